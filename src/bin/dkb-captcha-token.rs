//! Solve the login captcha once in a fresh browser and print the result as
//! a single JSON line on stdout. Logs go to stderr.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use dkb_fetch::captcha::{chromium, FetchResult};
use dkb_fetch::config::{default_config_path, Config};
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

fn parse_duration_arg(s: &str) -> Result<Duration, String> {
    dkb_fetch::duration::parse_duration(s).map_err(|e| e.to_string())
}

#[derive(Parser, Debug)]
#[command(name = "dkb-captcha-token")]
#[command(about = "Obtain a Friendly Captcha redemption token for the DKB login")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value_os_t = default_config_path())]
    config: PathBuf,

    /// Show the browser window
    #[arg(long)]
    show_browser: bool,

    /// Override how long to wait for the token (e.g. "400s", "5m")
    #[arg(long, value_parser = parse_duration_arg)]
    timeout: Option<Duration>,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(
                "info,chromiumoxide=warn,chromiumoxide::conn=off,chromiumoxide::handler=off",
            )
        }))
        .with(fmt::layer().with_writer(std::io::stderr).with_target(true))
        .init();

    let cli = Cli::parse();
    let result = match Config::load_or_default(&cli.config) {
        Ok(mut config) => {
            if cli.show_browser {
                config.captcha.headless = false;
            }
            if let Some(timeout) = cli.timeout {
                config.captcha.timeout = timeout;
            }
            info!(headless = config.captcha.headless, "solving captcha");
            match chromium::solve(&config.captcha).await {
                Ok(token) => FetchResult::success(token),
                Err(e) => {
                    error!("{e}");
                    FetchResult::failure(e.to_string())
                }
            }
        }
        Err(e) => {
            error!("{e:#}");
            FetchResult::failure(format!("{e:#}"))
        }
    };

    println!("{}", result.to_line());
    if result.is_success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}
