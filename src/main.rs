use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use dkb_fetch::captcha::IsolatedRunner;
use dkb_fetch::config::{default_config_path, Config};
use dkb_fetch::credentials::{Credentials, PassCredentialStore};
use dkb_fetch::dkb::StderrNotices;
use dkb_fetch::flow::{self, FetchRequest};
use dkb_fetch::report::FetchReport;
use tracing::error;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "dkb-fetch")]
#[command(about = "Log in to DKB banking and print accounts and transactions as JSON")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value_os_t = default_config_path())]
    config: PathBuf,

    /// DKB login name
    #[arg(long, env = "DKB_USERNAME")]
    username: Option<String>,

    /// DKB password
    #[arg(long, env = "DKB_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// Read username and password from this pass entry instead
    #[arg(long)]
    pass_entry: Option<String>,

    /// Only fetch this account
    #[arg(long)]
    account_id: Option<String>,

    /// Days of transaction history
    #[arg(long, default_value_t = 90)]
    days: u32,

    /// Show the browser window while solving the captcha
    #[arg(long)]
    show_browser: bool,

    /// Log as JSON lines on stderr
    #[arg(long)]
    json_logs: bool,
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(fmt::layer().with_writer(std::io::stderr).json())
            .init();
    } else {
        registry
            .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
            .init();
    }
}

async fn credentials(cli: &Cli) -> Result<Credentials> {
    if let Some(entry) = &cli.pass_entry {
        return Credentials::from_store(&PassCredentialStore::from_path(entry)).await;
    }
    match (&cli.username, &cli.password) {
        (Some(username), Some(password)) => Ok(Credentials::new(username, password)),
        _ => anyhow::bail!("--username and --password (or --pass-entry) are required"),
    }
}

async fn fetch(cli: Cli) -> Result<FetchReport> {
    let config = Config::load_or_default(&cli.config)?;
    let credentials = credentials(&cli).await?;

    let mut runner = IsolatedRunner::from_config(&config.isolation)
        .context("Could not locate captcha solver")?
        .arg("--config")
        .arg(cli.config.to_string_lossy());
    if cli.show_browser {
        runner = runner.arg("--show-browser");
    }

    let request = FetchRequest {
        credentials,
        account_id: cli.account_id,
        days: cli.days,
    };
    Ok(flow::run(&config, &runner, request, Arc::new(StderrNotices)).await?)
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.json_logs);

    let report = match fetch(cli).await {
        Ok(report) => report,
        Err(e) => {
            error!("{e:#}");
            FetchReport::failure(format!("{e:#}"))
        }
    };

    println!("{}", report.to_json());
    if report.is_success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}
