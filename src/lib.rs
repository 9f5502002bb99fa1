pub mod captcha;
pub mod config;
pub mod credentials;
pub mod dkb;
pub mod duration;
pub mod flow;
pub mod report;
