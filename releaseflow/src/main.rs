//! releaseflow - release orchestration CLI
//!
//! Exits with 0 when the run succeeded, 1 when any stage failed and 2 when
//! the configuration or the git ref could not be used.

use clap::Parser;
use tracing::error;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

mod cli;

fn init_logging(log_level: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(json.then(|| fmt::layer().json().with_target(false)))
        .with((!json).then(|| fmt::layer().with_target(false)))
        .init();
}

#[tokio::main]
async fn main() {
    let cli = cli::Cli::parse();
    init_logging(&cli.log_level, cli.json_logs);

    let code = match cli::execute(cli).await {
        Ok(code) => code,
        Err(err) => {
            error!("{err:#}");
            eprintln!("error: {err:#}");
            cli::error_exit_code(&err)
        }
    };
    std::process::exit(code);
}
