use std::path::Path;

use anyhow::Result;
use clap::Parser;
use tracing::{info, warn};

use sqld_daemon::{
    cli::{self, Cli, DotEnv},
    server::{self, AppConfig},
    telemetry,
};

#[tokio::main]
async fn main() -> Result<()> {
    let dotenv = cli::load_dotenv(Path::new(cli::DOTENV_PATH));
    let args = Cli::parse();

    let _telemetry = telemetry::init("sqld")?;
    match dotenv {
        DotEnv::Loaded => info!(path = cli::DOTENV_PATH, "environment loaded from file"),
        DotEnv::Missing => info!(path = cli::DOTENV_PATH, "no env file, using the process environment"),
        DotEnv::Failed(err) => warn!(path = cli::DOTENV_PATH, error = %err, "failed to load env file"),
    }

    let config = AppConfig::load(&args)?;
    server::run(config).await
}
