use anyhow::Result;
use clap::Parser;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod access_log;
mod backend;
mod bbpool;
mod config;
mod dispatcher;
mod error;
mod server;
mod transform;
mod urlcache;

use config::Config;
use server::Server;

#[derive(Parser, Debug)]
#[command(name = "sharaq", version)]
#[command(about = "HTTP image transformation proxy")]
struct Args {
    #[arg(short, long, default_value = "sharaq.json")]
    config: String,

    #[arg(long)]
    validate_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = Config::load(&args.config).await?;

    let default_filter = if config.debug { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if args.validate_config {
        info!("configuration is valid");
        return Ok(());
    }

    info!("starting sharaq");
    if config.debug {
        config.dump();
    }

    Server::new(config).run().await
}
