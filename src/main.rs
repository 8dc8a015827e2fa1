use std::path::PathBuf;

use ::tracing::{error, info};
use anyhow::Context;
use clap::Parser;
use service::Service;

mod config;
mod file_manager;
mod gc;
mod http_objects;
mod metrics;
mod middleware;
mod routes;
mod service;
mod tracing;
use tracing::setup_tracing;

#[cfg(test)]
mod integration_test_http_routes;
#[cfg(test)]
mod testing;

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    #[arg(short, long, value_name = "config file", help = "Path to config file")]
    config: Option<PathBuf>,

    /// Print the OpenAPI document and exit
    #[arg(long)]
    print_openapi: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.print_openapi {
        println!("{}", routes::openapi_document()?);
        return Ok(());
    }

    if let Err(err) = dotenvy::dotenv() {
        if !err.not_found() {
            return Err(err).context("failed to load .env file");
        }
    }

    let config = config::ServerConfig::load(cli.config.as_deref())?;
    let tracer_provider = setup_tracing(&config)?;
    info!(
        version = env!("CARGO_PKG_VERSION"),
        built_at = env!("VERGEN_BUILD_TIMESTAMP"),
        rustc = env!("VERGEN_RUSTC_SEMVER"),
        "starting filevault server"
    );

    let result = start_filevault(config).await;

    // export traces before shutdown
    if let Some(tracer_provider) = tracer_provider {
        if let Err(err) = tracer_provider.force_flush() {
            error!("Error flushing traces: {:?}", err);
        }
        if let Err(err) = tracer_provider.shutdown() {
            error!("Error shutting down tracer provider: {:?}", err);
        }
    }
    result
}

#[::tracing::instrument(skip(config), fields(env = config.env, instance_id = config.instance_id()))]
async fn start_filevault(config: config::ServerConfig) -> anyhow::Result<()> {
    let mut service = Service::new(config)
        .await
        .context("Failed to create service")?;
    service.start().await.context("Failed to start service")
}
