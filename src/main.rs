use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use dotenvy::dotenv;

use tracing::info;

use streamgate::{AppConfig, EdgeApplicationServer, Logger};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    let config = Arc::new(AppConfig::parse());

    // init logger and sentry, guards are kept alive to flush logs and maintain sentry connection
    let _guards = Logger::init(config.cargo_env, config.sentry_dsn.clone());

    info!(
        channel_source = %config.channel_source_url,
        format = ?config.channel_source_format,
        guide = %config.guide_url,
        proxies = config.proxy_prefixes().len(),
        "logger and env prepped, starting edge server..."
    );

    EdgeApplicationServer::serve(config)
        .await
        .context("edge server failed to start")?;

    Ok(())
}
