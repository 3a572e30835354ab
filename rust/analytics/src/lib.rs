pub mod cache;
pub mod catalog;
pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod query;
pub mod server;
pub mod state;
pub mod telemetry;
pub mod time;
pub mod validate;

use crate::{config::AppConfig, server::Server};

/// Bootstraps the analytics service using environment configuration.
pub async fn run() -> anyhow::Result<()> {
    let config = AppConfig::from_env()?;
    Server::new(config).await?.run().await
}
