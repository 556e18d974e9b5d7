// src/server/mod.rs

use crate::config::Config;
use anyhow::Result;
use std::path::PathBuf;

pub mod dispatch;
pub mod metrics_server;
pub mod notify;
pub mod reactor;
pub mod session;

/// Runs the server until a shutdown signal is received.
pub async fn run(config: Config, config_path: PathBuf, cold_start: bool) -> Result<()> {
    reactor::run(config, config_path, cold_start).await
}
