// src/main.rs

//! The entry point for the spallocd allocation daemon.

use anyhow::Result;
use spallocd::config::Config;
use spallocd::server;
use std::env;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::error;
use tracing_subscriber::{filter::EnvFilter, prelude::*, reload};

#[tokio::main]
async fn main() -> Result<()> {
    run_app().await
}

struct Args {
    config_path: PathBuf,
    cold_start: bool,
    quiet: bool,
}

fn parse_args() -> Option<Args> {
    let raw: Vec<String> = env::args().skip(1).collect();
    let mut config_path = None;
    let mut cold_start = false;
    let mut quiet = false;

    for arg in raw {
        match arg.as_str() {
            "--cold-start" | "-c" => cold_start = true,
            "-q" => quiet = true,
            other if config_path.is_none() => config_path = Some(PathBuf::from(other)),
            _ => return None,
        }
    }

    Some(Args {
        config_path: config_path?,
        cold_start,
        quiet,
    })
}

async fn run_app() -> Result<()> {
    let Some(args) = parse_args() else {
        eprintln!("usage: spallocd CONFIG_FILE [--cold-start|-c] [-q]");
        std::process::exit(1);
    };

    let config = match Config::from_file(&args.config_path.to_string_lossy()) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("failed to load configuration from \"{}\": {e}", args.config_path.display());
            std::process::exit(1);
        }
    };

    let initial_log_level = std::env::var("RUST_LOG").unwrap_or_else(|_| {
        if args.quiet {
            "warn".to_string()
        } else {
            config.log_level.clone()
        }
    });
    let (filter, reload_handle) = reload::Layer::new(EnvFilter::new(initial_log_level));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().compact().with_ansi(true))
        .init();
    let _reload_handle = Arc::new(reload_handle);

    if let Err(e) = server::run(config, args.config_path, args.cold_start).await {
        error!("server runtime error: {e}");
        return Err(e);
    }

    Ok(())
}
