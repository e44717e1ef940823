//! Boat telemetry engine
//!
//! Usage:
//!   boat-telemetry                          # ~/.boat-telemetry/config.yaml + env
//!   boat-telemetry -c /etc/boat/config.yaml
//!   boat-telemetry -b 127.0.0.1:8000 -d ./telemetry.db

use argh::FromArgs;
use std::path::PathBuf;

use boat_telemetry::config::{default_config_path, Config};
use boat_telemetry::service;

/// Boat telemetry engine: MQTT ingest, storage, live feeds and history API
#[derive(FromArgs)]
struct Args {
    /// path to the YAML config file (default: ~/.boat-telemetry/config.yaml)
    #[argh(option, short = 'c')]
    config: Option<PathBuf>,

    /// HTTP listen address, overrides config and HTTP_BIND
    #[argh(option, short = 'b')]
    bind: Option<String>,

    /// SQLite database path, overrides config and DATABASE_PATH
    #[argh(option, short = 'd')]
    database: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    service::setup_logging();

    let args: Args = argh::from_env();

    let config_path = args.config.unwrap_or_else(default_config_path);
    let mut config = Config::load(&config_path)?;
    if let Some(bind) = args.bind {
        config.http.bind = bind;
    }
    if let Some(database) = args.database {
        config.store.path = database;
    }

    if let Err(e) = service::run(&config).await {
        log::error!("{}", e);
        return Err(e.into());
    }
    Ok(())
}
