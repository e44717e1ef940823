//! Process-level errors: anything that stops the engine from starting or
//! shutting down cleanly.

use crate::broker::BrokerError;
use crate::config::ConfigError;
use crate::store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Broker(#[from] BrokerError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to install signal handler: {0}")]
    Signal(#[from] ctrlc::Error),
}

pub type Result<T> = std::result::Result<T, EngineError>;
