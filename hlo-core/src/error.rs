use thiserror::Error;

/// Errors produced by the HALO coordination layer.
#[derive(Error, Debug)]
pub enum HaloError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Hash ring is empty")]
    RingEmpty,

    #[error("Hash ring corrupted: {0}")]
    RingCorrupt(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Inventory error: {0}")]
    Inventory(String),

    #[error("Service is not running")]
    NotRunning,

    #[error("Service is already running")]
    AlreadyRunning,

    #[error("Operation rejected: {0}")]
    Rejected(&'static str),

    #[error("Timed out waiting for {0}")]
    Timeout(&'static str),
}

pub type Result<T> = std::result::Result<T, HaloError>;
