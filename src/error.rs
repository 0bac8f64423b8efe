//! Error types for the reconciliation engine.

use std::path::PathBuf;

use copytrade_broker::{BrokerError, Symbol};

use crate::retry::RetryError;

/// All errors that can abort a reconciliation cycle or the process start-up.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("config error: {0}")]
    Config(String),

    #[error("failed to read config file {path}: {source}")]
    ConfigRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("target allocation error: {0}")]
    Target(String),

    #[error("failed to read target file {path}: {source}")]
    TargetRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse target JSON: {0}")]
    TargetParse(#[from] serde_json::Error),

    #[error("account balance too low to trade: ${:.2}", *equity_cents as f64 / 100.0)]
    InsufficientBalance { equity_cents: i64 },

    #[error("no quote for {symbol}")]
    MissingQuote { symbol: Symbol },

    #[error("invalid quote for {symbol}: {price_cents} cents")]
    InvalidQuote { symbol: Symbol, price_cents: i64 },

    #[error("broker {step} failed: {source}")]
    Broker {
        step: &'static str,
        source: RetryError<BrokerError>,
    },

    #[error("failed to access snapshot {path}: {source}")]
    SnapshotIo {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("corrupt snapshot {path}: {source}")]
    SnapshotCorrupt {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("audit log error: {0}")]
    Audit(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
