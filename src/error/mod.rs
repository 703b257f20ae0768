//! Crate-wide error type.
//!
//! Per the error handling design: network failures, protocol violations, and
//! not-found results are not exceptional — only truly programmer-facing
//! conditions (not-running, bad configuration) and callback failures surface
//! as `Error`. Handlers that hit a transient network condition should log and
//! return a miss, not propagate an `Error`.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("config error: {0}")]
    Config(String),

    #[error("network timeout after {0:?}")]
    Timeout(std::time::Duration),

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("service not running")]
    NotRunning,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("callback error: {0}")]
    Callback(String),

    #[error("invalid node id: {0}")]
    InvalidNodeId(String),
}
