//! Crate-wide error type.
//!
//! Domain errors are closed enums so callers can match on failure kind (see
//! spec §7's taxonomy); only the outermost plumbing (CLI, ad-hoc scripts)
//! reaches for `anyhow`.

use crate::broker::BrokerError;
use crate::execution::ExecutionError;
use crate::occ::OccError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("broker error: {0}")]
    Broker(#[from] BrokerError),

    #[error("execution error: {0}")]
    Execution(#[from] ExecutionError),

    #[error("store error: {0}")]
    Store(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("invalid OCC symbol: {0}")]
    Occ(#[from] OccError),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("position {0} is no longer open; refusing to write stale state")]
    StaleState(i64),
}

pub type EngineResult<T> = Result<T, EngineError>;
