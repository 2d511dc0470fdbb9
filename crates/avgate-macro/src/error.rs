use avgate_proto::EncodeError;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MacroError {
    #[error("invalid macro: {0}")]
    Validation(String),
    #[error("macro not found: {0}")]
    NotFound(String),
    #[error("macro {active} already running")]
    Busy { active: String },
    #[error("persist macros: {0:#}")]
    Persist(anyhow::Error),
}

/// Transport-level failure of a single step. Logged and reported, never
/// propagated past the run.
#[derive(Debug, Error)]
pub enum StepError {
    #[error(transparent)]
    Encode(#[from] EncodeError),
    #[error("connect {addr} failed: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("connect {addr} timed out after {after:?}")]
    ConnectTimeout { addr: String, after: Duration },
    #[error("{addr}: {source}")]
    Io {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("serial port unavailable: {0}")]
    SerialUnavailable(String),
}
