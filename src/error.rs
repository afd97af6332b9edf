use std::io;
use std::thread;
use std::time::Duration;

use thiserror::Error;
use tracing::warn;

pub type Result<T> = std::result::Result<T, TernError>;

/// Retry cap for [`TernError::TempStore`]. Temp errors are retried locally
/// with a short sleep; everything else propagates to the caller.
pub const TEMP_RETRY_CAP: usize = 100;

#[derive(Debug, Error)]
pub enum TernError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error("wrong shard: {0}")]
    WrongShard(String),
    #[error("invalid operation: {0}")]
    InvalidOp(String),
    #[error("temporary store error: {0}")]
    TempStore(String),
    #[error("fatal store error: {0}")]
    FatalStore(String),
    #[error("cancelled")]
    Cancelled,
    #[error("schema violation: {0}")]
    SchemaViolation(String),
    #[error("corruption detected: {0}")]
    Corruption(String),
}

impl TernError {
    /// Wire discriminator used by RPC error replies.
    pub fn kind_byte(&self) -> u8 {
        match self {
            TernError::Io(_) => 1,
            TernError::NotFound(_) => 2,
            TernError::WrongShard(_) => 3,
            TernError::InvalidOp(_) => 4,
            TernError::TempStore(_) => 5,
            TernError::FatalStore(_) => 6,
            TernError::Cancelled => 7,
            TernError::SchemaViolation(_) => 8,
            TernError::Corruption(_) => 9,
        }
    }

    pub fn from_kind_byte(kind: u8, msg: String) -> Self {
        match kind {
            1 => TernError::Io(io::Error::other(msg)),
            2 => TernError::NotFound("remote object"),
            3 => TernError::WrongShard(msg),
            4 => TernError::InvalidOp(msg),
            5 => TernError::TempStore(msg),
            6 => TernError::FatalStore(msg),
            7 => TernError::Cancelled,
            8 => TernError::SchemaViolation(msg),
            _ => TernError::Corruption(msg),
        }
    }
}

/// Runs `op`, retrying [`TernError::TempStore`] with a short sleep up to
/// [`TEMP_RETRY_CAP`] attempts. Any other error is returned as-is.
pub fn retry_temp<T>(mut op: impl FnMut() -> Result<T>) -> Result<T> {
    let mut last = None;
    for _ in 0..TEMP_RETRY_CAP {
        match op() {
            Err(TernError::TempStore(msg)) => {
                warn!(error = %msg, "temporary store error, retrying");
                last = Some(TernError::TempStore(msg));
                thread::sleep(Duration::from_micros(1));
            }
            other => return other,
        }
    }
    Err(last.unwrap_or_else(|| TernError::TempStore("retries exhausted".into())))
}
