//! Native channel error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum NativeError {
    /// The host returned a failing status. `payload` is the error document
    /// it handed back, or empty when there was none.
    #[error("native call failed with status 0x{status:08X}: {payload}")]
    CallFailed { status: i32, payload: String },

    #[error("malformed native document: {0}")]
    Protocol(#[from] serde_json::Error),

    #[error("snapshot I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type NativeResult<T> = Result<T, NativeError>;
