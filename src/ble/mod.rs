//! Native BLE platform boundary
//!
//! Defines the asynchronous platform trait the session core drives, the
//! events a platform delivers back, advertisement data parsing, and an
//! in-process simulated platform for testing without radio hardware.

pub mod advertisement;
pub mod simulated;
pub mod transport;

use thiserror::Error;

/// Failure status of a completed native operation.
///
/// A native call that completes with a null result is not an error at this
/// level: platforms return `Ok(None)` and the session reports it as
/// "result is null".
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PlatformError {
    #[error("Operation was canceled")]
    Canceled,

    #[error("Operation failed with error")]
    Failed,

    #[error("Device is unreachable")]
    Unreachable,

    #[error("Protocol error")]
    ProtocolError(u8),

    #[error("Access denied")]
    AccessDenied,

    #[error("Unknown error ({0})")]
    Unknown(i32),

    #[error("{0}")]
    Other(String),
}

/// Outcome of a native call that may yield a null result.
pub type NativeResult<T> = Result<Option<T>, PlatformError>;
