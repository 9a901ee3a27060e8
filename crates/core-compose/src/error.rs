//! Error surface of the compositor.
//!
//! Four failure categories map onto four variants; `Ok(())` is the fifth
//! public status. Configuration and usage errors are recoverable, resource
//! errors leave nothing allocated, and a transport error aborts the
//! collective for good: the instance is poisoned and must be rebuilt.

use core_comm::CommError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CompositeError {
    /// Bad geometry, layout/mode mismatch, or a wrongly sized buffer.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// An image or scratch allocation failed.
    #[error("allocation of {bytes} bytes failed")]
    OutOfMemory { bytes: usize },

    /// The process group failed mid-collective. Not retryable; destroy and
    /// re-init before compositing again.
    #[error("transport failure: {0}")]
    Transport(#[from] CommError),

    /// `run` on a poisoned instance (a previous collective aborted).
    #[error("compositor is not ready: {0}")]
    WrongState(&'static str),
}

/// Coarse status codes for hosts that report results without inspecting
/// the error value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Success,
    InvalidArgument,
    OutOfMemory,
    TransportError,
    WrongState,
}

impl CompositeError {
    pub fn status(&self) -> Status {
        match self {
            CompositeError::InvalidArgument(_) => Status::InvalidArgument,
            CompositeError::OutOfMemory { .. } => Status::OutOfMemory,
            CompositeError::Transport(_) => Status::TransportError,
            CompositeError::WrongState(_) => Status::WrongState,
        }
    }
}

pub type Result<T> = std::result::Result<T, CompositeError>;

/// Allocate a zero-filled byte buffer, surfacing failure as `OutOfMemory`
/// instead of aborting the process.
pub(crate) fn try_zeroed(bytes: usize) -> Result<Vec<u8>> {
    let mut v = Vec::new();
    v.try_reserve_exact(bytes)
        .map_err(|_| CompositeError::OutOfMemory { bytes })?;
    v.resize(bytes, 0);
    Ok(v)
}
