use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::sync::Timeout;

pub type Result<T> = std::result::Result<T, Error>;

/// Failures of the submission layer.
///
/// Every variant that originates from a driver request keeps the underlying
/// [`io::Error`] so the OS error code survives for diagnostics (see
/// [`Error::os_error`]).
#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to open device {}: {source}", path.display())]
    DeviceOpen {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("buffer allocation of {size} bytes failed: {source}")]
    Allocation {
        size: u64,
        #[source]
        source: io::Error,
    },

    #[error("channel open failed: {0}")]
    ChannelOpen(#[source] io::Error),

    #[error("syncpoint get failed for index {index}: {source}")]
    SyncpointAllocation {
        index: u32,
        #[source]
        source: io::Error,
    },

    #[error("buffer mapping failed: {0}")]
    Mapping(#[source] io::Error),

    #[error("submit failed: {0}")]
    Submit(#[source] io::Error),

    #[error("syncpoint {id} did not reach {threshold} within {timeout}")]
    WaitTimeout {
        id: u32,
        threshold: u32,
        timeout: Timeout,
    },

    #[error("fence did not signal within {timeout}")]
    FenceTimeout { timeout: Timeout },

    #[error("syncpoint wait failed: {0}")]
    Wait(#[source] io::Error),

    #[error("syncpoint {id} read failed: {source}")]
    SyncpointRead {
        id: u32,
        #[source]
        source: io::Error,
    },
}

impl Error {
    /// Raw OS error code of the failed driver request, if any.
    pub fn os_error(&self) -> Option<i32> {
        match self {
            Error::DeviceOpen { source, .. }
            | Error::Allocation { source, .. }
            | Error::SyncpointAllocation { source, .. }
            | Error::SyncpointRead { source, .. } => source.raw_os_error(),
            Error::ChannelOpen(source)
            | Error::Mapping(source)
            | Error::Submit(source)
            | Error::Wait(source) => source.raw_os_error(),
            Error::WaitTimeout { .. } | Error::FenceTimeout { .. } => None,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::WaitTimeout { .. } | Error::FenceTimeout { .. })
    }
}
