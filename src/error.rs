use std::{collections::TryReserveError, ffi::NulError, io, os::fd::RawFd};

use crate::child_report::Stage;

#[derive(Debug, thiserror::Error)]
pub enum FenceError {
    #[error("invalid restrict configuration")]
    Config(#[from] serde_json::Error),

    #[error("interior nul byte in {what}")]
    Nul {
        what: &'static str,
        #[source]
        source: NulError,
    },

    #[error("could not reserve room for protected descriptors")]
    Reserve(#[source] TryReserveError),

    #[error(
        "{needed} descriptors were contributed but only {capacity} were reserved"
    )]
    CapacityExceeded { needed: usize, capacity: usize },

    #[error("launch option contributed invalid descriptor {0}")]
    InvalidDescriptor(RawFd),

    #[error("{call} failed")]
    Os {
        call: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("child failed during {stage}")]
    ChildSetup {
        stage: Stage,
        #[source]
        source: io::Error,
    },
}

impl FenceError {
    /// Wrap the current `errno` for a failed call.
    pub(crate) fn last_os(call: &'static str) -> Self {
        Self::Os {
            call,
            source: io::Error::last_os_error(),
        }
    }
}

pub type Result<T> = std::result::Result<T, FenceError>;
