use std::io;
use std::path::PathBuf;

use crate::ClassId;

/// Errors surfaced by pool, allocator and transaction operations.
///
/// Internal io failures keep their `fault_injection` annotation
/// inside the `Io` variant, so the failing call site can be
/// read straight off of the error's `Display` output.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The pool file could not be created, mapped, or validated.
    #[error("failed to create or open pool at {path:?}: {reason}")]
    HeapCreateOrOpen { path: PathBuf, reason: String },

    /// No free unit or chunk run can satisfy the request.
    #[error("out of space: no room for an allocation of {requested} bytes")]
    OutOfSpace { requested: u64 },

    /// The handle, offset, or address does not name a live
    /// allocation (or a valid range within one) in this pool.
    #[error("invalid offset or address {offset:#x}: {reason}")]
    InvalidOffsetOrAddress { offset: u64, reason: &'static str },

    /// A transaction operation was attempted in a state that
    /// does not allow it.
    #[error("transaction protocol violation: {0}")]
    TransactionProtocolViolation(&'static str),

    /// The transaction was rolled back and its effects are gone.
    #[error("transaction aborted")]
    TransactionAborted,

    /// The requested size can not be served by the requested class.
    #[error("invalid allocation size {size} for class {class:?}: {reason}")]
    InvalidAllocationSize {
        size: u64,
        class: ClassId,
        reason: &'static str,
    },

    /// Class registration or lookup failed.
    #[error("allocation class error: {0}")]
    AllocationClass(String),

    /// The undo or redo log has no room left for this transaction.
    #[error("{log} log exhausted: needed {needed} bytes but only {available} remain")]
    LogExhausted {
        log: &'static str,
        needed: u64,
        available: u64,
    },

    /// `Config::validate` rejected the configuration.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    pub(crate) fn invalid_offset(offset: u64, reason: &'static str) -> Error {
        Error::InvalidOffsetOrAddress { offset, reason }
    }

    pub(crate) fn create_or_open<R: ToString>(path: &std::path::Path, reason: R) -> Error {
        Error::HeapCreateOrOpen {
            path: path.to_path_buf(),
            reason: reason.to_string(),
        }
    }
}
