//! Loader error types (spec.md §7).
//!
//! Four error kinds are distinguished in the spec; only the first two are
//! represented here as `Result` values. "Open failure" and "target fault"
//! are not propagated through `Result`: the former exits the process
//! directly with status 1, and the latter is a property of the target
//! program observed via the restored default signal disposition, not a
//! return value.

use thiserror::Error;

/// Errors a caller of [`crate::init`] or [`crate::execute`] can observe.
#[derive(Debug, Error)]
pub enum LoaderError {
    /// Installing the fault handler failed (spec.md §7 item 1).
    #[error("failed to install SIGSEGV handler: {0}")]
    Init(#[from] nix::Error),

    /// The image is not a recognisable ELF64 executable (spec.md §7 item 2).
    #[error("failed to parse executable: {0}")]
    Parse(String),

    /// An I/O error occurred while reading the executable's program
    /// headers, distinct from the "open failure" exit-1 path, which is
    /// handled directly by the caller before a `LoaderError` could exist.
    #[error("I/O error reading executable: {0}")]
    Io(#[from] std::io::Error),
}
