//! Typed error surface for the placement layer (spec §7).
//!
//! Setup-time failures (xattr probing, directory creation, statvfs) are not
//! part of this contract and travel as `anyhow::Result` with context instead,
//! matching this crate's existing convention in `disk.rs`/`config.rs`.

use thiserror::Error;

/// The four error classes the placement layer surfaces to callers.
///
/// `Success` has no variant here -- it is represented by `Ok(..)`.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum MdError {
    /// Object not found after a ring lookup and a full scan-and-repair pass.
    #[error("object not found")]
    NoObj,

    /// Local disk error: the last disk refusing I/O, or placement disabled.
    #[error("local I/O error")]
    Eio,

    /// Recovery was scheduled asynchronously; the caller should retry.
    #[error("network error, retry")]
    NetworkError,
}
