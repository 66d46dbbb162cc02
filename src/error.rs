//! Error kinds for the storage core: every failure gets its own typed
//! variant so callers can match on *what kind* of failure occurred
//! (corruption vs. timeout vs. fatal) instead of parsing a message.

use std::fmt;
use std::io;

use thiserror::Error;

/// Result alias used throughout the crate.
pub type PtResult<T> = Result<T, PersistitError>;

#[derive(Error, Debug)]
pub enum PersistitError {
    /// An on-disk invariant was violated: bad page-type byte,
    /// out-of-range pointer, checksum mismatch. The volume the page
    /// belongs to should be marked suspect by the caller.
    #[error("corruption in volume {volume}: {detail}")]
    Corruption { volume: String, detail: String },

    /// Read/write error surfaced from the OS.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    /// A write could not be completed because the device is full.
    #[error("disk full while writing to {0}")]
    DiskFull(String),

    /// A wwDependency conflict or caller-requested abort. Callers are
    /// expected to retry up to a configured cap.
    #[error("transaction rolled back: {0}")]
    Rollback(String),

    /// A caller-supplied timeout elapsed (wwDependency wait, or a
    /// latch claim that could not make progress).
    #[error("operation timed out: {0}")]
    Timeout(String),

    /// The calling thread was interrupted while blocked.
    #[error("interrupted: {0}")]
    Interrupted(String),

    /// Internal signal from `Buffer::join` telling the caller to split
    /// instead of merging; never meant to escape the Exchange layer.
    #[error("rebalance required instead of join: {0}")]
    RebalanceRequired(String),

    /// An unrecoverable internal-consistency violation (timestamp
    /// monotonicity, page-map contradiction). The engine must stop
    /// accepting writes once this is raised.
    #[error("fatal internal error: {0}")]
    Fatal(String),

    /// A configuration value failed validation before any file was
    /// opened.
    #[error("invalid configuration: {0}")]
    Configuration(String),

    /// Requested capacity exceeded available space (used by the MVV
    /// codec's `storeVersion` and by page `putValue`).
    #[error("insufficient capacity: needed {needed}, available {available}")]
    InsufficientCapacity { needed: usize, available: usize },

    /// A lookup (key, version handle, page) found nothing.
    #[error("not found: {0}")]
    NotFound(String),
}

impl PersistitError {
    pub fn corruption(volume: impl Into<String>, detail: impl fmt::Display) -> Self {
        PersistitError::Corruption {
            volume: volume.into(),
            detail: detail.to_string(),
        }
    }

    pub fn fatal(detail: impl fmt::Display) -> Self {
        let err = PersistitError::Fatal(detail.to_string());
        log::error!("{}", err);
        err
    }

    /// True for the "volume is suspect, stop serving it" class of
    /// error (`Corruption`, `Fatal`).
    pub fn is_suspect(&self) -> bool {
        matches!(self, PersistitError::Corruption { .. } | PersistitError::Fatal(_))
    }
}
