//! Error types for tracevault.

use thiserror::Error;

/// Result type alias using tracevault's Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for region and allocation operations.
#[derive(Error, Debug)]
pub enum Error {
    /// The region already carries an active bitmap directory.
    ///
    /// Returned when `setup` runs against a region that was already set up
    /// (or recovered). Fatal to the call, harmless to the region.
    #[error("region already initialized")]
    AlreadyInitialized,

    /// The supplied region cannot hold the requested layout.
    #[error("invalid region size: {0}")]
    InvalidSize(String),

    /// The backing segment could not be mapped for writing.
    #[error("failed to map region: {0}")]
    MapFailed(String),

    /// No free pages are left.
    ///
    /// Recoverable, per call: the caller decides whether to drop data or
    /// back off. Region state is unchanged by the failed call.
    #[error("out of pages")]
    OutOfPages,

    /// Not enough pages to place the header and bitmap directory.
    ///
    /// Fatal to initialization; the region never becomes available.
    #[error("insufficient pages for region metadata: {0}")]
    InsufficientPages(String),

    /// I/O error from a file-backed segment.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// System call error (via rustix).
    #[error("system error: {0}")]
    System(#[from] rustix::io::Errno),
}
