use thiserror::Error;

/// Disk-level failures.
///
/// Any of these during a block write or piece verification moves the
/// owning torrent into the `Error` state.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("file path escapes the torrent directory: {0}")]
    PathTraversal(String),

    #[error("read or write beyond the end of the payload")]
    OutOfRange,
}
