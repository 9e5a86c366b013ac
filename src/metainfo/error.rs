use thiserror::Error;

/// Errors from parsing a torrent file.
#[derive(Debug, Error)]
pub enum MetainfoError {
    /// The file is not valid bencode.
    #[error("bencode error: {0}")]
    Bencode(#[from] crate::bencode::BencodeError),

    /// A required field is absent.
    #[error("missing field: {0}")]
    MissingField(&'static str),

    /// A field is present but malformed.
    #[error("invalid field: {0}")]
    InvalidField(&'static str),

    /// Only BitTorrent v1 torrents are supported.
    #[error("not a v1 torrent")]
    NotV1,
}
