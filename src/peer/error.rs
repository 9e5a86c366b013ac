use thiserror::Error;

/// Errors that close a peer connection.
#[derive(Debug, Error)]
pub enum PeerError {
    /// Network I/O failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The remote did not speak the BitTorrent handshake.
    #[error("invalid handshake")]
    InvalidHandshake,

    /// The remote handshook for a different torrent.
    #[error("info hash mismatch")]
    InfoHashMismatch,

    /// A frame violated the wire protocol.
    #[error("invalid wire message: {0}")]
    InvalidMessage(&'static str),

    /// The remote behaved maliciously (oversized frames, impossible
    /// requests, extension traffic it never negotiated).
    #[error("malicious peer: {0}")]
    Malicious(&'static str),

    /// The remote closed the connection.
    #[error("connection closed")]
    ConnectionClosed,

    /// A read or write deadline expired.
    #[error("timeout")]
    Timeout,

    /// Malformed bencode inside an extension message.
    #[error("bencode error: {0}")]
    Bencode(#[from] crate::bencode::BencodeError),
}
