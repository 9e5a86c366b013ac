use thiserror::Error;

/// Errors from bencode parsing.
#[derive(Debug, Error)]
pub enum BencodeError {
    /// Input ended in the middle of a value.
    #[error("truncated bencode input")]
    Truncated,

    /// The input violates bencode syntax.
    #[error("bencode syntax error: {0}")]
    Syntax(&'static str),

    /// More than 64 nested lists/dictionaries.
    #[error("bencode nesting too deep")]
    DepthLimit,

    /// Bytes remain after the outermost value.
    #[error("trailing bytes after bencode value")]
    Trailing,
}
