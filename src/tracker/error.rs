use thiserror::Error;

/// Tracker failures. Recorded on the tracker record; the tier scheduler
/// moves on to the next tracker.
#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("bencode error: {0}")]
    Bencode(#[from] crate::bencode::BencodeError),

    #[error("invalid tracker response: {0}")]
    InvalidResponse(&'static str),

    /// The tracker answered with a `failure reason`.
    #[error("tracker failure: {0}")]
    Failure(String),
}
