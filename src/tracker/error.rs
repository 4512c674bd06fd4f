use thiserror::Error;

#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The tracker answered with an error action.
    #[error("tracker returned error: {0}")]
    Failure(String),

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// Every retransmission went unanswered.
    #[error("timeout")]
    Timeout,

    #[error("could not resolve {0}")]
    Resolve(String),

    #[error("invalid url: {0}")]
    InvalidUrl(String),

    #[error("unsupported protocol: {0}")]
    UnsupportedProtocol(String),

    #[error("no usable tracker")]
    NoTrackers,
}
