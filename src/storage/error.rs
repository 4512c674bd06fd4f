use super::handles::ProviderError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("file provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("invalid piece index: {0}")]
    InvalidPieceIndex(u32),

    #[error("piece {0} is not verified")]
    PieceNotAvailable(u32),

    #[error("invalid block: piece {piece}, offset {offset}, length {length}")]
    InvalidBlock { piece: u32, offset: u32, length: u32 },

    #[error("range of {len} bytes at {offset} lies outside the content")]
    OutOfRange { offset: u64, len: usize },

    #[error("expected {expected} file handles, got {got}")]
    HandleCount { expected: usize, got: usize },

    #[error("piece digests must be 20 bytes per piece, got {0} bytes")]
    InvalidDigests(usize),

    #[error("piece length {0} does not fit in 32 bits")]
    PieceTooLarge(u64),

    #[error("no files attached")]
    NotAttached,
}
