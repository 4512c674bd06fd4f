use crate::config::ConfigError;
use crate::metainfo::MetainfoError;
use crate::storage::{ProviderError, StorageError};
use thiserror::Error;

/// Failures that end a download.
///
/// Misbehaving peers and unreachable trackers are not errors at this level;
/// they are dropped and reported through the progress sink.
#[derive(Debug, Error)]
pub enum SwarmError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("file provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("metainfo error: {0}")]
    Metainfo(#[from] MetainfoError),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("metadata not yet known")]
    NoMetadata,
}
