use thiserror::Error;

use crate::bencode::BencodeError;

/// Errors that can occur when parsing torrent files or magnet links.
#[derive(Debug, Error)]
pub enum MetainfoError {
    /// The torrent file contains invalid bencode.
    #[error("bencode error: {0}")]
    Bencode(#[from] BencodeError),

    /// The top-level value is not a dictionary.
    #[error("metainfo is not a dictionary")]
    NotADictionary,

    /// A field has an invalid value or type.
    #[error("invalid field: {0}")]
    InvalidField(&'static str),

    /// The info hash has an invalid length (must be 20 or 32 bytes).
    #[error("invalid info hash length")]
    InvalidInfoHashLength,

    /// The magnet link is malformed.
    #[error("invalid magnet link: {0}")]
    InvalidMagnetLink(String),

    /// The piece table does not describe the file lengths.
    #[error("inconsistent layout: {0}")]
    InconsistentLayout(String),
}
