use super::error::MetainfoError;
use super::info_hash::InfoHash;
use crate::bencode::{decode, parse, Dict, ParseMode, Value};
use bytes::Bytes;
use std::path::PathBuf;
use tracing::warn;

/// A parsed torrent file.
///
/// Built once and shared read-only (usually behind an `Arc`) by every other
/// component of a swarm.
///
/// # Examples
///
/// ```
/// use swarmbit::metainfo::Metainfo;
///
/// let metainfo = Metainfo::from_bytes(b"d4:infod6:lengthi12345e4:name3:abcee").unwrap();
/// assert_eq!(metainfo.info.name, "abc");
/// assert_eq!(metainfo.info.total_length, 12345);
/// ```
#[derive(Debug, Clone)]
pub struct Metainfo {
    /// The info dictionary containing file and piece information.
    pub info: Info,
    /// The unique identifier for this torrent (hash of the info dictionary).
    pub info_hash: InfoHash,
    /// Primary tracker URL.
    pub announce: Option<String>,
    /// Multi-tier tracker list ([BEP-12](http://bittorrent.org/beps/bep_0012.html)).
    pub announce_list: Vec<Vec<String>>,
    /// Unix timestamp when the torrent was created.
    pub creation_date: Option<i64>,
    /// Optional comment about the torrent.
    pub comment: Option<String>,
    /// Name/version of the program that created the torrent.
    pub created_by: Option<String>,
    /// Character set used for the strings in the info dictionary.
    pub encoding: Option<String>,
    raw_info: Bytes,
}

/// The info dictionary from a torrent file.
#[derive(Debug, Clone, Default)]
pub struct Info {
    /// Suggested name for the file or directory.
    pub name: String,
    /// Number of bytes per piece.
    pub piece_length: u64,
    /// SHA1 hash of each piece (20 bytes each).
    pub pieces: Vec<[u8; 20]>,
    /// List of files in the torrent.
    pub files: Vec<File>,
    /// Total size of all files combined.
    pub total_length: u64,
    /// True when the info dictionary carried a `files` list.
    pub multi_file: bool,
    /// MD5 of a single-file torrent's content, if published.
    pub md5sum: Option<String>,
}

/// A file within a torrent.
///
/// For single-file torrents, there is one file with the torrent name.
/// For multi-file torrents, paths start with the torrent name as the root
/// directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct File {
    pub path: PathBuf,
    pub length: u64,
    /// Byte offset of the file within the concatenated torrent content.
    pub offset: u64,
    pub md5sum: Option<String>,
}

impl Metainfo {
    /// Parses a torrent file from raw bytes.
    ///
    /// The info hash is computed over the exact bytes the `info` value
    /// occupied in `data`, never over a re-encoding.
    ///
    /// # Errors
    ///
    /// Returns an error if the data is not valid bencode or its top level is
    /// not a dictionary. Missing keys fall back to empty values.
    pub fn from_bytes(data: &[u8]) -> Result<Self, MetainfoError> {
        let parsed = parse(data, ParseMode::Strict)?;
        let raw_info = parsed
            .info_span
            .map(|span| Bytes::copy_from_slice(&data[span]))
            .unwrap_or_default();
        extract_metadata(&parsed.value, raw_info)
    }

    /// Builds metadata from a bare info dictionary, as received from peers
    /// for a magnet link.
    pub fn from_info_bytes(raw_info: Bytes, trackers: Vec<String>) -> Result<Self, MetainfoError> {
        let value = decode(&raw_info)?;
        let info_dict = value.as_dict().ok_or(MetainfoError::NotADictionary)?;
        let info = parse_info(info_dict);

        Ok(Self {
            info,
            info_hash: InfoHash::v1_of(&raw_info),
            announce: trackers.first().cloned(),
            announce_list: if trackers.is_empty() {
                Vec::new()
            } else {
                vec![trackers]
            },
            creation_date: None,
            comment: None,
            created_by: None,
            encoding: None,
            raw_info,
        })
    }

    /// Returns the raw bencoded info dictionary exactly as it was read.
    pub fn raw_info(&self) -> &Bytes {
        &self.raw_info
    }

    /// Returns all tracker URLs from both `announce` and `announce-list`.
    ///
    /// The primary tracker (from `announce`) comes first, followed by
    /// trackers from `announce-list` tier by tier. Duplicates are removed.
    pub fn trackers(&self) -> Vec<String> {
        let mut trackers = Vec::new();

        if let Some(ref announce) = self.announce {
            trackers.push(announce.clone());
        }

        for tier in &self.announce_list {
            for tracker in tier {
                if !trackers.contains(tracker) {
                    trackers.push(tracker.clone());
                }
            }
        }

        trackers
    }

    pub fn piece_count(&self) -> usize {
        self.info.pieces.len()
    }

    pub fn piece_hash(&self, index: usize) -> Option<&[u8; 20]> {
        self.info.pieces.get(index)
    }

    /// Length of the last piece; equal to `piece_length` when the content
    /// divides evenly.
    pub fn last_piece_length(&self) -> u64 {
        if self.info.piece_length == 0 || self.info.total_length == 0 {
            return 0;
        }
        match self.info.total_length % self.info.piece_length {
            0 => self.info.piece_length,
            rem => rem,
        }
    }

    pub fn piece_size(&self, index: usize) -> u64 {
        let count = self.piece_count();
        if index >= count {
            0
        } else if index + 1 == count {
            self.last_piece_length()
        } else {
            self.info.piece_length
        }
    }

    /// Checks that the piece table and file lengths agree, which is required
    /// before any piece can be downloaded or verified.
    pub fn validate(&self) -> Result<(), MetainfoError> {
        let info = &self.info;
        if info.piece_length == 0 {
            return Err(MetainfoError::InvalidField("piece length"));
        }
        let expected = info.total_length.div_ceil(info.piece_length);
        if expected != info.pieces.len() as u64 {
            return Err(MetainfoError::InconsistentLayout(format!(
                "{} bytes in pieces of {} need {} digests, found {}",
                info.total_length,
                info.piece_length,
                expected,
                info.pieces.len()
            )));
        }
        Ok(())
    }
}

/// Walks the recognised keys of a decoded torrent file.
///
/// Only a non-dictionary top level is an error; every missing or mistyped
/// key takes an empty or zero default.
pub fn extract_metadata(value: &Value, raw_info: Bytes) -> Result<Metainfo, MetainfoError> {
    let dict = value.as_dict().ok_or(MetainfoError::NotADictionary)?;

    let info = dict
        .get(b"info")
        .and_then(Value::as_dict)
        .map(parse_info)
        .unwrap_or_default();

    let announce_list = dict
        .get(b"announce-list")
        .and_then(Value::as_list)
        .map(|list| {
            list.iter()
                .filter_map(|tier| {
                    tier.as_list().map(|urls| {
                        urls.iter()
                            .filter_map(|u| u.as_str().map(String::from))
                            .collect()
                    })
                })
                .collect()
        })
        .unwrap_or_default();

    Ok(Metainfo {
        info,
        info_hash: InfoHash::v1_of(&raw_info),
        announce: string_field(dict, b"announce"),
        announce_list,
        creation_date: dict.get(b"creation date").and_then(Value::as_integer),
        comment: string_field(dict, b"comment"),
        created_by: string_field(dict, b"created by"),
        encoding: string_field(dict, b"encoding"),
        raw_info,
    })
}

fn string_field(dict: &Dict, key: &[u8]) -> Option<String> {
    dict.get(key).and_then(Value::as_str).map(String::from)
}

fn length_field(dict: &Dict, key: &[u8]) -> u64 {
    dict.get(key)
        .and_then(Value::as_integer)
        .map(|v| v.max(0) as u64)
        .unwrap_or(0)
}

fn parse_info(dict: &Dict) -> Info {
    let name = string_field(dict, b"name").unwrap_or_default();
    let piece_length = length_field(dict, b"piece length");

    let pieces_bytes = dict
        .get(b"pieces")
        .and_then(Value::as_bytes)
        .cloned()
        .unwrap_or_default();
    if pieces_bytes.len() % 20 != 0 {
        warn!(
            len = pieces_bytes.len(),
            "pieces field is not a multiple of 20 bytes, ignoring the remainder"
        );
    }
    let pieces: Vec<[u8; 20]> = pieces_bytes
        .chunks_exact(20)
        .map(|chunk| {
            let mut arr = [0u8; 20];
            arr.copy_from_slice(chunk);
            arr
        })
        .collect();

    let md5sum = string_field(dict, b"md5sum");

    if let Some(files_list) = dict.get(b"files").and_then(Value::as_list) {
        let mut files = Vec::with_capacity(files_list.len());
        let mut offset = 0u64;

        for file_dict in files_list.iter().filter_map(Value::as_dict) {
            let length = length_field(file_dict, b"length");
            let components = file_dict
                .get(b"path")
                .and_then(Value::as_list)
                .map(|list| list.iter().filter_map(Value::as_str).collect::<Vec<_>>())
                .unwrap_or_default();

            let path: PathBuf = std::iter::once(name.as_str()).chain(components).collect();

            files.push(File {
                path,
                length,
                offset,
                md5sum: string_field(file_dict, b"md5sum"),
            });
            offset += length;
        }

        Info {
            name,
            piece_length,
            pieces,
            files,
            total_length: offset,
            multi_file: true,
            md5sum,
        }
    } else {
        let length = length_field(dict, b"length");
        let file = File {
            path: PathBuf::from(&name),
            length,
            offset: 0,
            md5sum: md5sum.clone(),
        };
        Info {
            name,
            piece_length,
            pieces,
            files: vec![file],
            total_length: length,
            multi_file: false,
            md5sum,
        }
    }
}
