//! Torrent metainfo handling ([BEP-3], [BEP-9]).
//!
//! [`Metainfo`] is a parsed `.torrent` file; [`MagnetLink`] is a magnet URI
//! carrying only an info hash plus tracker and peer hints. A magnet start
//! fetches the info dictionary from peers and turns it into a `Metainfo`
//! with [`Metainfo::from_info_bytes`].
//!
//! # Examples
//!
//! ```
//! use swarmbit::metainfo::{InfoHash, Metainfo};
//!
//! let data = b"d8:announce21:udp://tracker.test:804:infod6:lengthi12345e4:name3:abc\
//!              12:piece lengthi16384e6:pieces20:aaaaaaaaaaaaaaaaaaaaee";
//! let torrent = Metainfo::from_bytes(data).unwrap();
//! assert_eq!(torrent.piece_count(), 1);
//! assert_eq!(torrent.trackers(), vec!["udp://tracker.test:80"]);
//! assert!(torrent.info_hash.verify(torrent.raw_info()));
//! ```
//!
//! # Torrent Structure
//!
//! - **info** - Core torrent metadata (hashed to create the info hash)
//!   - `name` - Suggested file/directory name
//!   - `piece length` - Size of each piece in bytes
//!   - `pieces` - Concatenated SHA1 hashes of each piece
//!   - `length` (single-file) or `files` list (multi-file), optional `md5sum`
//! - **announce** / **announce-list** - Tracker URLs (BEP-12)
//! - **creation date**, **comment**, **created by**, **encoding**
//!
//! [BEP-3]: http://bittorrent.org/beps/bep_0003.html
//! [BEP-9]: http://bittorrent.org/beps/bep_0009.html

mod error;
mod info_hash;
mod magnet;
mod torrent;

pub use error::MetainfoError;
pub use info_hash::InfoHash;
pub use magnet::MagnetLink;
pub use torrent::{extract_metadata, File, Info, Metainfo};
