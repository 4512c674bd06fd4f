//! swarmbit - A BitTorrent swarm engine
//!
//! Downloads and seeds torrent content from `.torrent` files or magnet
//! links, following the BEP (BitTorrent Enhancement Proposals)
//! specifications.
//!
//! # Modules
//!
//! - [`bencode`] - BEP-3 Bencode encoding/decoding
//! - [`metainfo`] - BEP-3/9 Torrent metainfo and magnet links
//! - [`storage`] - Piece verification and cross-file reads and writes
//! - [`peer`] - BEP-3/6/9/10 Peer wire protocol, fast extension, extension protocol, metadata exchange
//! - [`tracker`] - BEP-15 UDP tracker protocol
//! - [`swarm`] - Piece picking, endgame, uploads and the session event loop
//! - [`config`] - Tunables with validation
//! - [`constants`] - Protocol constants and defaults

pub mod bencode;
pub mod config;
pub mod constants;
pub mod metainfo;
pub mod peer;
pub mod storage;
pub mod swarm;
pub mod tracker;

pub use bencode::{decode, encode, BencodeError, Value};
pub use config::{ConfigError, SwarmConfig, TrackerConfig};
pub use metainfo::{File, Info, InfoHash, MagnetLink, Metainfo, MetainfoError};
pub use peer::{
    Bitfield, BlockRequest, ExtensionHandshake, Handshake, Message, PeerError, PeerId,
    PeerSession,
};
pub use storage::{ExistingDirProvider, FileProvider, FileSet, PieceStore, StorageError};
pub use swarm::{
    NullSink, Phase, PickPolicy, ProgressSink, Session, Source, Swarm, SwarmError, SwarmEvent,
};
pub use tracker::{
    AnnounceRequest, AnnounceResponse, CompactPeer, ScrapeResponse, TrackerClient, TrackerError,
    TrackerEvent, UdpTracker,
};
