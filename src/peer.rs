//! Peer wire protocol (BEP-3, BEP-6, BEP-9, BEP-10)
//!
//! This module implements the BitTorrent peer wire protocol: the 68-byte
//! handshake and length-prefixed framing, the fast extension, the extension
//! protocol, and metadata exchange for magnet links.
//!
//! I/O and protocol state are kept apart. [`connect_outbound`] and
//! [`accept_inbound`] perform the handshake and hand back a
//! [`PeerTransport`], which splits into a [`FrameReader`] and a
//! [`FrameWriter`]. Everything decided about a connection after that lives
//! in [`PeerSession`], a plain state machine fed one [`Message`] at a time.

mod bitfield;
mod choking;
mod connection;
mod error;
mod extension;
mod fast;
mod message;
mod metadata;
mod peer_id;
mod piece;
mod session;
mod transport;

pub use bitfield::Bitfield;
pub use choking::{select_unchoked, ChokingState, UnchokeCandidate};
pub use connection::{accept_inbound, connect_outbound, dial, handshake_outbound, Established};
pub use error::PeerError;
pub use extension::{
    ExtensionHandshake, ExtensionMessage, EXTENSION_HANDSHAKE_ID, UT_METADATA, UT_METADATA_ID,
};
pub use fast::{generate_allowed_fast_set, FastState};
pub use message::{Handshake, Message, MessageId, HANDSHAKE_LEN};
pub use metadata::{
    metadata_piece_count, metadata_piece_size, serve_metadata_piece, MetadataExchange,
    MetadataMessage, MetadataMessageType, MetadataOutcome,
};
pub use peer_id::PeerId;
pub use piece::BlockRequest;
pub use session::{ConnectionId, Inbound, PeerSession, SessionLimits, SessionState};
pub use transport::{FrameReader, FrameWriter, PeerTransport};

#[cfg(test)]
mod tests;
