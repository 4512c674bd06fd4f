//! Metadata exchange extension (ut_metadata, BEP-9).
//!
//! Magnet downloads start without the info dictionary. Peers that
//! advertise `ut_metadata` and a `metadata_size` serve it in 16 KiB pieces;
//! [`MetadataExchange`] spreads those piece requests over peers, assembles
//! the result and checks it against the magnet's info-hash.

use std::collections::{HashMap, HashSet};

use bytes::Bytes;
use tracing::{debug, warn};

use super::error::PeerError;
use super::session::ConnectionId;
use crate::bencode::{decode_prefix, encode, Dict, Value};
use crate::constants::{MAX_METADATA_SIZE, METADATA_PIECE_SIZE};
use crate::metainfo::InfoHash;

/// Message types for the ut_metadata extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetadataMessageType {
    Request = 0,
    Data = 1,
    Reject = 2,
}

impl MetadataMessageType {
    pub fn from_byte(b: i64) -> Option<Self> {
        match b {
            0 => Some(MetadataMessageType::Request),
            1 => Some(MetadataMessageType::Data),
            2 => Some(MetadataMessageType::Reject),
            _ => None,
        }
    }
}

/// A ut_metadata message: a bencoded header, followed by the raw piece
/// bytes for data messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataMessage {
    pub msg_type: MetadataMessageType,
    pub piece: u32,
    /// Only present in data messages.
    pub total_size: Option<usize>,
    /// Only present in data messages.
    pub data: Option<Bytes>,
}

impl MetadataMessage {
    pub fn request(piece: u32) -> Self {
        Self {
            msg_type: MetadataMessageType::Request,
            piece,
            total_size: None,
            data: None,
        }
    }

    pub fn data(piece: u32, total_size: usize, data: Bytes) -> Self {
        Self {
            msg_type: MetadataMessageType::Data,
            piece,
            total_size: Some(total_size),
            data: Some(data),
        }
    }

    pub fn reject(piece: u32) -> Self {
        Self {
            msg_type: MetadataMessageType::Reject,
            piece,
            total_size: None,
            data: None,
        }
    }

    pub fn encode(&self) -> Result<Bytes, PeerError> {
        let mut dict = Dict::new();
        dict.insert("msg_type", Value::Integer(self.msg_type as i64));
        dict.insert("piece", Value::Integer(self.piece as i64));
        if let Some(total_size) = self.total_size {
            dict.insert("total_size", Value::Integer(total_size as i64));
        }

        let mut out = encode(&Value::Dict(dict))?;
        if let Some(ref data) = self.data {
            out.extend_from_slice(data);
        }
        Ok(Bytes::from(out))
    }

    pub fn decode(payload: &[u8]) -> Result<Self, PeerError> {
        let (value, header_len) = decode_prefix(payload)?;
        let dict = value
            .as_dict()
            .ok_or_else(|| PeerError::Extension("expected dict".into()))?;

        let msg_type = dict
            .get(b"msg_type")
            .and_then(Value::as_integer)
            .and_then(MetadataMessageType::from_byte)
            .ok_or_else(|| PeerError::Extension("missing or invalid msg_type".into()))?;

        let piece = dict
            .get(b"piece")
            .and_then(Value::as_integer)
            .and_then(|p| u32::try_from(p).ok())
            .ok_or_else(|| PeerError::Extension("missing or invalid piece".into()))?;

        let total_size = dict
            .get(b"total_size")
            .and_then(Value::as_integer)
            .and_then(|s| usize::try_from(s).ok());

        let data = (msg_type == MetadataMessageType::Data)
            .then(|| Bytes::copy_from_slice(&payload[header_len..]));

        Ok(Self {
            msg_type,
            piece,
            total_size,
            data,
        })
    }
}

pub fn metadata_piece_count(metadata_size: usize) -> usize {
    metadata_size.div_ceil(METADATA_PIECE_SIZE)
}

/// Length of metadata piece `piece`, or 0 past the end.
pub fn metadata_piece_size(piece: u32, total_size: usize) -> usize {
    let offset = piece as usize * METADATA_PIECE_SIZE;
    if offset >= total_size {
        0
    } else {
        (total_size - offset).min(METADATA_PIECE_SIZE)
    }
}

/// Slice of an info dictionary served in answer to a metadata request.
pub fn serve_metadata_piece(raw_info: &Bytes, piece: u32) -> Option<Bytes> {
    let len = metadata_piece_size(piece, raw_info.len());
    if len == 0 {
        return None;
    }
    let start = piece as usize * METADATA_PIECE_SIZE;
    Some(raw_info.slice(start..start + len))
}

/// Result of feeding a data message into [`MetadataExchange`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetadataOutcome {
    /// Stored; more pieces outstanding.
    Accepted,
    /// Not something we asked for, or the wrong size. Dropped, and a piece
    /// the sender was asked for is up for grabs again.
    Ignored,
    /// All pieces arrived and hash to the expected info-hash.
    Complete(Bytes),
    /// All pieces arrived but the hash was wrong. Everything was discarded
    /// and `contributors` will not be asked again. Assembly restarts at the
    /// size some other peer advertised, if any did.
    Mismatch { contributors: Vec<ConnectionId> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Missing,
    Requested(ConnectionId),
    Received(ConnectionId),
}

/// Assembles the info dictionary from ut_metadata data messages.
#[derive(Debug)]
pub struct MetadataExchange {
    info_hash: InfoHash,
    size: Option<usize>,
    /// `metadata_size` as advertised by each peer.
    offers: HashMap<ConnectionId, usize>,
    slots: Vec<Slot>,
    buffer: Vec<u8>,
    excluded: HashSet<ConnectionId>,
}

impl MetadataExchange {
    pub fn new(info_hash: InfoHash) -> Self {
        Self {
            info_hash,
            size: None,
            offers: HashMap::new(),
            slots: Vec::new(),
            buffer: Vec::new(),
            excluded: HashSet::new(),
        }
    }

    pub fn size(&self) -> Option<usize> {
        self.size
    }

    /// Records the size `peer` advertised in its extension handshake.
    ///
    /// The first plausible size is assembled against. Peers disagreeing
    /// with it are not asked for pieces until a hash failure or a departure
    /// discredits it.
    pub fn offer_size(&mut self, peer: ConnectionId, size: i64) -> Result<(), PeerError> {
        let size = usize::try_from(size)
            .ok()
            .filter(|&s| s > 0 && s <= MAX_METADATA_SIZE)
            .ok_or_else(|| PeerError::Extension(format!("metadata_size {size} out of range")))?;

        if self.is_excluded(peer) {
            return Ok(());
        }
        self.offers.insert(peer, size);
        match self.size {
            Some(known) if known != size => {
                debug!(known, offered = size, "conflicting metadata size");
            }
            Some(_) => {}
            None => self.adopt(size),
        }
        Ok(())
    }

    /// Starts assembly over at `size`.
    fn adopt(&mut self, size: usize) {
        self.size = Some(size);
        self.slots = vec![Slot::Missing; metadata_piece_count(size)];
        self.buffer = vec![0u8; size];
    }

    /// The size offered by the earliest connected peer still trusted.
    fn preferred_offer(&self) -> Option<usize> {
        self.offers
            .iter()
            .min_by_key(|(peer, _)| **peer)
            .map(|(_, size)| *size)
    }

    fn disagrees(&self, peer: ConnectionId) -> bool {
        self.offers
            .get(&peer)
            .is_some_and(|&offered| Some(offered) != self.size)
    }

    pub fn is_excluded(&self, peer: ConnectionId) -> bool {
        self.excluded.contains(&peer)
    }

    /// Assigns the next missing piece to `peer`.
    pub fn next_request(&mut self, peer: ConnectionId) -> Option<u32> {
        if self.is_excluded(peer) || self.disagrees(peer) {
            return None;
        }
        let index = self.slots.iter().position(|s| *s == Slot::Missing)?;
        self.slots[index] = Slot::Requested(peer);
        Some(index as u32)
    }

    /// Puts a piece rejected by `peer` back up for grabs.
    pub fn on_reject(&mut self, peer: ConnectionId, piece: u32) {
        if let Some(slot) = self.slots.get_mut(piece as usize) {
            if *slot == Slot::Requested(peer) {
                *slot = Slot::Missing;
            }
        }
    }

    /// Releases every piece assigned to a departed peer.
    ///
    /// If nobody left vouches for the size in use and nothing has been
    /// received against it, assembly switches to a size still on offer.
    pub fn peer_gone(&mut self, peer: ConnectionId) {
        for slot in &mut self.slots {
            if *slot == Slot::Requested(peer) {
                *slot = Slot::Missing;
            }
        }
        if self.offers.remove(&peer).is_none() {
            return;
        }
        let backed = self.offers.values().any(|&s| Some(s) == self.size);
        let started = self.slots.iter().any(|s| matches!(s, Slot::Received(_)));
        if !backed && !started {
            if let Some(size) = self.preferred_offer() {
                debug!(size, "switching metadata size");
                self.adopt(size);
            }
        }
    }

    fn release(&mut self, peer: ConnectionId, piece: u32) -> MetadataOutcome {
        self.on_reject(peer, piece);
        MetadataOutcome::Ignored
    }

    pub fn on_data(
        &mut self,
        peer: ConnectionId,
        piece: u32,
        total_size: Option<usize>,
        data: &[u8],
    ) -> MetadataOutcome {
        let Some(size) = self.size else {
            return MetadataOutcome::Ignored;
        };
        if total_size.is_some_and(|t| t != size)
            || data.len() != metadata_piece_size(piece, size)
        {
            return self.release(peer, piece);
        }
        match self.slots.get(piece as usize) {
            Some(Slot::Requested(_)) => {}
            _ => return MetadataOutcome::Ignored,
        }

        let start = piece as usize * METADATA_PIECE_SIZE;
        self.buffer[start..start + data.len()].copy_from_slice(data);
        self.slots[piece as usize] = Slot::Received(peer);

        if self.slots.iter().any(|s| !matches!(s, Slot::Received(_))) {
            return MetadataOutcome::Accepted;
        }

        if self.info_hash.verify(&self.buffer) {
            debug!(size, "metadata verified");
            return MetadataOutcome::Complete(Bytes::from(std::mem::take(&mut self.buffer)));
        }

        let mut contributors: Vec<_> = self
            .slots
            .iter()
            .filter_map(|s| match s {
                Slot::Received(p) => Some(*p),
                _ => None,
            })
            .collect();
        contributors.sort_unstable();
        contributors.dedup();
        warn!(?contributors, "metadata failed hash check");

        for peer in &contributors {
            self.excluded.insert(*peer);
            self.offers.remove(peer);
        }
        let next = self.preferred_offer().unwrap_or(size);
        if next != size {
            debug!(size = next, "retrying metadata at another advertised size");
        }
        self.adopt(next);
        MetadataOutcome::Mismatch { contributors }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PEER_A: ConnectionId = ConnectionId(1);
    const PEER_B: ConnectionId = ConnectionId(2);

    fn fake_info(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 199) as u8).collect()
    }

    #[test]
    fn test_request_decode() {
        let decoded = MetadataMessage::decode(b"d8:msg_typei0e5:piecei5ee").unwrap();
        assert_eq!(decoded, MetadataMessage::request(5));
    }

    #[test]
    fn test_data_keeps_trailing_bytes() {
        let data = Bytes::from_static(b"d1:ae");
        let encoded = MetadataMessage::data(2, 1000, data.clone()).encode().unwrap();
        assert!(encoded.starts_with(b"d8:msg_typei1e5:piecei2e10:total_sizei1000ee"));

        let decoded = MetadataMessage::decode(&encoded).unwrap();
        assert_eq!(decoded.msg_type, MetadataMessageType::Data);
        assert_eq!(decoded.total_size, Some(1000));
        assert_eq!(decoded.data, Some(data));
    }

    #[test]
    fn test_decode_rejects_bad_header() {
        assert!(MetadataMessage::decode(b"d8:msg_typei7e5:piecei0ee").is_err());
        assert!(MetadataMessage::decode(b"d8:msg_typei0e5:piecei-1ee").is_err());
        assert!(MetadataMessage::decode(b"li0ee").is_err());
    }

    #[test]
    fn test_metadata_piece_count() {
        assert_eq!(metadata_piece_count(1), 1);
        assert_eq!(metadata_piece_count(16384), 1);
        assert_eq!(metadata_piece_count(16385), 2);
        assert_eq!(metadata_piece_size(1, 16385), 1);
        assert_eq!(metadata_piece_size(2, 16385), 0);
    }

    #[test]
    fn test_exchange_assembles_from_two_peers() {
        let info = fake_info(20000);
        let mut exchange = MetadataExchange::new(InfoHash::v1_of(&info));
        assert_eq!(exchange.next_request(PEER_A), None);

        exchange.offer_size(PEER_A, info.len() as i64).unwrap();
        assert_eq!(exchange.next_request(PEER_A), Some(0));
        assert_eq!(exchange.next_request(PEER_B), Some(1));
        assert_eq!(exchange.next_request(PEER_B), None);

        let outcome = exchange.on_data(PEER_B, 1, Some(20000), &info[16384..]);
        assert_eq!(outcome, MetadataOutcome::Accepted);
        let outcome = exchange.on_data(PEER_A, 0, Some(20000), &info[..16384]);
        assert_eq!(outcome, MetadataOutcome::Complete(Bytes::from(info)));
    }

    #[test]
    fn test_exchange_rejects_wrong_sizes() {
        let info = fake_info(100);
        let mut exchange = MetadataExchange::new(InfoHash::v1_of(&info));
        assert!(exchange.offer_size(PEER_A, 0).is_err());
        assert!(exchange
            .offer_size(PEER_A, MAX_METADATA_SIZE as i64 + 1)
            .is_err());

        exchange.offer_size(PEER_A, 100).unwrap();
        exchange.offer_size(PEER_B, 200).unwrap();
        assert_eq!(exchange.size(), Some(100));
        assert_eq!(exchange.next_request(PEER_B), None);

        assert_eq!(exchange.next_request(PEER_A), Some(0));
        assert_eq!(
            exchange.on_data(PEER_A, 0, Some(100), &info[..50]),
            MetadataOutcome::Ignored
        );
        assert_eq!(
            exchange.on_data(PEER_A, 0, Some(200), &info),
            MetadataOutcome::Ignored
        );
        // The malformed reply gave the piece back.
        assert_eq!(exchange.next_request(PEER_A), Some(0));
    }

    #[test]
    fn test_lying_size_gives_way_to_honest_peer() {
        let info = fake_info(20000);
        let mut exchange = MetadataExchange::new(InfoHash::v1_of(&info));

        exchange.offer_size(PEER_A, 100).unwrap();
        exchange.offer_size(PEER_B, 20000).unwrap();
        assert_eq!(exchange.size(), Some(100));

        // The honest peer answers against its own size; nothing sticks.
        assert_eq!(exchange.next_request(PEER_A), Some(0));
        assert_eq!(
            exchange.on_data(PEER_B, 0, Some(20000), &info[..16384]),
            MetadataOutcome::Ignored
        );
        assert_eq!(
            exchange.on_data(PEER_A, 0, Some(100), &[7u8; 100]),
            MetadataOutcome::Mismatch {
                contributors: vec![PEER_A]
            }
        );

        assert_eq!(exchange.size(), Some(20000));
        assert_eq!(exchange.next_request(PEER_A), None);
        assert_eq!(exchange.next_request(PEER_B), Some(0));
        assert_eq!(exchange.next_request(PEER_B), Some(1));
        assert_eq!(
            exchange.on_data(PEER_B, 0, Some(20000), &info[..16384]),
            MetadataOutcome::Accepted
        );
        assert_eq!(
            exchange.on_data(PEER_B, 1, Some(20000), &info[16384..]),
            MetadataOutcome::Complete(Bytes::from(info))
        );
    }

    #[test]
    fn test_departed_size_source_is_replaced() {
        let info = fake_info(300);
        let mut exchange = MetadataExchange::new(InfoHash::v1_of(&info));
        exchange.offer_size(PEER_A, 999).unwrap();
        exchange.offer_size(PEER_B, 300).unwrap();
        assert_eq!(exchange.next_request(PEER_A), Some(0));

        exchange.peer_gone(PEER_A);
        assert_eq!(exchange.size(), Some(300));
        assert_eq!(exchange.next_request(PEER_B), Some(0));
        assert!(matches!(
            exchange.on_data(PEER_B, 0, Some(300), &info),
            MetadataOutcome::Complete(_)
        ));
    }

    #[test]
    fn test_exchange_mismatch_excludes_contributors() {
        let info = fake_info(100);
        let mut exchange = MetadataExchange::new(InfoHash::v1_of(&info));
        exchange.offer_size(PEER_A, 100).unwrap();

        let mut bad = info.clone();
        bad[0] ^= 1;
        assert_eq!(exchange.next_request(PEER_A), Some(0));
        assert_eq!(
            exchange.on_data(PEER_A, 0, None, &bad),
            MetadataOutcome::Mismatch {
                contributors: vec![PEER_A]
            }
        );

        assert!(exchange.is_excluded(PEER_A));
        assert_eq!(exchange.next_request(PEER_A), None);
        assert_eq!(exchange.next_request(PEER_B), Some(0));
        assert!(matches!(
            exchange.on_data(PEER_B, 0, None, &info),
            MetadataOutcome::Complete(_)
        ));
    }

    #[test]
    fn test_reject_and_disconnect_release_pieces() {
        let info = fake_info(40000);
        let mut exchange = MetadataExchange::new(InfoHash::v1_of(&info));
        exchange.offer_size(PEER_A, 40000).unwrap();

        assert_eq!(exchange.next_request(PEER_A), Some(0));
        assert_eq!(exchange.next_request(PEER_A), Some(1));
        exchange.on_reject(PEER_A, 0);
        assert_eq!(exchange.next_request(PEER_B), Some(0));
        exchange.peer_gone(PEER_A);
        assert_eq!(exchange.next_request(PEER_B), Some(1));
    }

    #[test]
    fn test_serve_metadata_piece() {
        let raw = Bytes::from(fake_info(20000));
        assert_eq!(serve_metadata_piece(&raw, 1).unwrap().len(), 20000 - 16384);
        assert!(serve_metadata_piece(&raw, 2).is_none());
    }
}
