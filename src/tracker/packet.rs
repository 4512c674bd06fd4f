//! UDP tracker datagrams (BEP-15), without any socket.

use tokio::time::Instant;

use tracing::debug;

use super::error::TrackerError;
use super::response::{parse_compact_peers, AnnounceRequest, AnnounceResponse, ScrapeFile, ScrapeResponse};
use crate::constants::UDP_PROTOCOL_ID;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Connect = 0,
    Announce = 1,
    Scrape = 2,
    Error = 3,
}

impl Action {
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            0 => Some(Action::Connect),
            1 => Some(Action::Announce),
            2 => Some(Action::Scrape),
            3 => Some(Action::Error),
            _ => None,
        }
    }
}

/// One outstanding request to a tracker.
///
/// Retransmissions reuse the id; `attempt` is the exponent of the current
/// timeout.
#[derive(Debug, Clone)]
pub struct Transaction {
    pub id: u32,
    pub action: Action,
    pub attempt: u32,
    pub deadline: Instant,
    pub tracker: String,
}

/// A reply matched to its transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Connected { connection_id: u64 },
    Announced(AnnounceResponse),
    Scraped(ScrapeResponse),
    Error(String),
}

pub fn encode_connect(transaction_id: u32) -> Vec<u8> {
    let mut packet = Vec::with_capacity(16);
    packet.extend_from_slice(&UDP_PROTOCOL_ID.to_be_bytes());
    packet.extend_from_slice(&(Action::Connect as u32).to_be_bytes());
    packet.extend_from_slice(&transaction_id.to_be_bytes());
    packet
}

pub fn encode_announce(
    connection_id: u64,
    transaction_id: u32,
    request: &AnnounceRequest,
    key: u32,
    num_want: i32,
) -> Vec<u8> {
    let mut packet = Vec::with_capacity(98);
    packet.extend_from_slice(&connection_id.to_be_bytes());
    packet.extend_from_slice(&(Action::Announce as u32).to_be_bytes());
    packet.extend_from_slice(&transaction_id.to_be_bytes());
    packet.extend_from_slice(&request.info_hash);
    packet.extend_from_slice(&request.peer_id);
    packet.extend_from_slice(&request.downloaded.to_be_bytes());
    packet.extend_from_slice(&request.left.to_be_bytes());
    packet.extend_from_slice(&request.uploaded.to_be_bytes());
    packet.extend_from_slice(&request.event.as_udp_id().to_be_bytes());
    packet.extend_from_slice(&0u32.to_be_bytes()); // IP address (0 = default)
    packet.extend_from_slice(&key.to_be_bytes());
    packet.extend_from_slice(&num_want.to_be_bytes());
    packet.extend_from_slice(&request.port.to_be_bytes());
    packet
}

pub fn encode_scrape(connection_id: u64, transaction_id: u32, info_hashes: &[[u8; 20]]) -> Vec<u8> {
    let mut packet = Vec::with_capacity(16 + 20 * info_hashes.len());
    packet.extend_from_slice(&connection_id.to_be_bytes());
    packet.extend_from_slice(&(Action::Scrape as u32).to_be_bytes());
    packet.extend_from_slice(&transaction_id.to_be_bytes());
    for hash in info_hashes {
        packet.extend_from_slice(hash);
    }
    packet
}

fn read_u32(data: &[u8], at: usize) -> u32 {
    u32::from_be_bytes([data[at], data[at + 1], data[at + 2], data[at + 3]])
}

/// Matches a datagram against the outstanding transaction.
///
/// `Ok(None)` means the datagram belongs to someone else (too short to
/// carry a header, or a different transaction id) and must be ignored.
/// Error replies are only believed when their transaction id matches.
///
/// Scrape replies carry no hashes; `scraped` names them in request order.
pub fn decode_reply(
    data: &[u8],
    txn: &Transaction,
    scraped: &[[u8; 20]],
) -> Result<Option<Reply>, TrackerError> {
    if data.len() < 8 {
        debug!(tracker = %txn.tracker, len = data.len(), "discarding runt datagram");
        return Ok(None);
    }

    let action = read_u32(data, 0);
    let transaction_id = read_u32(data, 4);
    if transaction_id != txn.id {
        debug!(
            tracker = %txn.tracker,
            expected = txn.id,
            got = transaction_id,
            "discarding datagram for another transaction"
        );
        return Ok(None);
    }

    let body = &data[8..];
    match Action::from_u32(action) {
        Some(Action::Error) => Ok(Some(Reply::Error(
            String::from_utf8_lossy(body).into_owned(),
        ))),
        Some(a) if a != txn.action => Err(TrackerError::InvalidResponse(format!(
            "expected {:?} reply, got {:?}",
            txn.action, a
        ))),
        Some(Action::Connect) => {
            if body.len() < 8 {
                return Err(TrackerError::InvalidResponse("connect reply too short".into()));
            }
            let mut id = [0u8; 8];
            id.copy_from_slice(&body[..8]);
            Ok(Some(Reply::Connected {
                connection_id: u64::from_be_bytes(id),
            }))
        }
        Some(Action::Announce) => {
            if body.len() < 12 {
                return Err(TrackerError::InvalidResponse("announce reply too short".into()));
            }
            let peers = &body[12..];
            if peers.len() % 6 != 0 {
                return Err(TrackerError::InvalidResponse(format!(
                    "{} peer bytes is not a multiple of 6",
                    peers.len()
                )));
            }
            Ok(Some(Reply::Announced(AnnounceResponse {
                interval: read_u32(body, 0),
                leechers: read_u32(body, 4),
                seeders: read_u32(body, 8),
                peers: parse_compact_peers(peers),
            })))
        }
        Some(Action::Scrape) => {
            if body.len() % 12 != 0 || body.len() / 12 > scraped.len() {
                return Err(TrackerError::InvalidResponse(format!(
                    "scrape reply of {} bytes",
                    body.len()
                )));
            }
            let files = body
                .chunks_exact(12)
                .zip(scraped)
                .map(|(entry, hash)| ScrapeFile {
                    info_hash: *hash,
                    complete: read_u32(entry, 0),
                    downloaded: read_u32(entry, 4),
                    incomplete: read_u32(entry, 8),
                })
                .collect();
            Ok(Some(Reply::Scraped(ScrapeResponse { files })))
        }
        None => Err(TrackerError::InvalidResponse(format!("unknown action {action}"))),
    }
}
