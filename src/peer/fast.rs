use sha1::{Digest, Sha1};
use std::collections::{HashSet, VecDeque};
use std::net::IpAddr;

/// Fast extension (BEP-6) state for one connection.
///
/// Only meaningful when both handshakes set the fast bit; with it off,
/// every fast message from the peer is a protocol violation.
#[derive(Debug, Clone, Default)]
pub struct FastState {
    enabled: bool,
    /// Pieces the remote peer lets us request while it chokes us.
    allowed_incoming: HashSet<u32>,
    /// Pieces we serve to the remote peer while choking it.
    allowed_outgoing: HashSet<u32>,
    suggested: VecDeque<u32>,
}

impl FastState {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            ..Self::default()
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn add_allowed_incoming(&mut self, piece: u32) {
        self.allowed_incoming.insert(piece);
    }

    pub fn set_allowed_outgoing(&mut self, pieces: impl IntoIterator<Item = u32>) {
        self.allowed_outgoing = pieces.into_iter().collect();
    }

    pub fn can_request_while_choked(&self, piece: u32) -> bool {
        self.allowed_incoming.contains(&piece)
    }

    pub fn serves_while_choked(&self, piece: u32) -> bool {
        self.allowed_outgoing.contains(&piece)
    }

    pub fn add_suggested(&mut self, piece: u32) {
        if !self.suggested.contains(&piece) {
            self.suggested.push_back(piece);
        }
    }

    pub fn suggested(&self) -> impl Iterator<Item = u32> + '_ {
        self.suggested.iter().copied()
    }

    pub fn forget_suggested(&mut self, piece: u32) {
        self.suggested.retain(|&p| p != piece);
    }
}

/// Generates the allowed-fast set for a peer with the canonical BEP-6
/// algorithm.
///
/// IPv4 addresses are masked to /24; for IPv6 the first four bytes are
/// used. The set never holds more indices than there are pieces.
pub fn generate_allowed_fast_set(
    info_hash: &[u8; 20],
    peer_ip: IpAddr,
    num_pieces: u32,
    set_size: usize,
) -> Vec<u32> {
    let set_size = set_size.min(num_pieces as usize);
    let mut allowed = Vec::with_capacity(set_size);
    if set_size == 0 {
        return allowed;
    }

    let ip_bytes = match peer_ip {
        IpAddr::V4(ip) => {
            let o = ip.octets();
            [o[0], o[1], o[2], 0]
        }
        IpAddr::V6(ip) => {
            let o = ip.octets();
            [o[0], o[1], o[2], o[3]]
        }
    };

    let mut x = Vec::with_capacity(24);
    x.extend_from_slice(&ip_bytes);
    x.extend_from_slice(info_hash);

    while allowed.len() < set_size {
        let hash = Sha1::digest(&x);

        for chunk in hash.chunks_exact(4) {
            if allowed.len() >= set_size {
                break;
            }
            let index = u32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]) % num_pieces;
            if !allowed.contains(&index) {
                allowed.push(index);
            }
        }

        x = hash.to_vec();
    }

    allowed
}
