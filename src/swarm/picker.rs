use crate::peer::{Bitfield, BlockRequest};
use crate::storage::PieceStore;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Order in which missing pieces are fetched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PickPolicy {
    /// Lowest index first, for streaming.
    Sequential,
    /// Fewest holders in the swarm first.
    #[default]
    RarestFirst,
}

/// Chooses which piece a peer should be asked for next.
///
/// Keeps a per-piece count of how many connected peers hold it. Pieces
/// already partly requested are finished before new ones are started, then
/// pieces the peer suggested, then the rest in policy order.
#[derive(Debug)]
pub struct PiecePicker {
    policy: PickPolicy,
    availability: Vec<u32>,
    endgame_threshold: usize,
}

impl PiecePicker {
    pub fn new(piece_count: usize, policy: PickPolicy, endgame_threshold: usize) -> Self {
        Self {
            policy,
            availability: vec![0; piece_count],
            endgame_threshold,
        }
    }

    pub fn policy(&self) -> PickPolicy {
        self.policy
    }

    pub fn set_policy(&mut self, policy: PickPolicy) {
        self.policy = policy;
    }

    pub fn availability(&self, piece: u32) -> u32 {
        self.availability.get(piece as usize).copied().unwrap_or(0)
    }

    /// Counts every piece in a newly known peer bitfield.
    pub fn peer_has(&mut self, bitfield: &Bitfield) {
        for (index, count) in self.availability.iter_mut().enumerate() {
            if bitfield.has_piece(index) {
                *count += 1;
            }
        }
    }

    /// Forgets a departed peer's pieces.
    pub fn peer_lost(&mut self, bitfield: &Bitfield) {
        for (index, count) in self.availability.iter_mut().enumerate() {
            if bitfield.has_piece(index) {
                *count = count.saturating_sub(1);
            }
        }
    }

    pub fn have(&mut self, piece: u32) {
        if let Some(count) = self.availability.get_mut(piece as usize) {
            *count += 1;
        }
    }

    /// Best piece to request a new block from.
    ///
    /// `requestable` says whether the peer may be asked for a piece right
    /// now (it has the piece and is not choking us for it). Pieces in
    /// `skip` are passed over.
    pub fn pick<F>(
        &self,
        store: &PieceStore,
        suggested: &[u32],
        skip: &HashSet<u32>,
        requestable: F,
    ) -> Option<u32>
    where
        F: Fn(u32) -> bool,
    {
        let mut best: Option<(u8, u32, u32)> = None;

        for piece in store.missing_pieces() {
            if skip.contains(&piece) || store.fully_requested(piece) || !requestable(piece) {
                continue;
            }
            let tier = if store.in_progress(piece) {
                0
            } else if suggested.contains(&piece) {
                1
            } else {
                2
            };
            let key = match self.policy {
                PickPolicy::Sequential => 0,
                PickPolicy::RarestFirst => self.availability(piece),
            };
            let rank = (tier, key, piece);
            if best.map_or(true, |b| rank < b) {
                best = Some(rank);
            }
        }

        best.map(|(_, _, piece)| piece)
    }

    /// True once few enough pieces remain and every block of them has been
    /// requested from someone.
    pub fn in_endgame(&self, store: &PieceStore) -> bool {
        let mut missing = 0;
        for piece in store.missing_pieces() {
            if !store.fully_requested(piece) {
                return false;
            }
            missing += 1;
        }
        missing > 0 && missing <= self.endgame_threshold
    }

    /// Outstanding blocks a peer could be asked for a second time, rarest
    /// pieces first.
    pub fn endgame_requests<F>(&self, store: &PieceStore, requestable: F) -> Vec<BlockRequest>
    where
        F: Fn(u32) -> bool,
    {
        let mut pieces: Vec<u32> = store.missing_pieces().filter(|&p| requestable(p)).collect();
        pieces.sort_by_key(|&p| (self.availability(p), p));
        pieces
            .into_iter()
            .flat_map(|p| store.outstanding_blocks(p))
            .collect()
    }
}
