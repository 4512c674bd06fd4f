use super::session::ConnectionId;
use std::cmp::Reverse;
use std::collections::HashSet;

/// The four choke/interest flags of one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChokingState {
    pub am_choking: bool,
    pub am_interested: bool,
    pub peer_choking: bool,
    pub peer_interested: bool,
}

impl Default for ChokingState {
    fn default() -> Self {
        Self {
            am_choking: true,
            am_interested: false,
            peer_choking: true,
            peer_interested: false,
        }
    }
}

/// What the unchoke policy needs to know about a connected peer.
#[derive(Debug, Clone, Copy)]
pub struct UnchokeCandidate {
    pub id: ConnectionId,
    pub interested: bool,
    pub downloaded: u64,
    pub uploaded: u64,
}

/// Picks which peers to unchoke: interested peers only, at most `slots`.
///
/// While leeching, peers that gave us the most data win; when seeding,
/// the ones we served most. Ties go to the older connection.
pub fn select_unchoked(
    candidates: &[UnchokeCandidate],
    slots: usize,
    seeding: bool,
) -> HashSet<ConnectionId> {
    let mut interested: Vec<_> = candidates.iter().filter(|c| c.interested).collect();

    if seeding {
        interested.sort_by_key(|c| (Reverse(c.uploaded), c.id));
    } else {
        interested.sort_by_key(|c| (Reverse(c.downloaded), c.id));
    }

    interested.into_iter().take(slots).map(|c| c.id).collect()
}
