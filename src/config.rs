//! Engine configuration
//!
//! Every tunable the swarm and tracker client use, with defaults from
//! [`constants`](crate::constants). Both structs are plain serde types; the
//! crate itself never reads or writes configuration files.

use crate::constants::*;
use crate::swarm::PickPolicy;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
#[error("invalid {field}: {reason}")]
pub struct ConfigError {
    pub field: &'static str,
    pub reason: String,
}

impl ConfigError {
    fn new(field: &'static str, reason: impl Into<String>) -> Self {
        Self {
            field,
            reason: reason.into(),
        }
    }
}

/// Configuration of one torrent's swarm.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SwarmConfig {
    /// Block size for requests (bytes)
    pub block_size: u32,

    /// Maximum connected peers
    pub max_peers: usize,

    /// Maximum outbound connections still connecting or handshaking
    pub max_half_open: usize,

    /// TCP connect timeout in milliseconds
    pub connect_timeout_ms: u64,

    /// Handshake timeout in milliseconds
    pub handshake_timeout_ms: u64,

    /// Silence after which a peer is dropped, in milliseconds
    pub idle_timeout_ms: u64,

    /// Interval between keep-alives we send, in milliseconds
    pub keepalive_interval_ms: u64,

    /// Timeout for a single write to a peer, in milliseconds
    pub write_timeout_ms: u64,

    /// Outstanding block requests per peer
    pub max_requests_per_peer: usize,

    /// Simultaneously requested blocks per piece
    pub max_inflight_per_piece: usize,

    /// Endgame starts once at most this many pieces are missing
    pub endgame_threshold: usize,

    /// Piece selection order
    pub pick_policy: PickPolicy,

    /// Violations tolerated before a peer is dropped
    pub fault_threshold: u32,

    /// How long a faulted address stays banned, in seconds
    pub fault_cooldown_secs: u64,

    /// Peers unchoked at once
    pub upload_slots: usize,

    /// Bytes uploaded to a peer before tit-for-tat applies
    pub fairness_threshold: u64,

    /// Pieces each peer may request while choked (0 disables)
    pub allowed_fast_count: usize,

    /// Port we listen on and announce
    pub listen_port: u16,

    /// Keep serving uploads after the download finishes
    pub seed_after_finish: bool,

    /// Tracker client configuration
    pub tracker: TrackerConfig,
}

impl Default for SwarmConfig {
    fn default() -> Self {
        Self {
            block_size: BLOCK_SIZE,
            max_peers: MAX_PEERS_PER_TORRENT,
            max_half_open: MAX_HALF_OPEN,
            connect_timeout_ms: CONNECTION_TIMEOUT.as_millis() as u64,
            handshake_timeout_ms: HANDSHAKE_TIMEOUT.as_millis() as u64,
            idle_timeout_ms: PEER_IDLE_TIMEOUT.as_millis() as u64,
            keepalive_interval_ms: KEEPALIVE_INTERVAL.as_millis() as u64,
            write_timeout_ms: PEER_WRITE_TIMEOUT.as_millis() as u64,
            max_requests_per_peer: MAX_REQUESTS_PER_PEER,
            max_inflight_per_piece: MAX_INFLIGHT_PER_PIECE,
            endgame_threshold: ENDGAME_PIECES_THRESHOLD,
            pick_policy: PickPolicy::default(),
            fault_threshold: FAULT_THRESHOLD,
            fault_cooldown_secs: FAULT_COOLDOWN.as_secs(),
            upload_slots: DEFAULT_UPLOAD_SLOTS,
            fairness_threshold: FAIRNESS_THRESHOLD,
            allowed_fast_count: DEFAULT_ALLOWED_FAST_COUNT,
            listen_port: DEFAULT_PORT,
            seed_after_finish: true,
            tracker: TrackerConfig::default(),
        }
    }
}

impl SwarmConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_millis(self.keepalive_interval_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    pub fn fault_cooldown(&self) -> Duration {
        Duration::from_secs(self.fault_cooldown_secs)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.block_size == 0 || self.block_size > MAX_REQUEST_LENGTH {
            return Err(ConfigError::new(
                "block_size",
                format!("must be between 1 and {MAX_REQUEST_LENGTH}"),
            ));
        }
        if self.max_peers == 0 {
            return Err(ConfigError::new("max_peers", "must be at least 1"));
        }
        if self.max_half_open == 0 {
            return Err(ConfigError::new("max_half_open", "must be at least 1"));
        }
        if self.max_requests_per_peer == 0 {
            return Err(ConfigError::new("max_requests_per_peer", "must be at least 1"));
        }
        if self.max_inflight_per_piece == 0 {
            return Err(ConfigError::new("max_inflight_per_piece", "must be at least 1"));
        }
        if self.idle_timeout_ms <= self.keepalive_interval_ms {
            return Err(ConfigError::new(
                "keepalive_interval_ms",
                "must be shorter than idle_timeout_ms",
            ));
        }
        self.tracker.validate()
    }
}

/// UDP tracker client configuration (BEP-15).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// Base retransmission timeout in milliseconds; attempt `n` waits
    /// `base * 2^n`
    pub retransmit_base_ms: u64,

    /// Highest retransmission exponent before giving up
    pub max_attempt: u32,

    /// Connection id lifetime in milliseconds
    pub connection_id_ttl_ms: u64,

    /// Peers requested per announce (-1 = tracker default)
    pub num_want: i32,

    /// Re-announce interval used when the tracker sends none, in seconds
    pub fallback_interval_secs: u64,

    /// Lower bound on the re-announce interval, in seconds
    pub min_interval_secs: u64,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            retransmit_base_ms: UDP_RETRANSMIT_BASE.as_millis() as u64,
            max_attempt: UDP_MAX_ATTEMPT,
            connection_id_ttl_ms: UDP_CONNECTION_ID_TTL.as_millis() as u64,
            num_want: DEFAULT_NUM_WANT,
            fallback_interval_secs: TRACKER_ANNOUNCE_INTERVAL.as_secs(),
            min_interval_secs: TRACKER_MIN_INTERVAL.as_secs(),
        }
    }
}

impl TrackerConfig {
    pub fn retransmit_base(&self) -> Duration {
        Duration::from_millis(self.retransmit_base_ms)
    }

    pub fn connection_id_ttl(&self) -> Duration {
        Duration::from_millis(self.connection_id_ttl_ms)
    }

    /// Interval until the next announce, given what the tracker asked for.
    pub fn announce_interval(&self, requested_secs: u32) -> Duration {
        let secs = match requested_secs {
            0 => self.fallback_interval_secs,
            n => u64::from(n).max(self.min_interval_secs),
        };
        Duration::from_secs(secs)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.retransmit_base_ms == 0 {
            return Err(ConfigError::new("retransmit_base_ms", "must be positive"));
        }
        if self.max_attempt > 16 {
            return Err(ConfigError::new("max_attempt", "must be at most 16"));
        }
        Ok(())
    }
}
