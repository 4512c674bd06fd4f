//! Protocol constants and tuning parameters.
//!
//! Wire-level values fixed by the BEPs live next to the defaults for every
//! tunable in [`SwarmConfig`](crate::config::SwarmConfig) and
//! [`TrackerConfig`](crate::config::TrackerConfig).

use std::time::Duration;

// ============================================================================
// Client identification
// ============================================================================

/// Client ID prefix for peer ID generation (Azureus-style)
pub const CLIENT_PREFIX: &str = "-SB0001-";

/// Client name sent in the extension handshake `v` field
pub const CLIENT_NAME: &str = "swarmbit 0.1.0";

// ============================================================================
// Ports
// ============================================================================

/// Default BitTorrent listen port
pub const DEFAULT_PORT: u16 = 6881;

// ============================================================================
// Connection limits
// ============================================================================

/// Maximum connected peers per torrent
pub const MAX_PEERS_PER_TORRENT: usize = 50;

/// Maximum outbound connections still in TCP connect or handshake
pub const MAX_HALF_OPEN: usize = 8;

/// Peers unchoked for uploads at any one time
pub const DEFAULT_UPLOAD_SLOTS: usize = 4;

/// How often unchoke slots are re-evaluated
pub const UNCHOKE_INTERVAL: Duration = Duration::from_secs(10);

/// Maximum outstanding block requests we keep queued with one peer
pub const MAX_REQUESTS_PER_PEER: usize = 16;

/// Maximum simultaneously requested blocks of one piece
pub const MAX_INFLIGHT_PER_PIECE: usize = 64;

/// Size of the allowed-fast set we grant each peer (BEP-6)
pub const DEFAULT_ALLOWED_FAST_COUNT: usize = 10;

/// Outstanding request reqq advertised in the extension handshake
pub const DEFAULT_REQQ: usize = 250;

// ============================================================================
// Fault and fairness policy
// ============================================================================

/// Protocol violations tolerated before a peer is dropped
pub const FAULT_THRESHOLD: u32 = 3;

/// How long a faulted address is kept off the connect list
pub const FAULT_COOLDOWN: Duration = Duration::from_secs(600);

/// Bytes uploaded to a peer before tit-for-tat kicks in
pub const FAIRNESS_THRESHOLD: u64 = 4 * 1024 * 1024;

// ============================================================================
// Block and piece sizes
// ============================================================================

/// Standard block size (16 KiB)
pub const BLOCK_SIZE: u32 = 16384;

/// Largest block a peer may request from us (128 KiB)
pub const MAX_REQUEST_LENGTH: u32 = 131072;

/// Endgame starts once this few pieces remain and all are fully requested
pub const ENDGAME_PIECES_THRESHOLD: usize = 4;

/// Metadata piece size for ut_metadata (BEP-9)
pub const METADATA_PIECE_SIZE: usize = 16384;

/// Largest info dictionary accepted over the wire (8 MiB)
pub const MAX_METADATA_SIZE: usize = 8 * 1024 * 1024;

/// Largest frame accepted on a peer connection
pub const MAX_MESSAGE_SIZE: usize = 4 * 1024 * 1024;

// ============================================================================
// Timeouts - Connection
// ============================================================================

/// TCP connect timeout
pub const CONNECTION_TIMEOUT: Duration = Duration::from_secs(5);

/// Time allowed for the 68-byte handshake exchange
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Idle time before a silent peer is dropped
pub const PEER_IDLE_TIMEOUT: Duration = Duration::from_secs(120);

/// Timeout for a single write to a peer
pub const PEER_WRITE_TIMEOUT: Duration = Duration::from_secs(30);

/// Interval between keep-alives we send
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(90);

// ============================================================================
// Tracker (BEP-15)
// ============================================================================

/// Magic protocol id of a UDP tracker connect request
pub const UDP_PROTOCOL_ID: u64 = 0x41727101980;

/// Base retransmission timeout; attempt `n` waits `base * 2^n`
pub const UDP_RETRANSMIT_BASE: Duration = Duration::from_secs(15);

/// Highest retransmission exponent before giving up
pub const UDP_MAX_ATTEMPT: u32 = 8;

/// Lifetime of a UDP tracker connection id
pub const UDP_CONNECTION_ID_TTL: Duration = Duration::from_secs(60);

/// Largest UDP tracker datagram we expect
pub const UDP_MAX_PACKET_SIZE: usize = 2048;

/// Peers requested per announce (-1 means the tracker's default)
pub const DEFAULT_NUM_WANT: i32 = -1;

/// Re-announce interval used when a tracker gives none
pub const TRACKER_ANNOUNCE_INTERVAL: Duration = Duration::from_secs(1800);

/// Lower bound on any tracker-supplied interval
pub const TRACKER_MIN_INTERVAL: Duration = Duration::from_secs(60);
