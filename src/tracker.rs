//! UDP tracker client (BEP-15)
//!
//! [`packet`] builds and matches datagrams without touching a socket,
//! [`UdpTracker`] drives one tracker's connect/announce/scrape exchange with
//! retransmission, and [`TrackerClient`] falls back down an announce-list.

mod client;
mod error;
pub mod packet;
mod response;
mod udp;

pub use client::{AnnounceRound, TrackerClient};
pub use error::TrackerError;
pub use packet::{Action, Reply, Transaction};
pub use response::{
    parse_compact_peers, AnnounceRequest, AnnounceResponse, CompactPeer, ScrapeFile,
    ScrapeResponse, TrackerEvent,
};
pub use udp::{parse_udp_url, RetryPolicy, TrackerState, UdpTracker};

#[cfg(test)]
mod tests;
