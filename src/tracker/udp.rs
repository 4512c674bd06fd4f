use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use rand::rngs::StdRng;
use rand::RngCore;
use tokio::net::{lookup_host, UdpSocket};
use tokio::time::{timeout_at, Instant};
use tracing::{debug, trace};

use super::error::TrackerError;
use super::packet::{
    decode_reply, encode_announce, encode_connect, encode_scrape, Action, Reply, Transaction,
};
use super::response::{AnnounceRequest, AnnounceResponse, ScrapeResponse};
use crate::config::TrackerConfig;
use crate::constants::UDP_MAX_PACKET_SIZE;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackerState {
    Connect,
    Announce,
    Scrape,
    /// The last request failed; the next one starts over.
    Error,
}

/// Retransmission schedule: attempt `n` waits `base * 2^n`, for
/// `n = 0..=max_attempt`.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub base: Duration,
    pub max_attempt: u32,
}

impl RetryPolicy {
    pub fn from_config(config: &TrackerConfig) -> Self {
        Self {
            base: config.retransmit_base(),
            max_attempt: config.max_attempt,
        }
    }

    /// `None` once the tracker should be abandoned.
    pub fn timeout_for(&self, attempt: u32) -> Option<Duration> {
        if attempt > self.max_attempt {
            return None;
        }
        self.base.checked_mul(1u32.checked_shl(attempt)?)
    }
}

/// One UDP tracker endpoint.
///
/// Dropping it closes the socket, which cancels every pending timer.
pub struct UdpTracker<R = StdRng> {
    url: String,
    socket: UdpSocket,
    addr: SocketAddr,
    connection: Option<(u64, Instant)>,
    ttl: Duration,
    retry: RetryPolicy,
    num_want: i32,
    key: u32,
    rng: R,
    state: TrackerState,
}

impl<R: RngCore> UdpTracker<R> {
    pub async fn bind(url: &str, config: &TrackerConfig, mut rng: R) -> Result<Self, TrackerError> {
        let (host, port) = parse_udp_url(url)?;
        let addr = lookup_host((host.as_str(), port))
            .await
            .map_err(|_| TrackerError::Resolve(host.clone()))?
            .next()
            .ok_or_else(|| TrackerError::Resolve(host.clone()))?;

        let local: SocketAddr = if addr.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let socket = UdpSocket::bind(local).await?;
        socket.connect(addr).await?;

        let key = rng.next_u32();
        Ok(Self {
            url: url.to_string(),
            socket,
            addr,
            connection: None,
            ttl: config.connection_id_ttl(),
            retry: RetryPolicy::from_config(config),
            num_want: config.num_want,
            key,
            rng,
            state: TrackerState::Connect,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn state(&self) -> TrackerState {
        self.state
    }

    /// The current connection id, if one was ever granted and is still
    /// within its lifetime.
    pub fn connection_id(&self) -> Option<u64> {
        match self.connection {
            Some((id, issued)) if issued.elapsed() < self.ttl => Some(id),
            _ => None,
        }
    }

    pub async fn announce(
        &mut self,
        request: &AnnounceRequest,
    ) -> Result<AnnounceResponse, TrackerError> {
        let key = self.key;
        let num_want = self.num_want;
        let reply = self
            .request(TrackerState::Announce, Action::Announce, &[], |conn, tid| {
                encode_announce(conn, tid, request, key, num_want)
            })
            .await?;
        match reply {
            Reply::Announced(response) => {
                debug!(
                    tracker = %self.url,
                    peers = response.peers.len(),
                    interval = response.interval,
                    "announce ok"
                );
                Ok(response)
            }
            other => Err(unexpected(other)),
        }
    }

    pub async fn scrape(&mut self, info_hash: [u8; 20]) -> Result<ScrapeResponse, TrackerError> {
        let hashes = [info_hash];
        let reply = self
            .request(TrackerState::Scrape, Action::Scrape, &hashes, |conn, tid| {
                encode_scrape(conn, tid, &hashes)
            })
            .await?;
        match reply {
            Reply::Scraped(response) => Ok(response),
            other => Err(unexpected(other)),
        }
    }

    async fn ensure_connected(&mut self) -> Result<u64, TrackerError> {
        if let Some(id) = self.connection_id() {
            return Ok(id);
        }
        self.connection = None;
        self.state = TrackerState::Connect;

        let tid = self.rng.next_u32();
        let mut attempt = 0;
        loop {
            let wait = self.give_up_after(attempt)?;
            let txn = self.transaction(tid, Action::Connect, attempt, wait);
            match self.attempt(&encode_connect(tid), &txn, &[]).await {
                Ok(Some(Reply::Connected { connection_id })) => {
                    trace!(tracker = %self.url, connection_id, "connected");
                    self.connection = Some((connection_id, Instant::now()));
                    return Ok(connection_id);
                }
                Ok(Some(reply)) => return Err(self.fail(reply)),
                Ok(None) => attempt += 1,
                Err(e) => {
                    self.state = TrackerState::Error;
                    return Err(e);
                }
            }
        }
    }

    /// Sends one request until it is answered or the schedule runs out.
    ///
    /// The transaction id stays the same across retransmissions. An
    /// expired connection id is renewed before the next send.
    async fn request<F>(
        &mut self,
        state: TrackerState,
        action: Action,
        scraped: &[[u8; 20]],
        build: F,
    ) -> Result<Reply, TrackerError>
    where
        F: Fn(u64, u32) -> Vec<u8>,
    {
        let tid = self.rng.next_u32();
        let mut attempt = 0;
        loop {
            let wait = self.give_up_after(attempt)?;
            let connection_id = self.ensure_connected().await?;
            self.state = state;

            let txn = self.transaction(tid, action, attempt, wait);
            match self.attempt(&build(connection_id, tid), &txn, scraped).await {
                Ok(Some(Reply::Error(message))) => return Err(self.fail(Reply::Error(message))),
                Ok(Some(reply)) => return Ok(reply),
                Ok(None) => attempt += 1,
                Err(e) => {
                    self.state = TrackerState::Error;
                    return Err(e);
                }
            }
        }
    }

    fn give_up_after(&mut self, attempt: u32) -> Result<Duration, TrackerError> {
        match self.retry.timeout_for(attempt) {
            Some(wait) => Ok(wait),
            None => {
                debug!(tracker = %self.url, attempts = attempt, "tracker abandoned");
                self.state = TrackerState::Error;
                Err(TrackerError::Timeout)
            }
        }
    }

    fn transaction(&self, id: u32, action: Action, attempt: u32, wait: Duration) -> Transaction {
        Transaction {
            id,
            action,
            attempt,
            deadline: Instant::now() + wait,
            tracker: self.url.clone(),
        }
    }

    fn fail(&mut self, reply: Reply) -> TrackerError {
        self.state = TrackerState::Error;
        match reply {
            Reply::Error(message) => {
                debug!(tracker = %self.url, %message, "tracker error reply");
                TrackerError::Failure(message)
            }
            other => unexpected(other),
        }
    }

    /// One send, then every datagram until the deadline. `Ok(None)` means
    /// the deadline passed without a matching reply.
    async fn attempt(
        &self,
        packet: &[u8],
        txn: &Transaction,
        scraped: &[[u8; 20]],
    ) -> Result<Option<Reply>, TrackerError> {
        if txn.attempt > 0 {
            debug!(
                tracker = %self.url,
                action = ?txn.action,
                attempt = txn.attempt,
                "retransmitting"
            );
        }
        self.socket.send(packet).await?;

        let mut buf = [0u8; UDP_MAX_PACKET_SIZE];
        loop {
            match timeout_at(txn.deadline, self.socket.recv(&mut buf)).await {
                Err(_) => return Ok(None),
                Ok(Err(e)) => return Err(TrackerError::Io(e)),
                Ok(Ok(n)) => {
                    if let Some(reply) = decode_reply(&buf[..n], txn, scraped)? {
                        return Ok(Some(reply));
                    }
                }
            }
        }
    }
}

fn unexpected(reply: Reply) -> TrackerError {
    TrackerError::InvalidResponse(format!("unexpected reply {reply:?}"))
}

/// Splits `udp://host:port[/path]` into host and port. IPv6 hosts are
/// bracketed.
pub fn parse_udp_url(url: &str) -> Result<(String, u16), TrackerError> {
    let rest = url
        .strip_prefix("udp://")
        .ok_or_else(|| TrackerError::UnsupportedProtocol(url.to_string()))?;
    let authority = rest.split('/').next().unwrap_or(rest);

    let invalid = || TrackerError::InvalidUrl(url.to_string());
    let (host, port) = if let Some(bracketed) = authority.strip_prefix('[') {
        let (host, tail) = bracketed.split_once(']').ok_or_else(invalid)?;
        (host, tail.strip_prefix(':').ok_or_else(invalid)?)
    } else {
        authority.rsplit_once(':').ok_or_else(invalid)?
    };
    if host.is_empty() {
        return Err(invalid());
    }
    let port: u16 = port.parse().map_err(|_| invalid())?;
    Ok((host.to_string(), port))
}
