use super::coordinator::{Phase, Swarm};
use super::error::SwarmError;
use super::events::ProgressSink;
use crate::config::SwarmConfig;
use crate::constants::UNCHOKE_INTERVAL;
use crate::metainfo::{MagnetLink, Metainfo};
use crate::peer::{
    accept_inbound, dial, handshake_outbound, ConnectionId, Established, Message, PeerError,
    PeerId, PeerTransport,
};
use crate::storage::{ExistingDirProvider, FileProvider, FileSet};
use crate::tracker::{AnnounceRequest, AnnounceRound, TrackerClient, TrackerEvent};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::collections::HashMap;
use std::future::{pending, Future};
use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep_until, timeout, timeout_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// What a download starts from.
#[derive(Debug, Clone)]
pub enum Source {
    Torrent(Arc<Metainfo>),
    Magnet(MagnetLink),
}

/// Results of per-connection tasks, funnelled back to the session loop.
enum PeerEvent {
    TcpConnected {
        id: ConnectionId,
    },
    Dialed {
        id: ConnectionId,
        result: Result<Established, PeerError>,
    },
    Accepted(Established),
    InboundFailed {
        addr: SocketAddr,
        error: PeerError,
    },
    Message {
        id: ConnectionId,
        message: Message,
    },
    /// A frame that failed to decode; the connection stays up.
    Violation {
        id: ConnectionId,
        error: PeerError,
    },
    Closed {
        id: ConnectionId,
        error: PeerError,
    },
}

/// The tasks behind one live connection.
///
/// Dropping the link stops the reader and lets the writer flush what it
/// already holds before shutting the socket.
struct PeerLink {
    outbox: mpsc::UnboundedSender<Vec<Message>>,
    reader: JoinHandle<()>,
}

impl Drop for PeerLink {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

/// Drives a [`Swarm`] over real sockets.
///
/// One `select!` loop owns the swarm. Per-connection reader and writer
/// tasks, outbound dials, inbound handshakes and the tracker task all
/// report back over channels, so the swarm itself is never shared.
pub struct Session<S, P = ExistingDirProvider> {
    swarm: Swarm<S>,
    provider: P,
    destination: PathBuf,
    peers: Vec<SocketAddr>,
    listener: Option<TcpListener>,
    rng: StdRng,
}

impl<S: ProgressSink, P: FileProvider> Session<S, P> {
    pub fn new(
        source: Source,
        provider: P,
        destination: PathBuf,
        config: SwarmConfig,
        sink: S,
    ) -> Result<Self, SwarmError> {
        let our_id = PeerId::generate();
        let (swarm, peers) = match source {
            Source::Torrent(metainfo) => (
                Swarm::from_metainfo(metainfo, our_id, config, sink)?,
                Vec::new(),
            ),
            Source::Magnet(magnet) => {
                let swarm = Swarm::from_magnet(&magnet, our_id, config, sink)?;
                (swarm, magnet.peers)
            }
        };
        Ok(Self {
            swarm,
            provider,
            destination,
            peers,
            listener: None,
            rng: StdRng::from_rng(&mut rand::rng()),
        })
    }

    /// Accepts inbound peers on `listener` and announces its port.
    pub fn with_listener(mut self, listener: TcpListener) -> io::Result<Self> {
        let port = listener.local_addr()?.port();
        self.swarm.set_listen_port(port);
        self.listener = Some(listener);
        Ok(self)
    }

    /// Peers to dial before any tracker answers.
    pub fn with_peers<I>(mut self, peers: I) -> Self
    where
        I: IntoIterator<Item = SocketAddr>,
    {
        self.peers.extend(peers);
        self
    }

    /// Seeds the random source used for tracker transaction ids and keys.
    pub fn with_rng(mut self, rng: StdRng) -> Self {
        self.rng = rng;
        self
    }

    pub fn swarm(&self) -> &Swarm<S> {
        &self.swarm
    }

    /// Runs until the download finishes, or forever when seeding after
    /// completion is enabled.
    pub async fn run(self) -> Result<Swarm<S>, SwarmError> {
        self.run_until(pending()).await
    }

    /// Runs until `shutdown` resolves or the download is done.
    ///
    /// Returns the swarm so its counters and sink can be inspected. A
    /// storage failure is reported to the sink and returned.
    pub async fn run_until<F>(mut self, shutdown: F) -> Result<Swarm<S>, SwarmError>
    where
        F: Future<Output = ()>,
    {
        match self.drive(shutdown).await {
            Ok(()) => Ok(self.swarm),
            Err(e) => {
                self.swarm.fail(&e);
                Err(e)
            }
        }
    }

    async fn drive<F>(&mut self, shutdown: F) -> Result<(), SwarmError>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let mut links: HashMap<ConnectionId, PeerLink> = HashMap::new();
        let listener = self.listener.take();

        if self.swarm.phase() == Phase::AwaitingFiles {
            self.open_files().await?;
        }

        let (announce_tx, mut rounds_rx, tracker_task) = self.spawn_tracker();
        let announce = |request: AnnounceRequest| {
            announce_tx
                .as_ref()
                .is_some_and(|tx| tx.send(request).is_ok())
        };
        // Rounds requested but not yet answered.
        let mut in_flight = usize::from(announce(
            self.swarm.announce_request(TrackerEvent::Started),
        ));
        let mut next_announce: Option<Instant> = None;
        let mut completed_sent = self.swarm.is_finished();
        let mut done = false;

        let initial = std::mem::take(&mut self.peers);
        let dials = self.swarm.connect_candidates(initial);
        self.dial(dials, &events_tx);

        let mut unchoke = interval(UNCHOKE_INTERVAL);
        unchoke.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let result = loop {
            if self.swarm.phase() == Phase::AwaitingFiles {
                if let Err(e) = self.open_files().await {
                    break Err(e);
                }
            }
            self.flush(&mut links);

            if self.swarm.is_finished() {
                if !completed_sent {
                    in_flight +=
                        usize::from(announce(self.swarm.announce_request(TrackerEvent::Completed)));
                    completed_sent = true;
                }
                if !self.swarm.config().seed_after_finish {
                    done = true;
                    break Ok(());
                }
            }

            tokio::select! {
                _ = &mut shutdown => {
                    info!("shutting down");
                    break Ok(());
                }
                Some(event) = events_rx.recv() => {
                    if let Err(e) = self.on_peer_event(event, &events_tx, &mut links).await {
                        break Err(e);
                    }
                }
                accepted = accept(listener.as_ref()) => match accepted {
                    Ok((stream, addr)) => self.handshake_inbound(stream, addr, &events_tx),
                    Err(e) => warn!(error = %e, "accept failed"),
                },
                Some(round) = rounds_rx.recv() => {
                    in_flight = in_flight.saturating_sub(1);
                    let requested = round.response.as_ref().map_or(0, |(_, r)| r.interval);
                    let wait = self.swarm.config().tracker.announce_interval(requested);
                    next_announce = Some(Instant::now() + wait);
                    let dials = self.swarm.on_announce(round);
                    self.dial(dials, &events_tx);
                }
                _ = sleep_until(next_announce.unwrap_or_else(Instant::now)), if next_announce.is_some() => {
                    next_announce = None;
                    in_flight +=
                        usize::from(announce(self.swarm.announce_request(TrackerEvent::None)));
                }
                _ = unchoke.tick() => self.swarm.tick(),
            }
        };

        self.flush(&mut links);
        drop(links);
        if done && in_flight > 0 {
            // Connect and announce each get one retransmission period.
            let deadline = Instant::now() + self.swarm.config().tracker.retransmit_base() * 2;
            while in_flight > 0 {
                match timeout_at(deadline, rounds_rx.recv()).await {
                    Ok(Some(round)) => {
                        in_flight -= 1;
                        self.swarm.on_announce(round);
                    }
                    Ok(None) | Err(_) => {
                        debug!(in_flight, "leaving with tracker rounds unanswered");
                        break;
                    }
                }
            }
        }
        if let Some(task) = tracker_task {
            // Dropping the task drops its sockets, which cancels any
            // retransmission still pending.
            task.abort();
        }
        result
    }

    async fn open_files(&mut self) -> Result<(), SwarmError> {
        let metainfo = self
            .swarm
            .metainfo()
            .cloned()
            .ok_or(SwarmError::NoMetadata)?;
        let files = FileSet::open(&self.provider, metainfo, self.destination.clone()).await?;
        self.swarm.attach_files(files).await
    }

    #[allow(clippy::type_complexity)]
    fn spawn_tracker(
        &mut self,
    ) -> (
        Option<mpsc::UnboundedSender<AnnounceRequest>>,
        mpsc::UnboundedReceiver<AnnounceRound>,
        Option<JoinHandle<()>>,
    ) {
        let (rounds_tx, rounds_rx) = mpsc::unbounded_channel();
        let urls = self.swarm.trackers().to_vec();
        if urls.is_empty() {
            debug!("no trackers; relying on known peers");
            return (None, rounds_rx, None);
        }

        let (requests_tx, mut requests_rx) = mpsc::unbounded_channel::<AnnounceRequest>();
        let rng = StdRng::from_rng(&mut self.rng);
        let mut client = TrackerClient::new(urls, self.swarm.config().tracker.clone(), rng);
        let task = tokio::spawn(async move {
            while let Some(request) = requests_rx.recv().await {
                let round = client.announce(&request).await;
                if rounds_tx.send(round).is_err() {
                    break;
                }
            }
        });
        (Some(requests_tx), rounds_rx, Some(task))
    }

    fn dial(
        &self,
        dials: Vec<(ConnectionId, SocketAddr)>,
        events: &mpsc::UnboundedSender<PeerEvent>,
    ) {
        let info_hash = self.swarm.info_hash().wire_bytes();
        let our_id = self.swarm.our_id();
        let config = self.swarm.config();
        let (connect, handshake) = (config.connect_timeout(), config.handshake_timeout());

        for (id, addr) in dials {
            let events = events.clone();
            tokio::spawn(async move {
                let result = match dial(addr, connect).await {
                    Ok(transport) => {
                        let _ = events.send(PeerEvent::TcpConnected { id });
                        handshake_outbound(addr, transport, info_hash, our_id, handshake).await
                    }
                    Err(e) => Err(e),
                };
                let _ = events.send(PeerEvent::Dialed { id, result });
            });
        }
    }

    fn handshake_inbound(
        &self,
        stream: TcpStream,
        addr: SocketAddr,
        events: &mpsc::UnboundedSender<PeerEvent>,
    ) {
        let info_hash = self.swarm.info_hash().wire_bytes();
        let our_id = self.swarm.our_id();
        let limit = self.swarm.config().handshake_timeout();
        let events = events.clone();
        tokio::spawn(async move {
            let event = match accept_inbound(stream, info_hash, our_id, limit).await {
                Ok(established) => PeerEvent::Accepted(established),
                Err(error) => PeerEvent::InboundFailed { addr, error },
            };
            let _ = events.send(event);
        });
    }

    async fn on_peer_event(
        &mut self,
        event: PeerEvent,
        events: &mpsc::UnboundedSender<PeerEvent>,
        links: &mut HashMap<ConnectionId, PeerLink>,
    ) -> Result<(), SwarmError> {
        match event {
            PeerEvent::TcpConnected { id } => self.swarm.on_tcp_connected(id),
            PeerEvent::Dialed { id, result } => match result {
                Ok(established) => {
                    if self.swarm.on_connected(id, &established.handshake) {
                        links.insert(id, self.start_link(id, established.transport, events));
                    }
                }
                Err(error) => self.swarm.on_connect_failed(id, &error),
            },
            PeerEvent::Accepted(established) => {
                if let Some(id) = self.swarm.on_accepted(established.addr, &established.handshake)
                {
                    links.insert(id, self.start_link(id, established.transport, events));
                }
            }
            PeerEvent::InboundFailed { addr, error } => self.swarm.on_inbound_failed(addr, &error),
            PeerEvent::Message { id, message } => self.swarm.on_message(id, message).await?,
            PeerEvent::Violation { id, error } => self.swarm.on_violation(id, &error),
            PeerEvent::Closed { id, error } => {
                links.remove(&id);
                self.swarm.on_disconnected(id, &error);
            }
        }
        Ok(())
    }

    /// Splits an established connection into a reader and a writer task.
    ///
    /// The writer sends a keep-alive whenever nothing else went out for a
    /// full keep-alive interval.
    fn start_link(
        &self,
        id: ConnectionId,
        transport: PeerTransport,
        events: &mpsc::UnboundedSender<PeerEvent>,
    ) -> PeerLink {
        let config = self.swarm.config();
        let (idle, keepalive, write_limit) = (
            config.idle_timeout(),
            config.keepalive_interval(),
            config.write_timeout(),
        );
        let (mut reader, mut writer) = transport.into_split();
        let (outbox, mut batches) = mpsc::unbounded_channel::<Vec<Message>>();

        let inbound = events.clone();
        let reader = tokio::spawn(async move {
            loop {
                match reader.next_message(idle).await {
                    Ok(message) => {
                        if inbound.send(PeerEvent::Message { id, message }).is_err() {
                            return;
                        }
                    }
                    Err(error) if error.keeps_framing() => {
                        if inbound.send(PeerEvent::Violation { id, error }).is_err() {
                            return;
                        }
                    }
                    Err(error) => {
                        let _ = inbound.send(PeerEvent::Closed { id, error });
                        return;
                    }
                }
            }
        });

        let outbound = events.clone();
        tokio::spawn(async move {
            loop {
                let batch = match timeout(keepalive, batches.recv()).await {
                    Ok(Some(batch)) => batch,
                    Ok(None) => {
                        let _ = writer.shutdown().await;
                        return;
                    }
                    Err(_) => vec![Message::KeepAlive],
                };
                if let Err(error) = writer.send_all(&batch, write_limit).await {
                    let _ = outbound.send(PeerEvent::Closed { id, error });
                    return;
                }
            }
        });

        PeerLink { outbox, reader }
    }

    /// Hands queued messages to writers and tears down closed connections.
    fn flush(&mut self, links: &mut HashMap<ConnectionId, PeerLink>) {
        for (id, messages) in self.swarm.drain_outgoing() {
            if let Some(link) = links.get(&id) {
                let _ = link.outbox.send(messages);
            }
        }
        for id in self.swarm.take_closed() {
            links.remove(&id);
        }
    }
}

async fn accept(listener: Option<&TcpListener>) -> io::Result<(TcpStream, SocketAddr)> {
    match listener {
        Some(listener) => listener.accept().await,
        None => pending().await,
    }
}
