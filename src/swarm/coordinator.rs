use super::error::SwarmError;
use super::events::{ProgressSink, SwarmEvent};
use super::picker::PiecePicker;
use crate::config::SwarmConfig;
use crate::constants::{CLIENT_NAME, DEFAULT_REQQ};
use crate::metainfo::{InfoHash, MagnetLink, Metainfo};
use crate::peer::{
    generate_allowed_fast_set, select_unchoked, serve_metadata_piece, Bitfield, BlockRequest,
    ConnectionId, ExtensionHandshake, ExtensionMessage, Handshake, Inbound, Message,
    MetadataExchange, MetadataMessage, MetadataMessageType, MetadataOutcome, PeerError, PeerId,
    PeerSession, SessionLimits, SessionState, UnchokeCandidate, EXTENSION_HANDSHAKE_ID,
};
use crate::storage::{BlockOutcome, FileSet, PieceStore, StorageError};
use crate::tracker::{AnnounceRequest, AnnounceRound, TrackerEvent};
use bytes::Bytes;
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

/// Where a swarm is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Fetching the info dictionary from peers (magnet start).
    Metadata,
    /// Metadata known; waiting for [`Swarm::attach_files`].
    AwaitingFiles,
    /// Re-hashing data already on disk. No requests go out.
    Verifying,
    Downloading,
    /// Everything verified; only uploading.
    Seeding,
}

/// The download/upload state of one torrent across all its peers.
///
/// Connections live in an arena keyed by [`ConnectionId`]. The swarm never
/// touches a socket: the driver feeds it connection results and messages,
/// then collects outgoing messages with [`drain_outgoing`](Self::drain_outgoing)
/// and closes whatever [`take_closed`](Self::take_closed) names.
pub struct Swarm<S> {
    info_hash: InfoHash,
    our_id: PeerId,
    config: SwarmConfig,
    listen_port: u16,
    trackers: Vec<String>,
    metainfo: Option<Arc<Metainfo>>,
    store: Option<PieceStore>,
    picker: Option<PiecePicker>,
    metadata: Option<MetadataExchange>,
    sessions: HashMap<ConnectionId, PeerSession>,
    next_id: u64,
    faulted: HashMap<SocketAddr, Instant>,
    closed: Vec<ConnectionId>,
    phase: Phase,
    downloaded: u64,
    uploaded: u64,
    finished: bool,
    sink: S,
}

impl<S: ProgressSink> Swarm<S> {
    /// A swarm for a torrent whose metainfo is already known.
    pub fn from_metainfo(
        metainfo: Arc<Metainfo>,
        our_id: PeerId,
        config: SwarmConfig,
        sink: S,
    ) -> Result<Self, SwarmError> {
        config.validate()?;
        metainfo.validate()?;
        let mut swarm = Self::empty(metainfo.info_hash, our_id, config, sink);
        swarm.trackers = metainfo.trackers();
        swarm.metainfo = Some(metainfo);
        swarm.phase = Phase::AwaitingFiles;
        Ok(swarm)
    }

    /// A swarm that first fetches the info dictionary from peers.
    pub fn from_magnet(
        magnet: &MagnetLink,
        our_id: PeerId,
        config: SwarmConfig,
        sink: S,
    ) -> Result<Self, SwarmError> {
        config.validate()?;
        let mut swarm = Self::empty(magnet.info_hash, our_id, config, sink);
        swarm.trackers = magnet.trackers.clone();
        swarm.metadata = Some(MetadataExchange::new(magnet.info_hash));
        Ok(swarm)
    }

    fn empty(info_hash: InfoHash, our_id: PeerId, config: SwarmConfig, sink: S) -> Self {
        Self {
            info_hash,
            our_id,
            listen_port: config.listen_port,
            config,
            trackers: Vec::new(),
            metainfo: None,
            store: None,
            picker: None,
            metadata: None,
            sessions: HashMap::new(),
            next_id: 0,
            faulted: HashMap::new(),
            closed: Vec::new(),
            phase: Phase::Metadata,
            downloaded: 0,
            uploaded: 0,
            finished: false,
            sink,
        }
    }

    pub fn info_hash(&self) -> InfoHash {
        self.info_hash
    }

    pub fn our_id(&self) -> PeerId {
        self.our_id
    }

    pub fn config(&self) -> &SwarmConfig {
        &self.config
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn metainfo(&self) -> Option<&Arc<Metainfo>> {
        self.metainfo.as_ref()
    }

    pub fn store(&self) -> Option<&PieceStore> {
        self.store.as_ref()
    }

    pub fn trackers(&self) -> &[String] {
        &self.trackers
    }

    pub fn downloaded(&self) -> u64 {
        self.downloaded
    }

    pub fn uploaded(&self) -> u64 {
        self.uploaded
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn peer_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn session(&self, id: ConnectionId) -> Option<&PeerSession> {
        self.sessions.get(&id)
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn sink_mut(&mut self) -> &mut S {
        &mut self.sink
    }

    /// The port announced to trackers, once the listener is bound.
    pub fn set_listen_port(&mut self, port: u16) {
        self.listen_port = port;
    }

    fn limits(&self) -> SessionLimits {
        SessionLimits {
            fault_threshold: self.config.fault_threshold,
            max_requests: self.config.max_requests_per_peer,
        }
    }

    fn piece_count(&self) -> Option<usize> {
        self.store.as_ref().map(PieceStore::piece_count)
    }

    fn allocate_id(&mut self) -> ConnectionId {
        self.next_id += 1;
        ConnectionId(self.next_id)
    }

    /// Opens storage over `files`, re-hashes what is already there, and
    /// starts transferring.
    pub async fn attach_files(&mut self, files: FileSet) -> Result<(), SwarmError> {
        let metainfo = self.metainfo.clone().ok_or(SwarmError::NoMetadata)?;
        let mut store = PieceStore::from_metainfo(&metainfo, self.config.block_size)?
            .with_inflight_cap(self.config.max_inflight_per_piece);
        store.attach(files);

        self.phase = Phase::Verifying;
        let sink = &mut self.sink;
        let have = store
            .verify_existing(|checked, total| {
                sink.emit(SwarmEvent::VerificationProgress { checked, total })
            })
            .await?;
        info!(
            name = %metainfo.info.name,
            have = have.count(),
            total = have.piece_count(),
            "existing data checked"
        );

        let piece_count = store.piece_count();
        let complete = store.is_complete();
        self.store = Some(store);
        self.metadata = None;

        // Peers that connected during the metadata phase only now get a
        // piece count.
        let mut picker = PiecePicker::new(
            piece_count,
            self.config.pick_policy,
            self.config.endgame_threshold,
        );
        let mut broken = Vec::new();
        for (id, session) in &mut self.sessions {
            match session.set_piece_count(piece_count) {
                Ok(()) => picker.peer_has(session.bitfield()),
                Err(e) => broken.push((*id, e)),
            }
        }
        self.picker = Some(picker);
        for (id, error) in broken {
            self.drop_peer(id, error.to_string(), true);
        }

        self.phase = Phase::Downloading;
        if complete {
            self.finish().await?;
        }

        let ids = self.active_ids();
        for &id in &ids {
            self.announce_pieces(id, &have);
            self.grant_allowed_fast(id);
            self.update_interest(id);
        }
        self.recompute_unchoke();
        self.fill_all();
        Ok(())
    }

    fn active_ids(&self) -> Vec<ConnectionId> {
        let mut ids: Vec<_> = self
            .sessions
            .values()
            .filter(|s| s.is_active())
            .map(PeerSession::id)
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Reserves connection slots for addresses worth dialing.
    ///
    /// Addresses already connected or connecting, and addresses dropped for
    /// misbehaviour within the cool-down, are skipped. At most `max_peers`
    /// sessions and `max_half_open` pending dials exist at once.
    pub fn connect_candidates<I>(&mut self, addrs: I) -> Vec<(ConnectionId, SocketAddr)>
    where
        I: IntoIterator<Item = SocketAddr>,
    {
        self.expire_faults();
        let mut known: HashSet<SocketAddr> = self.sessions.values().map(|s| s.addr()).collect();
        let mut half_open = self
            .sessions
            .values()
            .filter(|s| matches!(s.state(), SessionState::Connecting | SessionState::Handshaking))
            .count();

        let mut dials = Vec::new();
        for addr in addrs {
            if self.sessions.len() >= self.config.max_peers
                || half_open >= self.config.max_half_open
            {
                break;
            }
            if self.faulted.contains_key(&addr) || !known.insert(addr) {
                continue;
            }
            let id = self.allocate_id();
            let session = PeerSession::new(id, addr, self.piece_count(), self.limits());
            self.sessions.insert(id, session);
            half_open += 1;
            dials.push((id, addr));
        }
        if !dials.is_empty() {
            debug!(count = dials.len(), "dialing peers");
        }
        dials
    }

    fn expire_faults(&mut self) {
        let now = Instant::now();
        let cooldown = self.config.fault_cooldown();
        self.faulted
            .retain(|_, at| now.saturating_duration_since(*at) < cooldown);
    }

    /// The dial for `id` reached the peer; handshakes are being exchanged.
    pub fn on_tcp_connected(&mut self, id: ConnectionId) {
        if let Some(session) = self.sessions.get_mut(&id) {
            session.mark_handshaking();
        }
    }

    /// The dial for `id` finished its handshake. False if the slot is gone
    /// and the connection should be closed.
    pub fn on_connected(&mut self, id: ConnectionId, handshake: &Handshake) -> bool {
        let Some(session) = self.sessions.get_mut(&id) else {
            return false;
        };
        if session.state() != SessionState::Handshaking {
            return false;
        }
        session.on_handshake(handshake);
        self.welcome(id);
        true
    }

    /// The dial for `id` failed; its slot is released.
    pub fn on_connect_failed(&mut self, id: ConnectionId, error: &PeerError) {
        // A wrong info hash or handshake is the peer's fault; a refused
        // connection is not.
        self.drop_peer(id, error.to_string(), error.is_violation());
    }

    /// Admits an accepted connection whose handshake checked out.
    pub fn on_accepted(&mut self, addr: SocketAddr, handshake: &Handshake) -> Option<ConnectionId> {
        if self.sessions.len() >= self.config.max_peers {
            debug!(peer = %addr, "refusing inbound peer: at capacity");
            return None;
        }
        self.expire_faults();
        if self.faulted.contains_key(&addr) || self.sessions.values().any(|s| s.addr() == addr) {
            return None;
        }
        let id = self.allocate_id();
        let mut session = PeerSession::new(id, addr, self.piece_count(), self.limits());
        session.mark_handshaking();
        session.on_handshake(handshake);
        self.sessions.insert(id, session);
        self.welcome(id);
        Some(id)
    }

    /// An inbound connection failed before it got a session.
    pub fn on_inbound_failed(&mut self, addr: SocketAddr, error: &PeerError) {
        if error.is_violation() {
            self.faulted.insert(addr, Instant::now());
        }
        debug!(peer = %addr, %error, "inbound handshake failed");
        self.sink.emit(SwarmEvent::PeerDropped {
            peer: addr,
            reason: error.to_string(),
        });
    }

    /// The connection behind `id` ended.
    pub fn on_disconnected(&mut self, id: ConnectionId, error: &PeerError) {
        self.drop_peer(id, error.to_string(), error.is_violation());
    }

    /// First messages after a handshake: our availability, the extension
    /// handshake, and the allowed-fast set.
    fn welcome(&mut self, id: ConnectionId) {
        let metadata_size = self.metainfo.as_ref().map(|m| m.raw_info().len());
        let ours = self.store.as_ref().map(PieceStore::bitfield);
        let Some(session) = self.sessions.get_mut(&id) else {
            return;
        };
        let addr = session.addr();

        match (&ours, session.fast().enabled()) {
            (Some(ours), true) if ours.is_complete() => session.send(Message::HaveAll),
            (Some(ours), _) if !ours.is_empty() => {
                session.send(Message::Bitfield(ours.to_bytes()))
            }
            (_, true) => session.send(Message::HaveNone),
            (_, false) => {}
        }

        if session.supports_extensions() {
            let handshake = ExtensionHandshake::local(CLIENT_NAME, DEFAULT_REQQ, metadata_size);
            match handshake.encode() {
                Ok(payload) => session.send(Message::Extended {
                    id: EXTENSION_HANDSHAKE_ID,
                    payload,
                }),
                Err(e) => warn!(peer = %addr, error = %e, "cannot encode extension handshake"),
            }
        }

        info!(peer = %addr, id = %id, "peer connected");
        self.sink.emit(SwarmEvent::PeerConnected { peer: addr });
        self.grant_allowed_fast(id);
        self.recompute_unchoke();
    }

    fn grant_allowed_fast(&mut self, id: ConnectionId) {
        let count = self.config.allowed_fast_count;
        let (Some(piece_count), Some(session)) = (self.piece_count(), self.sessions.get_mut(&id))
        else {
            return;
        };
        if count == 0 || !session.fast().enabled() {
            return;
        }
        let pieces = generate_allowed_fast_set(
            &self.info_hash.wire_bytes(),
            session.addr().ip(),
            piece_count as u32,
            count,
        );
        session.grant_allowed_fast(&pieces);
    }

    /// Tells a peer greeted before we had storage which pieces we hold.
    fn announce_pieces(&mut self, id: ConnectionId, have: &Bitfield) {
        let Some(session) = self.sessions.get_mut(&id) else {
            return;
        };
        for piece in have.available_pieces() {
            session.send(Message::Have {
                piece: piece as u32,
            });
        }
    }

    /// Removes a peer, returning its outstanding requests to the pool.
    fn drop_peer(&mut self, id: ConnectionId, reason: String, fault: bool) {
        let Some(mut session) = self.sessions.remove(&id) else {
            return;
        };
        let addr = session.addr();
        let was_active = session.is_active();

        for request in session.close() {
            if let Some(store) = self.store.as_mut() {
                store.release_request(&request);
            }
        }
        if let (Some(picker), true) = (self.picker.as_mut(), was_active) {
            picker.peer_lost(session.bitfield());
        }
        let fetching_metadata = match self.metadata.as_mut() {
            Some(exchange) => {
                exchange.peer_gone(id);
                true
            }
            None => false,
        };
        if fault {
            self.faulted.insert(addr, Instant::now());
        }

        debug!(peer = %addr, id = %id, %reason, "dropping peer");
        self.sink.emit(SwarmEvent::PeerDropped { peer: addr, reason });
        self.closed.push(id);

        if was_active {
            self.recompute_unchoke();
            self.fill_all();
            if fetching_metadata {
                self.request_metadata_except(None);
            }
        }
    }

    /// A frame from `id` could not be decoded although the stream is still
    /// in sync. It counts as a fault like any other violation.
    pub fn on_violation(&mut self, id: ConnectionId, error: &PeerError) {
        self.violation(id, error);
    }

    /// Counts a protocol violation against `id` and drops it past the
    /// fault threshold.
    fn violation(&mut self, id: ConnectionId, error: &PeerError) {
        let Some(session) = self.sessions.get_mut(&id) else {
            return;
        };
        let exceeded = session.record_fault();
        warn!(
            peer = %session.addr(),
            error = %error,
            faults = session.faults(),
            "protocol violation"
        );
        if exceeded {
            self.drop_peer(id, format!("too many violations: {error}"), true);
        }
    }

    /// Connections the driver must close.
    pub fn take_closed(&mut self) -> Vec<ConnectionId> {
        std::mem::take(&mut self.closed)
    }

    /// Messages waiting to be written, per connection.
    pub fn drain_outgoing(&mut self) -> Vec<(ConnectionId, Vec<Message>)> {
        let mut out: Vec<_> = self
            .sessions
            .values_mut()
            .filter(|s| s.is_active() && s.has_outgoing())
            .map(|s| (s.id(), s.drain_outbox()))
            .collect();
        out.sort_unstable_by_key(|(id, _)| *id);
        out
    }

    /// Handles one message from an active connection.
    ///
    /// Peer misbehaviour is absorbed here; only failures of local storage
    /// come back as errors.
    pub async fn on_message(
        &mut self,
        id: ConnectionId,
        message: Message,
    ) -> Result<(), SwarmError> {
        let Some(session) = self.sessions.get_mut(&id) else {
            return Ok(());
        };
        let inbound = match session.handle(message) {
            Ok(inbound) => inbound,
            Err(e) => {
                self.violation(id, &e);
                return Ok(());
            }
        };

        match inbound {
            Inbound::Nothing | Inbound::Cancel(_) => {}
            Inbound::Choked { released } => {
                if let Some(store) = self.store.as_mut() {
                    for request in &released {
                        store.release_request(request);
                    }
                }
                if !released.is_empty() {
                    self.fill_all();
                }
            }
            Inbound::Unchoked | Inbound::Suggest(_) => self.fill_requests(id),
            Inbound::Interest(_) => self.recompute_unchoke(),
            Inbound::Have(piece) => {
                if let Some(picker) = self.picker.as_mut() {
                    picker.have(piece);
                }
                self.update_interest(id);
                self.fill_requests(id);
            }
            Inbound::Availability => {
                if let (Some(picker), Some(session)) = (self.picker.as_mut(), self.sessions.get(&id))
                {
                    picker.peer_has(session.bitfield());
                }
                self.update_interest(id);
                self.fill_requests(id);
            }
            Inbound::AllowedFast(_) => {
                self.update_interest(id);
                self.fill_requests(id);
            }
            Inbound::Request(_) => self.serve_uploads(id).await?,
            Inbound::Block { request, data } => self.on_block(id, request, data).await?,
            Inbound::Rejected(request) => {
                if let Some(store) = self.store.as_mut() {
                    store.release_request(&request);
                }
                self.fill_all();
            }
            Inbound::Extended(message) => self.on_extension(id, message)?,
        }
        Ok(())
    }

    fn update_interest(&mut self, id: ConnectionId) {
        let Some(session) = self.sessions.get_mut(&id) else {
            return;
        };
        let interested = match &self.store {
            Some(store) => store
                .missing_pieces()
                .any(|piece| session.bitfield().has_piece(piece as usize)),
            None => false,
        };
        session.set_interested(interested);
    }

    fn fill_all(&mut self) {
        for id in self.active_ids() {
            self.fill_requests(id);
        }
    }

    /// Tops up the request pipeline of one peer.
    fn fill_requests(&mut self, id: ConnectionId) {
        if self.phase != Phase::Downloading {
            return;
        }
        let Self {
            sessions,
            store,
            picker,
            ..
        } = self;
        let (Some(store), Some(picker), Some(session)) =
            (store.as_mut(), picker.as_ref(), sessions.get_mut(&id))
        else {
            return;
        };
        if !session.is_active() || !session.choking().am_interested {
            return;
        }

        let suggested: Vec<u32> = session.fast().suggested().collect();
        let mut skip = HashSet::new();
        while session.request_slots() > 0 {
            let Some(piece) = picker.pick(store, &suggested, &skip, |p| session.can_request(p))
            else {
                break;
            };
            match store.next_block_request(piece) {
                Some(request) => {
                    trace!(peer = %session.addr(), piece, offset = request.offset, "request");
                    session.request(request);
                }
                None => {
                    skip.insert(piece);
                }
            }
        }

        if session.request_slots() == 0 || !picker.in_endgame(store) {
            return;
        }
        for request in picker.endgame_requests(store, |p| session.can_request(p)) {
            if session.request_slots() == 0 {
                break;
            }
            if session.has_pending(&request) {
                continue;
            }
            trace!(peer = %session.addr(), piece = request.piece, offset = request.offset, "endgame request");
            store.duplicate_request(&request);
            session.request(request);
        }
    }

    async fn on_block(
        &mut self,
        id: ConnectionId,
        request: BlockRequest,
        data: Bytes,
    ) -> Result<(), SwarmError> {
        let Some(addr) = self.sessions.get(&id).map(PeerSession::addr) else {
            return Ok(());
        };
        let bytes = data.len() as u64;
        self.downloaded += bytes;
        self.sink.emit(SwarmEvent::Downloaded { peer: addr, bytes });

        let Some(store) = self.store.as_mut() else {
            return Ok(());
        };
        let outcome = store
            .on_block_received(request.piece, request.offset, &data, id)
            .await?;

        match outcome {
            BlockOutcome::Accepted => self.cancel_duplicates(id, &request),
            BlockOutcome::Duplicate => {
                trace!(peer = %addr, piece = request.piece, offset = request.offset, "duplicate block");
            }
            BlockOutcome::Malformed => {
                self.violation(id, &PeerError::Protocol("block outside its piece".into()));
            }
            BlockOutcome::Verified => {
                self.cancel_duplicates(id, &request);
                self.on_piece_verified(request.piece).await?;
            }
            BlockOutcome::HashMismatch { contributors } => {
                self.on_hash_mismatch(request.piece, contributors);
            }
        }

        self.fill_requests(id);
        Ok(())
    }

    /// Withdraws endgame copies of a block another peer delivered.
    fn cancel_duplicates(&mut self, from: ConnectionId, request: &BlockRequest) {
        for session in self.sessions.values_mut() {
            if session.id() != from && session.has_pending(request) {
                trace!(peer = %session.addr(), piece = request.piece, offset = request.offset, "cancel");
                session.cancel(*request);
            }
        }
    }

    async fn on_piece_verified(&mut self, piece: u32) -> Result<(), SwarmError> {
        self.sink.emit(SwarmEvent::PieceVerified { piece });
        for session in self.sessions.values_mut().filter(|s| s.is_active()) {
            session.send(Message::Have { piece });
        }
        for id in self.active_ids() {
            self.update_interest(id);
        }

        if self.store.as_ref().is_some_and(PieceStore::is_complete) {
            self.finish().await?;
        }
        Ok(())
    }

    async fn finish(&mut self) -> Result<(), SwarmError> {
        if self.finished {
            return Ok(());
        }
        if let Some(store) = self.store.as_mut() {
            store.sync().await?;
        }
        self.finished = true;
        self.phase = Phase::Seeding;
        info!(downloaded = self.downloaded, "download finished");
        self.sink.emit(SwarmEvent::Finished);
        self.recompute_unchoke();
        Ok(())
    }

    fn on_hash_mismatch(&mut self, piece: u32, contributors: Vec<ConnectionId>) {
        let peers = contributors
            .iter()
            .filter_map(|id| self.sessions.get(id).map(PeerSession::addr))
            .collect();
        self.sink.emit(SwarmEvent::HashMismatch { piece, peers });
        for id in contributors {
            self.violation(id, &PeerError::Protocol(format!("piece {piece} failed hash check")));
        }
        self.fill_all();
    }

    /// Answers every queued request of `id` from disk.
    async fn serve_uploads(&mut self, id: ConnectionId) -> Result<(), SwarmError> {
        // Tit-for-tat only matters while we still need something back.
        let fairness = (!self.finished).then_some(self.config.fairness_threshold);
        let Self {
            sessions,
            store,
            sink,
            uploaded,
            ..
        } = self;
        let Some(session) = sessions.get_mut(&id) else {
            return Ok(());
        };

        while let Some(request) = session.next_upload() {
            let Some(disk) = store.as_mut().filter(|s| s.have(request.piece)) else {
                session.reject_upload(&request);
                continue;
            };
            if fairness.is_some_and(|threshold| !session.may_upload(threshold)) {
                trace!(peer = %session.addr(), "upload refused: fairness");
                session.reject_upload(&request);
                continue;
            }

            let data = match disk.read_block(&request).await {
                Ok(data) => data,
                Err(StorageError::InvalidBlock { .. }) => {
                    session.reject_upload(&request);
                    continue;
                }
                Err(e) => return Err(e.into()),
            };
            let bytes = data.len() as u64;
            session.send(Message::Piece {
                index: request.piece,
                begin: request.offset,
                data,
            });
            *uploaded += bytes;
            sink.emit(SwarmEvent::Uploaded {
                peer: session.addr(),
                bytes,
            });
        }
        Ok(())
    }

    /// Re-runs the unchoke policy over every active peer.
    pub fn recompute_unchoke(&mut self) {
        let candidates: Vec<UnchokeCandidate> = self
            .sessions
            .values()
            .filter(|s| s.is_active())
            .map(|s| UnchokeCandidate {
                id: s.id(),
                interested: s.choking().peer_interested,
                downloaded: s.downloaded(),
                uploaded: s.uploaded(),
            })
            .collect();
        let unchoked = select_unchoked(&candidates, self.config.upload_slots, self.finished);
        for session in self.sessions.values_mut().filter(|s| s.is_active()) {
            session.set_choking(!unchoked.contains(&session.id()));
        }
    }

    /// Periodic housekeeping: unchoke rotation and request top-up.
    pub fn tick(&mut self) {
        self.recompute_unchoke();
        self.fill_all();
    }

    fn on_extension(
        &mut self,
        id: ConnectionId,
        message: ExtensionMessage,
    ) -> Result<(), SwarmError> {
        match message {
            ExtensionMessage::Handshake(theirs) => {
                let (Some(exchange), Some(size)) = (self.metadata.as_mut(), theirs.metadata_size)
                else {
                    return Ok(());
                };
                match exchange.offer_size(id, size) {
                    Ok(()) => self.request_metadata(id),
                    Err(e) => self.violation(id, &e),
                }
            }
            ExtensionMessage::Metadata(message) => self.on_metadata_message(id, message)?,
            ExtensionMessage::Unknown { .. } => {}
        }
        Ok(())
    }

    fn send_metadata(&mut self, id: ConnectionId, message: MetadataMessage) {
        let Some(session) = self.sessions.get_mut(&id) else {
            return;
        };
        let Some(remote_id) = session.extension().and_then(ExtensionHandshake::ut_metadata_id)
        else {
            return;
        };
        match message.encode() {
            Ok(payload) => session.send(Message::Extended {
                id: remote_id,
                payload,
            }),
            Err(e) => warn!(peer = %session.addr(), error = %e, "cannot encode metadata message"),
        }
    }

    /// Asks `id` for one more metadata piece, if any is unassigned.
    fn request_metadata(&mut self, id: ConnectionId) {
        if self.phase != Phase::Metadata {
            return;
        }
        let supported = self
            .sessions
            .get(&id)
            .and_then(PeerSession::extension)
            .and_then(ExtensionHandshake::ut_metadata_id)
            .is_some();
        let Some(exchange) = self.metadata.as_mut().filter(|_| supported) else {
            return;
        };
        if let Some(piece) = exchange.next_request(id) {
            trace!(id = %id, piece, "requesting metadata piece");
            self.send_metadata(id, MetadataMessage::request(piece));
        }
    }

    /// Hands out freed metadata pieces to every active peer but `skip`.
    fn request_metadata_except(&mut self, skip: Option<ConnectionId>) {
        for other in self.active_ids() {
            if Some(other) != skip {
                self.request_metadata(other);
            }
        }
    }

    fn on_metadata_message(
        &mut self,
        id: ConnectionId,
        message: MetadataMessage,
    ) -> Result<(), SwarmError> {
        match message.msg_type {
            MetadataMessageType::Request => {
                let reply = self
                    .metainfo
                    .as_ref()
                    .and_then(|m| {
                        let raw = m.raw_info();
                        serve_metadata_piece(raw, message.piece)
                            .map(|data| MetadataMessage::data(message.piece, raw.len(), data))
                    })
                    .unwrap_or_else(|| MetadataMessage::reject(message.piece));
                self.send_metadata(id, reply);
            }
            MetadataMessageType::Reject => {
                if let Some(exchange) = self.metadata.as_mut() {
                    exchange.on_reject(id, message.piece);
                }
                self.request_metadata_except(Some(id));
            }
            MetadataMessageType::Data => {
                let Some(exchange) = self.metadata.as_mut() else {
                    return Ok(());
                };
                let data = message.data.unwrap_or_default();
                match exchange.on_data(id, message.piece, message.total_size, &data) {
                    MetadataOutcome::Accepted => self.request_metadata(id),
                    MetadataOutcome::Ignored => {
                        trace!(id = %id, piece = message.piece, "ignoring metadata piece");
                        self.request_metadata_except(Some(id));
                    }
                    MetadataOutcome::Complete(raw) => self.on_metadata_complete(raw)?,
                    MetadataOutcome::Mismatch { contributors } => {
                        for peer in contributors {
                            self.violation(peer, &PeerError::Extension("bad metadata".into()));
                        }
                        self.request_metadata_except(None);
                    }
                }
            }
        }
        Ok(())
    }

    fn on_metadata_complete(&mut self, raw: Bytes) -> Result<(), SwarmError> {
        let size = raw.len();
        let metainfo = Metainfo::from_info_bytes(raw, self.trackers.clone())?;
        // The digest only proves the peers sent what the link names; the
        // layout inside may still be inconsistent.
        metainfo.validate()?;
        info!(name = %metainfo.info.name, size, "metadata received");
        self.metainfo = Some(Arc::new(metainfo));
        self.phase = Phase::AwaitingFiles;
        self.sink.emit(SwarmEvent::MetadataReceived { size });
        Ok(())
    }

    /// What to tell trackers right now.
    pub fn announce_request(&self, event: TrackerEvent) -> AnnounceRequest {
        AnnounceRequest {
            info_hash: self.info_hash.wire_bytes(),
            peer_id: *self.our_id.as_bytes(),
            downloaded: self.downloaded,
            left: self.store.as_ref().map_or(0, PieceStore::remaining),
            uploaded: self.uploaded,
            event,
            port: self.listen_port,
        }
    }

    /// Reports an announce round and reserves slots for the returned peers,
    /// unless the download is done and nothing is left to seed.
    pub fn on_announce(&mut self, round: AnnounceRound) -> Vec<(ConnectionId, SocketAddr)> {
        for (tracker, error) in round.failures {
            self.sink.emit(SwarmEvent::TrackerFailed {
                tracker,
                error: error.to_string(),
            });
        }
        let Some((tracker, response)) = round.response else {
            return Vec::new();
        };
        self.sink.emit(SwarmEvent::TrackerAnnounced {
            tracker,
            peers: response.peers.len(),
        });
        if self.finished && !self.config.seed_after_finish {
            return Vec::new();
        }
        self.connect_candidates(response.peers)
    }

    /// Reports a terminal failure to the sink.
    pub fn fail(&mut self, error: &SwarmError) {
        warn!(error = %error, "download failed");
        self.sink.emit(SwarmEvent::Failed {
            error: error.to_string(),
        });
    }
}
