use super::bitfield::Bitfield;
use super::choking::ChokingState;
use super::error::PeerError;
use super::extension::{ExtensionHandshake, ExtensionMessage};
use super::fast::FastState;
use super::message::{Handshake, Message};
use super::peer_id::PeerId;
use super::piece::BlockRequest;
use crate::constants::MAX_REQUEST_LENGTH;
use bytes::Bytes;
use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::net::SocketAddr;
use tracing::{debug, trace};

/// Arena key of a connection inside the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// TCP connect in progress.
    Connecting,
    /// Socket open, handshakes not yet exchanged.
    Handshaking,
    /// Handshake done; messages flow.
    Active,
    Closed,
}

/// Limits a session enforces on its own.
#[derive(Debug, Clone, Copy)]
pub struct SessionLimits {
    /// Violations tolerated before the peer must be dropped.
    pub fault_threshold: u32,
    /// Requests we keep outstanding with this peer.
    pub max_requests: usize,
}

/// What the coordinator has to act on after [`PeerSession::handle`].
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// State updated; nothing further to do.
    Nothing,
    /// The peer choked us. `released` requests will not be answered.
    Choked { released: Vec<BlockRequest> },
    Unchoked,
    Interest(bool),
    /// The peer newly announced a piece.
    Have(u32),
    /// The peer's whole bitfield was set (Bitfield, HaveAll or HaveNone).
    Availability,
    /// A request queued for upload.
    Request(BlockRequest),
    /// A queued upload the peer withdrew.
    Cancel(BlockRequest),
    Block { request: BlockRequest, data: Bytes },
    Rejected(BlockRequest),
    Suggest(u32),
    AllowedFast(u32),
    Extended(ExtensionMessage),
}

/// Availability announced before we knew the piece count (magnet start).
#[derive(Debug, Default)]
struct Deferred {
    bitfield: Option<Bytes>,
    have_all: bool,
    haves: Vec<u32>,
}

/// Protocol state of one peer connection, without any I/O.
///
/// Incoming messages go through [`handle`](Self::handle); outgoing ones are
/// queued with [`send`](Self::send) and collected by the driver with
/// [`drain_outbox`](Self::drain_outbox).
#[derive(Debug)]
pub struct PeerSession {
    id: ConnectionId,
    addr: SocketAddr,
    peer_id: Option<PeerId>,
    state: SessionState,
    choking: ChokingState,
    piece_count: Option<usize>,
    bitfield: Bitfield,
    deferred: Deferred,
    seen_first_message: bool,
    pending: HashSet<BlockRequest>,
    cancelled: HashSet<BlockRequest>,
    uploads: VecDeque<BlockRequest>,
    fast: FastState,
    extensions_enabled: bool,
    extension: Option<ExtensionHandshake>,
    limits: SessionLimits,
    faults: u32,
    downloaded: u64,
    uploaded: u64,
    outbox: Vec<Message>,
}

impl PeerSession {
    pub fn new(
        id: ConnectionId,
        addr: SocketAddr,
        piece_count: Option<usize>,
        limits: SessionLimits,
    ) -> Self {
        Self {
            id,
            addr,
            peer_id: None,
            state: SessionState::Connecting,
            choking: ChokingState::default(),
            piece_count,
            bitfield: Bitfield::new(piece_count.unwrap_or(0)),
            deferred: Deferred::default(),
            seen_first_message: false,
            pending: HashSet::new(),
            cancelled: HashSet::new(),
            uploads: VecDeque::new(),
            fast: FastState::new(false),
            extensions_enabled: false,
            extension: None,
            limits,
            faults: 0,
            downloaded: 0,
            uploaded: 0,
            outbox: Vec::new(),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn peer_id(&self) -> Option<PeerId> {
        self.peer_id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_active(&self) -> bool {
        self.state == SessionState::Active
    }

    pub fn choking(&self) -> ChokingState {
        self.choking
    }

    pub fn bitfield(&self) -> &Bitfield {
        &self.bitfield
    }

    pub fn fast(&self) -> &FastState {
        &self.fast
    }

    pub fn fast_mut(&mut self) -> &mut FastState {
        &mut self.fast
    }

    pub fn extension(&self) -> Option<&ExtensionHandshake> {
        self.extension.as_ref()
    }

    pub fn supports_extensions(&self) -> bool {
        self.extensions_enabled
    }

    pub fn downloaded(&self) -> u64 {
        self.downloaded
    }

    pub fn uploaded(&self) -> u64 {
        self.uploaded
    }

    pub fn faults(&self) -> u32 {
        self.faults
    }

    pub fn pending(&self) -> &HashSet<BlockRequest> {
        &self.pending
    }

    pub fn has_pending(&self, request: &BlockRequest) -> bool {
        self.pending.contains(request)
    }

    pub fn mark_handshaking(&mut self) {
        if self.state == SessionState::Connecting {
            self.state = SessionState::Handshaking;
        }
    }

    /// Adopts the remote handshake; the session becomes active.
    pub fn on_handshake(&mut self, theirs: &Handshake) {
        // Our own handshake always advertises both extensions.
        self.peer_id = Some(PeerId(theirs.peer_id));
        self.fast = FastState::new(theirs.supports_fast_extension());
        self.extensions_enabled = theirs.supports_extension_protocol();
        self.state = SessionState::Active;
    }

    /// Marks the session closed and returns the requests it still held.
    pub fn close(&mut self) -> Vec<BlockRequest> {
        self.state = SessionState::Closed;
        self.uploads.clear();
        self.outbox.clear();
        self.cancelled.clear();
        self.pending.drain().collect()
    }

    /// Resolves availability that arrived before the piece count was known.
    pub fn set_piece_count(&mut self, piece_count: usize) -> Result<(), PeerError> {
        if self.piece_count.is_some() {
            return Ok(());
        }
        self.piece_count = Some(piece_count);

        let deferred = std::mem::take(&mut self.deferred);
        self.bitfield = match (deferred.have_all, deferred.bitfield) {
            (true, _) => Bitfield::full(piece_count),
            (false, Some(bytes)) => Bitfield::from_wire(&bytes, piece_count)?,
            (false, None) => Bitfield::new(piece_count),
        };
        for piece in deferred.haves {
            if piece as usize >= piece_count {
                return Err(PeerError::Protocol(format!("have for piece {piece}")));
            }
            self.bitfield.set_piece(piece as usize);
        }
        Ok(())
    }

    /// Counts one protocol violation. True once the peer has exceeded the
    /// fault threshold and must be dropped.
    pub fn record_fault(&mut self) -> bool {
        self.faults += 1;
        self.faults > self.limits.fault_threshold
    }

    /// Tit-for-tat: uploads are free below `threshold` bytes, then only
    /// while the peer has given us at least as much as it took.
    pub fn may_upload(&self, threshold: u64) -> bool {
        self.uploaded < threshold || self.downloaded >= self.uploaded
    }

    /// True if a request for a block of `piece` could go out now.
    pub fn can_request(&self, piece: u32) -> bool {
        self.is_active()
            && self.choking.am_interested
            && self.pending.len() < self.limits.max_requests
            && self.bitfield.has_piece(piece as usize)
            && (!self.choking.peer_choking || self.fast.can_request_while_choked(piece))
    }

    /// Room left in the request pipeline.
    pub fn request_slots(&self) -> usize {
        self.limits.max_requests.saturating_sub(self.pending.len())
    }

    /// Next queued upload, oldest first.
    pub fn next_upload(&mut self) -> Option<BlockRequest> {
        self.uploads.pop_front()
    }

    pub fn queued_uploads(&self) -> usize {
        self.uploads.len()
    }

    /// Applies one incoming message.
    ///
    /// An `Err` is a protocol violation (or an undecodable extension
    /// message); the caller counts it with [`record_fault`](Self::record_fault).
    pub fn handle(&mut self, message: Message) -> Result<Inbound, PeerError> {
        if self.state != SessionState::Active {
            return Err(PeerError::Protocol(format!(
                "message in state {:?}",
                self.state
            )));
        }

        let first = !self.seen_first_message;
        self.seen_first_message = true;

        match message {
            Message::KeepAlive | Message::Port(_) => Ok(Inbound::Nothing),
            Message::Choke => {
                self.choking.peer_choking = true;
                let released = if self.fast.enabled() {
                    Vec::new()
                } else {
                    self.cancelled.clear();
                    self.pending.drain().collect()
                };
                Ok(Inbound::Choked { released })
            }
            Message::Unchoke => {
                self.choking.peer_choking = false;
                Ok(Inbound::Unchoked)
            }
            Message::Interested => {
                self.choking.peer_interested = true;
                Ok(Inbound::Interest(true))
            }
            Message::NotInterested => {
                self.choking.peer_interested = false;
                Ok(Inbound::Interest(false))
            }
            Message::Have { piece } => self.on_have(piece),
            Message::Bitfield(bits) => {
                self.first_only(first, "bitfield")?;
                match self.piece_count {
                    Some(count) => self.bitfield = Bitfield::from_wire(&bits, count)?,
                    None => self.deferred.bitfield = Some(bits),
                }
                Ok(Inbound::Availability)
            }
            Message::HaveAll => {
                self.require_fast("have all")?;
                self.first_only(first, "have all")?;
                match self.piece_count {
                    Some(count) => self.bitfield = Bitfield::full(count),
                    None => self.deferred.have_all = true,
                }
                Ok(Inbound::Availability)
            }
            Message::HaveNone => {
                self.require_fast("have none")?;
                self.first_only(first, "have none")?;
                Ok(Inbound::Availability)
            }
            Message::Request {
                index,
                begin,
                length,
            } => self.on_request(BlockRequest::new(index, begin, length)),
            Message::Cancel {
                index,
                begin,
                length,
            } => {
                let request = BlockRequest::new(index, begin, length);
                let before = self.uploads.len();
                self.uploads.retain(|r| *r != request);
                if self.uploads.len() < before {
                    Ok(Inbound::Cancel(request))
                } else {
                    Ok(Inbound::Nothing)
                }
            }
            Message::Piece { index, begin, data } => {
                let request = BlockRequest::new(index, begin, data.len() as u32);
                if self.pending.remove(&request) {
                    self.downloaded += data.len() as u64;
                    Ok(Inbound::Block { request, data })
                } else if self.cancelled.remove(&request) {
                    // Crossed our Cancel on the wire.
                    trace!(peer = %self.addr, piece = index, begin, "late block after cancel");
                    self.downloaded += data.len() as u64;
                    Ok(Inbound::Nothing)
                } else {
                    Err(PeerError::Protocol(format!("unrequested block {request}")))
                }
            }
            Message::Suggest { piece } => {
                self.require_fast("suggest")?;
                self.check_index(piece)?;
                self.fast.add_suggested(piece);
                Ok(Inbound::Suggest(piece))
            }
            Message::Reject {
                index,
                begin,
                length,
            } => {
                self.require_fast("reject")?;
                let request = BlockRequest::new(index, begin, length);
                if self.pending.remove(&request) {
                    Ok(Inbound::Rejected(request))
                } else if self.cancelled.remove(&request) {
                    Ok(Inbound::Nothing)
                } else {
                    Err(PeerError::Protocol(format!(
                        "reject for unrequested block {request}"
                    )))
                }
            }
            Message::AllowedFast { piece } => {
                self.require_fast("allowed fast")?;
                self.check_index(piece)?;
                self.fast.add_allowed_incoming(piece);
                Ok(Inbound::AllowedFast(piece))
            }
            Message::Extended { id, payload } => {
                if !self.extensions_enabled {
                    return Err(PeerError::Protocol("extended message not negotiated".into()));
                }
                let message = ExtensionMessage::decode(id, &payload)?;
                match message {
                    ExtensionMessage::Handshake(ref hs) => {
                        debug!(peer = %self.addr, client = ?hs.client, "extension handshake");
                        self.extension = Some(hs.clone());
                    }
                    ExtensionMessage::Unknown { id, .. } => {
                        debug!(peer = %self.addr, id, "ignoring unknown extension message");
                        return Ok(Inbound::Nothing);
                    }
                    ExtensionMessage::Metadata(_) => {}
                }
                Ok(Inbound::Extended(message))
            }
        }
    }

    fn on_have(&mut self, piece: u32) -> Result<Inbound, PeerError> {
        if self.piece_count.is_none() {
            self.deferred.haves.push(piece);
            return Ok(Inbound::Nothing);
        }
        self.check_index(piece)?;
        if self.bitfield.has_piece(piece as usize) {
            return Ok(Inbound::Nothing);
        }
        self.bitfield.set_piece(piece as usize);
        Ok(Inbound::Have(piece))
    }

    fn on_request(&mut self, request: BlockRequest) -> Result<Inbound, PeerError> {
        if request.length == 0 || request.length > MAX_REQUEST_LENGTH {
            return Err(PeerError::Protocol(format!(
                "request length {}",
                request.length
            )));
        }
        self.check_index(request.piece)?;

        if self.choking.am_choking && !self.fast.serves_while_choked(request.piece) {
            if self.fast.enabled() {
                self.outbox.push(reject(&request));
            }
            return Ok(Inbound::Nothing);
        }

        if !self.uploads.contains(&request) {
            self.uploads.push_back(request);
        }
        Ok(Inbound::Request(request))
    }

    fn check_index(&self, piece: u32) -> Result<(), PeerError> {
        match self.piece_count {
            Some(count) if piece as usize >= count => Err(PeerError::Protocol(format!(
                "piece index {piece} out of range"
            ))),
            _ => Ok(()),
        }
    }

    fn first_only(&self, first: bool, what: &str) -> Result<(), PeerError> {
        if first {
            Ok(())
        } else {
            Err(PeerError::Protocol(format!("{what} after first message")))
        }
    }

    fn require_fast(&self, what: &str) -> Result<(), PeerError> {
        if self.fast.enabled() {
            Ok(())
        } else {
            Err(PeerError::Protocol(format!("{what} without fast extension")))
        }
    }

    /// Queues an outgoing message and applies its effect on local state.
    pub fn send(&mut self, message: Message) {
        if message == Message::Choke && self.fast.enabled() {
            self.choking.am_choking = true;
            let fast = &self.fast;
            let (keep, refused): (Vec<_>, Vec<_>) = self
                .uploads
                .drain(..)
                .partition(|r| fast.serves_while_choked(r.piece));
            self.uploads = keep.into();
            self.outbox.push(message);
            self.outbox.extend(refused.iter().map(reject));
            return;
        }

        match &message {
            Message::Choke => {
                self.choking.am_choking = true;
                self.uploads.clear();
            }
            Message::Unchoke => self.choking.am_choking = false,
            Message::Interested => self.choking.am_interested = true,
            Message::NotInterested => self.choking.am_interested = false,
            Message::Request {
                index,
                begin,
                length,
            } => {
                let request = BlockRequest::new(*index, *begin, *length);
                self.cancelled.remove(&request);
                self.pending.insert(request);
            }
            Message::Cancel {
                index,
                begin,
                length,
            } => {
                let request = BlockRequest::new(*index, *begin, *length);
                if self.pending.remove(&request) {
                    self.cancelled.insert(request);
                }
            }
            Message::Piece { data, .. } => self.uploaded += data.len() as u64,
            _ => {}
        }
        self.outbox.push(message);
    }

    /// Sends Interested/NotInterested if our interest changed.
    pub fn set_interested(&mut self, interested: bool) {
        if self.choking.am_interested != interested {
            self.send(if interested {
                Message::Interested
            } else {
                Message::NotInterested
            });
        }
    }

    /// Sends Choke/Unchoke if our choke state changed.
    pub fn set_choking(&mut self, choking: bool) {
        if self.choking.am_choking != choking {
            self.send(if choking {
                Message::Choke
            } else {
                Message::Unchoke
            });
        }
    }

    pub fn request(&mut self, request: BlockRequest) {
        self.send(Message::Request {
            index: request.piece,
            begin: request.offset,
            length: request.length,
        });
    }

    pub fn cancel(&mut self, request: BlockRequest) {
        self.send(Message::Cancel {
            index: request.piece,
            begin: request.offset,
            length: request.length,
        });
    }

    /// Tells the peer it may request `pieces` while we choke it.
    pub fn grant_allowed_fast(&mut self, pieces: &[u32]) {
        if !self.fast.enabled() {
            return;
        }
        self.fast.set_allowed_outgoing(pieces.iter().copied());
        for &piece in pieces {
            self.outbox.push(Message::AllowedFast { piece });
        }
    }

    /// Answers a queued request we will not serve.
    pub fn reject_upload(&mut self, request: &BlockRequest) {
        if self.fast.enabled() {
            self.outbox.push(reject(request));
        }
    }

    pub fn has_outgoing(&self) -> bool {
        !self.outbox.is_empty()
    }

    pub fn drain_outbox(&mut self) -> Vec<Message> {
        std::mem::take(&mut self.outbox)
    }
}

fn reject(request: &BlockRequest) -> Message {
    Message::Reject {
        index: request.piece,
        begin: request.offset,
        length: request.length,
    }
}
