use super::error::StorageError;
use super::handles::FileSet;
use crate::metainfo::Metainfo;
use crate::peer::{Bitfield, BlockRequest, ConnectionId};
use bytes::Bytes;
use sha1::{Digest, Sha1};
use std::collections::HashSet;
use tracing::{debug, trace, warn};

/// Verification state of one piece.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PieceState {
    /// Not yet verified; blocks may be requested.
    Pending,
    /// Hash matched and the bytes are on disk.
    Verified,
    /// Assembled bytes did not hash to the expected digest.
    Invalid,
}

/// What happened to a block handed to [`PieceStore::on_block_received`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockOutcome {
    /// Stored; the piece still has missing blocks.
    Accepted,
    /// The block (or its whole piece) was already in hand.
    Duplicate,
    /// Offset or length does not match any block of the piece.
    Malformed,
    /// The block completed its piece, which hashed correctly and was written.
    Verified,
    /// The block completed its piece but the hash was wrong. The buffer has
    /// been discarded; `contributors` sent blocks of it.
    HashMismatch { contributors: Vec<ConnectionId> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockState {
    Free,
    /// Requested from this many peers at once (more than one in endgame).
    Requested(u32),
    Received,
}

#[derive(Debug)]
struct Piece {
    digest: [u8; 20],
    length: u32,
    state: PieceState,
    blocks: Vec<BlockState>,
    buffer: Option<Vec<u8>>,
    contributors: HashSet<ConnectionId>,
}

impl Piece {
    fn in_flight(&self) -> usize {
        self.blocks
            .iter()
            .filter(|b| matches!(b, BlockState::Requested(_)))
            .count()
    }

    fn received(&self) -> usize {
        self.blocks
            .iter()
            .filter(|b| **b == BlockState::Received)
            .count()
    }

    fn reset(&mut self) {
        self.blocks.fill(BlockState::Free);
        self.buffer = None;
        self.contributors.clear();
    }
}

/// Per-piece receive and verification state for one torrent.
///
/// Blocks arrive in any order from any peer; once every block of a piece is
/// present the piece is hashed and, on a match, written to the attached
/// [`FileSet`] exactly once.
///
/// # Examples
///
/// ```
/// use swarmbit::storage::PieceStore;
/// use sha1::{Digest, Sha1};
///
/// let data = vec![7u8; 40_000];
/// let digests: Vec<u8> = data.chunks(32_768).flat_map(|c| Sha1::digest(c).to_vec()).collect();
/// let mut store = PieceStore::new(2, 32_768, 40_000 - 32_768, 16_384, &digests).unwrap();
///
/// let first = store.next_block_request(0).unwrap();
/// assert_eq!((first.offset, first.length), (0, 16_384));
/// assert_eq!(store.piece_length(1), 7_232);
/// ```
#[derive(Debug)]
pub struct PieceStore {
    pieces: Vec<Piece>,
    piece_length: u64,
    block_size: u32,
    max_inflight_per_piece: usize,
    total_length: u64,
    files: Option<FileSet>,
    bytes_written: u64,
    verified_bytes: u64,
}

impl PieceStore {
    /// Creates a store for `piece_count` pieces.
    ///
    /// `digests` holds the concatenated 20-byte SHA1 digests of every piece.
    pub fn new(
        piece_count: usize,
        piece_length: u64,
        last_piece_length: u64,
        block_size: u32,
        digests: &[u8],
    ) -> Result<Self, StorageError> {
        if digests.len() != piece_count * 20 {
            return Err(StorageError::InvalidDigests(digests.len()));
        }
        let block_size = block_size.max(1);
        let narrow =
            |length: u64| u32::try_from(length).map_err(|_| StorageError::PieceTooLarge(length));
        let (piece_length32, last_piece_length32) =
            (narrow(piece_length)?, narrow(last_piece_length)?);

        let pieces = digests
            .chunks_exact(20)
            .enumerate()
            .map(|(index, chunk)| {
                let mut digest = [0u8; 20];
                digest.copy_from_slice(chunk);
                let length = if index + 1 == piece_count {
                    last_piece_length32
                } else {
                    piece_length32
                };
                Piece {
                    digest,
                    length,
                    state: PieceState::Pending,
                    blocks: vec![BlockState::Free; length.div_ceil(block_size) as usize],
                    buffer: None,
                    contributors: HashSet::new(),
                }
            })
            .collect::<Vec<_>>();

        let total_length = pieces.iter().map(|p| p.length as u64).sum();

        Ok(Self {
            pieces,
            piece_length,
            block_size,
            max_inflight_per_piece: usize::MAX,
            total_length,
            files: None,
            bytes_written: 0,
            verified_bytes: 0,
        })
    }

    /// Creates a store laid out for `metainfo`.
    pub fn from_metainfo(metainfo: &Metainfo, block_size: u32) -> Result<Self, StorageError> {
        let digests: Vec<u8> = metainfo.info.pieces.iter().flatten().copied().collect();
        Self::new(
            metainfo.piece_count(),
            metainfo.info.piece_length,
            metainfo.last_piece_length(),
            block_size,
            &digests,
        )
    }

    /// Caps how many blocks of one piece may be requested at the same time.
    pub fn with_inflight_cap(mut self, cap: usize) -> Self {
        self.max_inflight_per_piece = cap.max(1);
        self
    }

    /// Attaches the backing files. Verified pieces are written here.
    pub fn attach(&mut self, files: FileSet) {
        self.files = Some(files);
    }

    pub fn is_attached(&self) -> bool {
        self.files.is_some()
    }

    pub fn piece_count(&self) -> usize {
        self.pieces.len()
    }

    pub fn piece_length(&self, index: u32) -> u32 {
        self.pieces
            .get(index as usize)
            .map(|p| p.length)
            .unwrap_or(0)
    }

    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    pub fn total_length(&self) -> u64 {
        self.total_length
    }

    pub fn state(&self, index: u32) -> Option<PieceState> {
        self.pieces.get(index as usize).map(|p| p.state)
    }

    pub fn have(&self, index: u32) -> bool {
        self.state(index) == Some(PieceState::Verified)
    }

    pub fn is_complete(&self) -> bool {
        self.pieces.iter().all(|p| p.state == PieceState::Verified)
    }

    /// The local bitfield: one bit per verified piece.
    pub fn bitfield(&self) -> Bitfield {
        let mut bitfield = Bitfield::new(self.pieces.len());
        for (index, piece) in self.pieces.iter().enumerate() {
            if piece.state == PieceState::Verified {
                bitfield.set_piece(index);
            }
        }
        bitfield
    }

    /// Bytes flushed to disk after verification.
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// Bytes belonging to verified pieces, whether downloaded or found on disk.
    pub fn verified_bytes(&self) -> u64 {
        self.verified_bytes
    }

    pub fn remaining(&self) -> u64 {
        self.total_length - self.verified_bytes
    }

    /// Pieces still to be downloaded.
    pub fn missing_pieces(&self) -> impl Iterator<Item = u32> + '_ {
        self.pieces
            .iter()
            .enumerate()
            .filter(|(_, p)| p.state != PieceState::Verified)
            .map(|(i, _)| i as u32)
    }

    /// True if some block of the piece has been requested or received.
    pub fn in_progress(&self, index: u32) -> bool {
        self.pieces.get(index as usize).is_some_and(|p| {
            p.state != PieceState::Verified && p.blocks.iter().any(|b| *b != BlockState::Free)
        })
    }

    /// True if no block of the piece is left unrequested.
    pub fn fully_requested(&self, index: u32) -> bool {
        self.pieces
            .get(index as usize)
            .is_some_and(|p| p.blocks.iter().all(|b| *b != BlockState::Free))
    }

    fn block_request(&self, index: u32, block: usize) -> BlockRequest {
        let offset = block as u32 * self.block_size;
        let length = (self.pieces[index as usize].length - offset).min(self.block_size);
        BlockRequest::new(index, offset, length)
    }

    /// Reserves the next unrequested block of `index`.
    ///
    /// Returns `None` when the piece is verified, fully requested, or already
    /// has as many blocks in flight as the cap allows.
    pub fn next_block_request(&mut self, index: u32) -> Option<BlockRequest> {
        let cap = self.max_inflight_per_piece;
        let piece = self.pieces.get_mut(index as usize)?;
        if piece.state == PieceState::Verified || piece.in_flight() >= cap {
            return None;
        }

        let block = piece.blocks.iter().position(|b| *b == BlockState::Free)?;
        piece.blocks[block] = BlockState::Requested(1);
        Some(self.block_request(index, block))
    }

    /// Blocks of `index` that are requested but not yet received, for
    /// duplicate requests in endgame.
    pub fn outstanding_blocks(&self, index: u32) -> Vec<BlockRequest> {
        let Some(piece) = self.pieces.get(index as usize) else {
            return Vec::new();
        };
        if piece.state == PieceState::Verified {
            return Vec::new();
        }
        piece
            .blocks
            .iter()
            .enumerate()
            .filter(|(_, b)| matches!(b, BlockState::Requested(_)))
            .map(|(block, _)| self.block_request(index, block))
            .collect()
    }

    /// Records one more peer holding a request for an outstanding block.
    pub fn duplicate_request(&mut self, request: &BlockRequest) {
        if let Some(BlockState::Requested(n)) = self.block_state_mut(request) {
            *n += 1;
        }
    }

    /// Returns a request to the pool after a choke, reject, cancel or
    /// disconnect. A block already received is left alone.
    pub fn release_request(&mut self, request: &BlockRequest) {
        if let Some(state) = self.block_state_mut(request) {
            *state = match *state {
                BlockState::Requested(n) if n > 1 => BlockState::Requested(n - 1),
                BlockState::Requested(_) => BlockState::Free,
                other => other,
            };
        }
    }

    fn block_index(&self, piece: u32, offset: u32, length: u32) -> Option<usize> {
        let p = self.pieces.get(piece as usize)?;
        if offset % self.block_size != 0 || offset >= p.length {
            return None;
        }
        let expected = (p.length - offset).min(self.block_size);
        (length == expected).then_some((offset / self.block_size) as usize)
    }

    fn block_state_mut(&mut self, request: &BlockRequest) -> Option<&mut BlockState> {
        let block = self.block_index(request.piece, request.offset, request.length)?;
        self.pieces[request.piece as usize].blocks.get_mut(block)
    }

    /// Stores a received block and verifies its piece once complete.
    ///
    /// # Errors
    ///
    /// Only failures to write a verified piece are errors; they are fatal
    /// for the download.
    pub async fn on_block_received(
        &mut self,
        index: u32,
        offset: u32,
        data: &[u8],
        from: ConnectionId,
    ) -> Result<BlockOutcome, StorageError> {
        let Some(block) = self.block_index(index, offset, data.len() as u32) else {
            return Ok(BlockOutcome::Malformed);
        };

        let piece = &mut self.pieces[index as usize];
        if piece.state == PieceState::Verified || piece.blocks[block] == BlockState::Received {
            return Ok(BlockOutcome::Duplicate);
        }

        let length = piece.length as usize;
        let buffer = piece.buffer.get_or_insert_with(|| vec![0u8; length]);
        buffer[offset as usize..offset as usize + data.len()].copy_from_slice(data);
        piece.blocks[block] = BlockState::Received;
        piece.contributors.insert(from);

        if piece.received() < piece.blocks.len() {
            return Ok(BlockOutcome::Accepted);
        }

        let assembled = piece.buffer.take().unwrap_or_default();
        if check_digest(&piece.digest, &assembled) == PieceState::Invalid {
            let mut contributors: Vec<_> = piece.contributors.iter().copied().collect();
            contributors.sort_unstable();
            piece.reset();
            piece.state = PieceState::Pending;
            warn!(piece = index, ?contributors, "piece failed hash check");
            return Ok(BlockOutcome::HashMismatch { contributors });
        }

        let files = self.files.as_mut().ok_or(StorageError::NotAttached)?;
        files
            .write_at(index as u64 * self.piece_length, &assembled)
            .await?;

        let piece = &mut self.pieces[index as usize];
        piece.state = PieceState::Verified;
        piece.contributors.clear();
        self.bytes_written += assembled.len() as u64;
        self.verified_bytes += assembled.len() as u64;
        debug!(piece = index, "piece verified");

        Ok(BlockOutcome::Verified)
    }

    /// Re-hashes whatever is on disk and marks matching pieces verified.
    ///
    /// Files that are missing or shorter than declared simply leave their
    /// pieces pending. `progress` is called with `(checked, total)` after
    /// every piece. Running it again over unchanged files yields the same
    /// bitfield.
    pub async fn verify_existing<F>(&mut self, mut progress: F) -> Result<Bitfield, StorageError>
    where
        F: FnMut(usize, usize),
    {
        let total = self.pieces.len();
        debug!("Starting verification of {} pieces", total);

        let mut verified_bytes = 0u64;
        for index in 0..total {
            let length = self.pieces[index].length as usize;
            let files = self.files.as_mut().ok_or(StorageError::NotAttached)?;

            let state = match files.read_at(index as u64 * self.piece_length, length).await {
                Ok(data) => check_digest(&self.pieces[index].digest, &data),
                Err(StorageError::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    trace!(piece = index, "piece not present on disk");
                    PieceState::Invalid
                }
                Err(e) => return Err(e),
            };

            let piece = &mut self.pieces[index];
            piece.reset();
            piece.state = match state {
                PieceState::Verified => {
                    verified_bytes += length as u64;
                    PieceState::Verified
                }
                _ => PieceState::Pending,
            };
            progress(index + 1, total);
        }

        self.verified_bytes = verified_bytes;
        let bitfield = self.bitfield();
        debug!(
            "Verification complete: {}/{} pieces valid",
            bitfield.count(),
            total
        );
        Ok(bitfield)
    }

    /// Reads a block of a verified piece for uploading.
    pub async fn read_block(&mut self, request: &BlockRequest) -> Result<Bytes, StorageError> {
        let piece = self
            .pieces
            .get(request.piece as usize)
            .ok_or(StorageError::InvalidPieceIndex(request.piece))?;
        if request.length == 0 || request.end() > piece.length as u64 {
            return Err(StorageError::InvalidBlock {
                piece: request.piece,
                offset: request.offset,
                length: request.length,
            });
        }
        if piece.state != PieceState::Verified {
            return Err(StorageError::PieceNotAvailable(request.piece));
        }

        let offset = request.piece as u64 * self.piece_length + request.offset as u64;
        let files = self.files.as_mut().ok_or(StorageError::NotAttached)?;
        files.read_at(offset, request.length as usize).await
    }

    /// Flushes the attached files.
    pub async fn sync(&mut self) -> Result<(), StorageError> {
        match self.files.as_mut() {
            Some(files) => files.sync().await,
            None => Ok(()),
        }
    }
}

/// Hashes `data` and compares it with `digest`.
pub fn check_digest(digest: &[u8; 20], data: &[u8]) -> PieceState {
    if Sha1::digest(data).as_slice() == digest {
        PieceState::Verified
    } else {
        PieceState::Invalid
    }
}
