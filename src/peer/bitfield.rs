use super::error::PeerError;
use bytes::Bytes;

/// A bitfield representing which pieces a peer has.
///
/// Each bit represents whether a piece is available (1) or not (0).
/// Bits are numbered from the high bit of the first byte.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bitfield {
    bits: Vec<u8>,
    piece_count: usize,
}

impl Bitfield {
    /// Creates a new empty bitfield for the given number of pieces.
    pub fn new(piece_count: usize) -> Self {
        Self {
            bits: vec![0; piece_count.div_ceil(8)],
            piece_count,
        }
    }

    /// Parses the payload of a Bitfield message.
    ///
    /// The payload must be exactly `ceil(piece_count / 8)` bytes and every
    /// spare bit past the last piece must be zero.
    pub fn from_wire(bytes: &[u8], piece_count: usize) -> Result<Self, PeerError> {
        let expected = piece_count.div_ceil(8);
        if bytes.len() != expected {
            return Err(PeerError::Protocol(format!(
                "bitfield of {} bytes for {} pieces",
                bytes.len(),
                piece_count
            )));
        }

        let bf = Self {
            bits: bytes.to_vec(),
            piece_count,
        };
        if bf.spare_mask() & bf.bits.last().copied().unwrap_or(0) != 0 {
            return Err(PeerError::Protocol("bitfield has spare bits set".into()));
        }
        Ok(bf)
    }

    /// Creates a full bitfield (all pieces available).
    pub fn full(piece_count: usize) -> Self {
        let mut bf = Self {
            bits: vec![0xFF; piece_count.div_ceil(8)],
            piece_count,
        };
        if let Some(last) = bf.bits.last_mut() {
            *last &= !bf_spare_mask(piece_count);
        }
        bf
    }

    /// Returns true if the piece at the given index is available.
    pub fn has_piece(&self, index: usize) -> bool {
        if index >= self.piece_count {
            return false;
        }
        let byte_index = index / 8;
        let bit_index = 7 - (index % 8);
        (self.bits[byte_index] >> bit_index) & 1 == 1
    }

    /// Sets the bit for the piece at the given index.
    pub fn set_piece(&mut self, index: usize) {
        if index >= self.piece_count {
            return;
        }
        let byte_index = index / 8;
        let bit_index = 7 - (index % 8);
        self.bits[byte_index] |= 1 << bit_index;
    }

    /// Clears the bit for the piece at the given index.
    pub fn clear_piece(&mut self, index: usize) {
        if index >= self.piece_count {
            return;
        }
        let byte_index = index / 8;
        let bit_index = 7 - (index % 8);
        self.bits[byte_index] &= !(1 << bit_index);
    }

    /// Returns the number of pieces that are available.
    pub fn count(&self) -> usize {
        self.bits.iter().map(|b| b.count_ones() as usize).sum()
    }

    /// Returns true if all pieces are available.
    pub fn is_complete(&self) -> bool {
        self.count() == self.piece_count
    }

    /// Returns true if no pieces are available.
    pub fn is_empty(&self) -> bool {
        self.bits.iter().all(|&b| b == 0)
    }

    pub fn piece_count(&self) -> usize {
        self.piece_count
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bits
    }

    pub fn to_bytes(&self) -> Bytes {
        Bytes::copy_from_slice(&self.bits)
    }

    /// Returns indices of all available pieces.
    pub fn available_pieces(&self) -> Vec<usize> {
        (0..self.piece_count)
            .filter(|&i| self.has_piece(i))
            .collect()
    }

    /// True if this bitfield has any piece `ours` lacks.
    pub fn has_any_missing_from(&self, ours: &Bitfield) -> bool {
        (0..self.piece_count).any(|i| self.has_piece(i) && !ours.has_piece(i))
    }

    fn spare_mask(&self) -> u8 {
        bf_spare_mask(self.piece_count)
    }
}

/// Mask of the unused low bits in the last byte of a bitfield.
fn bf_spare_mask(piece_count: usize) -> u8 {
    match piece_count % 8 {
        0 => 0,
        used => 0xFF >> used,
    }
}
