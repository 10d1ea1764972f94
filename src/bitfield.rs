use bytes::Bytes;

/// A bit-per-piece completion vector.
///
/// Bits are numbered from the high bit of the first byte, as on the wire.
/// The same type backs our own completion state and the mirror of a remote
/// peer's pieces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bitfield {
    bits: Vec<u8>,
    piece_count: usize,
}

impl Bitfield {
    /// Creates a new empty bitfield for the given number of pieces.
    pub fn new(piece_count: usize) -> Self {
        Self {
            bits: vec![0; Self::byte_len_for(piece_count)],
            piece_count,
        }
    }

    /// Creates a bitfield from raw bytes.
    ///
    /// Short input is padded with zeroes and extra bytes are dropped, so a
    /// remote bitfield can be mirrored before its length has been checked.
    pub fn from_bytes(bytes: &[u8], piece_count: usize) -> Self {
        let mut bits = bytes.to_vec();
        bits.resize(Self::byte_len_for(piece_count), 0);

        let mut bf = Self { bits, piece_count };
        bf.clear_spare_bits();
        bf
    }

    /// Creates a full bitfield (all pieces available).
    pub fn full(piece_count: usize) -> Self {
        let mut bf = Self {
            bits: vec![0xFF; Self::byte_len_for(piece_count)],
            piece_count,
        };
        bf.clear_spare_bits();
        bf
    }

    /// Number of bytes needed on the wire for `piece_count` pieces.
    pub fn byte_len_for(piece_count: usize) -> usize {
        piece_count.div_ceil(8)
    }

    /// Returns true if the piece at the given index is set.
    pub fn has(&self, index: usize) -> bool {
        if index >= self.piece_count {
            return false;
        }
        (self.bits[index / 8] >> (7 - (index % 8))) & 1 == 1
    }

    /// Sets the bit for the piece at the given index.
    ///
    /// Returns true if the bit was previously clear.
    pub fn set(&mut self, index: usize) -> bool {
        if index >= self.piece_count {
            return false;
        }
        let mask = 1 << (7 - (index % 8));
        let was_clear = self.bits[index / 8] & mask == 0;
        self.bits[index / 8] |= mask;
        was_clear
    }

    /// Clears the bit for the piece at the given index.
    pub fn clear(&mut self, index: usize) {
        if index >= self.piece_count {
            return;
        }
        self.bits[index / 8] &= !(1 << (7 - (index % 8)));
    }

    /// Returns the number of set pieces.
    pub fn count(&self) -> usize {
        self.bits.iter().map(|b| b.count_ones() as usize).sum()
    }

    /// Returns true if all pieces are set.
    pub fn is_complete(&self) -> bool {
        self.count() == self.piece_count
    }

    /// Returns true if no pieces are set.
    pub fn is_empty(&self) -> bool {
        self.bits.iter().all(|&b| b == 0)
    }

    pub fn piece_count(&self) -> usize {
        self.piece_count
    }

    /// Returns the raw bytes of the bitfield.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bits
    }

    /// Converts the bitfield to owned bytes.
    pub fn to_bytes(&self) -> Bytes {
        Bytes::copy_from_slice(&self.bits)
    }

    /// Iterates over the indices of set pieces in ascending order.
    pub fn iter_set(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.piece_count).filter(move |&i| self.has(i))
    }

    /// Returns true if `self` has at least one piece that `ours` lacks.
    pub fn has_missing_from(&self, ours: &Bitfield) -> bool {
        self.bits
            .iter()
            .zip(ours.bits.iter().chain(std::iter::repeat(&0)))
            .any(|(theirs, ours)| theirs & !ours != 0)
    }

    /// Returns indices set in `self` but not in `older`.
    pub fn newly_set(&self, older: &Bitfield) -> Vec<usize> {
        self.iter_set().filter(|&i| !older.has(i)).collect()
    }

    /// Returns indices of all pieces that are not set.
    pub fn missing(&self) -> Vec<usize> {
        (0..self.piece_count).filter(|&i| !self.has(i)).collect()
    }

    /// Clears any spare bits in the last byte that don't correspond to pieces.
    fn clear_spare_bits(&mut self) {
        let spare = (self.bits.len() * 8) - self.piece_count;
        if spare > 0 && spare < 8 {
            let last = self.bits.len() - 1;
            self.bits[last] &= 0xFFu8 << spare;
        }
    }
}
