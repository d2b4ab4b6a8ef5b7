//! Chunk presence tracking
//!
//! A [`ChunkMap`] keeps one bit per fixed-size chunk of an address range.
//! What a set bit means is up to the caller: the update collector uses set
//! for "still outstanding", the boot loader uses set for "page differs".
//!
//! Bit `i` (chunk at `start + i * chunk_size`) lives in byte `i / 8`, bit
//! `i % 8`. Bits past the last chunk in the final byte are padding and are
//! never reported.
//!
//! Invalid maps and out-of-range addresses are tolerated: mutators do
//! nothing and predicates answer `false`.

/// Bytes needed to track `[start, end)` in `chunk_size` chunks
pub const fn chunk_map_bytes(start: u32, end: u32, chunk_size: u32) -> usize {
    if chunk_size == 0 || end <= start {
        0
    } else {
        ((end - start).div_ceil(chunk_size) as usize).div_ceil(8)
    }
}

/// Bitmap over the chunks of an address range
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ChunkMap<const BYTES: usize> {
    start: u32,
    end: u32,
    chunk_size: u32,
    bits: [u8; BYTES],
}

impl<const BYTES: usize> ChunkMap<BYTES> {
    /// Create a map with every bit clear
    ///
    /// The map is invalid (every operation a no-op) if `chunk_size` is zero,
    /// the range is empty, or `BYTES` is too small for the range.
    pub const fn new(start: u32, end: u32, chunk_size: u32) -> Self {
        Self {
            start,
            end,
            chunk_size,
            bits: [0; BYTES],
        }
    }

    pub fn is_valid(&self) -> bool {
        let needed = chunk_map_bytes(self.start, self.end, self.chunk_size);
        needed > 0 && needed <= BYTES
    }

    pub fn start(&self) -> u32 {
        self.start
    }

    pub fn end(&self) -> u32 {
        self.end
    }

    pub fn chunk_size(&self) -> u32 {
        self.chunk_size
    }

    /// Number of chunks tracked (0 for an invalid map)
    pub fn chunk_count(&self) -> u32 {
        if self.is_valid() {
            (self.end - self.start).div_ceil(self.chunk_size)
        } else {
            0
        }
    }

    /// Fill the whole bitset with zeros
    pub fn clear_all(&mut self) {
        self.bits = [0; BYTES];
    }

    /// Fill the whole bitset with ones, padding included
    pub fn set_all(&mut self) {
        self.bits = [0xFF; BYTES];
    }

    pub fn set(&mut self, address: u32) {
        if let Some(i) = self.index(address) {
            self.bits[i / 8] |= 1 << (i % 8);
        }
    }

    pub fn clear(&mut self, address: u32) {
        if let Some(i) = self.index(address) {
            self.bits[i / 8] &= !(1 << (i % 8));
        }
    }

    /// Set every chunk whose start lies in `[start, end)`
    ///
    /// Both bounds must be chunk aligned and `start < end`.
    pub fn set_range(&mut self, start: u32, end: u32) {
        if let Some((first, last)) = self.range(start, end) {
            self.fill(first, last, true);
        }
    }

    /// Clear every chunk whose start lies in `[start, end)`
    pub fn clear_range(&mut self, start: u32, end: u32) {
        if let Some((first, last)) = self.range(start, end) {
            self.fill(first, last, false);
        }
    }

    /// Check if the chunk holding `address` is set
    pub fn is_set(&self, address: u32) -> bool {
        self.index(address)
            .map(|i| self.bits[i / 8] & (1 << (i % 8)) != 0)
            .unwrap_or(false)
    }

    /// Check if the chunk holding `address` is clear
    ///
    /// `false` for an invalid map or address, so this is not `!is_set`.
    pub fn is_clear(&self, address: u32) -> bool {
        self.index(address)
            .map(|i| self.bits[i / 8] & (1 << (i % 8)) == 0)
            .unwrap_or(false)
    }

    /// Check if no chunk is set
    pub fn is_clear_all(&self) -> bool {
        self.all_bytes_match(0x00)
    }

    /// Check if every chunk is set
    pub fn is_set_all(&self) -> bool {
        self.all_bytes_match(0xFF)
    }

    /// Address of the first set chunk
    pub fn first_set(&self) -> Option<u32> {
        self.nth_set(0)
    }

    /// Address of the `n`th set chunk, counting from zero
    pub fn nth_set(&self, n: usize) -> Option<u32> {
        (0..self.chunk_count())
            .filter(|&i| self.bits[i as usize / 8] & (1 << (i % 8)) != 0)
            .nth(n)
            .map(|i| self.start + i * self.chunk_size)
    }

    /// Number of set chunks
    pub fn count_set(&self) -> u32 {
        (0..self.chunk_count())
            .filter(|&i| self.bits[i as usize / 8] & (1 << (i % 8)) != 0)
            .count() as u32
    }

    fn index(&self, address: u32) -> Option<usize> {
        if !self.is_valid() || address < self.start || address >= self.end {
            return None;
        }
        Some(((address - self.start) / self.chunk_size) as usize)
    }

    /// Chunk index range `[first, last)` for an aligned address range
    fn range(&self, start: u32, end: u32) -> Option<(usize, usize)> {
        if !self.is_valid() || start >= end || start < self.start || end > self.end {
            return None;
        }
        let aligned = |a: u32| (a - self.start) % self.chunk_size == 0 || a == self.end;
        if !aligned(start) || !aligned(end) {
            return None;
        }
        let first = ((start - self.start) / self.chunk_size) as usize;
        let last = (end - self.start).div_ceil(self.chunk_size) as usize;
        Some((first, last))
    }

    /// Apply `value` to bits `[first, last)`: partial first byte, whole
    /// interior bytes, partial last byte
    fn fill(&mut self, first: usize, last: usize, value: bool) {
        let (first_byte, first_bit) = (first / 8, first % 8);
        let (last_byte, last_bit) = (last / 8, last % 8);

        if first_byte == last_byte {
            let mask = low_mask(last_bit) & !low_mask(first_bit);
            apply(&mut self.bits[first_byte], mask, value);
            return;
        }

        apply(&mut self.bits[first_byte], !low_mask(first_bit), value);
        let fill = if value { 0xFF } else { 0x00 };
        for byte in &mut self.bits[first_byte + 1..last_byte] {
            *byte = fill;
        }
        if last_bit != 0 {
            apply(&mut self.bits[last_byte], low_mask(last_bit), value);
        }
    }

    fn all_bytes_match(&self, pattern: u8) -> bool {
        let count = self.chunk_count() as usize;
        if count == 0 {
            return false;
        }
        let full = count / 8;
        if self.bits[..full].iter().any(|&b| b != pattern) {
            return false;
        }
        let tail = count % 8;
        if tail == 0 {
            return true;
        }
        let mask = low_mask(tail);
        self.bits[full] & mask == pattern & mask
    }
}

/// Mask of the low `bits` bits of a byte (`bits` in 0..=8)
fn low_mask(bits: usize) -> u8 {
    ((1u16 << bits) - 1) as u8
}

fn apply(byte: &mut u8, mask: u8, value: bool) {
    if value {
        *byte |= mask;
    } else {
        *byte &= !mask;
    }
}
