//! Record framing and bit packing
//!
//! Every record starts with a lead word and continues with zero or more
//! continuation words:
//!
//! ```text
//!  lead:          [1][ type:5 ][ payload:26 ]
//!  continuation:  [0][         payload:31    ]
//! ```
//!
//! Fields are packed most-significant-bit first, each one starting where the
//! previous one stopped, crossing word boundaries with no padding. The word
//! count of a record is fixed by the sum of its field widths; there is no
//! length field.

use heapless::Vec;
use ringlog_hal::flash::ERASED_WORD;

/// Bit 31 marks a lead word
pub const LEAD_FLAG: u32 = 0x8000_0000;

/// Position of the 5-bit type tag in a lead word
pub const TYPE_SHIFT: u32 = 26;

/// Mask for the type tag (after shifting)
pub const TYPE_MASK: u32 = 0x1F;

/// Payload bits carried by a lead word
pub const LEAD_PAYLOAD_BITS: u32 = 26;

/// Payload bits carried by a continuation word
pub const CONTINUATION_PAYLOAD_BITS: u32 = 31;

/// Staging capacity of one record, in words
pub const MAX_RECORD_WORDS: usize = 40;

/// Widest single field
pub const MAX_FIELD_BITS: u32 = 32;

/// Record type tags
///
/// The tag values are part of the on-flash format and never change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum RecordType {
    /// No-op / reserved
    Zero = 0x00,
    /// Full device configuration snapshot
    Config = 0x01,
    /// Firmware update version and address range
    UpdateHeader = 0x0C,
    /// One chunk of firmware update data
    UpdateChunk = 0x0D,
    /// Authorization to apply a collected update
    UpdateExecute = 0x0E,
    /// Page recency marker
    Sequence = 0x1F,
}

impl RecordType {
    /// Get the tag as a byte value
    pub const fn tag(self) -> u8 {
        self as u8
    }

    /// Create a type from its tag
    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0x00 => Some(RecordType::Zero),
            0x01 => Some(RecordType::Config),
            0x0C => Some(RecordType::UpdateHeader),
            0x0D => Some(RecordType::UpdateChunk),
            0x0E => Some(RecordType::UpdateExecute),
            0x1F => Some(RecordType::Sequence),
            _ => None,
        }
    }
}

/// Check if `word` begins a record (bit 31 set)
///
/// An erased word also has bit 31 set; callers that walk flash treat it
/// separately.
pub const fn is_lead(word: u32) -> bool {
    word & LEAD_FLAG != 0
}

/// Type tag carried by a lead word
pub const fn lead_tag(word: u32) -> u8 {
    ((word >> TYPE_SHIFT) & TYPE_MASK) as u8
}

/// Number of words needed to carry `bits` payload bits
pub const fn words_for_bits(bits: u32) -> usize {
    if bits <= LEAD_PAYLOAD_BITS {
        1
    } else {
        1 + (bits - LEAD_PAYLOAD_BITS).div_ceil(CONTINUATION_PAYLOAD_BITS) as usize
    }
}

const fn low_bits(width: u32) -> u32 {
    if width >= 32 {
        u32::MAX
    } else {
        (1 << width) - 1
    }
}

/// Errors from encoding a record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum EncodeError {
    /// Field wider than 32 bits
    FieldTooWide,
    /// Record would exceed the staging capacity
    Overflow,
}

/// Errors from decoding a record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DecodeError {
    /// First word is not a lead word
    NotLeadWord,
    /// Input ran out (or hit another lead word) before a field completed
    Truncated,
    /// Words left over after the last field
    TrailingWords,
    /// Tag does not name a known record type
    UnknownType(u8),
    /// Field wider than 32 bits
    FieldTooWide,
}

/// A record being encoded into its staged words
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordBuf {
    words: Vec<u32, MAX_RECORD_WORDS>,
    /// Unused payload bits left in the last word
    free: u32,
}

impl RecordBuf {
    /// Start a record of `record_type`
    pub fn begin(record_type: RecordType) -> Self {
        let mut words = Vec::new();
        let pushed = words.push(LEAD_FLAG | ((record_type.tag() as u32) << TYPE_SHIFT));
        debug_assert!(pushed.is_ok());
        Self {
            words,
            free: LEAD_PAYLOAD_BITS,
        }
    }

    /// Append the low `width` bits of `value`
    ///
    /// Bits of `value` above `width` are ignored. A zero-width field is a
    /// no-op. Nothing is written if the field does not fit.
    pub fn field(&mut self, width: u32, value: u32) -> Result<(), EncodeError> {
        if width > MAX_FIELD_BITS {
            return Err(EncodeError::FieldTooWide);
        }
        if width > self.free {
            let extra = (width - self.free).div_ceil(CONTINUATION_PAYLOAD_BITS) as usize;
            if self.words.len() + extra > MAX_RECORD_WORDS {
                return Err(EncodeError::Overflow);
            }
        }

        let value = value & low_bits(width);
        let mut remaining = width;
        while remaining > 0 {
            if self.free == 0 {
                self.words.push(0).map_err(|_| EncodeError::Overflow)?;
                self.free = CONTINUATION_PAYLOAD_BITS;
            }
            let take = remaining.min(self.free);
            let bits = (value >> (remaining - take)) & low_bits(take);
            if let Some(last) = self.words.last_mut() {
                *last |= bits << (self.free - take);
            }
            self.free -= take;
            remaining -= take;
        }
        Ok(())
    }

    /// Record type from the lead word
    pub fn record_type(&self) -> Option<RecordType> {
        self.words.first().and_then(|w| RecordType::from_tag(lead_tag(*w)))
    }

    /// Number of staged words
    pub fn len(&self) -> usize {
        self.words.len()
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    /// The encoded words, lead word first
    pub fn words(&self) -> &[u32] {
        &self.words
    }
}

/// Streaming decoder over one record
///
/// Continuation words are pulled from `source` only when a field needs
/// them.
pub struct Decoder<I> {
    source: I,
    tag: u8,
    current: u32,
    /// Unread payload bits left in `current`
    avail: u32,
}

impl<I: Iterator<Item = u32>> Decoder<I> {
    /// Start decoding at `lead`
    pub fn begin(lead: u32, source: I) -> Result<Self, DecodeError> {
        if !is_lead(lead) || lead == ERASED_WORD {
            return Err(DecodeError::NotLeadWord);
        }
        Ok(Self {
            source,
            tag: lead_tag(lead),
            current: lead & low_bits(LEAD_PAYLOAD_BITS),
            avail: LEAD_PAYLOAD_BITS,
        })
    }

    /// Raw type tag of the record
    pub fn tag(&self) -> u8 {
        self.tag
    }

    /// Read the next `width` bits
    pub fn field(&mut self, width: u32) -> Result<u32, DecodeError> {
        if width > MAX_FIELD_BITS {
            return Err(DecodeError::FieldTooWide);
        }

        let mut value: u32 = 0;
        let mut remaining = width;
        while remaining > 0 {
            if self.avail == 0 {
                let word = self.source.next().ok_or(DecodeError::Truncated)?;
                if is_lead(word) {
                    return Err(DecodeError::Truncated);
                }
                self.current = word;
                self.avail = CONTINUATION_PAYLOAD_BITS;
            }
            let take = remaining.min(self.avail);
            let bits = (self.current >> (self.avail - take)) & low_bits(take);
            value = (value << take) | bits;
            self.avail -= take;
            remaining -= take;
        }
        Ok(value)
    }

    /// Finish the record, rejecting any words left unread
    pub fn finish(mut self) -> Result<(), DecodeError> {
        match self.source.next() {
            Some(_) => Err(DecodeError::TrailingWords),
            None => Ok(()),
        }
    }
}
