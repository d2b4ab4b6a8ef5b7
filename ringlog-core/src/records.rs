//! Typed records and their field layouts
//!
//! | Type            | Fields (bits)                                   | Words |
//! |-----------------|-------------------------------------------------|-------|
//! | `Sequence`      | counter 26                                      | 1     |
//! | `Config`        | 32 x 32                                         | 34    |
//! | `UpdateHeader`  | sequence 20, version 32, start 14, end 14       | 3     |
//! | `UpdateChunk`   | sequence 20, address 13, 64 x 8 data            | 18    |
//! | `UpdateExecute` | sequence 20, version 32                         | 2     |
//!
//! Update addresses are stored shifted right by [`CHUNK_SHIFT`].

use crate::codec::{DecodeError, Decoder, EncodeError, RecordBuf, RecordType, LEAD_FLAG, TYPE_SHIFT};
use crate::config::{DeviceConfig, CONFIG_WORDS};

/// Log2 of the firmware update chunk size
pub const CHUNK_SHIFT: u32 = 6;

/// Firmware update chunk size in bytes
pub const CHUNK_SIZE: usize = 1 << CHUNK_SHIFT;

/// Width of the page sequence counter
pub const SEQUENCE_BITS: u32 = 26;

/// Largest page sequence value
pub const SEQUENCE_MASK: u32 = (1 << SEQUENCE_BITS) - 1;

/// Width of the update sequence carried by update records
pub const UPDATE_SEQUENCE_BITS: u32 = 20;

const VERSION_BITS: u32 = 32;
const HEADER_ADDRESS_BITS: u32 = 14;
const CHUNK_ADDRESS_BITS: u32 = 13;
const BYTE_BITS: u32 = 8;

/// The one-word `Sequence` record for `sequence`
pub const fn sequence_marker(sequence: u32) -> u32 {
    LEAD_FLAG | ((RecordType::Sequence as u32) << TYPE_SHIFT) | (sequence & SEQUENCE_MASK)
}

/// Firmware update announcement
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct UpdateHeader {
    /// Identifies this update among others in the log
    pub sequence: u32,
    /// Firmware version being delivered
    pub version: u32,
    /// First byte of the image (chunk aligned)
    pub start: u32,
    /// One past the last byte of the image (chunk aligned)
    pub end: u32,
}

/// One chunk of firmware update data
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct UpdateChunk {
    /// Sequence of the header this chunk belongs to
    pub sequence: u32,
    /// Destination address (chunk aligned)
    pub address: u32,
    pub data: [u8; CHUNK_SIZE],
}

impl UpdateChunk {
    /// Chunk data as little-endian words, ready to program
    pub fn data_words(&self) -> [u32; CHUNK_SIZE / 4] {
        let mut words = [0u32; CHUNK_SIZE / 4];
        for (word, bytes) in words.iter_mut().zip(self.data.chunks_exact(4)) {
            *word = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        }
        words
    }
}

/// Authorization to apply the update with a matching sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct UpdateExecute {
    pub sequence: u32,
    pub version: u32,
}

/// A decoded log record
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Record {
    Zero,
    /// Page recency marker
    Sequence(u32),
    Config(DeviceConfig),
    UpdateHeader(UpdateHeader),
    UpdateChunk(UpdateChunk),
    UpdateExecute(UpdateExecute),
}

impl Record {
    pub fn record_type(&self) -> RecordType {
        match self {
            Record::Zero => RecordType::Zero,
            Record::Sequence(_) => RecordType::Sequence,
            Record::Config(_) => RecordType::Config,
            Record::UpdateHeader(_) => RecordType::UpdateHeader,
            Record::UpdateChunk(_) => RecordType::UpdateChunk,
            Record::UpdateExecute(_) => RecordType::UpdateExecute,
        }
    }

    /// Encode into staged words
    pub fn encode(&self) -> Result<RecordBuf, EncodeError> {
        let mut buf = RecordBuf::begin(self.record_type());
        match self {
            Record::Zero => {}
            Record::Sequence(counter) => buf.field(SEQUENCE_BITS, *counter)?,
            Record::Config(config) => {
                for word in config.words() {
                    buf.field(32, *word)?;
                }
            }
            Record::UpdateHeader(h) => {
                buf.field(UPDATE_SEQUENCE_BITS, h.sequence)?;
                buf.field(VERSION_BITS, h.version)?;
                buf.field(HEADER_ADDRESS_BITS, h.start >> CHUNK_SHIFT)?;
                buf.field(HEADER_ADDRESS_BITS, h.end >> CHUNK_SHIFT)?;
            }
            Record::UpdateChunk(c) => {
                buf.field(UPDATE_SEQUENCE_BITS, c.sequence)?;
                buf.field(CHUNK_ADDRESS_BITS, c.address >> CHUNK_SHIFT)?;
                for byte in &c.data {
                    buf.field(BYTE_BITS, *byte as u32)?;
                }
            }
            Record::UpdateExecute(x) => {
                buf.field(UPDATE_SEQUENCE_BITS, x.sequence)?;
                buf.field(VERSION_BITS, x.version)?;
            }
        }
        Ok(buf)
    }

    /// Decode a complete record from its staged words
    ///
    /// The word count must match the type's field layout exactly.
    pub fn decode(words: &[u32]) -> Result<Self, DecodeError> {
        let (&lead, rest) = words.split_first().ok_or(DecodeError::Truncated)?;
        let mut dec = Decoder::begin(lead, rest.iter().copied())?;

        let record = match RecordType::from_tag(dec.tag()) {
            Some(RecordType::Zero) => Record::Zero,
            Some(RecordType::Sequence) => Record::Sequence(dec.field(SEQUENCE_BITS)?),
            Some(RecordType::Config) => {
                let mut raw = [0u32; CONFIG_WORDS];
                for word in raw.iter_mut() {
                    *word = dec.field(32)?;
                }
                Record::Config(DeviceConfig::from_words(raw))
            }
            Some(RecordType::UpdateHeader) => Record::UpdateHeader(UpdateHeader {
                sequence: dec.field(UPDATE_SEQUENCE_BITS)?,
                version: dec.field(VERSION_BITS)?,
                start: dec.field(HEADER_ADDRESS_BITS)? << CHUNK_SHIFT,
                end: dec.field(HEADER_ADDRESS_BITS)? << CHUNK_SHIFT,
            }),
            Some(RecordType::UpdateChunk) => {
                let sequence = dec.field(UPDATE_SEQUENCE_BITS)?;
                let address = dec.field(CHUNK_ADDRESS_BITS)? << CHUNK_SHIFT;
                let mut data = [0u8; CHUNK_SIZE];
                for byte in data.iter_mut() {
                    *byte = dec.field(BYTE_BITS)? as u8;
                }
                Record::UpdateChunk(UpdateChunk {
                    sequence,
                    address,
                    data,
                })
            }
            Some(RecordType::UpdateExecute) => Record::UpdateExecute(UpdateExecute {
                sequence: dec.field(UPDATE_SEQUENCE_BITS)?,
                version: dec.field(VERSION_BITS)?,
            }),
            None => return Err(DecodeError::UnknownType(dec.tag())),
        };

        dec.finish()?;
        Ok(record)
    }
}
