//! Record dispatch
//!
//! Replay hands each decoded record to a [`RecordSink`], filtered by a
//! [`RecordMask`] chosen per call: the boot loader asks only for update
//! records, the application also asks for configuration. The same mask type
//! doubles as the pending-write word of the storage manager.
//!
//! Configuration records are delivered as decoded. Checking their CRC is
//! the consumer's job.

use core::ops::{BitOr, BitOrAssign};

use crate::codec::RecordType;
use crate::config::DeviceConfig;
use crate::records::{Record, UpdateChunk, UpdateExecute, UpdateHeader};

/// Set of record kinds, one bit each
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct RecordMask(u8);

impl RecordMask {
    pub const NONE: Self = Self(0);
    pub const CONFIG: Self = Self(0x01);
    pub const UPDATE_HEADER: Self = Self(0x04);
    pub const UPDATE_CHUNK: Self = Self(0x08);
    pub const UPDATE_EXECUTE: Self = Self(0x10);

    /// Everything the boot loader needs
    pub const UPDATE: Self = Self(0x04 | 0x08 | 0x10);

    /// Everything a consumer can receive
    pub const ALL: Self = Self(0x01 | 0x04 | 0x08 | 0x10);

    /// Mask bit for a record type, if the type has consumers at all
    pub fn for_type(record_type: RecordType) -> Self {
        match record_type {
            RecordType::Config => Self::CONFIG,
            RecordType::UpdateHeader => Self::UPDATE_HEADER,
            RecordType::UpdateChunk => Self::UPDATE_CHUNK,
            RecordType::UpdateExecute => Self::UPDATE_EXECUTE,
            RecordType::Zero | RecordType::Sequence => Self::NONE,
        }
    }

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Check if every bit of `other` is in `self`
    pub const fn contains(self, other: Self) -> bool {
        other.0 != 0 && self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: Self) {
        self.0 &= !other.0;
    }
}

impl BitOr for RecordMask {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for RecordMask {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

/// Consumer of replayed records
///
/// Every method defaults to ignoring the record, so a sink implements only
/// what it cares about.
pub trait RecordSink {
    fn config(&mut self, _config: &DeviceConfig) {}

    fn update_header(&mut self, _header: &UpdateHeader) {}

    fn update_chunk(&mut self, _chunk: &UpdateChunk) {}

    fn update_execute(&mut self, _execute: &UpdateExecute) {}
}

/// Sink that ignores everything
impl RecordSink for () {}

impl<S: RecordSink + ?Sized> RecordSink for &mut S {
    fn config(&mut self, config: &DeviceConfig) {
        (**self).config(config)
    }

    fn update_header(&mut self, header: &UpdateHeader) {
        (**self).update_header(header)
    }

    fn update_chunk(&mut self, chunk: &UpdateChunk) {
        (**self).update_chunk(chunk)
    }

    fn update_execute(&mut self, execute: &UpdateExecute) {
        (**self).update_execute(execute)
    }
}

/// Fan out to two sinks, first then second
impl<A: RecordSink, B: RecordSink> RecordSink for (A, B) {
    fn config(&mut self, config: &DeviceConfig) {
        self.0.config(config);
        self.1.config(config);
    }

    fn update_header(&mut self, header: &UpdateHeader) {
        self.0.update_header(header);
        self.1.update_header(header);
    }

    fn update_chunk(&mut self, chunk: &UpdateChunk) {
        self.0.update_chunk(chunk);
        self.1.update_chunk(chunk);
    }

    fn update_execute(&mut self, execute: &UpdateExecute) {
        self.0.update_execute(execute);
        self.1.update_execute(execute);
    }
}

/// Deliver `record` to `sink` if its kind is in `interest`
///
/// Returns whether a sink method was called.
pub fn dispatch<S: RecordSink + ?Sized>(record: &Record, interest: RecordMask, sink: &mut S) -> bool {
    if !interest.contains(RecordMask::for_type(record.record_type())) {
        return false;
    }

    match record {
        Record::Config(config) => sink.config(config),
        Record::UpdateHeader(header) => sink.update_header(header),
        Record::UpdateChunk(chunk) => sink.update_chunk(chunk),
        Record::UpdateExecute(execute) => sink.update_execute(execute),
        Record::Zero | Record::Sequence(_) => return false,
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Counts {
        configs: u32,
        headers: u32,
        chunks: u32,
        executes: u32,
    }

    impl RecordSink for Counts {
        fn config(&mut self, _: &DeviceConfig) {
            self.configs += 1;
        }

        fn update_header(&mut self, _: &UpdateHeader) {
            self.headers += 1;
        }

        fn update_chunk(&mut self, _: &UpdateChunk) {
            self.chunks += 1;
        }

        fn update_execute(&mut self, _: &UpdateExecute) {
            self.executes += 1;
        }
    }

    fn header() -> Record {
        Record::UpdateHeader(UpdateHeader {
            sequence: 1,
            version: 2,
            start: 0,
            end: 64,
        })
    }

    #[test]
    fn test_mask_bits_match_record_types() {
        assert_eq!(RecordMask::for_type(RecordType::Config).bits(), 0x01);
        assert_eq!(RecordMask::for_type(RecordType::UpdateHeader).bits(), 0x04);
        assert_eq!(RecordMask::for_type(RecordType::UpdateChunk).bits(), 0x08);
        assert_eq!(RecordMask::for_type(RecordType::UpdateExecute).bits(), 0x10);
        assert!(RecordMask::for_type(RecordType::Sequence).is_empty());
    }

    #[test]
    fn test_mask_set_operations() {
        let mut mask = RecordMask::CONFIG | RecordMask::UPDATE_CHUNK;
        assert!(mask.contains(RecordMask::CONFIG));
        assert!(!mask.contains(RecordMask::UPDATE_HEADER));
        assert!(!mask.contains(RecordMask::NONE));

        mask.remove(RecordMask::CONFIG);
        assert_eq!(mask, RecordMask::UPDATE_CHUNK);
        mask |= RecordMask::UPDATE_EXECUTE;
        assert!(RecordMask::UPDATE.contains(mask));
    }

    #[test]
    fn test_interest_filters_delivery() {
        let mut counts = Counts::default();
        let config = Record::Config(DeviceConfig::factory());

        assert!(!dispatch(&config, RecordMask::UPDATE, &mut counts));
        assert!(dispatch(&header(), RecordMask::UPDATE, &mut counts));
        assert!(dispatch(&config, RecordMask::ALL, &mut counts));
        assert_eq!(counts.configs, 1);
        assert_eq!(counts.headers, 1);
    }

    #[test]
    fn test_markers_are_never_delivered() {
        let mut counts = Counts::default();
        assert!(!dispatch(&Record::Sequence(3), RecordMask::ALL, &mut counts));
        assert!(!dispatch(&Record::Zero, RecordMask::ALL, &mut counts));
    }

    #[test]
    fn test_config_crc_not_checked() {
        let mut counts = Counts::default();
        let mut config = DeviceConfig::factory();
        config.set_node_id(5);
        assert!(!config.verify_crc());
        assert!(dispatch(&Record::Config(config), RecordMask::CONFIG, &mut counts));
        assert_eq!(counts.configs, 1);
    }

    #[test]
    fn test_pair_fans_out() {
        let mut pair = (Counts::default(), Counts::default());
        dispatch(&header(), RecordMask::ALL, &mut pair);
        assert_eq!(pair.0.headers, 1);
        assert_eq!(pair.1.headers, 1);
        assert_eq!(pair.0.chunks + pair.1.chunks + pair.0.executes, 0);
    }
}
