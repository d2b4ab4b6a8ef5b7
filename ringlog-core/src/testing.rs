//! Shared fixtures for unit tests

use heapless::Vec;
use ringlog_hal::flash::{FlashDevice, WORD_SIZE};
use ringlog_hal::mem::MemFlash;

use crate::config::DeviceConfig;
use crate::dispatch::RecordSink;
use crate::records::{Record, UpdateChunk, UpdateExecute, UpdateHeader, CHUNK_SIZE};
use crate::region::FlashRegion;

/// Test page size: 64 words
pub const PAGE: u32 = 256;

/// Words in an eight-page test region
pub const REGION_WORDS: usize = 8 * (PAGE as usize / 4);

pub type TestFlash = MemFlash<REGION_WORDS>;

pub fn region() -> FlashRegion {
    FlashRegion::new(0, 8 * PAGE, PAGE).unwrap()
}

pub fn flash() -> TestFlash {
    MemFlash::new(0, PAGE)
}

/// Program `records` back to back from `address`, returning the next free
/// address
pub fn write_records<F: FlashDevice>(flash: &mut F, mut address: u32, records: &[Record]) -> u32 {
    for record in records {
        let buf = record.encode().unwrap();
        flash.program_sync(address, buf.words()).unwrap();
        address += buf.len() as u32 * WORD_SIZE;
    }
    address
}

pub fn header(sequence: u32, version: u32) -> Record {
    Record::UpdateHeader(UpdateHeader {
        sequence,
        version,
        start: 0x400,
        end: 0x800,
    })
}

pub fn chunk(sequence: u32, address: u32, fill: u8) -> Record {
    Record::UpdateChunk(UpdateChunk {
        sequence,
        address,
        data: [fill; CHUNK_SIZE],
    })
}

/// Sink that keeps everything it is given, in order
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Recorder {
    pub configs: Vec<DeviceConfig, 8>,
    pub headers: Vec<UpdateHeader, 16>,
    pub chunks: Vec<(u32, u32), 64>,
    pub executes: Vec<UpdateExecute, 8>,
}

impl RecordSink for Recorder {
    fn config(&mut self, config: &DeviceConfig) {
        self.configs.push(*config).unwrap();
    }

    fn update_header(&mut self, header: &UpdateHeader) {
        self.headers.push(*header).unwrap();
    }

    fn update_chunk(&mut self, chunk: &UpdateChunk) {
        self.chunks.push((chunk.sequence, chunk.address)).unwrap();
    }

    fn update_execute(&mut self, execute: &UpdateExecute) {
        self.executes.push(*execute).unwrap();
    }
}
