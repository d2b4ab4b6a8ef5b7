//! Firmware update collection
//!
//! An update arrives as three kinds of log record: a header announcing the
//! image range and version, one chunk record per 64 bytes of image, and an
//! execute record authorizing the image to be applied. Records of several
//! updates may be interleaved in the log; only the newest announced update
//! (highest header sequence) is collected.
//!
//! [`UpdateSearch`] is a [`RecordSink`], so it can be fed straight from a
//! mount or a replay of the log.

use crate::bitmap::{chunk_map_bytes, ChunkMap};
use crate::dispatch::RecordSink;
use crate::records::{UpdateChunk, UpdateExecute, UpdateHeader, CHUNK_SIZE};

const CHUNK: u32 = CHUNK_SIZE as u32;

/// Updatable part of code flash
///
/// Update addresses are addresses in the code flash device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct CodeLayout {
    pub start: u32,
    pub end: u32,
    /// Erase unit of the code flash
    pub page_size: u32,
}

impl CodeLayout {
    pub const fn new(start: u32, end: u32, page_size: u32) -> Self {
        Self { start, end, page_size }
    }

    /// Check if `header` describes an image this layout can take
    ///
    /// The image must lie inside the layout, start on a page boundary, end
    /// on a chunk boundary and be at least one page long.
    pub fn accepts(&self, header: &UpdateHeader) -> bool {
        self.page_size != 0
            && header.start >= self.start
            && header.end <= self.end
            && header.start % self.page_size == 0
            && header.end % CHUNK == 0
            && header.end >= header.start + self.page_size
    }
}

/// Where collection of the newest update stands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum UpdateStatus {
    /// No acceptable header seen
    None,
    /// Chunks still outstanding
    Incomplete { missing: u32 },
    /// All chunks present, no matching execute record
    NotAuthorized,
    Complete,
}

/// Collects the newest firmware update from replayed records
///
/// `BYTES` sizes the outstanding-chunk map: one bit per 64-byte chunk of the
/// largest acceptable image.
#[derive(Debug, Clone)]
pub struct UpdateSearch<const BYTES: usize> {
    code: CodeLayout,
    header: Option<UpdateHeader>,
    execute: Option<UpdateExecute>,
    /// Set bits are chunks not yet seen
    outstanding: ChunkMap<BYTES>,
}

impl<const BYTES: usize> UpdateSearch<BYTES> {
    pub const fn new(code: CodeLayout) -> Self {
        Self {
            code,
            header: None,
            execute: None,
            outstanding: ChunkMap::new(0, 0, CHUNK),
        }
    }

    pub fn code(&self) -> &CodeLayout {
        &self.code
    }

    /// Header of the update being collected
    pub fn header(&self) -> Option<&UpdateHeader> {
        self.header.as_ref()
    }

    /// Execute record matching the header
    pub fn execute(&self) -> Option<&UpdateExecute> {
        self.execute.as_ref()
    }

    /// Check if `chunk` belongs to the update being collected
    pub fn wants(&self, chunk: &UpdateChunk) -> bool {
        match &self.header {
            Some(h) => {
                chunk.sequence == h.sequence
                    && chunk.address % CHUNK == 0
                    && chunk.address >= h.start
                    && chunk.address < h.end
            }
            None => false,
        }
    }

    /// Number of chunks not yet seen
    pub fn missing(&self) -> u32 {
        self.outstanding.count_set()
    }

    /// Address of the first chunk not yet seen
    pub fn next_missing(&self) -> Option<u32> {
        self.outstanding.first_set()
    }

    pub fn status(&self) -> UpdateStatus {
        let Some(header) = &self.header else {
            return UpdateStatus::None;
        };
        if !self.outstanding.is_clear_all() {
            return UpdateStatus::Incomplete {
                missing: self.missing(),
            };
        }
        match &self.execute {
            Some(x) if x.version == header.version => UpdateStatus::Complete,
            _ => UpdateStatus::NotAuthorized,
        }
    }

    /// Check if the update is fully present and authorized
    pub fn is_complete(&self) -> bool {
        self.status() == UpdateStatus::Complete
    }
}

impl<const BYTES: usize> RecordSink for UpdateSearch<BYTES> {
    fn update_header(&mut self, header: &UpdateHeader) {
        if !self.code.accepts(header) || chunk_map_bytes(header.start, header.end, CHUNK) > BYTES {
            warn!(
                "ignoring update {=u32}: range {=u32:#x}..{=u32:#x} not acceptable",
                header.sequence,
                header.start,
                header.end
            );
            return;
        }
        if let Some(current) = &self.header {
            if header.sequence <= current.sequence {
                return;
            }
        }

        debug!("collecting update {=u32} version {=u32:#x}", header.sequence, header.version);
        self.header = Some(*header);
        self.execute = None;
        self.outstanding = ChunkMap::new(header.start, header.end, CHUNK);
        self.outstanding.set_range(header.start, header.end);
    }

    fn update_chunk(&mut self, chunk: &UpdateChunk) {
        if self.wants(chunk) {
            self.outstanding.clear(chunk.address);
        }
    }

    fn update_execute(&mut self, execute: &UpdateExecute) {
        if self.header.is_some_and(|h| h.sequence == execute.sequence) {
            self.execute = Some(*execute);
        }
    }
}
