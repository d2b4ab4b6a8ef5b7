//! Applying a collected update to code flash
//!
//! Runs before the application, against a read-only view of the log. The
//! apply is idempotent: pages already holding the new image are left alone,
//! so a reset half way through simply resumes on the next boot.
//!
//! ```text
//!   replay #1   collect the newest update            UpdateSearch
//!   replay #2   compare chunks with code flash       pages that differ
//!               erase those pages                    erase_sync
//!   replay #3   program chunks of erased pages       program_sync
//! ```

use ringlog_hal::flash::{FlashDevice, FlashError, FlashRead, WORD_SIZE};

use crate::bitmap::ChunkMap;
use crate::dispatch::{RecordMask, RecordSink};
use crate::records::{UpdateChunk, CHUNK_SIZE};
use crate::region::FlashRegion;
use crate::scanner::replay;
use crate::update::{CodeLayout, UpdateSearch, UpdateStatus};

/// What the boot loader did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum BootDecision {
    /// No update in the log
    NoUpdate,
    /// Update announced but chunks are missing
    Incomplete { missing: u32 },
    /// Update present but not authorized
    NotAuthorized,
    /// Code flash already holds the update
    AlreadyApplied,
    Applied { pages_erased: u32, chunks_written: u32 },
}

/// Update applier
///
/// `CHUNK_BYTES` sizes the chunk maps (one bit per 64-byte chunk of the
/// largest image), `PAGE_BYTES` the page map (one bit per code page).
pub struct BootLoader<const CHUNK_BYTES: usize, const PAGE_BYTES: usize> {
    code: CodeLayout,
}

impl<const CHUNK_BYTES: usize, const PAGE_BYTES: usize> BootLoader<CHUNK_BYTES, PAGE_BYTES> {
    pub const fn new(code: CodeLayout) -> Self {
        Self { code }
    }

    /// Apply the newest complete update found in `log`
    pub fn run<R, C>(&self, storage: &mut R, log: &FlashRegion, code: &mut C) -> Result<BootDecision, FlashError>
    where
        R: FlashRead + ?Sized,
        C: FlashDevice,
    {
        let mut search = UpdateSearch::<CHUNK_BYTES>::new(self.code);
        replay(storage, log, RecordMask::UPDATE, &mut search);

        match search.status() {
            UpdateStatus::None => return Ok(BootDecision::NoUpdate),
            UpdateStatus::Incomplete { missing } => {
                info!("update incomplete, {=u32} chunks missing", missing);
                return Ok(BootDecision::Incomplete { missing });
            }
            UpdateStatus::NotAuthorized => return Ok(BootDecision::NotAuthorized),
            UpdateStatus::Complete => {}
        }
        let Some(header) = search.header().copied() else {
            return Ok(BootDecision::NoUpdate);
        };

        let page_end = header.end.next_multiple_of(self.code.page_size);
        let mut compare = Compare {
            search: &search,
            code: &mut *code,
            dirty: ChunkMap::<PAGE_BYTES>::new(header.start, page_end, self.code.page_size),
        };
        replay(storage, log, RecordMask::UPDATE_CHUNK, &mut compare);
        let dirty = compare.dirty;

        if dirty.is_clear_all() {
            info!("update version {=u32:#x} already applied", header.version);
            return Ok(BootDecision::AlreadyApplied);
        }

        let mut pages_erased = 0;
        let mut page = header.start;
        while page < page_end {
            if dirty.is_set(page) {
                debug!("erasing code page {=u32:#x}", page);
                code.erase_sync(page)?;
                pages_erased += 1;
            }
            page += self.code.page_size;
        }

        let mut program = Program {
            search: &search,
            code: &mut *code,
            erased: &dirty,
            written: ChunkMap::<CHUNK_BYTES>::new(header.start, header.end, CHUNK_SIZE as u32),
            count: 0,
            error: None,
        };
        replay(storage, log, RecordMask::UPDATE_CHUNK, &mut program);
        if let Some(e) = program.error {
            error!("programming update failed: {}", e);
            return Err(e);
        }

        info!(
            "applied update version {=u32:#x}: {=u32} pages, {=u32} chunks",
            header.version,
            pages_erased,
            program.count
        );
        Ok(BootDecision::Applied {
            pages_erased,
            chunks_written: program.count,
        })
    }
}

/// Marks pages holding a chunk that differs from code flash
struct Compare<'a, C, const CHUNK_BYTES: usize, const PAGE_BYTES: usize> {
    search: &'a UpdateSearch<CHUNK_BYTES>,
    code: &'a mut C,
    dirty: ChunkMap<PAGE_BYTES>,
}

impl<C: FlashRead, const CHUNK_BYTES: usize, const PAGE_BYTES: usize> RecordSink
    for Compare<'_, C, CHUNK_BYTES, PAGE_BYTES>
{
    fn update_chunk(&mut self, chunk: &UpdateChunk) {
        if !self.search.wants(chunk) || self.dirty.is_set(chunk.address) {
            return;
        }
        let differs = chunk
            .data_words()
            .iter()
            .enumerate()
            .any(|(i, &word)| self.code.read_word(chunk.address + i as u32 * WORD_SIZE) != word);
        if differs {
            self.dirty.set(chunk.address);
        }
    }
}

/// Programs every chunk that falls in an erased page, once
struct Program<'a, C, const CHUNK_BYTES: usize, const PAGE_BYTES: usize> {
    search: &'a UpdateSearch<CHUNK_BYTES>,
    code: &'a mut C,
    erased: &'a ChunkMap<PAGE_BYTES>,
    written: ChunkMap<CHUNK_BYTES>,
    count: u32,
    error: Option<FlashError>,
}

impl<C: FlashDevice, const CHUNK_BYTES: usize, const PAGE_BYTES: usize> RecordSink
    for Program<'_, C, CHUNK_BYTES, PAGE_BYTES>
{
    fn update_chunk(&mut self, chunk: &UpdateChunk) {
        if self.error.is_some()
            || !self.search.wants(chunk)
            || !self.erased.is_set(chunk.address)
            || self.written.is_set(chunk.address)
        {
            return;
        }
        match self.code.program_sync(chunk.address, &chunk.data_words()) {
            Ok(()) => {
                self.written.set(chunk.address);
                self.count += 1;
            }
            Err(e) => self.error = Some(e),
        }
    }
}
