//! In-memory flash device
//!
//! A word array that behaves like NOR flash: program can only clear bits,
//! erase sets a whole page back to ones. Asynchronous requests are held
//! until [`MemFlash::complete`] is called, which applies them (or reports a
//! scripted failure without touching the array). Every call is counted in
//! [`FlashStats`] so callers can assert on the exact traffic they caused.

use heapless::Vec;

use crate::flash::{FlashDevice, FlashError, FlashRead, ERASED_WORD, WORD_SIZE};

/// Largest asynchronous program request accepted, in words
pub const MAX_PROGRAM_WORDS: usize = 64;

/// Counters for every operation issued to a [`MemFlash`]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct FlashStats {
    pub async_erases: u32,
    pub async_programs: u32,
    pub sync_erases: u32,
    pub sync_programs: u32,
    /// Completions delivered as failures (scripted or rejected)
    pub failed_completions: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum PendingOp {
    Erase(u32),
    Program { dest: u32, words: Vec<u32, MAX_PROGRAM_WORDS> },
    /// Request refused at submission; completes as a failure
    Rejected,
}

/// Host-side flash device backed by `WORDS` words starting at `base`
pub struct MemFlash<const WORDS: usize> {
    base: u32,
    page_size: u32,
    words: [u32; WORDS],
    pending: Option<PendingOp>,
    fail_next: u32,
    /// Page that accepts erases and programs but keeps its contents
    worn: Option<u32>,
    stats: FlashStats,
}

impl<const WORDS: usize> MemFlash<WORDS> {
    /// Create a fully erased device
    ///
    /// `page_size` is in bytes and must divide the device size.
    pub const fn new(base: u32, page_size: u32) -> Self {
        Self {
            base,
            page_size,
            words: [ERASED_WORD; WORDS],
            pending: None,
            fail_next: 0,
            worn: None,
            stats: FlashStats {
                async_erases: 0,
                async_programs: 0,
                sync_erases: 0,
                sync_programs: 0,
                failed_completions: 0,
            },
        }
    }

    /// First address past the device
    pub fn end(&self) -> u32 {
        self.base + (WORDS as u32) * WORD_SIZE
    }

    /// Make the next `count` asynchronous completions report failure
    pub fn fail_next(&mut self, count: u32) {
        self.fail_next = count;
    }

    /// Make `page` stop changing while still reporting success, as a worn
    /// out sector does
    pub fn wear_out(&mut self, page: u32) {
        self.worn = Some(page);
    }

    /// Check if an asynchronous request is waiting for [`complete`](Self::complete)
    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Deliver the outcome of the outstanding asynchronous request
    ///
    /// Returns `None` when nothing is outstanding. A failed completion leaves
    /// the array untouched, as a controller that gave up would.
    pub fn complete(&mut self) -> Option<bool> {
        let op = self.pending.take()?;

        if self.fail_next > 0 {
            self.fail_next -= 1;
            self.stats.failed_completions += 1;
            return Some(false);
        }

        let applied = match op {
            PendingOp::Erase(page) => self.apply_erase(page),
            PendingOp::Program { dest, words } => self.apply_program(dest, &words),
            PendingOp::Rejected => Err(FlashError::Device),
        };

        if applied.is_err() {
            self.stats.failed_completions += 1;
        }
        Some(applied.is_ok())
    }

    /// Operation counters since creation
    pub fn stats(&self) -> FlashStats {
        self.stats
    }

    /// Overwrite a word directly, bypassing flash semantics (test setup)
    pub fn poke(&mut self, address: u32, word: u32) {
        if let Ok(index) = self.index(address) {
            self.words[index] = word;
        }
    }

    /// Raw view of the whole array
    pub fn words(&self) -> &[u32] {
        &self.words
    }

    fn index(&self, address: u32) -> Result<usize, FlashError> {
        if address % WORD_SIZE != 0 {
            return Err(FlashError::Misaligned);
        }
        if address < self.base || address >= self.end() {
            return Err(FlashError::OutOfBounds);
        }
        Ok(((address - self.base) / WORD_SIZE) as usize)
    }

    fn apply_erase(&mut self, page: u32) -> Result<(), FlashError> {
        let first = self.index(page)?;
        if self.page_size == 0 || (page - self.base) % self.page_size != 0 {
            return Err(FlashError::Misaligned);
        }
        if self.worn == Some(page) {
            return Ok(());
        }
        let count = (self.page_size / WORD_SIZE) as usize;
        let last = (first + count).min(WORDS);
        self.words[first..last].fill(ERASED_WORD);
        Ok(())
    }

    fn apply_program(&mut self, dest: u32, words: &[u32]) -> Result<(), FlashError> {
        let first = self.index(dest)?;
        if first + words.len() > WORDS {
            return Err(FlashError::OutOfBounds);
        }
        for (index, word) in (first..).zip(words) {
            if !self.is_worn(index) {
                self.words[index] &= *word;
            }
        }
        Ok(())
    }

    fn is_worn(&self, index: usize) -> bool {
        let address = self.base + index as u32 * WORD_SIZE;
        self.worn
            .is_some_and(|page| address >= page && address < page + self.page_size)
    }
}

impl<const WORDS: usize> FlashRead for MemFlash<WORDS> {
    fn read_word(&mut self, address: u32) -> u32 {
        match self.index(address) {
            Ok(index) => self.words[index],
            Err(_) => ERASED_WORD,
        }
    }
}

impl<const WORDS: usize> FlashDevice for MemFlash<WORDS> {
    fn page_size(&self) -> u32 {
        self.page_size
    }

    fn erase_async(&mut self, page: u32) {
        self.stats.async_erases += 1;
        self.pending = Some(PendingOp::Erase(page));
    }

    fn program_async(&mut self, dest: u32, words: &[u32]) {
        self.stats.async_programs += 1;
        self.pending = Some(match Vec::from_slice(words) {
            Ok(words) => PendingOp::Program { dest, words },
            Err(()) => PendingOp::Rejected,
        });
    }

    fn erase_sync(&mut self, page: u32) -> Result<(), FlashError> {
        self.stats.sync_erases += 1;
        self.apply_erase(page)
    }

    fn program_sync(&mut self, dest: u32, words: &[u32]) -> Result<(), FlashError> {
        self.stats.sync_programs += 1;
        self.apply_program(dest, words)
    }
}
