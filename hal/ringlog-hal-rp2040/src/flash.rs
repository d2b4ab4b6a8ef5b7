//! Flash driver for RP2040
//!
//! The RP2040 executes in place from the same QSPI flash it stores to, so
//! erase and program always stall the core; embassy-rp exposes them as
//! blocking calls. To fit the request/completion model of the storage log,
//! asynchronous requests are queued here and carried out by [`service`],
//! which the storage task calls from its own loop. Each serviced request
//! yields exactly one completion.
//!
//! Addresses are offsets from the start of flash.
//!
//! [`service`]: Rp2040Flash::service

use embassy_rp::flash::{Blocking, Flash, ERASE_SIZE};
use embassy_rp::peripherals::FLASH;
use embassy_rp::Peri;
use heapless::Vec;

pub use ringlog_hal::flash::{FlashDevice, FlashError, FlashRead, ERASED_WORD, WORD_SIZE};

/// 2MB flash on the Pico
pub const FLASH_SIZE: usize = 2 * 1024 * 1024;

/// Flash erase size for RP2040
pub const PAGE_SIZE: u32 = ERASE_SIZE as u32;

/// Pages given to the storage log
pub const LOG_PAGES: u32 = 62;

/// Configuration mirror page, the last page of flash
pub const CONFIG_PAGE: u32 = FLASH_SIZE as u32 - PAGE_SIZE;

/// Start of the storage log, right below the config page
pub const LOG_START: u32 = CONFIG_PAGE - LOG_PAGES * PAGE_SIZE;

/// End of the storage log
pub const LOG_END: u32 = CONFIG_PAGE;

/// Largest asynchronous program request
pub const MAX_PROGRAM_WORDS: usize = 64;

enum Request {
    Erase(u32),
    Program { dest: u32, bytes: Vec<u8, { MAX_PROGRAM_WORDS * 4 }> },
    /// Refused at submission, completes as a failure
    Refused,
}

/// RP2040 on-chip flash
pub struct Rp2040Flash<'d> {
    flash: Flash<'d, FLASH, Blocking, FLASH_SIZE>,
    queued: Option<Request>,
}

impl<'d> Rp2040Flash<'d> {
    pub fn new(flash: Peri<'d, FLASH>) -> Self {
        Self {
            flash: Flash::new_blocking(flash),
            queued: None,
        }
    }

    /// Check if a request is waiting for [`service`](Self::service)
    pub fn is_pending(&self) -> bool {
        self.queued.is_some()
    }

    /// Carry out the queued request
    ///
    /// Returns its completion, or `None` if nothing was queued.
    pub fn service(&mut self) -> Option<bool> {
        let result = match self.queued.take()? {
            Request::Erase(page) => self.erase(page),
            Request::Program { dest, bytes } => self.write(dest, &bytes),
            Request::Refused => Err(FlashError::Device),
        };
        Some(result.is_ok())
    }

    /// Get the raw flash peripheral for low-level access
    pub fn flash(&mut self) -> &mut Flash<'d, FLASH, Blocking, FLASH_SIZE> {
        &mut self.flash
    }

    fn queue(&mut self, request: Request) {
        if self.queued.is_some() {
            // Only one request may be outstanding; the caller broke the
            // contract, so the newer one fails.
            self.queued = Some(Request::Refused);
            return;
        }
        self.queued = Some(request);
    }

    fn erase(&mut self, page: u32) -> Result<(), FlashError> {
        if page % PAGE_SIZE != 0 {
            return Err(FlashError::Misaligned);
        }
        if page as usize >= FLASH_SIZE {
            return Err(FlashError::OutOfBounds);
        }
        self.flash
            .blocking_erase(page, page + PAGE_SIZE)
            .map_err(|_| FlashError::Device)
    }

    fn write(&mut self, dest: u32, bytes: &[u8]) -> Result<(), FlashError> {
        if dest % WORD_SIZE != 0 {
            return Err(FlashError::Misaligned);
        }
        if dest as usize + bytes.len() > FLASH_SIZE {
            return Err(FlashError::OutOfBounds);
        }
        self.flash.blocking_write(dest, bytes).map_err(|_| FlashError::Device)
    }
}

fn to_bytes(words: &[u32]) -> Option<Vec<u8, { MAX_PROGRAM_WORDS * 4 }>> {
    let mut bytes = Vec::new();
    for word in words {
        bytes.extend_from_slice(&word.to_le_bytes()).ok()?;
    }
    Some(bytes)
}

impl FlashRead for Rp2040Flash<'_> {
    fn read_word(&mut self, address: u32) -> u32 {
        let mut buf = [0u8; 4];
        if address as usize + 4 > FLASH_SIZE || self.flash.blocking_read(address, &mut buf).is_err() {
            return ERASED_WORD;
        }
        u32::from_le_bytes(buf)
    }
}

impl FlashDevice for Rp2040Flash<'_> {
    fn page_size(&self) -> u32 {
        PAGE_SIZE
    }

    fn erase_async(&mut self, page: u32) {
        self.queue(Request::Erase(page));
    }

    fn program_async(&mut self, dest: u32, words: &[u32]) {
        match to_bytes(words) {
            Some(bytes) => self.queue(Request::Program { dest, bytes }),
            None => self.queue(Request::Refused),
        }
    }

    fn erase_sync(&mut self, page: u32) -> Result<(), FlashError> {
        self.erase(page)
    }

    fn program_sync(&mut self, dest: u32, words: &[u32]) -> Result<(), FlashError> {
        let bytes = to_bytes(words).ok_or(FlashError::OutOfBounds)?;
        self.write(dest, &bytes)
    }
}
