//! Retrying flash port
//!
//! Owns the flash device and the single in-flight asynchronous operation.
//! A failed completion resubmits the identical request; the third failure
//! performs the request through the blocking path instead and reports it
//! done regardless, so a stubborn controller can stall the system briefly
//! but never wedge it.

use heapless::Vec;
use ringlog_hal::flash::{FlashDevice, FlashError, FlashRead};

use crate::codec::MAX_RECORD_WORDS;

/// Asynchronous submissions per operation before the blocking fallback
pub const FLASH_TRIES: u8 = 3;

/// Largest program request: a full record plus a sequence marker
pub const PROGRAM_WORDS: usize = MAX_RECORD_WORDS + 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
enum Operation {
    Erase(u32),
    Program(u32),
}

/// Flash device wrapper tracking one asynchronous operation
pub struct Flasher<F> {
    device: F,
    in_flight: Option<Operation>,
    tries_left: u8,
    buffer: Vec<u32, PROGRAM_WORDS>,
    fallbacks: u32,
}

impl<F: FlashDevice> Flasher<F> {
    pub fn new(device: F) -> Self {
        Self {
            device,
            in_flight: None,
            tries_left: 0,
            buffer: Vec::new(),
            fallbacks: 0,
        }
    }

    /// Check if an operation is waiting for its completion
    pub fn is_busy(&self) -> bool {
        self.in_flight.is_some()
    }

    /// Start erasing `page`
    ///
    /// Must only be called when not busy.
    pub fn erase(&mut self, page: u32) {
        self.start(Operation::Erase(page));
    }

    /// Start programming `words` at `dest`
    ///
    /// The words are copied, so the caller's buffer is free once this
    /// returns. Must only be called when not busy.
    pub fn program(&mut self, dest: u32, words: &[u32]) -> Result<(), FlashError> {
        self.buffer = Vec::from_slice(words).map_err(|_| FlashError::OutOfBounds)?;
        self.start(Operation::Program(dest));
        Ok(())
    }

    /// Route an asynchronous completion to the operation in flight
    pub fn completion(&mut self, ok: bool) {
        let Some(op) = self.in_flight else {
            debug!("flash completion with nothing in flight");
            return;
        };

        if ok {
            self.in_flight = None;
            return;
        }

        self.tries_left = self.tries_left.saturating_sub(1);
        if self.tries_left > 0 {
            debug!("flash {} failed, {=u8} tries left", op, self.tries_left);
            self.submit(op);
            return;
        }

        warn!("flash {} failed {=u8} times, using blocking path", op, FLASH_TRIES);
        let result = match op {
            Operation::Erase(page) => self.device.erase_sync(page),
            Operation::Program(dest) => self.device.program_sync(dest, &self.buffer),
        };
        if let Err(e) = result {
            error!("blocking flash {} rejected: {}", op, e);
        }
        self.fallbacks += 1;
        self.in_flight = None;
    }

    /// Number of operations finished through the blocking path
    pub fn fallbacks(&self) -> u32 {
        self.fallbacks
    }

    pub fn device(&self) -> &F {
        &self.device
    }

    /// Direct access to the device (e.g. to service its completions)
    pub fn device_mut(&mut self) -> &mut F {
        &mut self.device
    }

    pub fn into_inner(self) -> F {
        self.device
    }

    fn start(&mut self, op: Operation) {
        self.tries_left = FLASH_TRIES;
        self.submit(op);
    }

    fn submit(&mut self, op: Operation) {
        self.in_flight = Some(op);
        match op {
            Operation::Erase(page) => self.device.erase_async(page),
            Operation::Program(dest) => self.device.program_async(dest, &self.buffer),
        }
    }
}

impl<F: FlashRead> FlashRead for Flasher<F> {
    fn read_word(&mut self, address: u32) -> u32 {
        self.device.read_word(address)
    }
}
