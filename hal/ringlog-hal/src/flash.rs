//! Flash device abstractions
//!
//! NOR flash as seen by the storage log: word addressed, page erasable,
//! and programmable only from 1 to 0. Erasing is the only way back to 1.

/// Value of a word in an erased page
pub const ERASED_WORD: u32 = 0xFFFF_FFFF;

/// Size of a flash word in bytes
pub const WORD_SIZE: u32 = 4;

/// Errors from argument validation in flash implementations
///
/// These are contract violations (bad address or alignment), not transient
/// hardware failures. Transient failures are reported through the
/// asynchronous completion path as `false`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum FlashError {
    /// Address outside the device
    OutOfBounds,
    /// Address not word (or page, for erase) aligned
    Misaligned,
    /// Operation refused by the controller
    Device,
}

/// Word-level read access to flash
pub trait FlashRead {
    /// Read the aligned 32-bit word at `address`
    ///
    /// Addresses outside the device read as erased.
    fn read_word(&mut self, address: u32) -> u32;

    /// Check if the word at `address` is erased
    fn is_erased(&mut self, address: u32) -> bool {
        self.read_word(address) == ERASED_WORD
    }
}

/// Erase/program access to flash
///
/// The asynchronous operations return immediately. Their outcome is
/// delivered later by the owner of the device to whoever issued them, as a
/// single `bool` per request (see `StorageManager::completion_notify`). A
/// request the controller refuses outright must still produce exactly one
/// completion, reporting failure.
///
/// The blocking operations are the guaranteed-completion fallback: they busy
/// wait on the raw controller and always finish.
pub trait FlashDevice: FlashRead {
    /// Size of an erasable page in bytes
    fn page_size(&self) -> u32;

    /// Begin erasing the page starting at `page`
    fn erase_async(&mut self, page: u32);

    /// Begin programming `words` starting at `dest`
    fn program_async(&mut self, dest: u32, words: &[u32]);

    /// Erase the page starting at `page`, blocking until done
    fn erase_sync(&mut self, page: u32) -> Result<(), FlashError>;

    /// Program `words` starting at `dest`, blocking until done
    fn program_sync(&mut self, dest: u32, words: &[u32]) -> Result<(), FlashError>;
}

impl<T: FlashRead + ?Sized> FlashRead for &mut T {
    fn read_word(&mut self, address: u32) -> u32 {
        (**self).read_word(address)
    }
}
