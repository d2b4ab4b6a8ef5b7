//! Flash region geometry
//!
//! A [`FlashRegion`] is a run of whole pages treated as a ring: the page
//! after the last one is the first one. All constructors are `const fn` so a
//! bad layout constant is rejected at compile time.

use ringlog_hal::flash::WORD_SIZE;

use crate::codec::MAX_RECORD_WORDS;

/// Region geometry errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum RegionError {
    /// Page size is not a non-zero multiple of the word size
    BadPageSize,
    /// Start address is not on a page boundary
    StartMisaligned,
    /// Region has no pages
    Empty,
    /// Length is not a whole number of pages
    NotPageMultiple,
    /// A page cannot hold the largest record plus a sequence marker
    PageTooSmall,
}

/// An immutable circular run of flash pages
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct FlashRegion {
    start: u32,
    end: u32,
    page_size: u32,
}

impl FlashRegion {
    /// Describe the pages in `[start, end)`
    pub const fn new(start: u32, end: u32, page_size: u32) -> Result<Self, RegionError> {
        if page_size == 0 || page_size % WORD_SIZE != 0 {
            return Err(RegionError::BadPageSize);
        }
        if start % page_size != 0 {
            return Err(RegionError::StartMisaligned);
        }
        if end <= start {
            return Err(RegionError::Empty);
        }
        if (end - start) % page_size != 0 {
            return Err(RegionError::NotPageMultiple);
        }
        if ((page_size / WORD_SIZE) as usize) < MAX_RECORD_WORDS + 1 {
            return Err(RegionError::PageTooSmall);
        }
        Ok(Self { start, end, page_size })
    }

    pub const fn start(&self) -> u32 {
        self.start
    }

    pub const fn end(&self) -> u32 {
        self.end
    }

    pub const fn page_size(&self) -> u32 {
        self.page_size
    }

    pub const fn page_count(&self) -> u32 {
        (self.end - self.start) / self.page_size
    }

    pub const fn words_per_page(&self) -> u32 {
        self.page_size / WORD_SIZE
    }

    /// Start of the last page in the region
    pub const fn last_page(&self) -> u32 {
        self.end - self.page_size
    }

    pub const fn contains(&self, address: u32) -> bool {
        address >= self.start && address < self.end
    }

    /// Start of the page holding `address`
    pub const fn page_start(&self, address: u32) -> u32 {
        address - (address - self.start) % self.page_size
    }

    /// Check if `address` is the first byte of a page
    pub const fn is_page_start(&self, address: u32) -> bool {
        (address - self.start) % self.page_size == 0
    }

    /// Index of the page holding `address`, counted from the region start
    pub const fn page_index(&self, address: u32) -> u32 {
        (address - self.start) / self.page_size
    }

    /// Start address of the page at `index`
    pub const fn page_address(&self, index: u32) -> u32 {
        self.start + index * self.page_size
    }

    /// The page following `page`, wrapping from the last page to the first
    pub const fn next_page(&self, page: u32) -> u32 {
        let next = self.page_start(page) + self.page_size;
        if next >= self.end {
            self.start
        } else {
            next
        }
    }

    /// Iterate over the start address of every page, lowest first
    pub fn pages(&self) -> impl Iterator<Item = u32> {
        let region = *self;
        (0..region.page_count()).map(move |i| region.page_address(i))
    }

    /// Iterate over the word addresses of `page`
    pub fn page_words(&self, page: u32) -> impl Iterator<Item = u32> {
        let start = self.page_start(page);
        (0..self.words_per_page()).map(move |i| start + i * WORD_SIZE)
    }
}
