//! Write state machine
//!
//! Appending one record is a small, pure state machine driven by what the
//! scheduler observes on flash each pass. Keeping it free of I/O lets every
//! transition be tested without a device.
//!
//! ```text
//!           needs page,                     target
//!           not erased      page erased     written
//!   Idle ──────────────▶ Erasing(n) ─────▶ Writing(n) ─────▶ Idle (Complete)
//!     │                    │   ▲               │   ▲
//!     │ fits / erased      └───┘ n < 3         └───┘ n < 3
//!     └──────────────────────────────────────▶ Writing(1)
//!
//!   Erasing(3) / Writing(3) still not applied ──▶ Idle (None: record dropped)
//!   Idle / Erasing about to write, target not erased ──▶ Idle (Skip)
//! ```

use crate::region::FlashRegion;
use ringlog_hal::flash::WORD_SIZE;

/// Issues of one step (erase or program) before giving up on a record
pub const MAX_ATTEMPTS: u8 = 3;

/// Where the write scheduler is with the staged record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum WriteState {
    /// No step issued yet
    #[default]
    Idle,
    /// Erase of the next page issued this many times
    Erasing(u8),
    /// Program of the record issued this many times
    Writing(u8),
}

/// What the scheduler sees on flash before deciding
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Observation {
    /// The record does not fit in what is left of the current page
    pub needs_page: bool,
    /// First word of the next page reads erased
    pub next_page_erased: bool,
    /// First word of the write target no longer reads erased
    pub target_written: bool,
}

/// Flash work requested by a transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Action {
    IssueErase,
    IssueProgram,
    /// The record is on flash
    Complete,
    /// The target held data before anything was programmed; move the write
    /// pointer to the next page boundary and plan again
    Skip,
    /// Nothing to do; after `Erasing`/`Writing` this means the record was
    /// abandoned
    None,
}

impl WriteState {
    pub fn is_idle(&self) -> bool {
        matches!(self, WriteState::Idle)
    }

    /// Decide the next step from the current state and what flash shows
    ///
    /// The `target_written`/`next_page_erased` checks are what let a
    /// re-entry after a completion skip work that already landed. They look
    /// at one word only, so a program that landed its first word and nothing
    /// else is taken as written.
    ///
    /// Before the first program the target must read erased; a stale target
    /// yields [`Action::Skip`] instead of programming over it.
    pub fn transition(self, obs: Observation) -> (Self, Action) {
        use WriteState::*;

        match (self, obs) {
            (Idle, o) if o.needs_page && !o.next_page_erased => (Erasing(1), Action::IssueErase),
            (Idle, o) if o.target_written => (Idle, Action::Skip),
            (Idle, _) => (Writing(1), Action::IssueProgram),

            (Erasing(_), o) if o.next_page_erased && o.target_written => (Idle, Action::Skip),
            (Erasing(_), o) if o.next_page_erased => (Writing(1), Action::IssueProgram),
            (Erasing(n), _) if n < MAX_ATTEMPTS => (Erasing(n + 1), Action::IssueErase),
            (Erasing(_), _) => (Idle, Action::None),

            (Writing(_), o) if o.target_written => (Idle, Action::Complete),
            (Writing(n), _) if n < MAX_ATTEMPTS => (Writing(n + 1), Action::IssueProgram),
            (Writing(_), _) => (Idle, Action::None),
        }
    }
}

/// Where a record of a given size lands relative to the write pointer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Placement {
    /// The record spills out of the current page, so the next page must be
    /// erased and gets a new `Sequence` record
    pub needs_page: bool,
    /// The page after the current one, circularly
    pub next_page: u32,
    /// Address the program starts at
    pub target: u32,
}

impl Placement {
    /// Plan a write of `words` words at `write_pointer`
    ///
    /// A pointer sitting exactly on a page boundary belongs to the end of the
    /// previous page, with nothing left in it. When the next page wraps
    /// around to the start of the region, the unused tail of the last page is
    /// abandoned and the write starts at the region start.
    pub fn plan(region: &FlashRegion, write_pointer: u32, words: usize) -> Self {
        let (remaining, next_page) = if write_pointer >= region.end() {
            (0, region.start())
        } else if region.is_page_start(write_pointer) {
            (0, write_pointer)
        } else {
            let page_end = region.page_start(write_pointer) + region.page_size();
            ((page_end - write_pointer) / WORD_SIZE, region.next_page(write_pointer))
        };

        let needs_page = words > remaining as usize;
        let target = if needs_page && next_page <= write_pointer {
            next_page
        } else {
            write_pointer
        };

        Self {
            needs_page,
            next_page,
            target,
        }
    }

    /// The new page's `Sequence` record goes before the staged record
    ///
    /// True when the write starts on the new page itself. Otherwise the
    /// record straddles into the new page and the marker follows it, landing
    /// right after the record's carried-over continuation words.
    pub fn sequence_first(&self) -> bool {
        self.needs_page && self.target == self.next_page
    }
}
