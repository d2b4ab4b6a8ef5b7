//! Page scanner
//!
//! Recovers the log at boot in two passes:
//!
//! 1. **Locate** - read each page up to its first erased word or its
//!    `Sequence` record, whichever comes first, and keep the pages with the
//!    lowest (oldest) and highest (newest) sequence.
//! 2. **Replay** - walk the ring from oldest to newest, streaming every word
//!    through an [`Importer`] that reassembles records and dispatches them.
//!
//! In full mode ([`recover`]) the scan also yields the [`WriteCursor`]: the
//! address after the last programmed word of the newest page.
//!
//! Scanning only reads flash, so scanning an unchanged region twice gives
//! the same answer.

use heapless::Vec;
use ringlog_hal::flash::{FlashRead, ERASED_WORD, WORD_SIZE};

use crate::codec::{is_lead, lead_tag, DecodeError, RecordType, MAX_RECORD_WORDS};
use crate::dispatch::{dispatch, RecordMask, RecordSink};
use crate::records::{Record, SEQUENCE_MASK};
use crate::region::FlashRegion;

/// Oldest and newest written pages
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PageSpan {
    pub oldest: u32,
    pub oldest_sequence: u32,
    pub newest: u32,
    pub newest_sequence: u32,
}

/// Where the next record goes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct WriteCursor {
    /// Address of the first free word
    pub write_pointer: u32,
    /// Sequence of the newest page; the next page gets `sequence + 1`
    pub sequence: u32,
}

impl WriteCursor {
    /// Cursor for a region with nothing in it
    pub const fn empty(region: &FlashRegion) -> Self {
        Self {
            write_pointer: region.start(),
            sequence: 0,
        }
    }
}

/// Counters from one replay
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ReplayStats {
    pub pages: u32,
    /// Records decoded, markers included
    pub records: u32,
    /// Records handed to the sink
    pub delivered: u32,
    /// Damaged, truncated or unknown records skipped
    pub dropped: u32,
}

/// Outcome of a scan
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ScanReport {
    /// `None` when the region holds no sequence marker at all
    pub span: Option<PageSpan>,
    pub stats: ReplayStats,
}

/// Sequence number of `page`, if it has one
pub fn page_sequence<R: FlashRead + ?Sized>(flash: &mut R, region: &FlashRegion, page: u32) -> Option<u32> {
    for address in region.page_words(page) {
        let word = flash.read_word(address);
        if word == ERASED_WORD {
            return None;
        }
        if is_lead(word) && lead_tag(word) == RecordType::Sequence.tag() {
            return Some(word & SEQUENCE_MASK);
        }
    }
    None
}

/// Find the oldest and newest pages by sequence
///
/// Sequence numbers are assumed never to wrap, so plain min/max ordering
/// holds however the ring has rotated.
pub fn locate<R: FlashRead + ?Sized>(flash: &mut R, region: &FlashRegion) -> Option<PageSpan> {
    let mut span: Option<PageSpan> = None;

    for page in region.pages() {
        let Some(sequence) = page_sequence(flash, region, page) else {
            continue;
        };
        match span.as_mut() {
            None => {
                span = Some(PageSpan {
                    oldest: page,
                    oldest_sequence: sequence,
                    newest: page,
                    newest_sequence: sequence,
                })
            }
            Some(span) => {
                if sequence < span.oldest_sequence {
                    span.oldest = page;
                    span.oldest_sequence = sequence;
                }
                if sequence > span.newest_sequence {
                    span.newest = page;
                    span.newest_sequence = sequence;
                }
            }
        }
    }

    span
}

/// Streaming record reassembler
///
/// A lead word flushes whatever is in progress and starts a new record; a
/// continuation word extends it; an erased word flushes and leaves nothing
/// in progress. Continuation words with no record in progress (the tail of
/// a record whose start was overwritten) are ignored.
pub struct Importer {
    words: Vec<u32, MAX_RECORD_WORDS>,
    active: bool,
    overflow: bool,
    stats: ReplayStats,
}

impl Default for Importer {
    fn default() -> Self {
        Self::new()
    }
}

impl Importer {
    pub const fn new() -> Self {
        Self {
            words: Vec::new(),
            active: false,
            overflow: false,
            stats: ReplayStats {
                pages: 0,
                records: 0,
                delivered: 0,
                dropped: 0,
            },
        }
    }

    /// Feed one word read from flash
    pub fn push<S: RecordSink + ?Sized>(&mut self, word: u32, interest: RecordMask, sink: &mut S) {
        if is_lead(word) {
            self.flush(interest, sink);
            if word != ERASED_WORD {
                self.words.clear();
                let pushed = self.words.push(word);
                debug_assert!(pushed.is_ok());
                self.active = true;
                self.overflow = false;
            }
            return;
        }

        if self.active && self.words.push(word).is_err() {
            self.overflow = true;
        }
    }

    /// Decode and dispatch the record in progress, if any
    pub fn flush<S: RecordSink + ?Sized>(&mut self, interest: RecordMask, sink: &mut S) {
        if !self.active {
            return;
        }
        self.active = false;

        if self.overflow {
            self.stats.dropped += 1;
            warn!("dropping oversized record");
            return;
        }

        match Record::decode(&self.words) {
            Ok(record) => {
                self.stats.records += 1;
                if dispatch(&record, interest, sink) {
                    self.stats.delivered += 1;
                }
            }
            Err(DecodeError::UnknownType(tag)) => {
                self.stats.dropped += 1;
                debug!("skipping record with unknown tag {=u8}", tag);
            }
            Err(e) => {
                self.stats.dropped += 1;
                warn!("dropping damaged record ({=usize} words): {}", self.words.len(), e);
            }
        }
    }

    pub fn stats(&self) -> ReplayStats {
        self.stats
    }

    fn start_page(&mut self) {
        self.stats.pages += 1;
    }
}

/// Replay every record from oldest to newest page (read-only mode)
pub fn replay<R, S>(flash: &mut R, region: &FlashRegion, interest: RecordMask, sink: &mut S) -> ScanReport
where
    R: FlashRead + ?Sized,
    S: RecordSink + ?Sized,
{
    let Some(span) = locate(flash, region) else {
        debug!("log region empty");
        return ScanReport {
            span: None,
            stats: ReplayStats::default(),
        };
    };

    let mut importer = Importer::new();
    let mut page = span.oldest;
    loop {
        importer.start_page();
        for address in region.page_words(page) {
            let word = flash.read_word(address);
            importer.push(word, interest, sink);
            if word == ERASED_WORD {
                break;
            }
        }

        if page == span.newest {
            importer.push(ERASED_WORD, interest, sink);
            break;
        }
        page = region.next_page(page);
    }

    let stats = importer.stats();
    debug!(
        "replayed {=u32} pages, {=u32} records, {=u32} dropped",
        stats.pages,
        stats.records,
        stats.dropped
    );

    ScanReport {
        span: Some(span),
        stats,
    }
}

/// Replay the log and work out where writing resumes (full mode)
pub fn recover<R, S>(
    flash: &mut R,
    region: &FlashRegion,
    interest: RecordMask,
    sink: &mut S,
) -> (ScanReport, WriteCursor)
where
    R: FlashRead + ?Sized,
    S: RecordSink + ?Sized,
{
    let report = replay(flash, region, interest, sink);

    let cursor = match report.span {
        None => WriteCursor::empty(region),
        Some(span) => WriteCursor {
            write_pointer: page_tail(flash, region, span.newest),
            sequence: span.newest_sequence,
        },
    };

    info!(
        "log recovered: write pointer {=u32:#x}, sequence {=u32}",
        cursor.write_pointer,
        cursor.sequence
    );

    (report, cursor)
}

/// Address after the last non-erased word of `page`
fn page_tail<R: FlashRead + ?Sized>(flash: &mut R, region: &FlashRegion, page: u32) -> u32 {
    let mut end = page + region.page_size();
    while end > page && flash.read_word(end - WORD_SIZE) == ERASED_WORD {
        end -= WORD_SIZE;
    }
    end
}
