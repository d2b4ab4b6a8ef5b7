//! Write scheduler
//!
//! Appends one staged record at a time to the log. The scheduler is
//! re-entered once per pass of the cooperative loop through
//! [`WriteScheduler::step`]; each call either issues one flash request,
//! waits for the one in flight, or finishes the record.
//!
//! A record that spills out of the current page first makes sure the next
//! page (circularly) is erased, then writes the record together with the new
//! page's `Sequence` record, numbered one above the newest page so far.

pub mod flasher;
pub mod state;

use heapless::Vec;
use ringlog_hal::flash::{FlashDevice, FlashRead, WORD_SIZE};

use crate::codec::{EncodeError, RecordBuf};
use crate::records::{sequence_marker, Record, SEQUENCE_MASK};
use crate::region::FlashRegion;
use crate::scanner::WriteCursor;

pub use flasher::{Flasher, FLASH_TRIES, PROGRAM_WORDS};
pub use state::{Action, Observation, Placement, WriteState, MAX_ATTEMPTS};

/// Errors from staging a record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum StageError {
    /// Another record is still being written
    Busy,
    /// The record could not be encoded into the staging buffer
    Encode(EncodeError),
}

impl From<EncodeError> for StageError {
    fn from(e: EncodeError) -> Self {
        StageError::Encode(e)
    }
}

/// Result of one scheduler pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Progress {
    /// Nothing staged
    Idle,
    /// A flash request is outstanding or was just issued
    Pending,
    /// The staged record is on flash and the cursor has moved past it
    Written,
    /// Every attempt failed to land; the record was dropped
    Abandoned,
}

impl Progress {
    /// Check if the caller should call `step` again
    pub fn is_pending(self) -> bool {
        matches!(self, Progress::Pending)
    }
}

/// Single-writer appender for a log region
pub struct WriteScheduler {
    region: FlashRegion,
    cursor: WriteCursor,
    state: WriteState,
    staged: Option<RecordBuf>,
    plan: Option<Placement>,
    /// Words actually programmed: the record plus any sequence marker
    frame: Vec<u32, PROGRAM_WORDS>,
}

impl WriteScheduler {
    /// Resume writing at `cursor`, as recovered by the page scanner
    pub fn new(region: FlashRegion, cursor: WriteCursor) -> Self {
        Self {
            region,
            cursor,
            state: WriteState::Idle,
            staged: None,
            plan: None,
            frame: Vec::new(),
        }
    }

    pub fn region(&self) -> &FlashRegion {
        &self.region
    }

    pub fn cursor(&self) -> WriteCursor {
        self.cursor
    }

    pub fn state(&self) -> WriteState {
        self.state
    }

    /// Check if no record is staged
    pub fn is_idle(&self) -> bool {
        self.staged.is_none()
    }

    /// Encode `record` and stage it for writing
    pub fn stage(&mut self, record: &Record) -> Result<(), StageError> {
        if self.staged.is_some() {
            return Err(StageError::Busy);
        }
        self.stage_encoded(record.encode()?)
    }

    /// Stage an already encoded record
    pub fn stage_encoded(&mut self, buf: RecordBuf) -> Result<(), StageError> {
        if self.staged.is_some() {
            return Err(StageError::Busy);
        }
        self.staged = Some(buf);
        self.plan = None;
        self.frame.clear();
        self.state = WriteState::Idle;
        Ok(())
    }

    /// Advance the staged write by one step
    pub fn step<F: FlashDevice>(&mut self, flash: &mut Flasher<F>) -> Progress {
        let Some(words) = self.staged.as_ref().map(|buf| buf.len()) else {
            return Progress::Idle;
        };
        if flash.is_busy() {
            return Progress::Pending;
        }

        let plan = match self.plan {
            Some(plan) => plan,
            None => {
                let plan = Placement::plan(&self.region, self.cursor.write_pointer, words);
                self.plan = Some(plan);
                plan
            }
        };

        let obs = Observation {
            needs_page: plan.needs_page,
            next_page_erased: flash.is_erased(plan.next_page),
            target_written: !flash.is_erased(plan.target),
        };
        let (next, action) = self.state.transition(obs);
        trace!("write {} -> {}: {}", self.state, next, action);
        self.state = next;

        match action {
            Action::IssueErase => {
                debug!("erasing log page {=u32:#x}", plan.next_page);
                flash.erase(plan.next_page);
                Progress::Pending
            }
            Action::IssueProgram => {
                if self.frame.is_empty() {
                    self.build_frame(&plan);
                }
                match flash.program(plan.target, &self.frame) {
                    Ok(()) => Progress::Pending,
                    Err(e) => {
                        error!("program request refused: {}", e);
                        self.finish();
                        Progress::Abandoned
                    }
                }
            }
            Action::Complete => {
                self.cursor.write_pointer = plan.target + self.frame.len() as u32 * WORD_SIZE;
                if plan.needs_page {
                    self.cursor.sequence = self.next_sequence();
                }
                self.finish();
                Progress::Written
            }
            Action::Skip => {
                let page_end = self.region.page_start(plan.target) + self.region.page_size();
                warn!(
                    "write target {=u32:#x} not erased, moving on to {=u32:#x}",
                    plan.target,
                    page_end
                );
                self.cursor.write_pointer = page_end;
                self.plan = None;
                self.frame.clear();
                self.step(flash)
            }
            Action::None => {
                warn!("giving up on record at {=u32:#x}", plan.target);
                self.finish();
                Progress::Abandoned
            }
        }
    }

    /// Assemble the staged record with the new page's marker, if any
    ///
    /// The marker carries the next sequence number; the cursor only takes
    /// it once the write lands.
    fn build_frame(&mut self, plan: &Placement) {
        let Some(staged) = self.staged.as_ref() else {
            return;
        };

        self.frame.clear();
        let marker = plan.needs_page.then(|| sequence_marker(self.next_sequence()));
        let built = match marker {
            Some(marker) if plan.sequence_first() => {
                self.frame.push(marker).is_ok() && self.frame.extend_from_slice(staged.words()).is_ok()
            }
            Some(marker) => {
                self.frame.extend_from_slice(staged.words()).is_ok() && self.frame.push(marker).is_ok()
            }
            None => self.frame.extend_from_slice(staged.words()).is_ok(),
        };
        // PROGRAM_WORDS leaves room for a full record and its marker
        debug_assert!(built);
    }

    fn next_sequence(&self) -> u32 {
        (self.cursor.sequence + 1) & SEQUENCE_MASK
    }

    fn finish(&mut self) {
        self.staged = None;
        self.plan = None;
        self.frame.clear();
        self.state = WriteState::Idle;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::RecordMask;
    use crate::scanner::{page_sequence, recover};
    use crate::testing::*;
    use ringlog_hal::flash::{FlashError, FlashRead};

    /// Drive the scheduler, delivering device completions, until it settles
    fn run(s: &mut WriteScheduler, f: &mut Flasher<TestFlash>) -> Progress {
        for _ in 0..32 {
            let progress = s.step(f);
            if !progress.is_pending() {
                return progress;
            }
            if let Some(ok) = f.device_mut().complete() {
                f.completion(ok);
            }
        }
        panic!("scheduler did not settle");
    }

    fn words_at(f: &mut Flasher<TestFlash>, address: u32, count: u32) -> heapless::Vec<u32, 48> {
        (0..count).map(|i| f.read_word(address + i * 4)).collect()
    }

    #[test]
    fn test_first_write_to_empty_region() {
        let region = region();
        let mut f = Flasher::new(flash());
        let mut s = WriteScheduler::new(region, WriteCursor::empty(&region));

        s.stage(&header(1, 1)).unwrap();
        assert_eq!(run(&mut s, &mut f), Progress::Written);

        assert_eq!(f.read_word(0), sequence_marker(1));
        assert_eq!(s.cursor(), WriteCursor { write_pointer: 16, sequence: 1 });
        assert_eq!(f.device().stats().async_erases, 0);
    }

    #[test]
    fn test_record_that_fits_has_no_marker() {
        let region = region();
        let mut f = Flasher::new(flash());
        let mut s = WriteScheduler::new(region, WriteCursor { write_pointer: 8, sequence: 4 });

        let record = header(2, 2);
        s.stage(&record).unwrap();
        assert_eq!(run(&mut s, &mut f), Progress::Written);

        let expected = record.encode().unwrap();
        assert_eq!(&words_at(&mut f, 8, 3)[..], expected.words());
        assert_eq!(s.cursor(), WriteCursor { write_pointer: 20, sequence: 4 });
        assert_eq!(f.device().stats().async_programs, 1);
    }

    #[test]
    fn test_page_rollover_prepends_sequence() {
        let region = region();
        let mut f = Flasher::new(flash());
        // Page 0 is exactly full and page 1 is already erased
        let mut s = WriteScheduler::new(region, WriteCursor { write_pointer: PAGE, sequence: 1 });

        let record = header(3, 3);
        s.stage(&record).unwrap();
        assert_eq!(run(&mut s, &mut f), Progress::Written);

        let stats = f.device().stats();
        assert_eq!(stats.async_erases, 0);
        assert_eq!(stats.sync_erases, 0);
        assert_eq!(stats.async_programs, 1);

        let encoded = record.encode().unwrap();
        let written = words_at(&mut f, PAGE, 4);
        assert_eq!(written[0], sequence_marker(2));
        assert_eq!(&written[1..], encoded.words());
        assert_eq!(s.cursor(), WriteCursor { write_pointer: PAGE + 16, sequence: 2 });
    }

    #[test]
    fn test_straddling_record_gets_marker_after_it() {
        let region = region();
        let mut f = Flasher::new(flash());
        // Page 0 has a marker and room for two more words
        write_records(f.device_mut(), 0, &[Record::Sequence(1)]);
        let mut s = WriteScheduler::new(region, WriteCursor { write_pointer: PAGE - 8, sequence: 1 });

        let record = header(5, 5);
        s.stage(&record).unwrap();
        assert_eq!(run(&mut s, &mut f), Progress::Written);

        let encoded = record.encode().unwrap();
        let written = words_at(&mut f, PAGE - 8, 4);
        assert_eq!(&written[..3], encoded.words());
        assert_eq!(written[3], sequence_marker(2));
        assert_eq!(page_sequence(&mut f, &region, PAGE), Some(2));
        assert_eq!(s.cursor(), WriteCursor { write_pointer: PAGE + 8, sequence: 2 });

        // The straddling record reads back whole
        let mut sink = Recorder::default();
        let (_, cursor) = recover(&mut f, &region, RecordMask::ALL, &mut sink);
        assert_eq!(sink.headers.len(), 1);
        assert_eq!(cursor, s.cursor());
    }

    #[test]
    fn test_wrap_erases_oldest_page() {
        let region = region();
        let mut f = Flasher::new(flash());
        // Every page written, newest is the last one with 2 words free
        for (i, page) in region.pages().enumerate() {
            write_records(f.device_mut(), page, &[Record::Sequence(i as u32 + 1)]);
        }
        let last = region.last_page();
        let mut s = WriteScheduler::new(region, WriteCursor { write_pointer: last + PAGE - 8, sequence: 8 });

        s.stage(&header(6, 6)).unwrap();
        assert_eq!(run(&mut s, &mut f), Progress::Written);

        assert_eq!(f.device().stats().async_erases, 1);
        assert_eq!(f.read_word(0), sequence_marker(9));
        assert!(f.is_erased(16));
        assert_eq!(s.cursor(), WriteCursor { write_pointer: 16, sequence: 9 });

        // Oldest is now page 1, newest page 0
        let mut sink = Recorder::default();
        let (report, cursor) = recover(&mut f, &region, RecordMask::ALL, &mut sink);
        let span = report.span.unwrap();
        assert_eq!(span.oldest, PAGE);
        assert_eq!(span.newest, 0);
        assert_eq!(cursor, s.cursor());
        assert_eq!(sink.headers.len(), 1);
    }

    #[test]
    fn test_busy_while_staged() {
        let region = region();
        let mut s = WriteScheduler::new(region, WriteCursor::empty(&region));
        s.stage(&Record::Zero).unwrap();
        assert_eq!(s.stage(&Record::Zero), Err(StageError::Busy));
        assert!(!s.is_idle());
    }

    #[test]
    fn test_pending_while_flash_busy() {
        let region = region();
        let mut f = Flasher::new(flash());
        let mut s = WriteScheduler::new(region, WriteCursor { write_pointer: 4, sequence: 1 });
        s.stage(&Record::Zero).unwrap();

        assert_eq!(s.step(&mut f), Progress::Pending);
        assert_eq!(s.state(), WriteState::Writing(1));
        assert_eq!(s.step(&mut f), Progress::Pending);
        assert_eq!(f.device().stats().async_programs, 1);
    }

    #[test]
    fn test_failures_resolved_by_fallback() {
        let region = region();
        let mut f = Flasher::new(flash());
        f.device_mut().fail_next(3);
        let mut s = WriteScheduler::new(region, WriteCursor { write_pointer: 4, sequence: 1 });

        s.stage(&header(7, 7)).unwrap();
        assert_eq!(run(&mut s, &mut f), Progress::Written);
        assert_eq!(f.device().stats().sync_programs, 1);
        assert_eq!(f.fallbacks(), 1);
        assert_eq!(s.cursor().write_pointer, 16);
    }

    #[test]
    fn test_idle_step_does_nothing() {
        let region = region();
        let mut f = Flasher::new(flash());
        let mut s = WriteScheduler::new(region, WriteCursor::empty(&region));
        assert_eq!(s.step(&mut f), Progress::Idle);
        assert_eq!(f.device().stats(), Default::default());
    }

    /// Device that accepts every request and changes nothing
    struct Stuck(TestFlash);

    impl FlashRead for Stuck {
        fn read_word(&mut self, address: u32) -> u32 {
            self.0.read_word(address)
        }
    }

    impl FlashDevice for Stuck {
        fn page_size(&self) -> u32 {
            PAGE
        }
        fn erase_async(&mut self, _page: u32) {}
        fn program_async(&mut self, _dest: u32, _words: &[u32]) {}
        fn erase_sync(&mut self, _page: u32) -> Result<(), FlashError> {
            Ok(())
        }
        fn program_sync(&mut self, _dest: u32, _words: &[u32]) -> Result<(), FlashError> {
            Ok(())
        }
    }

    #[test]
    fn test_unlanded_write_is_abandoned() {
        let region = region();
        let mut f = Flasher::new(Stuck(flash()));
        let start = WriteCursor { write_pointer: 4, sequence: 1 };
        let mut s = WriteScheduler::new(region, start);
        s.stage(&header(1, 1)).unwrap();

        let mut issued = 0;
        let progress = loop {
            let progress = s.step(&mut f);
            if !progress.is_pending() {
                break progress;
            }
            issued += 1;
            f.completion(true);
        };

        assert_eq!(progress, Progress::Abandoned);
        assert_eq!(issued, MAX_ATTEMPTS);
        assert_eq!(s.cursor(), start);
        assert!(s.is_idle());
    }

    #[test]
    fn test_unerasable_page_is_abandoned() {
        let region = region();
        let mut inner = flash();
        inner.program_sync(PAGE, &[0]).unwrap();
        let mut f = Flasher::new(Stuck(inner));
        let mut s = WriteScheduler::new(region, WriteCursor { write_pointer: PAGE, sequence: 1 });
        s.stage(&Record::Zero).unwrap();

        let mut erases = 0;
        loop {
            let progress = s.step(&mut f);
            if !progress.is_pending() {
                assert_eq!(progress, Progress::Abandoned);
                break;
            }
            assert!(matches!(s.state(), WriteState::Erasing(_)));
            erases += 1;
            f.completion(true);
        }
        assert_eq!(erases, MAX_ATTEMPTS);
    }

    #[test]
    fn test_abandoned_page_write_keeps_sequence() {
        let region = region();
        let start = WriteCursor { write_pointer: PAGE, sequence: 1 };
        let mut f = Flasher::new(Stuck(flash()));
        let mut s = WriteScheduler::new(region, start);
        s.stage(&header(1, 1)).unwrap();

        let progress = loop {
            let progress = s.step(&mut f);
            if !progress.is_pending() {
                break progress;
            }
            f.completion(true);
        };
        assert_eq!(progress, Progress::Abandoned);
        assert_eq!(s.cursor(), start);

        // Same page, working device: the marker number was not used up
        let mut f = Flasher::new(f.into_inner().0);
        s.stage(&header(1, 1)).unwrap();
        assert_eq!(run(&mut s, &mut f), Progress::Written);
        assert_eq!(f.read_word(PAGE), sequence_marker(2));
        assert_eq!(s.cursor(), WriteCursor { write_pointer: PAGE + 16, sequence: 2 });
    }

    #[test]
    fn test_stale_target_moves_to_next_page() {
        let region = region();
        let mut inner = flash();
        let next = write_records(&mut inner, 0, &[Record::Sequence(1), header(1, 1)]);
        inner.program_sync(next, &[0x1234_5678]).unwrap();
        let mut f = Flasher::new(inner);
        let mut s = WriteScheduler::new(region, WriteCursor { write_pointer: next, sequence: 1 });

        s.stage(&header(2, 2)).unwrap();
        assert_eq!(run(&mut s, &mut f), Progress::Written);

        assert_eq!(f.read_word(next), 0x1234_5678);
        assert!(f.is_erased(next + 4));
        assert_eq!(page_sequence(&mut f, &region, PAGE), Some(2));
        assert_eq!(s.cursor(), WriteCursor { write_pointer: PAGE + 16, sequence: 2 });
        assert_eq!(f.device().stats().async_programs, 1);
    }
}
