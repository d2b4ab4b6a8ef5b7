//! Storage manager
//!
//! Owns everything the application needs to persist state through the log:
//! the flash device (behind the retrying [`Flasher`]), the
//! [`WriteScheduler`] and its cursor, the running [`DeviceConfig`], and the
//! queue of pending writes.
//!
//! The manager is driven from a cooperative loop:
//!
//! ```text
//!   loop {
//!       if let Some(ok) = <device completion> { store.completion_notify(ok) }
//!       store.poll(now_ms);
//!   }
//! ```
//!
//! Producers queue work with `save_config` and `store_update_*`. Each kind
//! has one staging slot and one bit in the pending word; when idle, the
//! manager starts the next pending write in fixed priority order:
//! configuration (once its debounce delay has passed), update header, update
//! chunk, update execute.
//!
//! # Configuration page
//!
//! With a dedicated configuration page the configuration is appended there
//! slot by slot. When the page is full, a copy goes to the log first, then
//! the page is erased and the copy lands in slot 0. A save that does not
//! land (the log copy abandoned, or the slot still erased afterwards) leaves
//! the page alone and is queued again after the debounce delay. At mount, the newest
//! valid slot wins, unless the log holds an even newer valid copy, which is
//! adopted and written back.

use ringlog_hal::flash::{FlashDevice, FlashRead, WORD_SIZE};

use crate::config::{DeviceConfig, CONFIG_BYTES, CONFIG_WORDS};
use crate::dispatch::{RecordMask, RecordSink};
use crate::records::{Record, UpdateChunk, UpdateExecute, UpdateHeader};
use crate::region::{FlashRegion, RegionError};
use crate::scanner::{locate, recover, replay, PageSpan, ScanReport, WriteCursor};
use crate::scheduler::{Flasher, Progress, StageError, WriteScheduler};

/// Default delay between a non-forced config save request and the write
pub const CONFIG_SAVE_DELAY_MS: u32 = 5_000;

/// Layout errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum LayoutError {
    /// Log region geometry is invalid
    Region(RegionError),
    /// Config page does not start on a page boundary
    ConfigPageMisaligned,
    /// Config page lies inside the log region
    ConfigPageOverlapsLog,
    /// Device erase size differs from the log page size
    PageSizeMismatch,
}

impl From<RegionError> for LayoutError {
    fn from(e: RegionError) -> Self {
        LayoutError::Region(e)
    }
}

/// Where things live in flash
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct StorageLayout {
    pub log: FlashRegion,
    /// Dedicated configuration page, same size as a log page
    pub config_page: Option<u32>,
}

impl StorageLayout {
    pub const fn new(log: FlashRegion, config_page: Option<u32>) -> Result<Self, LayoutError> {
        if let Some(page) = config_page {
            if page % log.page_size() != 0 {
                return Err(LayoutError::ConfigPageMisaligned);
            }
            if page < log.end() && page + log.page_size() > log.start() {
                return Err(LayoutError::ConfigPageOverlapsLog);
            }
        }
        Ok(Self { log, config_page })
    }
}

/// Tunables
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct StoreSettings {
    /// Debounce applied to non-forced config saves
    pub config_save_delay_ms: u32,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            config_save_delay_ms: CONFIG_SAVE_DELAY_MS,
        }
    }
}

/// Where the running configuration came from at mount
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ConfigSource {
    Defaults,
    ConfigPage,
    Log,
}

/// What mounting found
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct MountReport {
    pub scan: ScanReport,
    pub config: ConfigSource,
}

/// Diagnostic snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct StoreInfo {
    pub span: Option<PageSpan>,
    pub cursor: WriteCursor,
    pub config_sequence: u16,
    pub pending: RecordMask,
    pub fallbacks: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AfterWrite {
    Nothing,
    /// The record was the configuration and there is no config page
    ConfigSaved,
    /// The record was the safety copy taken before erasing the config page
    EraseConfigPage,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Writing(AfterWrite),
    ConfigErase,
    /// Programming the config page slot at this address
    ConfigProgram(u32),
}

/// Adopts configuration records newer than the running one
struct ConfigAdopter<'a> {
    config: &'a mut DeviceConfig,
    adopted: bool,
}

impl RecordSink for ConfigAdopter<'_> {
    fn config(&mut self, candidate: &DeviceConfig) {
        if candidate.is_newer_than(self.config) && candidate.verify_crc() {
            *self.config = *candidate;
            self.adopted = true;
        }
    }
}

/// Logs every record it is given
struct Lister;

impl RecordSink for Lister {
    fn config(&mut self, config: &DeviceConfig) {
        info!(
            "config seq {=u16} node {=u16:#x} net {=u16:#x} crc ok {=bool}",
            config.sequence(),
            config.node_id(),
            config.net_id(),
            config.verify_crc()
        );
    }

    fn update_header(&mut self, header: &UpdateHeader) {
        info!(
            "update seq {=u32} version {=u32:#x} {=u32:#x}..{=u32:#x}",
            header.sequence,
            header.version,
            header.start,
            header.end
        );
    }

    fn update_chunk(&mut self, chunk: &UpdateChunk) {
        info!("chunk seq {=u32} at {=u32:#x}", chunk.sequence, chunk.address);
    }

    fn update_execute(&mut self, execute: &UpdateExecute) {
        info!("execute seq {=u32} version {=u32:#x}", execute.sequence, execute.version);
    }
}

/// Owner of the log, the configuration and the flash device
pub struct StorageManager<F> {
    flasher: Flasher<F>,
    layout: StorageLayout,
    settings: StoreSettings,
    scheduler: WriteScheduler,
    phase: Phase,
    pending: RecordMask,
    now_ms: u32,

    config: DeviceConfig,
    /// Copy being written, sequence and CRC already set
    snapshot: DeviceConfig,
    config_due: Option<u32>,
    config_saving: bool,

    header: Option<UpdateHeader>,
    chunk: Option<UpdateChunk>,
    execute: Option<UpdateExecute>,
}

impl<F: FlashDevice> StorageManager<F> {
    /// Load the configuration and recover the log
    ///
    /// Every record in the log is replayed to `sink` (configuration
    /// included). Update records reach the application only this way.
    pub fn mount<S: RecordSink + ?Sized>(
        device: F,
        layout: StorageLayout,
        settings: StoreSettings,
        sink: &mut S,
    ) -> Result<(Self, MountReport), LayoutError> {
        if device.page_size() != layout.log.page_size() {
            return Err(LayoutError::PageSizeMismatch);
        }

        let mut flasher = Flasher::new(device);
        let mut config = DeviceConfig::factory();
        config.reset_to_defaults();
        let mut source = ConfigSource::Defaults;

        if let Some(page) = layout.config_page {
            if load_config_page(&mut flasher, page, layout.log.page_size(), &mut config) {
                source = ConfigSource::ConfigPage;
            }
        }

        let mut adopter = ConfigAdopter {
            config: &mut config,
            adopted: false,
        };
        let mut sinks = (&mut adopter, &mut *sink);
        let (scan, cursor) = recover(&mut flasher, &layout.log, RecordMask::ALL, &mut sinks);
        let adopted = adopter.adopted;
        if adopted {
            source = ConfigSource::Log;
        }

        info!("config sequence {=u16} from {}", config.sequence(), source);

        let mut store = Self {
            flasher,
            layout,
            settings,
            scheduler: WriteScheduler::new(layout.log, cursor),
            phase: Phase::Idle,
            pending: RecordMask::NONE,
            now_ms: 0,
            config,
            snapshot: config,
            config_due: None,
            config_saving: false,
            header: None,
            chunk: None,
            execute: None,
        };

        if adopted && layout.config_page.is_some() {
            store.save_config(true);
        }

        Ok((store, MountReport { scan, config: source }))
    }

    /// Do the next piece of storage work
    ///
    /// Returns whether more work can be done right now. Work waiting on a
    /// flash completion or on the config debounce delay does not count; the
    /// caller polls again on its next pass.
    pub fn poll(&mut self, now_ms: u32) -> bool {
        self.now_ms = now_ms;

        match self.phase {
            Phase::Idle => self.start_next(),
            Phase::Writing(after) => self.advance_write(after),
            Phase::ConfigErase => {
                if self.flasher.is_busy() {
                    return false;
                }
                match self.layout.config_page {
                    Some(page) if self.flasher.is_erased(page) => {
                        self.program_config_slot(page);
                        false
                    }
                    _ => {
                        self.config_save_failed();
                        self.has_ready_work()
                    }
                }
            }
            Phase::ConfigProgram(slot) => {
                if self.flasher.is_busy() {
                    return false;
                }
                if self.flasher.is_erased(slot) {
                    self.config_save_failed();
                } else {
                    debug!("config {=u16} saved", self.snapshot.sequence());
                    self.config_saved();
                }
                self.has_ready_work()
            }
        }
    }

    /// Route an asynchronous flash completion
    pub fn completion_notify(&mut self, ok: bool) {
        self.flasher.completion(ok);
    }

    /// Check if the flash device has a request outstanding
    pub fn is_flash_busy(&self) -> bool {
        self.flasher.is_busy()
    }

    /// Check if nothing is queued or in progress
    pub fn is_idle(&self) -> bool {
        self.phase == Phase::Idle && self.pending.is_empty()
    }

    /// Request that the running configuration be saved
    ///
    /// Without `force`, the write waits for the debounce delay measured
    /// from the last `poll` time, so a burst of changes costs one write.
    pub fn save_config(&mut self, force: bool) {
        self.config_due = if force {
            None
        } else {
            Some(self.now_ms.wrapping_add(self.settings.config_save_delay_ms))
        };
        self.pending.insert(RecordMask::CONFIG);
        self.config_saving = true;
    }

    /// Check if the last requested configuration save has completed
    pub fn is_config_saved(&self) -> bool {
        !self.config_saving
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    /// Change the running configuration; call `save_config` to persist it
    pub fn config_mut(&mut self) -> &mut DeviceConfig {
        &mut self.config
    }

    /// Queue an update header for writing
    pub fn store_update_header(&mut self, header: UpdateHeader) -> Result<(), StageError> {
        if self.pending.contains(RecordMask::UPDATE_HEADER) {
            return Err(StageError::Busy);
        }
        self.header = Some(header);
        self.pending.insert(RecordMask::UPDATE_HEADER);
        Ok(())
    }

    /// Queue an update chunk for writing
    pub fn store_update_chunk(&mut self, chunk: UpdateChunk) -> Result<(), StageError> {
        if self.pending.contains(RecordMask::UPDATE_CHUNK) {
            return Err(StageError::Busy);
        }
        self.chunk = Some(chunk);
        self.pending.insert(RecordMask::UPDATE_CHUNK);
        Ok(())
    }

    /// Queue an update execute record for writing
    pub fn store_update_execute(&mut self, execute: UpdateExecute) -> Result<(), StageError> {
        if self.pending.contains(RecordMask::UPDATE_EXECUTE) {
            return Err(StageError::Busy);
        }
        self.execute = Some(execute);
        self.pending.insert(RecordMask::UPDATE_EXECUTE);
        Ok(())
    }

    /// Stage an arbitrary record for the next `poll` to write
    pub fn schedule(&mut self, record: &Record) -> Result<(), StageError> {
        if self.phase != Phase::Idle {
            return Err(StageError::Busy);
        }
        self.scheduler.stage(record)?;
        self.phase = Phase::Writing(AfterWrite::Nothing);
        Ok(())
    }

    /// Replay the log to `sink`, restricted to `interest`
    pub fn read<S: RecordSink + ?Sized>(&mut self, interest: RecordMask, sink: &mut S) -> ScanReport {
        replay(&mut self.flasher, &self.layout.log, interest, sink)
    }

    /// Log every record in the log
    pub fn list(&mut self) -> ScanReport {
        replay(&mut self.flasher, &self.layout.log, RecordMask::ALL, &mut Lister)
    }

    pub fn info(&mut self) -> StoreInfo {
        StoreInfo {
            span: locate(&mut self.flasher, &self.layout.log),
            cursor: self.scheduler.cursor(),
            config_sequence: self.config.sequence(),
            pending: self.pending,
            fallbacks: self.flasher.fallbacks(),
        }
    }

    pub fn layout(&self) -> &StorageLayout {
        &self.layout
    }

    pub fn flash(&self) -> &F {
        self.flasher.device()
    }

    /// Direct access to the device, e.g. to collect its completions
    pub fn flash_mut(&mut self) -> &mut F {
        self.flasher.device_mut()
    }

    pub fn into_flash(self) -> F {
        self.flasher.into_inner()
    }

    fn config_ready(&self) -> bool {
        match self.config_due {
            None => true,
            Some(due) => (self.now_ms.wrapping_sub(due) as i32) >= 0,
        }
    }

    fn has_ready_work(&self) -> bool {
        let ready = RecordMask::UPDATE_HEADER | RecordMask::UPDATE_CHUNK | RecordMask::UPDATE_EXECUTE;
        self.phase != Phase::Idle
            || self.pending.bits() & ready.bits() != 0
            || (self.pending.contains(RecordMask::CONFIG) && self.config_ready())
    }

    fn start_next(&mut self) -> bool {
        if self.pending.contains(RecordMask::CONFIG) && self.config_ready() {
            self.pending.remove(RecordMask::CONFIG);
            return self.start_config_save();
        }

        let record = if self.pending.contains(RecordMask::UPDATE_HEADER) {
            self.pending.remove(RecordMask::UPDATE_HEADER);
            self.header.take().map(Record::UpdateHeader)
        } else if self.pending.contains(RecordMask::UPDATE_CHUNK) {
            self.pending.remove(RecordMask::UPDATE_CHUNK);
            self.chunk.take().map(Record::UpdateChunk)
        } else if self.pending.contains(RecordMask::UPDATE_EXECUTE) {
            self.pending.remove(RecordMask::UPDATE_EXECUTE);
            self.execute.take().map(Record::UpdateExecute)
        } else {
            return false;
        };

        match record {
            Some(record) => self.start_write(&record, AfterWrite::Nothing),
            None => self.has_ready_work(),
        }
    }

    fn start_write(&mut self, record: &Record, after: AfterWrite) -> bool {
        if let Err(e) = self.scheduler.stage(record) {
            error!("cannot stage {}: {}", record.record_type(), e);
            return self.has_ready_work();
        }
        self.phase = Phase::Writing(after);
        self.advance_write(after)
    }

    fn advance_write(&mut self, after: AfterWrite) -> bool {
        let progress = self.scheduler.step(&mut self.flasher);
        if progress.is_pending() {
            return false;
        }
        // A lost config copy must not be reported saved, and the config page
        // is only erased once the log holds the copy
        if progress == Progress::Abandoned && after != AfterWrite::Nothing {
            self.config_save_failed();
            return self.has_ready_work();
        }

        match after {
            AfterWrite::Nothing => {
                self.phase = Phase::Idle;
                self.has_ready_work()
            }
            AfterWrite::ConfigSaved => {
                self.config_saved();
                self.has_ready_work()
            }
            AfterWrite::EraseConfigPage => {
                match self.layout.config_page {
                    Some(page) => {
                        debug!("erasing config page {=u32:#x}", page);
                        self.flasher.erase(page);
                        self.phase = Phase::ConfigErase;
                    }
                    None => self.config_saved(),
                }
                false
            }
        }
    }

    fn start_config_save(&mut self) -> bool {
        let sequence = self.config.sequence().wrapping_add(1);
        self.config.set_sequence(sequence);
        self.config.update_crc();
        self.snapshot = self.config;

        let Some(page) = self.layout.config_page else {
            return self.start_write(&Record::Config(self.snapshot), AfterWrite::ConfigSaved);
        };

        match self.free_config_slot(page) {
            Some(slot) => {
                self.program_config_slot(slot);
                false
            }
            None => {
                debug!("config page full, copying config to log");
                self.start_write(&Record::Config(self.snapshot), AfterWrite::EraseConfigPage)
            }
        }
    }

    fn program_config_slot(&mut self, slot: u32) {
        if let Err(e) = self.flasher.program(slot, self.snapshot.words()) {
            error!("config program refused: {}", e);
            self.config_save_failed();
            return;
        }
        self.phase = Phase::ConfigProgram(slot);
    }

    fn free_config_slot(&mut self, page: u32) -> Option<u32> {
        let slots = self.layout.log.page_size() / CONFIG_BYTES;
        (0..slots)
            .map(|i| page + i * CONFIG_BYTES)
            .find(|&slot| self.flasher.is_erased(slot))
    }

    fn config_saved(&mut self) {
        self.phase = Phase::Idle;
        self.config_saving = self.pending.contains(RecordMask::CONFIG);
    }

    /// Queue the save again after the debounce delay
    fn config_save_failed(&mut self) {
        warn!("config {=u16} not saved, retrying", self.snapshot.sequence());
        self.phase = Phase::Idle;
        self.pending.insert(RecordMask::CONFIG);
        self.config_due = Some(self.now_ms.wrapping_add(self.settings.config_save_delay_ms));
        self.config_saving = true;
    }
}

/// Adopt the newest valid slot of the config page
fn load_config_page<R: FlashRead + ?Sized>(
    flash: &mut R,
    page: u32,
    page_size: u32,
    config: &mut DeviceConfig,
) -> bool {
    let mut found = false;
    let mut slot = page;
    while slot + CONFIG_BYTES <= page + page_size {
        if !flash.is_erased(slot) {
            let mut words = [0u32; CONFIG_WORDS];
            for (i, word) in words.iter_mut().enumerate() {
                *word = flash.read_word(slot + i as u32 * WORD_SIZE);
            }
            let candidate = DeviceConfig::from_words(words);
            if candidate.verify_crc() && candidate.is_newer_than(config) {
                *config = candidate;
                found = true;
            }
        }
        slot += CONFIG_BYTES;
    }
    found
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::lead_tag;
    use crate::codec::RecordType;
    use crate::records::{sequence_marker, CHUNK_SIZE};
    use crate::testing::{header, region, write_records, Recorder, PAGE};
    use ringlog_hal::flash::ERASED_WORD;
    use ringlog_hal::mem::MemFlash;

    /// Eight log pages plus the config page
    const WORDS: usize = 9 * (PAGE as usize / 4);
    const CONFIG_PAGE: u32 = 8 * PAGE;

    type Flash = MemFlash<WORDS>;

    fn blank() -> Flash {
        MemFlash::new(0, PAGE)
    }

    fn layout() -> StorageLayout {
        StorageLayout::new(region(), Some(CONFIG_PAGE)).unwrap()
    }

    fn mount_with(flash: Flash, layout: StorageLayout) -> (StorageManager<Flash>, MountReport, Recorder) {
        let mut rec = Recorder::default();
        let (store, report) = StorageManager::mount(flash, layout, StoreSettings::default(), &mut rec).unwrap();
        (store, report, rec)
    }

    fn mount(flash: Flash) -> (StorageManager<Flash>, MountReport, Recorder) {
        mount_with(flash, layout())
    }

    /// Poll and deliver completions until nothing is left to do at `now`
    fn drive(store: &mut StorageManager<Flash>, now: u32) {
        for _ in 0..64 {
            let more = store.poll(now);
            if let Some(ok) = store.flash_mut().complete() {
                store.completion_notify(ok);
                continue;
            }
            if !more {
                return;
            }
        }
        panic!("storage did not settle");
    }

    fn slot(flash: &Flash, address: u32) -> DeviceConfig {
        let first = (address / 4) as usize;
        let mut words = [0u32; CONFIG_WORDS];
        words.copy_from_slice(&flash.words()[first..first + CONFIG_WORDS]);
        DeviceConfig::from_words(words)
    }

    fn config(sequence: u16, node_id: u16) -> DeviceConfig {
        let mut config = DeviceConfig::factory();
        config.set_sequence(sequence);
        config.set_node_id(node_id);
        config.update_crc();
        config
    }

    fn execute(sequence: u32) -> UpdateExecute {
        UpdateExecute {
            sequence,
            version: 0x0102_0304,
        }
    }

    fn update_header(sequence: u32) -> UpdateHeader {
        match header(sequence, 7) {
            Record::UpdateHeader(h) => h,
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_mount_empty_flash() {
        let (mut store, report, rec) = mount(blank());

        assert_eq!(report.config, ConfigSource::Defaults);
        assert_eq!(report.scan.span, None);
        assert_eq!(rec, Recorder::default());
        assert_eq!(store.config().sequence(), 1);
        assert!(store.is_config_saved());
        assert!(store.is_idle());

        let info = store.info();
        assert_eq!(info.cursor, WriteCursor::empty(&region()));
        assert_eq!(info.span, None);
        assert_eq!(info.config_sequence, 1);
    }

    #[test]
    fn test_forced_save_uses_first_free_slot() {
        let (mut store, _, _) = mount(blank());
        store.config_mut().set_node_id(0x1234);
        store.save_config(true);
        assert!(!store.is_config_saved());

        drive(&mut store, 0);
        assert!(store.is_config_saved());

        let saved = slot(store.flash(), CONFIG_PAGE);
        assert_eq!(saved.sequence(), 2);
        assert_eq!(saved.node_id(), 0x1234);
        assert!(saved.verify_crc());
        // The log is untouched
        assert_eq!(store.flash().words()[0], ERASED_WORD);

        let (store, report, _) = mount(store.into_flash());
        assert_eq!(report.config, ConfigSource::ConfigPage);
        assert_eq!(store.config().sequence(), 2);
        assert_eq!(store.config().node_id(), 0x1234);
    }

    #[test]
    fn test_save_is_debounced() {
        let (mut store, _, _) = mount(blank());
        store.poll(1_000);
        store.save_config(false);

        assert!(!store.poll(4_000));
        assert!(!store.flash().is_pending());
        assert!(!store.is_config_saved());

        // A second request pushes the deadline out
        store.save_config(false);
        drive(&mut store, 6_000);
        drive(&mut store, 8_999);
        assert_eq!(store.flash().words()[(CONFIG_PAGE / 4) as usize], ERASED_WORD);

        drive(&mut store, 9_000);
        assert!(store.is_config_saved());
        assert_eq!(slot(store.flash(), CONFIG_PAGE).sequence(), 2);
    }

    #[test]
    fn test_deadline_survives_timer_wrap() {
        let (mut store, _, _) = mount(blank());
        store.poll(u32::MAX - 1_000);
        store.save_config(false);

        assert!(!store.poll(u32::MAX));
        drive(&mut store, 3_999);
        assert!(store.is_config_saved());
    }

    #[test]
    fn test_full_config_page_rolls_through_log() {
        let (mut store, _, _) = mount(blank());
        for _ in 0..3 {
            store.save_config(true);
            drive(&mut store, 0);
            assert!(store.is_config_saved());
        }

        // Two slots per page: the third save erased the page
        assert_eq!(slot(store.flash(), CONFIG_PAGE).sequence(), 4);
        assert_eq!(store.flash().words()[(CONFIG_PAGE + CONFIG_BYTES) as usize / 4], ERASED_WORD);

        let mut rec = Recorder::default();
        store.read(RecordMask::CONFIG, &mut rec);
        assert_eq!(rec.configs.len(), 1);
        assert_eq!(rec.configs[0].sequence(), 4);

        let (store, report, _) = mount(store.into_flash());
        assert_eq!(report.config, ConfigSource::ConfigPage);
        assert_eq!(store.config().sequence(), 4);
        assert!(store.is_config_saved());
    }

    #[test]
    fn test_lost_log_copy_keeps_config_page() {
        let (mut store, _, _) = mount(blank());
        for _ in 0..2 {
            store.save_config(true);
            drive(&mut store, 0);
        }
        assert_eq!(slot(store.flash(), CONFIG_PAGE + CONFIG_BYTES).sequence(), 3);

        // Page full: the copy heads for log page 0, which no longer takes writes
        store.flash_mut().wear_out(0);
        store.save_config(true);
        drive(&mut store, 0);

        assert!(!store.is_config_saved());
        assert!(store.info().pending.contains(RecordMask::CONFIG));
        let stats = store.flash().stats();
        assert_eq!(stats.async_erases + stats.sync_erases, 0);
        assert_eq!(slot(store.flash(), CONFIG_PAGE).sequence(), 2);
        assert_eq!(slot(store.flash(), CONFIG_PAGE + CONFIG_BYTES).sequence(), 3);

        // Retried once the debounce delay has passed
        let programs = store.flash().stats().async_programs;
        drive(&mut store, CONFIG_SAVE_DELAY_MS);
        assert!(store.flash().stats().async_programs > programs);
        assert!(!store.is_config_saved());

        let (store, report, _) = mount(store.into_flash());
        assert_eq!(report.config, ConfigSource::ConfigPage);
        assert_eq!(store.config().sequence(), 3);
    }

    #[test]
    fn test_unwritten_slot_is_not_reported_saved() {
        let (mut store, _, _) = mount(blank());
        store.flash_mut().wear_out(CONFIG_PAGE);
        store.save_config(true);
        drive(&mut store, 0);

        assert_eq!(store.flash().words()[(CONFIG_PAGE / 4) as usize], ERASED_WORD);
        assert!(!store.is_config_saved());
        assert!(store.info().pending.contains(RecordMask::CONFIG));
    }

    #[test]
    fn test_lost_log_config_stays_pending() {
        let layout = StorageLayout::new(region(), None).unwrap();
        let (mut store, _, _) = mount_with(blank(), layout);
        store.flash_mut().wear_out(0);
        store.save_config(true);
        drive(&mut store, 0);

        assert!(!store.is_config_saved());
        assert!(!store.is_idle());
        assert!(store.info().pending.contains(RecordMask::CONFIG));
        assert_eq!(store.info().cursor, WriteCursor::empty(&region()));
    }

    #[test]
    fn test_mount_adopts_newer_log_config() {
        let mut flash = blank();
        flash.program_sync(CONFIG_PAGE, config(3, 1).words()).unwrap();
        flash.poke(0, sequence_marker(1));
        write_records(&mut flash, 4, &[Record::Config(config(5, 2))]);

        let (mut store, report, rec) = mount(flash);
        assert_eq!(report.config, ConfigSource::Log);
        assert_eq!(store.config().sequence(), 5);
        assert_eq!(store.config().node_id(), 2);
        assert_eq!(rec.configs.len(), 1);

        // Written back to the config page
        assert!(!store.is_config_saved());
        drive(&mut store, 0);
        assert!(store.is_config_saved());
        let saved = slot(store.flash(), CONFIG_PAGE + CONFIG_BYTES);
        assert_eq!(saved.sequence(), 6);
        assert_eq!(saved.node_id(), 2);
    }

    #[test]
    fn test_mount_ignores_corrupt_configs() {
        let mut flash = blank();
        let mut bad_slot = config(7, 1);
        bad_slot.set_node_id(9);
        flash.program_sync(CONFIG_PAGE, bad_slot.words()).unwrap();

        let mut bad_log = config(9, 3);
        bad_log.set_sequence(10);
        flash.poke(0, sequence_marker(1));
        write_records(&mut flash, 4, &[Record::Config(bad_log)]);

        let (store, report, _) = mount(flash);
        assert_eq!(report.config, ConfigSource::Defaults);
        assert_eq!(store.config().sequence(), 1);
        assert!(store.is_config_saved());
    }

    #[test]
    fn test_update_records_written_in_priority_order() {
        let (mut store, _, _) = mount(blank());
        let chunk = UpdateChunk {
            sequence: 4,
            address: 0x440,
            data: [0x5A; CHUNK_SIZE],
        };

        store.store_update_execute(execute(4)).unwrap();
        store.store_update_chunk(chunk).unwrap();
        store.store_update_header(update_header(4)).unwrap();
        assert_eq!(store.store_update_chunk(chunk), Err(StageError::Busy));

        drive(&mut store, 0);
        assert!(store.is_idle());

        let words = store.flash().words();
        assert_eq!(words[0], sequence_marker(1));
        assert_eq!(lead_tag(words[1]), RecordType::UpdateHeader.tag());
        assert_eq!(lead_tag(words[4]), RecordType::UpdateChunk.tag());
        assert_eq!(lead_tag(words[22]), RecordType::UpdateExecute.tag());

        let mut rec = Recorder::default();
        let report = store.read(RecordMask::UPDATE, &mut rec);
        assert_eq!(report.stats.delivered, 3);
        assert_eq!(rec.headers[0], update_header(4));
        assert_eq!(rec.chunks[0], (4, 0x440));
        assert_eq!(rec.executes[0], execute(4));
    }

    #[test]
    fn test_slot_frees_once_write_starts() {
        let (mut store, _, _) = mount(blank());
        store.store_update_execute(execute(1)).unwrap();

        // Started, waiting on the device
        assert!(!store.poll(0));
        assert!(store.flash().is_pending());
        store.store_update_execute(execute(2)).unwrap();

        drive(&mut store, 0);
        let mut rec = Recorder::default();
        store.read(RecordMask::UPDATE_EXECUTE, &mut rec);
        assert_eq!(rec.executes.len(), 2);
        assert_eq!(rec.executes[1].sequence, 2);
    }

    #[test]
    fn test_failed_completions_fall_back() {
        let (mut store, _, _) = mount(blank());
        store.store_update_header(update_header(2)).unwrap();
        store.flash_mut().fail_next(3);

        drive(&mut store, 0);

        assert_eq!(store.info().fallbacks, 1);
        assert_eq!(store.flash().stats().sync_programs, 1);
        let mut rec = Recorder::default();
        store.read(RecordMask::ALL, &mut rec);
        assert_eq!(rec.headers.len(), 1);
    }

    #[test]
    fn test_schedule_direct() {
        let (mut store, _, _) = mount(blank());
        store.schedule(&header(3, 1)).unwrap();
        assert_eq!(store.schedule(&header(3, 2)), Err(StageError::Busy));

        drive(&mut store, 0);
        store.schedule(&header(3, 2)).unwrap();
        drive(&mut store, 0);

        assert_eq!(store.list().stats.delivered, 2);
        let info = store.info();
        assert_eq!(info.span.map(|s| s.newest_sequence), Some(1));
        assert_eq!(info.cursor.write_pointer, 4 + 2 * 12);
    }

    #[test]
    fn test_without_config_page() {
        let layout = StorageLayout::new(region(), None).unwrap();
        let (mut store, _, _) = mount_with(blank(), layout);
        store.config_mut().set_device_id(0xDEAD_BEEF);
        store.save_config(true);
        drive(&mut store, 0);
        assert!(store.is_config_saved());

        let (store, report, rec) = mount_with(store.into_flash(), layout);
        assert_eq!(report.config, ConfigSource::Log);
        assert_eq!(rec.configs.len(), 1);
        assert_eq!(store.config().sequence(), 2);
        assert_eq!(store.config().device_id(), 0xDEAD_BEEF);
        // Nowhere to write it back to
        assert!(store.is_idle());
    }

    #[test]
    fn test_layout_validation() {
        assert_eq!(
            StorageLayout::new(region(), Some(0x100)),
            Err(LayoutError::ConfigPageOverlapsLog)
        );
        assert_eq!(
            StorageLayout::new(region(), Some(CONFIG_PAGE + 4)),
            Err(LayoutError::ConfigPageMisaligned)
        );
        assert!(StorageLayout::new(region(), Some(CONFIG_PAGE)).is_ok());

        let mut rec = Recorder::default();
        let mismatched: Flash = MemFlash::new(0, 2 * PAGE);
        let mounted = StorageManager::mount(mismatched, layout(), StoreSettings::default(), &mut rec);
        assert!(matches!(mounted, Err(LayoutError::PageSizeMismatch)));
    }
}
