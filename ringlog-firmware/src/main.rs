//! Ringlog - Log-Structured Flash Storage Firmware
//!
//! Firmware binary for RP2040-based radio nodes. Mounts the storage log,
//! records the boot, reports any firmware update waiting in the log, then
//! hands the storage manager to its own task.

#![no_std]
#![no_main]

use defmt::*;
use embassy_executor::Spawner;
use {defmt_rtt as _, panic_probe as _};

use ringlog_core::{
    CodeLayout, FlashRegion, StorageLayout, StorageManager, StoreSettings, UpdateSearch, UpdateStatus,
};
use ringlog_hal_rp2040::flash::{CONFIG_PAGE, LOG_END, LOG_START, PAGE_SIZE};
use ringlog_hal_rp2040::Rp2040Flash;

use crate::channels::{StoreRequest, STORE_REQUESTS};

mod channels;
mod tasks;

/// Storage log right below the config page at the top of flash
const LAYOUT: StorageLayout = match FlashRegion::new(LOG_START, LOG_END, PAGE_SIZE) {
    Ok(log) => match StorageLayout::new(log, Some(CONFIG_PAGE)) {
        Ok(layout) => layout,
        Err(_) => core::panic!("config page overlaps the log"),
    },
    Err(_) => core::panic!("invalid log region"),
};

/// Range an update may replace (chunk addresses reach 512KB)
const UPDATE_CODE: CodeLayout = CodeLayout::new(0, 0x8_0000, PAGE_SIZE);

/// One bit per 64-byte chunk of `UPDATE_CODE`
const UPDATE_MAP_BYTES: usize = 0x8_0000 / 64 / 8;

/// Main entry point
#[embassy_executor::main]
async fn main(spawner: Spawner) {
    info!("Ringlog firmware starting...");

    let p = embassy_rp::init(Default::default());
    let mut flash = Rp2040Flash::new(p.FLASH);
    let device_id = read_device_id(&mut flash);

    // Mount the log, collecting update records on the way
    let mut update = UpdateSearch::<UPDATE_MAP_BYTES>::new(UPDATE_CODE);
    let (mut store, report) = match StorageManager::mount(flash, LAYOUT, StoreSettings::default(), &mut update) {
        Ok(mounted) => mounted,
        Err(e) => panic!("Storage unusable: {}", e),
    };
    info!(
        "Storage mounted: {} pages, {} records, config from {}",
        report.scan.stats.pages,
        report.scan.stats.records,
        report.config
    );

    match (update.status(), update.header()) {
        (UpdateStatus::Complete, Some(header)) => {
            info!("Update to version {:x} ready, applied on next boot", header.version)
        }
        (status, _) => debug!("Update status: {}", status),
    }

    let config = store.config_mut();
    config.increment_boot_count();
    config.set_device_id(device_id);
    info!("Boot {} of device {:x}", config.boot_count(), device_id);

    spawner.spawn(tasks::tick_task()).unwrap();
    spawner.spawn(tasks::store_task(store)).unwrap();

    STORE_REQUESTS.send(StoreRequest::SaveConfig { force: false }).await;

    info!("All tasks spawned, firmware running");

    // Main task has nothing else to do - all work happens in spawned tasks
    loop {
        embassy_time::Timer::after_secs(60).await;
        trace!("Main loop heartbeat");
    }
}

/// Device id from the low half of the flash unique id
fn read_device_id(flash: &mut Rp2040Flash<'_>) -> u32 {
    let mut uid = [0u8; 8];
    match flash.flash().blocking_unique_id(&mut uid) {
        Ok(()) => u32::from_le_bytes([uid[4], uid[5], uid[6], uid[7]]),
        Err(_) => {
            warn!("Flash unique id unavailable");
            0
        }
    }
}
