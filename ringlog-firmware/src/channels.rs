//! Inter-task communication channels
//!
//! Defines the static channels used to reach the storage task, which owns
//! the flash and the storage manager.

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::Channel;

use ringlog_core::{UpdateChunk, UpdateExecute, UpdateHeader};

/// Channel capacity for storage requests
const STORE_CHANNEL_SIZE: usize = 4;

/// Work for the storage task
#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum StoreRequest {
    /// Persist the running configuration
    SaveConfig { force: bool },
    UpdateHeader(UpdateHeader),
    UpdateChunk(UpdateChunk),
    UpdateExecute(UpdateExecute),
}

/// Requests for the storage task (radio, console, boot code)
pub static STORE_REQUESTS: Channel<CriticalSectionRawMutex, StoreRequest, STORE_CHANNEL_SIZE> =
    Channel::new();
