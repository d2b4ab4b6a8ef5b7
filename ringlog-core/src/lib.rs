//! Board-agnostic storage logic for the ringlog firmware
//!
//! A circular, append-only log of typed records kept in a region of NOR
//! flash, plus the device configuration and firmware update handling built
//! on top of it.
//!
//! ```text
//!   producers ──► StorageManager ──► WriteScheduler ──► Flasher ──► FlashDevice
//!                      │                                   ▲           │
//!                      │                                   └ completion┘
//!                      ▼
//!                   scanner ──► Importer ──► dispatch ──► RecordSink
//!                                                         (UpdateSearch, app)
//! ```
//!
//! - Record codec (tagged, variable-length, bit-packed words)
//! - Page scanner and log recovery
//! - Write scheduler with async retry and sync fallback
//! - Record dispatch by interest mask
//! - Chunk bitmap, update collection and boot-time apply
//! - Device configuration with a dedicated mirror page

#![cfg_attr(not(test), no_std)]
#![deny(unsafe_code)]

#[macro_use]
mod fmt;

pub mod bitmap;
pub mod boot;
pub mod codec;
pub mod config;
pub mod dispatch;
pub mod manager;
pub mod records;
pub mod region;
pub mod scanner;
pub mod scheduler;
pub mod update;

#[cfg(test)]
mod testing;

pub use bitmap::ChunkMap;
pub use boot::{BootDecision, BootLoader};
pub use codec::{DecodeError, EncodeError, RecordBuf, RecordType, MAX_RECORD_WORDS};
pub use config::DeviceConfig;
pub use dispatch::{dispatch, RecordMask, RecordSink};
pub use manager::{LayoutError, MountReport, StorageLayout, StorageManager, StoreInfo, StoreSettings};
pub use records::{Record, UpdateChunk, UpdateExecute, UpdateHeader};
pub use region::{FlashRegion, RegionError};
pub use scanner::{ScanReport, WriteCursor};
pub use scheduler::{Progress, StageError, WriteScheduler};
pub use update::{CodeLayout, UpdateSearch, UpdateStatus};
