//! Ringlog Hardware Abstraction Layer
//!
//! This crate defines the flash device interface the storage log is written
//! against. Chip-specific HALs implement it over their flash controller, and
//! [`mem::MemFlash`] implements it over a word array so the log logic can be
//! exercised on the host.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │  ringlog-core (log, scheduler, scanner) │
//! └─────────────────────────────────────────┘
//!                     │
//!                     ▼
//! ┌─────────────────────────────────────────┐
//! │  ringlog-hal (this crate - traits)      │
//! └─────────────────────────────────────────┘
//!                     │
//!         ┌───────────┴───────────┐
//!         ▼                       ▼
//! ┌───────────────┐       ┌───────────────┐
//! │ ringlog-hal-  │       │  mem::Mem-    │
//! │    rp2040     │       │  Flash (host) │
//! └───────────────┘       └───────────────┘
//! ```
//!
//! # Traits
//!
//! - [`flash::FlashRead`] - Word reads
//! - [`flash::FlashDevice`] - Asynchronous and blocking erase/program

#![no_std]
#![deny(unsafe_code)]

pub mod flash;
pub mod mem;

// Re-export key traits at crate root for convenience
pub use flash::{FlashDevice, FlashError, FlashRead, ERASED_WORD};
