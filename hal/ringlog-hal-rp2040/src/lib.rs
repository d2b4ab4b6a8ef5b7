//! RP2040-specific HAL for the ringlog firmware
//!
//! Provides the on-chip QSPI flash as a `ringlog_hal::FlashDevice`, and the
//! flash map shared by the firmware and its linker script.

#![no_std]
#![deny(unsafe_code)]

pub mod flash;

pub use flash::Rp2040Flash;
