//! Persisted device configuration
//!
//! The configuration is a frozen block of 32 little-endian words. Words not
//! named below are reserved and kept zero.
//!
//! ```text
//!  word  0  [15:0] sequence
//!  word  1  [15:0] node id      [31:16] net id
//!  word  2         device id
//!  word  6  [7:0]  frequency (MHz above 2400)
//!  word 29         print mask
//!  word 30  [15:0] boot count
//!  word 31         CRC-32 over words 0..=30
//! ```

/// Size of the configuration in words
pub const CONFIG_WORDS: usize = 32;

/// Size of the configuration in bytes
pub const CONFIG_BYTES: u32 = (CONFIG_WORDS * 4) as u32;

/// Lowest accepted frequency offset
pub const FREQUENCY_MIN: u8 = 2;

/// Highest accepted frequency offset
pub const FREQUENCY_MAX: u8 = 80;

const SEQUENCE_WORD: usize = 0;
const NETWORK_WORD: usize = 1;
const DEVICE_ID_WORD: usize = 2;
const FREQUENCY_WORD: usize = 6;
const PRINT_MASK_WORD: usize = 29;
const BOOT_COUNT_WORD: usize = 30;
const CRC_WORD: usize = 31;

/// Configuration errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ConfigError {
    /// Frequency outside 2..=80
    FrequencyOutOfRange,
}

/// The running device configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DeviceConfig {
    words: [u32; CONFIG_WORDS],
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self::factory()
    }
}

impl DeviceConfig {
    /// All-zero configuration with sequence 0
    pub const fn factory() -> Self {
        Self {
            words: [0; CONFIG_WORDS],
        }
    }

    /// Wrap raw words read from flash or a record
    pub const fn from_words(words: [u32; CONFIG_WORDS]) -> Self {
        Self { words }
    }

    /// Raw words, CRC included
    pub fn words(&self) -> &[u32; CONFIG_WORDS] {
        &self.words
    }

    /// Clear to factory defaults, keeping the boot count
    ///
    /// The sequence moves forward by one so the defaults outrank any copy
    /// with the old sequence.
    pub fn reset_to_defaults(&mut self) {
        let sequence = self.sequence();
        let boots = self.boot_count();
        self.words = [0; CONFIG_WORDS];
        self.set_sequence(sequence.wrapping_add(1));
        self.set_boot_count(boots);
    }

    /// Configuration sequence number
    ///
    /// Higher is newer. Assumed never to wrap within device lifetime.
    pub fn sequence(&self) -> u16 {
        self.low_half(SEQUENCE_WORD)
    }

    pub fn set_sequence(&mut self, sequence: u16) {
        self.set_low_half(SEQUENCE_WORD, sequence);
    }

    /// Check if this copy outranks `other`
    pub fn is_newer_than(&self, other: &DeviceConfig) -> bool {
        self.sequence() > other.sequence()
    }

    pub fn node_id(&self) -> u16 {
        self.low_half(NETWORK_WORD)
    }

    pub fn set_node_id(&mut self, node_id: u16) {
        self.set_low_half(NETWORK_WORD, node_id);
    }

    pub fn net_id(&self) -> u16 {
        (self.words[NETWORK_WORD] >> 16) as u16
    }

    pub fn set_net_id(&mut self, net_id: u16) {
        self.words[NETWORK_WORD] = (self.words[NETWORK_WORD] & 0x0000_FFFF) | ((net_id as u32) << 16);
    }

    pub fn device_id(&self) -> u32 {
        self.words[DEVICE_ID_WORD]
    }

    pub fn set_device_id(&mut self, device_id: u32) {
        self.words[DEVICE_ID_WORD] = device_id;
    }

    /// Radio channel as an offset above 2400 MHz (0 = unset)
    pub fn frequency(&self) -> u8 {
        self.words[FREQUENCY_WORD] as u8
    }

    pub fn set_frequency(&mut self, frequency: u8) -> Result<(), ConfigError> {
        if !(FREQUENCY_MIN..=FREQUENCY_MAX).contains(&frequency) {
            return Err(ConfigError::FrequencyOutOfRange);
        }
        self.words[FREQUENCY_WORD] = (self.words[FREQUENCY_WORD] & !0xFF) | frequency as u32;
        Ok(())
    }

    /// Debug print categories enabled on the console
    pub fn print_mask(&self) -> u32 {
        self.words[PRINT_MASK_WORD]
    }

    pub fn set_print_mask(&mut self, mask: u32) {
        self.words[PRINT_MASK_WORD] = mask;
    }

    pub fn boot_count(&self) -> u16 {
        self.low_half(BOOT_COUNT_WORD)
    }

    pub fn set_boot_count(&mut self, count: u16) {
        self.set_low_half(BOOT_COUNT_WORD, count);
    }

    /// Count one more boot
    pub fn increment_boot_count(&mut self) {
        self.set_boot_count(self.boot_count().wrapping_add(1));
    }

    /// Stored CRC
    pub fn crc(&self) -> u32 {
        self.words[CRC_WORD]
    }

    /// Calculate CRC32 over every word except the CRC itself
    pub fn calculate_crc(&self) -> u32 {
        let mut crc: u32 = 0xFFFFFFFF;
        for word in &self.words[..CRC_WORD] {
            crc = crc32_update(crc, &word.to_le_bytes());
        }
        !crc
    }

    /// Update the CRC field
    pub fn update_crc(&mut self) {
        self.words[CRC_WORD] = self.calculate_crc();
    }

    /// Verify the CRC is correct
    pub fn verify_crc(&self) -> bool {
        self.crc() == self.calculate_crc()
    }

    fn low_half(&self, index: usize) -> u16 {
        self.words[index] as u16
    }

    fn set_low_half(&mut self, index: usize, value: u16) {
        self.words[index] = (self.words[index] & 0xFFFF_0000) | value as u32;
    }
}

/// CRC32 update (IEEE 802.3 polynomial, reflected)
fn crc32_update(crc: u32, data: &[u8]) -> u32 {
    const POLY: u32 = 0xEDB88320;
    let mut crc = crc;

    for &byte in data {
        crc ^= byte as u32;
        for _ in 0..8 {
            if crc & 1 != 0 {
                crc = (crc >> 1) ^ POLY;
            } else {
                crc >>= 1;
            }
        }
    }

    crc
}
