//! Device information types.

use crate::types::contact::PublicKey;

/// Radio configuration parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RadioConfig {
    /// Frequency in MHz.
    pub frequency_mhz: f64,
    /// Bandwidth in kHz.
    pub bandwidth_khz: f64,
    /// Spreading factor (6-12).
    pub spreading_factor: u8,
    /// Coding rate (5-8, representing 4/5 to 4/8).
    pub coding_rate: u8,
}

impl Default for RadioConfig {
    fn default() -> Self {
        Self {
            frequency_mhz: 868.0,
            bandwidth_khz: 125.0,
            spreading_factor: 7,
            coding_rate: 5,
        }
    }
}

/// Self device information returned by `AppStart` during the handshake.
#[derive(Debug, Clone)]
pub struct SelfInfo {
    /// Node/advertisement type.
    pub node_type: u8,
    /// Current TX power (dBm).
    pub tx_power: u8,
    /// Maximum TX power (dBm).
    pub max_tx_power: u8,
    /// Device public key.
    pub public_key: PublicKey,
    /// Device latitude in degrees.
    pub latitude: Option<f64>,
    /// Device longitude in degrees.
    pub longitude: Option<f64>,
    /// Device behavior flags (multi-ack, location policy, telemetry,
    /// manual contact add), packed as received.
    pub flags: [u8; 4],
    /// Radio configuration.
    pub radio: RadioConfig,
    /// Device name.
    pub name: String,
}

/// Device information returned by `DeviceQuery` during the handshake.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    /// Protocol/firmware version.
    pub firmware_version: u8,
    /// Maximum contacts (if firmware >= 3; the wire carries half).
    pub max_contacts: Option<u16>,
    /// Maximum channels (if firmware >= 3).
    pub max_channels: Option<u8>,
    /// BLE pairing PIN (if firmware >= 3).
    pub ble_pin: Option<u32>,
    /// Build identifier (if firmware >= 3).
    pub build: Option<String>,
    /// Manufacturer/model string (if firmware >= 3).
    pub manufacturer: Option<String>,
    /// Firmware version string (if firmware >= 3).
    pub firmware_str: Option<String>,
}

/// Battery and storage status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatteryStatus {
    /// Battery voltage in millivolts.
    pub level_mv: u16,
    /// Used storage in KB, if reported.
    pub used_kb: Option<u32>,
    /// Total storage in KB, if reported.
    pub total_kb: Option<u32>,
}

/// Channel configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelInfo {
    /// Channel index (0-based).
    pub index: u8,
    /// Channel name (up to 32 bytes).
    pub name: String,
    /// Channel secret (16 bytes; all-zero for a public channel).
    pub secret: [u8; 16],
}

impl ChannelInfo {
    /// Returns true when the secret is all zeros (public channel).
    #[must_use]
    pub fn is_public(&self) -> bool {
        self.secret.iter().all(|&b| b == 0)
    }
}
