//! Remote node status and device statistics.

use crate::types::contact::KeyPrefix;

/// Status snapshot reported by a remote node (repeater/room server).
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteNodeStatus {
    /// Reporting node's public key prefix.
    pub prefix: KeyPrefix,
    /// Battery voltage in millivolts.
    pub battery_mv: u16,
    /// Transmit queue length.
    pub tx_queue_len: u16,
    /// Noise floor in dBm.
    pub noise_floor: i16,
    /// RSSI of the last received packet.
    pub last_rssi: i16,
    /// Packets received since boot.
    pub packets_received: u32,
    /// Packets sent since boot.
    pub packets_sent: u32,
    /// TX airtime in seconds.
    pub airtime_secs: u32,
    /// Uptime in seconds.
    pub uptime_secs: u32,
    /// Flood packets sent.
    pub sent_flood: u32,
    /// Direct packets sent.
    pub sent_direct: u32,
    /// Flood packets received.
    pub recv_flood: u32,
    /// Direct packets received.
    pub recv_direct: u32,
    /// Queue-full events.
    pub full_events: u16,
    /// SNR of the last received packet in dB.
    pub last_snr: f32,
    /// Duplicate direct packets seen.
    pub direct_dups: u16,
    /// Duplicate flood packets seen.
    pub flood_dups: u16,
    /// RX airtime in seconds.
    pub rx_airtime_secs: u32,
}

/// Local device statistics returned by `GetStats`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DeviceStats {
    /// Battery voltage in millivolts.
    pub battery_mv: u16,
    /// Uptime in seconds.
    pub uptime_secs: u32,
    /// Error counter.
    pub errors: u16,
    /// Transmit queue length.
    pub queue_len: u8,
}
