//! Command frame builders.
//!
//! Every host→node command is a single frame: one opcode byte followed by
//! a little-endian, field-concatenated payload. The builders here are
//! pure; they never touch the transport. Fixed-width string fields are
//! zero-padded to their full width and truncated on overflow. Coordinates
//! are microdegrees (`round(deg * 1e6)` as i32).

use bytes::{BufMut, Bytes, BytesMut};

use crate::types::contact::{Contact, MAX_NAME_LEN, MAX_PATH_LEN, PublicKey};

/// Coordinate scaling factor (degrees to microdegrees).
const COORD_SCALE: f64 = 1_000_000.0;

/// Command opcodes sent to the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CommandOpcode {
    /// Initialize connection, returns `SelfInfo`.
    AppStart = 0x01,
    /// Send a direct text message.
    SendText = 0x02,
    /// Send a channel text message.
    SendChanText = 0x03,
    /// Get contact list.
    GetContacts = 0x04,
    /// Get current device time.
    GetDeviceTime = 0x05,
    /// Set device time.
    SetDeviceTime = 0x06,
    /// Send self advertisement.
    SendSelfAdvert = 0x07,
    /// Set advertised name.
    SetAdvertName = 0x08,
    /// Add or update a contact.
    AddUpdateContact = 0x09,
    /// Get next waiting message.
    SyncNextMessage = 0x0A,
    /// Set radio parameters.
    SetRadioParams = 0x0B,
    /// Set TX power.
    SetRadioTxPower = 0x0C,
    /// Reset path for a contact.
    ResetPath = 0x0D,
    /// Set advertised coordinates.
    SetAdvertLatLon = 0x0E,
    /// Remove a contact.
    RemoveContact = 0x0F,
    /// Share a contact over the mesh.
    ShareContact = 0x10,
    /// Reboot device.
    Reboot = 0x13,
    /// Get battery and storage status.
    GetBatteryAndStorage = 0x14,
    /// Query device info.
    DeviceQuery = 0x16,
    /// Send raw data along an explicit path.
    SendRawData = 0x19,
    /// Send login request.
    SendLogin = 0x1A,
    /// Send status request.
    SendStatusReq = 0x1B,
    /// Check connection to a remote node.
    HasConnection = 0x1C,
    /// Send logout.
    Logout = 0x1D,
    /// Get a single contact by key.
    GetContactByKey = 0x1E,
    /// Get channel info.
    GetChannel = 0x1F,
    /// Set channel.
    SetChannel = 0x20,
    /// Send trace path request.
    SendTracePath = 0x24,
    /// Request telemetry.
    SendTelemetryReq = 0x27,
    /// Get advert path for a contact.
    GetAdvertPath = 0x2A,
    /// Get tuning parameters.
    GetTuningParams = 0x2B,
    /// Binary request.
    SendBinaryReq = 0x32,
    /// Factory reset.
    FactoryReset = 0x33,
    /// Path discovery.
    SendPathDiscovery = 0x34,
    /// Get statistics.
    GetStats = 0x38,
}

impl From<CommandOpcode> for u8 {
    fn from(cmd: CommandOpcode) -> Self {
        cmd as Self
    }
}

/// Writes a string into a fixed-width field: zero-padded when short,
/// truncated when long.
fn put_fixed_str(buf: &mut BytesMut, s: &str, width: usize) {
    let bytes = s.as_bytes();
    let len = bytes.len().min(width);
    buf.put_slice(&bytes[..len]);
    buf.put_bytes(0, width - len);
}

/// Encodes a coordinate as signed microdegrees.
#[allow(clippy::cast_possible_truncation)]
fn encode_coord(deg: f64) -> i32 {
    (deg * COORD_SCALE).round() as i32
}

// ==================== Device ====================

/// `deviceQuery`: ask for device info, advertising our protocol version.
#[must_use]
pub fn device_query(version: u8) -> Bytes {
    Bytes::from(vec![CommandOpcode::DeviceQuery as u8, version])
}

/// `appStart`: identify the host application; returns `SelfInfo`.
#[must_use]
pub fn app_start(app_name: &str) -> Bytes {
    let mut buf = BytesMut::with_capacity(1 + app_name.len());
    buf.put_u8(CommandOpcode::AppStart as u8);
    buf.put_slice(app_name.as_bytes());
    buf.freeze()
}

/// `getDeviceTime`.
#[must_use]
pub fn get_device_time() -> Bytes {
    Bytes::from_static(&[CommandOpcode::GetDeviceTime as u8])
}

/// `setDeviceTime`.
#[must_use]
pub fn set_device_time(timestamp: u32) -> Bytes {
    let mut buf = BytesMut::with_capacity(5);
    buf.put_u8(CommandOpcode::SetDeviceTime as u8);
    buf.put_u32_le(timestamp);
    buf.freeze()
}

/// `getBatteryAndStorage`.
#[must_use]
pub fn get_battery_and_storage() -> Bytes {
    Bytes::from_static(&[CommandOpcode::GetBatteryAndStorage as u8])
}

/// `reboot`.
#[must_use]
pub fn reboot() -> Bytes {
    Bytes::from_static(&[CommandOpcode::Reboot as u8])
}

/// `factoryReset`: carries the literal "reset" guard so a stray byte
/// cannot wipe a device.
#[must_use]
pub fn factory_reset() -> Bytes {
    Bytes::from_static(&[CommandOpcode::FactoryReset as u8, b'r', b'e', b's', b'e', b't'])
}

// ==================== Messaging ====================

/// `sendText`: direct message to a contact, addressed by key prefix.
#[must_use]
pub fn send_text(
    text_type: u8,
    attempt: u8,
    sender_ts: u32,
    recipient: &PublicKey,
    text: &str,
) -> Bytes {
    let mut buf = BytesMut::with_capacity(13 + text.len());
    buf.put_u8(CommandOpcode::SendText as u8);
    buf.put_u8(text_type);
    buf.put_u8(attempt);
    buf.put_u32_le(sender_ts);
    buf.put_slice(recipient.prefix().as_bytes());
    buf.put_slice(text.as_bytes());
    buf.freeze()
}

/// `sendChanText`: text message on a channel.
#[must_use]
pub fn send_chan_text(text_type: u8, channel_index: u8, sender_ts: u32, text: &str) -> Bytes {
    let mut buf = BytesMut::with_capacity(7 + text.len());
    buf.put_u8(CommandOpcode::SendChanText as u8);
    buf.put_u8(text_type);
    buf.put_u8(channel_index);
    buf.put_u32_le(sender_ts);
    buf.put_slice(text.as_bytes());
    buf.freeze()
}

/// `syncNextMessage`: pop the next queued inbound message.
#[must_use]
pub fn sync_next_message() -> Bytes {
    Bytes::from_static(&[CommandOpcode::SyncNextMessage as u8])
}

// ==================== Contacts ====================

/// `getContacts`, optionally incremental from a last-modified timestamp.
#[must_use]
pub fn get_contacts(since: Option<u32>) -> Bytes {
    match since {
        Some(ts) => {
            let mut buf = BytesMut::with_capacity(5);
            buf.put_u8(CommandOpcode::GetContacts as u8);
            buf.put_u32_le(ts);
            buf.freeze()
        }
        None => Bytes::from_static(&[CommandOpcode::GetContacts as u8]),
    }
}

/// `addUpdateContact`: full 147-byte contact frame after the opcode.
#[must_use]
pub fn add_update_contact(contact: &Contact) -> Bytes {
    let mut buf = BytesMut::with_capacity(148);
    buf.put_u8(CommandOpcode::AddUpdateContact as u8);
    buf.put_slice(contact.public_key.as_bytes());
    buf.put_u8(contact.contact_type as u8);
    buf.put_u8(contact.flags.as_byte());
    buf.put_i8(contact.out_path_len);

    // Path: 64 bytes; a negative (flood) path length writes all zeros.
    let path_len = if contact.out_path_len < 0 {
        0
    } else {
        contact.out_path.len().min(MAX_PATH_LEN)
    };
    buf.put_slice(&contact.out_path[..path_len]);
    buf.put_bytes(0, MAX_PATH_LEN - path_len);

    put_fixed_str(&mut buf, &contact.name, MAX_NAME_LEN);

    buf.put_u32_le(contact.last_advert);
    buf.put_i32_le(contact.latitude.map_or(0, encode_coord));
    buf.put_i32_le(contact.longitude.map_or(0, encode_coord));
    buf.put_u32_le(contact.last_modified);
    buf.freeze()
}

fn key_command(opcode: CommandOpcode, public_key: &PublicKey) -> Bytes {
    let mut buf = BytesMut::with_capacity(33);
    buf.put_u8(opcode as u8);
    buf.put_slice(public_key.as_bytes());
    buf.freeze()
}

/// `removeContact`.
#[must_use]
pub fn remove_contact(public_key: &PublicKey) -> Bytes {
    key_command(CommandOpcode::RemoveContact, public_key)
}

/// `getContactByKey`.
#[must_use]
pub fn get_contact_by_key(public_key: &PublicKey) -> Bytes {
    key_command(CommandOpcode::GetContactByKey, public_key)
}

/// `resetPath`: clear the contact's outbound path, falling back to flood.
#[must_use]
pub fn reset_path(public_key: &PublicKey) -> Bytes {
    key_command(CommandOpcode::ResetPath, public_key)
}

/// `shareContact`.
#[must_use]
pub fn share_contact(public_key: &PublicKey) -> Bytes {
    key_command(CommandOpcode::ShareContact, public_key)
}

// ==================== Radio ====================

/// `setRadioParams`: frequency/bandwidth in kHz, spreading factor,
/// coding rate.
#[must_use]
pub fn set_radio_params(freq_khz: u32, bw_hz: u32, sf: u8, cr: u8) -> Bytes {
    let mut buf = BytesMut::with_capacity(11);
    buf.put_u8(CommandOpcode::SetRadioParams as u8);
    buf.put_u32_le(freq_khz);
    buf.put_u32_le(bw_hz);
    buf.put_u8(sf);
    buf.put_u8(cr);
    buf.freeze()
}

/// `setRadioTxPower` in dBm.
#[must_use]
#[allow(clippy::cast_sign_loss)]
pub fn set_radio_tx_power(dbm: i8) -> Bytes {
    Bytes::from(vec![CommandOpcode::SetRadioTxPower as u8, dbm as u8])
}

/// `sendSelfAdvert`: flood byte 1 for a flood advertisement.
#[must_use]
pub fn send_self_advert(flood: bool) -> Bytes {
    Bytes::from(vec![CommandOpcode::SendSelfAdvert as u8, u8::from(flood)])
}

/// `setAdvertName`.
#[must_use]
pub fn set_advert_name(name: &str) -> Bytes {
    let mut buf = BytesMut::with_capacity(1 + name.len());
    buf.put_u8(CommandOpcode::SetAdvertName as u8);
    buf.put_slice(name.as_bytes());
    buf.freeze()
}

/// `setAdvertLatLon` in degrees, encoded as microdegrees.
#[must_use]
pub fn set_advert_lat_lon(latitude: f64, longitude: f64) -> Bytes {
    let mut buf = BytesMut::with_capacity(9);
    buf.put_u8(CommandOpcode::SetAdvertLatLon as u8);
    buf.put_i32_le(encode_coord(latitude));
    buf.put_i32_le(encode_coord(longitude));
    buf.freeze()
}

/// `getTuningParams`.
#[must_use]
pub fn get_tuning_params() -> Bytes {
    Bytes::from_static(&[CommandOpcode::GetTuningParams as u8])
}

// ==================== Channels ====================

/// `getChannel`.
#[must_use]
pub fn get_channel(index: u8) -> Bytes {
    Bytes::from(vec![CommandOpcode::GetChannel as u8, index])
}

/// `setChannel`: 32-byte name field, 16-byte secret.
#[must_use]
pub fn set_channel(index: u8, name: &str, secret: &[u8; 16]) -> Bytes {
    let mut buf = BytesMut::with_capacity(50);
    buf.put_u8(CommandOpcode::SetChannel as u8);
    buf.put_u8(index);
    put_fixed_str(&mut buf, name, MAX_NAME_LEN);
    buf.put_slice(secret);
    buf.freeze()
}

// ==================== Auth ====================

/// `sendLogin`: authenticate against a room server or repeater.
#[must_use]
pub fn send_login(public_key: &PublicKey, password: &str) -> Bytes {
    let mut buf = BytesMut::with_capacity(33 + password.len());
    buf.put_u8(CommandOpcode::SendLogin as u8);
    buf.put_slice(public_key.as_bytes());
    buf.put_slice(password.as_bytes());
    buf.freeze()
}

/// `hasConnection`.
#[must_use]
pub fn has_connection(public_key: &PublicKey) -> Bytes {
    key_command(CommandOpcode::HasConnection, public_key)
}

/// `logout`.
#[must_use]
pub fn logout(public_key: &PublicKey) -> Bytes {
    key_command(CommandOpcode::Logout, public_key)
}

// ==================== Binary / push requests ====================

/// `sendBinaryReq`: typed binary request addressed by full key.
#[must_use]
pub fn send_binary_req(public_key: &PublicKey, request_type: u8, data: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(34 + data.len());
    buf.put_u8(CommandOpcode::SendBinaryReq as u8);
    buf.put_slice(public_key.as_bytes());
    buf.put_u8(request_type);
    buf.put_slice(data);
    buf.freeze()
}

/// `sendStatusReq`.
#[must_use]
pub fn send_status_req(public_key: &PublicKey) -> Bytes {
    key_command(CommandOpcode::SendStatusReq, public_key)
}

/// `sendTelemetryReq`: self telemetry when no key is given.
#[must_use]
pub fn send_telemetry_req(public_key: Option<&PublicKey>) -> Bytes {
    let mut buf = BytesMut::with_capacity(36);
    buf.put_u8(CommandOpcode::SendTelemetryReq as u8);
    buf.put_bytes(0, 3);
    if let Some(key) = public_key {
        buf.put_slice(key.as_bytes());
    }
    buf.freeze()
}

/// `sendRawData` along an explicit repeater path.
#[must_use]
pub fn send_raw_data(path: &[u8], payload: &[u8]) -> Bytes {
    let path_len = path.len().min(MAX_PATH_LEN);
    let mut buf = BytesMut::with_capacity(2 + path_len + payload.len());
    buf.put_u8(CommandOpcode::SendRawData as u8);
    buf.put_u8(path_len as u8);
    buf.put_slice(&path[..path_len]);
    buf.put_slice(payload);
    buf.freeze()
}

/// `getAdvertPath`.
#[must_use]
pub fn get_advert_path(public_key: &PublicKey) -> Bytes {
    let mut buf = BytesMut::with_capacity(34);
    buf.put_u8(CommandOpcode::GetAdvertPath as u8);
    buf.put_u8(0);
    buf.put_slice(public_key.as_bytes());
    buf.freeze()
}

/// `sendPathDiscovery`.
#[must_use]
pub fn send_path_discovery(public_key: &PublicKey) -> Bytes {
    let mut buf = BytesMut::with_capacity(34);
    buf.put_u8(CommandOpcode::SendPathDiscovery as u8);
    buf.put_u8(0);
    buf.put_slice(public_key.as_bytes());
    buf.freeze()
}

/// `sendTracePath`: probe routing through specific repeaters.
#[must_use]
pub fn send_trace_path(tag: u32, auth: u32, flags: u8, path: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(10 + path.len());
    buf.put_u8(CommandOpcode::SendTracePath as u8);
    buf.put_u32_le(tag);
    buf.put_u32_le(auth);
    buf.put_u8(flags);
    buf.put_slice(path);
    buf.freeze()
}

/// `getStats`.
#[must_use]
pub fn get_stats() -> Bytes {
    Bytes::from_static(&[CommandOpcode::GetStats as u8])
}
