//! Frame parsing: bytes in, [`Event`] out.
//!
//! [`parse_frame`] is total over byte slices. It never panics and never
//! returns an error; anything short or malformed becomes
//! [`Event::ParseFailure`], which the session counts and subscribers can
//! observe.

use bytes::{Buf, Bytes};

use crate::event::{Event, LoginInfo};
use crate::protocol::packet::PacketType;
use crate::types::telemetry::parse_lpp;
use crate::types::{
    Acknowledgement, BatteryStatus, ChannelInfo, ChannelMessage, Contact, ContactFlags,
    ContactMessage, ContactType, DeviceInfo, DeviceStats, KeyPrefix, PublicKey, RadioConfig,
    RemoteNodeStatus, SelfInfo, TextType,
};

/// Coordinate scaling factor (microdegrees to degrees).
const COORD_SCALE: f64 = 1_000_000.0;

/// SNR is transmitted as quarter-dB.
const SNR_SCALE: f32 = 4.0;

/// Byte size of a full contact record on the wire.
pub const CONTACT_FRAME_LEN: usize = 147;

/// Parses a zero-terminated or fixed-length string field.
fn parse_string(data: &[u8], max_len: usize) -> String {
    let len = data
        .iter()
        .take(max_len)
        .position(|&b| b == 0)
        .unwrap_or_else(|| max_len.min(data.len()));
    String::from_utf8_lossy(&data[..len]).into_owned()
}

/// Decodes a microdegree coordinate; 0 is the "unset" sentinel.
fn parse_coord(value: i32) -> Option<f64> {
    if value == 0 {
        None
    } else {
        Some(f64::from(value) / COORD_SCALE)
    }
}

fn failure(code: u8, reason: impl Into<String>) -> Event {
    Event::ParseFailure {
        code,
        reason: reason.into(),
    }
}

/// Parses one frame into an event. Total: any input yields an event.
#[must_use]
#[allow(clippy::too_many_lines)]
pub fn parse_frame(frame: &[u8]) -> Event {
    let Some(&code) = frame.first() else {
        return failure(0, "empty frame");
    };
    let data = &frame[1..];

    let Some(packet) = PacketType::from_byte(code) else {
        return failure(code, "unknown response code");
    };

    match packet {
        PacketType::Ok => match data.len() {
            0 => Event::Ok { value: None },
            n if n >= 4 => Event::Ok {
                value: Some(u32::from_le_bytes([data[0], data[1], data[2], data[3]])),
            },
            _ => failure(code, "ok payload must be 0 or 4 bytes"),
        },
        PacketType::Error => Event::Error {
            code: data.first().copied(),
        },
        PacketType::Disabled => Event::Disabled,
        PacketType::SelfInfo => parse_self_info(data).unwrap_or_else(|r| failure(code, r)),
        PacketType::DeviceInfo => parse_device_info(data).unwrap_or_else(|r| failure(code, r)),
        PacketType::CurrentTime => {
            if data.len() >= 4 {
                Event::CurrentTime(u32::from_le_bytes([data[0], data[1], data[2], data[3]]))
            } else {
                failure(code, "time payload too short")
            }
        }
        PacketType::Battery => parse_battery(data).unwrap_or_else(|r| failure(code, r)),
        PacketType::ContactsStart => {
            if data.len() >= 4 {
                Event::ContactsStart {
                    count: u32::from_le_bytes([data[0], data[1], data[2], data[3]]),
                }
            } else {
                failure(code, "contact count too short")
            }
        }
        PacketType::Contact => parse_contact(data)
            .map(|c| Event::Contact(Box::new(c)))
            .unwrap_or_else(|r| failure(code, r)),
        PacketType::ContactsEnd => {
            let last_modified = if data.len() >= 4 {
                u32::from_le_bytes([data[0], data[1], data[2], data[3]])
            } else {
                0
            };
            Event::ContactsEnd { last_modified }
        }
        PacketType::ContactMsgRecv => {
            parse_contact_message(data, false).unwrap_or_else(|r| failure(code, r))
        }
        PacketType::ContactMsgRecvV3 => {
            parse_contact_message(data, true).unwrap_or_else(|r| failure(code, r))
        }
        PacketType::ChannelMsgRecv => {
            parse_channel_message(data, false).unwrap_or_else(|r| failure(code, r))
        }
        PacketType::ChannelMsgRecvV3 => {
            parse_channel_message(data, true).unwrap_or_else(|r| failure(code, r))
        }
        PacketType::MsgSent => {
            if data.len() >= 9 {
                Event::MessageSent {
                    text_type: data[0],
                    expected_ack: [data[1], data[2], data[3], data[4]],
                    suggested_timeout_ms: u32::from_le_bytes([data[5], data[6], data[7], data[8]]),
                }
            } else {
                failure(code, "message-sent payload too short")
            }
        }
        PacketType::Ack => {
            if data.len() >= 4 {
                Event::Acknowledgement(Acknowledgement {
                    code: [data[0], data[1], data[2], data[3]],
                })
            } else {
                failure(code, "ack payload too short")
            }
        }
        PacketType::MessagesWaiting => Event::MessagesWaiting,
        PacketType::NoMoreMsgs => Event::NoMoreMessages,
        PacketType::Advertisement => parse_key_push(data)
            .map(|(public_key, prefix)| Event::Advertisement { public_key, prefix })
            .unwrap_or_else(|r| failure(code, r)),
        PacketType::PathUpdate => parse_key_push(data)
            .map(|(public_key, prefix)| Event::PathUpdate { public_key, prefix })
            .unwrap_or_else(|r| failure(code, r)),
        PacketType::NewAdvert => {
            // Fallback ladder: a full contact record, else a bare key.
            if data.len() >= CONTACT_FRAME_LEN {
                parse_contact(data)
                    .map(|c| Event::NewAdvert(Box::new(c)))
                    .unwrap_or_else(|r| failure(code, r))
            } else if data.len() >= 32 {
                let public_key = PublicKey::from_bytes(&data[..32]);
                let prefix = public_key.prefix();
                Event::Advertisement {
                    public_key: Some(public_key),
                    prefix,
                }
            } else {
                failure(code, "advert payload shorter than a public key")
            }
        }
        PacketType::StatusResponse => {
            // [reserved:1] precedes the status record.
            if data.len() > 1 {
                parse_remote_status(&data[1..])
                    .map(|s| Event::StatusResponse(Box::new(s)))
                    .unwrap_or_else(|r| failure(code, r))
            } else {
                failure(code, "status payload too short")
            }
        }
        PacketType::TelemetryResponse => {
            // [reserved:1][prefix:6][lpp...]
            if data.len() >= 7 {
                Event::TelemetryResponse {
                    prefix: KeyPrefix::from_bytes(&data[1..7]),
                    readings: parse_lpp(&data[7..]),
                }
            } else {
                failure(code, "telemetry payload too short")
            }
        }
        PacketType::BinaryResponse => Event::BinaryResponse(Bytes::copy_from_slice(data)),
        PacketType::PathDiscoveryResponse => {
            Event::PathDiscoveryResponse(Bytes::copy_from_slice(data))
        }
        PacketType::ControlData => {
            if data.len() >= 4 {
                Event::ControlData {
                    snr: f32::from(data[0] as i8) / SNR_SCALE,
                    rssi: data[1] as i8,
                    path_len: data[2],
                    payload_type: data[3],
                    payload: Bytes::copy_from_slice(&data[4..]),
                }
            } else {
                failure(code, "control data too short")
            }
        }
        PacketType::RawData => Event::RawData(Bytes::copy_from_slice(data)),
        PacketType::LogData => Event::LogData(String::from_utf8_lossy(data).into_owned()),
        PacketType::TraceData => Event::TraceData(Bytes::copy_from_slice(data)),
        PacketType::ChannelInfo => parse_channel_info(data).unwrap_or_else(|r| failure(code, r)),
        PacketType::Stats => parse_stats(data).unwrap_or_else(|r| failure(code, r)),
        PacketType::LoginSuccess => parse_login_success(data).unwrap_or_else(|r| failure(code, r)),
        PacketType::LoginFailed => {
            if data.len() >= 6 {
                Event::LoginFail {
                    prefix: KeyPrefix::from_bytes(&data[..6]),
                }
            } else {
                failure(code, "login-fail payload too short")
            }
        }
    }
}

/// `[node_type:1][tx:1][max_tx:1][pubkey:32][lat:4][lon:4][flags:4]
/// [freq:4][bw:4][sf:1][cr:1][name...]`
fn parse_self_info(data: &[u8]) -> Result<Event, String> {
    if data.len() < 57 {
        return Err(format!("self info too short: {} bytes", data.len()));
    }

    let mut cursor = std::io::Cursor::new(data);

    let node_type = cursor.get_u8();
    let tx_power = cursor.get_u8();
    let max_tx_power = cursor.get_u8();

    let mut pubkey = [0u8; 32];
    cursor.copy_to_slice(&mut pubkey);

    let lat_raw = cursor.get_i32_le();
    let lon_raw = cursor.get_i32_le();

    let mut flags = [0u8; 4];
    cursor.copy_to_slice(&mut flags);

    let freq_raw = cursor.get_u32_le();
    let bw_raw = cursor.get_u32_le();
    let sf = cursor.get_u8();
    let cr = cursor.get_u8();

    let name_start = usize::try_from(cursor.position()).unwrap_or(data.len());
    let name = parse_string(&data[name_start..], 32);

    Ok(Event::SelfInfo(Box::new(SelfInfo {
        node_type,
        tx_power,
        max_tx_power,
        public_key: PublicKey::from_bytes(&pubkey),
        latitude: parse_coord(lat_raw),
        longitude: parse_coord(lon_raw),
        flags,
        radio: RadioConfig {
            frequency_mhz: f64::from(freq_raw) / 1000.0,
            bandwidth_khz: f64::from(bw_raw) / 1000.0,
            spreading_factor: sf,
            coding_rate: cr,
        },
        name,
    })))
}

/// `[fw_ver:1]` plus, for version >= 3:
/// `[max_contacts/2:1][max_channels:1][ble_pin:4][build:12][manufacturer:40]
/// [fw_str:20]`
fn parse_device_info(data: &[u8]) -> Result<Event, String> {
    let Some(&firmware_version) = data.first() else {
        return Err("device info empty".into());
    };

    let info = if firmware_version >= 3 && data.len() >= 79 {
        let max_contacts = u16::from(data[1]) * 2;
        let max_channels = data[2];
        let ble_pin = u32::from_le_bytes([data[3], data[4], data[5], data[6]]);
        DeviceInfo {
            firmware_version,
            max_contacts: Some(max_contacts),
            max_channels: Some(max_channels),
            ble_pin: Some(ble_pin),
            build: Some(parse_string(&data[7..19], 12)),
            manufacturer: Some(parse_string(&data[19..59], 40)),
            firmware_str: Some(parse_string(&data[59..79], 20)),
        }
    } else {
        DeviceInfo {
            firmware_version,
            max_contacts: None,
            max_channels: None,
            ble_pin: None,
            build: None,
            manufacturer: None,
            firmware_str: None,
        }
    };

    Ok(Event::DeviceInfo(Box::new(info)))
}

/// `[level_mv:2]` plus `[used_kb:4][total_kb:4]` when the device reports
/// storage.
fn parse_battery(data: &[u8]) -> Result<Event, String> {
    if data.len() < 2 {
        return Err("battery payload too short".into());
    }

    let level_mv = u16::from_le_bytes([data[0], data[1]]);
    let (used_kb, total_kb) = if data.len() >= 10 {
        (
            Some(u32::from_le_bytes([data[2], data[3], data[4], data[5]])),
            Some(u32::from_le_bytes([data[6], data[7], data[8], data[9]])),
        )
    } else {
        (None, None)
    };

    Ok(Event::Battery(BatteryStatus {
        level_mv,
        used_kb,
        total_kb,
    }))
}

/// Parses the 147-byte contact record:
/// `[pubkey:32][type:1][flags:1][out_path_len:i8][out_path:64][name:32]
/// [last_advert:4][lat:4][lon:4][last_modified:4]`
///
/// A wire path length of 0xFF denotes flood routing; it parses as -1 with
/// an empty path.
pub fn parse_contact(data: &[u8]) -> Result<Contact, String> {
    if data.len() < CONTACT_FRAME_LEN {
        return Err(format!("contact record too short: {} bytes", data.len()));
    }

    let mut cursor = std::io::Cursor::new(data);

    let mut pubkey = [0u8; 32];
    cursor.copy_to_slice(&mut pubkey);

    let contact_type = ContactType::from_byte(cursor.get_u8());
    let flags = ContactFlags::from_byte(cursor.get_u8());
    let out_path_len = cursor.get_i8();

    let mut path = [0u8; 64];
    cursor.copy_to_slice(&mut path);
    let significant = usize::try_from(out_path_len).unwrap_or(0).min(64);
    let out_path = Bytes::copy_from_slice(&path[..significant]);

    let name = parse_string(&data[99..131], 32);

    cursor.set_position(131);
    let last_advert = cursor.get_u32_le();
    let lat_raw = cursor.get_i32_le();
    let lon_raw = cursor.get_i32_le();
    let last_modified = cursor.get_u32_le();

    Ok(Contact {
        public_key: PublicKey::from_bytes(&pubkey),
        contact_type,
        flags,
        out_path_len,
        out_path,
        name,
        last_advert,
        latitude: parse_coord(lat_raw),
        longitude: parse_coord(lon_raw),
        last_modified,
    })
}

/// v1: `[prefix:6][path_len:1][txt_type:1][ts:4][sig:4?][text...]`
/// v3 prepends `[snr:i8 quarter-dB][reserved:2]`.
fn parse_contact_message(data: &[u8], v3: bool) -> Result<Event, String> {
    let min_len = if v3 { 15 } else { 12 };
    if data.len() < min_len {
        return Err(format!("contact message too short: {} bytes", data.len()));
    }

    let mut cursor = std::io::Cursor::new(data);

    let snr = if v3 {
        let raw = cursor.get_i8();
        cursor.advance(2);
        Some(f32::from(raw) / SNR_SCALE)
    } else {
        None
    };

    let mut prefix = [0u8; 6];
    cursor.copy_to_slice(&mut prefix);

    let path_len = cursor.get_u8();
    let text_type = TextType::from_byte(cursor.get_u8());
    let sender_ts = cursor.get_u32_le();

    let text_start = usize::try_from(cursor.position()).unwrap_or(data.len());
    let (signature, text) = if text_type == TextType::SignedPlain && data.len() >= text_start + 4 {
        let sig = [
            data[text_start],
            data[text_start + 1],
            data[text_start + 2],
            data[text_start + 3],
        ];
        (
            Some(sig),
            String::from_utf8_lossy(&data[text_start + 4..]).into_owned(),
        )
    } else {
        (
            None,
            String::from_utf8_lossy(&data[text_start..]).into_owned(),
        )
    };

    Ok(Event::ContactMessage(Box::new(ContactMessage {
        sender_prefix: KeyPrefix::from_bytes(&prefix),
        path_len,
        text_type,
        sender_ts,
        signature,
        text,
        snr,
    })))
}

/// v1: `[channel:1][path_len:1][txt_type:1][ts:4][text...]`
/// v3 prepends `[snr:i8 quarter-dB][reserved:2]`.
fn parse_channel_message(data: &[u8], v3: bool) -> Result<Event, String> {
    let min_len = if v3 { 10 } else { 7 };
    if data.len() < min_len {
        return Err(format!("channel message too short: {} bytes", data.len()));
    }

    let mut cursor = std::io::Cursor::new(data);

    let snr = if v3 {
        let raw = cursor.get_i8();
        cursor.advance(2);
        Some(f32::from(raw) / SNR_SCALE)
    } else {
        None
    };

    let channel_index = cursor.get_u8();
    let path_len = cursor.get_u8();
    let text_type = TextType::from_byte(cursor.get_u8());
    let sender_ts = cursor.get_u32_le();

    let text_start = usize::try_from(cursor.position()).unwrap_or(data.len());
    let text = String::from_utf8_lossy(&data[text_start..]).into_owned();

    Ok(Event::ChannelMessage(Box::new(ChannelMessage {
        channel_index,
        path_len,
        text_type,
        sender_ts,
        text,
        snr,
    })))
}

/// A push carrying a full 32-byte key, or only a prefix on short frames.
fn parse_key_push(data: &[u8]) -> Result<(Option<PublicKey>, KeyPrefix), String> {
    if data.len() >= 32 {
        let key = PublicKey::from_bytes(&data[..32]);
        let prefix = key.prefix();
        Ok((Some(key), prefix))
    } else if data.len() >= 6 {
        Ok((None, KeyPrefix::from_bytes(&data[..6])))
    } else {
        Err(format!("key push too short: {} bytes", data.len()))
    }
}

/// `[index:1][name:32][secret:16]`
fn parse_channel_info(data: &[u8]) -> Result<Event, String> {
    if data.len() < 49 {
        return Err(format!("channel info too short: {} bytes", data.len()));
    }

    let index = data[0];
    let name = parse_string(&data[1..33], 32);
    let mut secret = [0u8; 16];
    secret.copy_from_slice(&data[33..49]);

    Ok(Event::ChannelInfo(Box::new(ChannelInfo {
        index,
        name,
        secret,
    })))
}

/// Remote node status record following the reserved byte.
fn parse_remote_status(data: &[u8]) -> Result<RemoteNodeStatus, String> {
    if data.len() < 58 {
        return Err(format!("status record too short: {} bytes", data.len()));
    }

    let mut cursor = std::io::Cursor::new(data);

    let mut prefix = [0u8; 6];
    cursor.copy_to_slice(&mut prefix);

    let battery_mv = cursor.get_u16_le();
    let tx_queue_len = cursor.get_u16_le();
    let noise_floor = cursor.get_i16_le();
    let last_rssi = cursor.get_i16_le();
    let packets_received = cursor.get_u32_le();
    let packets_sent = cursor.get_u32_le();
    let airtime_secs = cursor.get_u32_le();
    let uptime_secs = cursor.get_u32_le();
    let sent_flood = cursor.get_u32_le();
    let sent_direct = cursor.get_u32_le();
    let recv_flood = cursor.get_u32_le();
    let recv_direct = cursor.get_u32_le();
    let full_events = cursor.get_u16_le();
    let last_snr = f32::from(cursor.get_i16_le()) / SNR_SCALE;
    let direct_dups = cursor.get_u16_le();
    let flood_dups = cursor.get_u16_le();
    let rx_airtime_secs = cursor.get_u32_le();

    Ok(RemoteNodeStatus {
        prefix: KeyPrefix::from_bytes(&prefix),
        battery_mv,
        tx_queue_len,
        noise_floor,
        last_rssi,
        packets_received,
        packets_sent,
        airtime_secs,
        uptime_secs,
        sent_flood,
        sent_direct,
        recv_flood,
        recv_direct,
        full_events,
        last_snr,
        direct_dups,
        flood_dups,
        rx_airtime_secs,
    })
}

/// `[battery_mv:2][uptime:4][errors:2][queue_len:1]`
fn parse_stats(data: &[u8]) -> Result<Event, String> {
    if data.len() < 9 {
        return Err(format!("stats payload too short: {} bytes", data.len()));
    }

    let mut cursor = std::io::Cursor::new(data);
    let battery_mv = cursor.get_u16_le();
    let uptime_secs = cursor.get_u32_le();
    let errors = cursor.get_u16_le();
    let queue_len = cursor.get_u8();

    Ok(Event::Stats(DeviceStats {
        battery_mv,
        uptime_secs,
        errors,
        queue_len,
    }))
}

/// `[is_admin:1][prefix:6]` plus optional `[server_ts:4][acl:1][fw:1]`.
fn parse_login_success(data: &[u8]) -> Result<Event, String> {
    if data.len() < 7 {
        return Err(format!("login payload too short: {} bytes", data.len()));
    }

    let is_admin = data[0] != 0;
    let prefix = KeyPrefix::from_bytes(&data[1..7]);
    let server_ts = if data.len() >= 11 {
        Some(u32::from_le_bytes([data[7], data[8], data[9], data[10]]))
    } else {
        None
    };
    let acl = data.get(11).copied();
    let firmware_level = data.get(12).copied();

    Ok(Event::LoginSuccess(LoginInfo {
        is_admin,
        prefix,
        server_ts,
        acl,
        firmware_level,
    }))
}
