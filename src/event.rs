//! Decodes the payloads carried by `NOTIFY_ALARM` and `NOTIFY_HMS_EVENT`
//! into a `SensorEvent`.
//!
//! The decoder never panics: every malformed payload turns into an
//! `EventDecodeError`, which the caller (the session's notification
//! handler) logs and drops, keeping the reader thread alive.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EventDecodeError {
    #[error("payload too short: got {got} bytes, need at least {need}")]
    TooShort { got: usize, need: usize },
    #[error("sensor MAC bytes are not valid ASCII")]
    InvalidMac,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SensorType {
    Switch,
    SwitchV2,
    Motion,
    MotionV2,
    Leak,
    Climate,
    Chime,
    Keypad,
    Unknown(u8),
}

impl SensorType {
    pub fn from_byte(b: u8) -> Self {
        match b {
            0x01 => SensorType::Switch,
            0x02 => SensorType::Motion,
            0x03 => SensorType::Leak,
            0x05 => SensorType::Keypad,
            0x07 => SensorType::Climate,
            0x0C => SensorType::Chime,
            0x0E => SensorType::SwitchV2,
            0x0F => SensorType::MotionV2,
            other => SensorType::Unknown(other),
        }
    }

    pub fn tag(&self) -> String {
        match self {
            SensorType::Switch => "switch".into(),
            SensorType::SwitchV2 => "switchv2".into(),
            SensorType::Motion => "motion".into(),
            SensorType::MotionV2 => "motionv2".into(),
            SensorType::Leak => "leak".into(),
            SensorType::Climate => "climate".into(),
            SensorType::Chime => "chime".into(),
            SensorType::Keypad => "keypad".into(),
            SensorType::Unknown(b) => format!("unknown:{b:02x}"),
        }
    }

    /// Index 0/1 state-pair lookup shared by switch/motion/leak sensors.
    fn state_label(&self, idx: u8) -> String {
        let pair = match self {
            SensorType::Switch | SensorType::SwitchV2 => Some(("closed", "open")),
            SensorType::Motion | SensorType::MotionV2 => Some(("inactive", "active")),
            SensorType::Leak => Some(("dry", "wet")),
            _ => None,
        };
        match (pair, idx) {
            (Some((off, _)), 0) => off.to_string(),
            (Some((_, on)), 1) => on.to_string(),
            _ => format!("unknown({idx})"),
        }
    }

    /// 1.5V-cell sensors (switchv2) report half-scale battery.
    fn normalize_battery(&self, raw: u8) -> u8 {
        match self {
            SensorType::SwitchV2 => ((raw as u16) * 2).min(100) as u8,
            _ => raw.min(100),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ClimateReading {
    pub temperature_c: f32,
    pub raw_integer: u8,
    pub raw_fraction: u8,
    pub humidity_pct: u8,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum KeypadSubEvent {
    Mode(String),
    Motion(String),
    PinStart,
    PinConfirm(String),
    Unknown(u8),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SensorState {
    /// switch/motion/status "off"/"on" style state.
    Binary(String),
    /// leak state plus the dongle's secondary probe reading.
    Leak {
        state: String,
        probe_state: Option<String>,
        probe_present: bool,
    },
    Climate(ClimateReading),
    Keypad {
        sub_event: KeypadSubEvent,
        label: String,
    },
    /// Unrecognised dongle event byte; payload kept verbatim.
    Raw(Vec<u8>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    Alarm,
    Status,
    Climate,
    Leak,
    Keypad,
    Raw(u8),
}

impl EventKind {
    pub fn tag(&self) -> String {
        match self {
            EventKind::Alarm => "alarm".into(),
            EventKind::Status => "status".into(),
            EventKind::Climate => "climate".into(),
            EventKind::Leak => "leak".into(),
            EventKind::Keypad => "keypad".into(),
            EventKind::Raw(b) => format!("raw:{b:02x}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorEvent {
    pub mac: String,
    pub timestamp_ms: u64,
    pub kind: EventKind,
    pub sensor_type: SensorType,
    pub state: SensorState,
    pub battery: u8,
    pub signal_dbm: i16,
}

/// States that the gateway's glue publishes as boolean "on" (before
/// `invert_state` is applied).
const ON_STATES: [&str; 3] = ["active", "open", "wet"];

/// Published integer state = (state ∈ {active, open, wet}) XOR invert_state.
pub fn published_state_bit(state: &str, invert_state: bool) -> u8 {
    (ON_STATES.contains(&state) ^ invert_state) as u8
}

fn host_now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

fn read_mac(bytes: &[u8]) -> Result<String, EventDecodeError> {
    std::str::from_utf8(bytes)
        .map(|s| s.to_string())
        .map_err(|_| EventDecodeError::InvalidMac)
}

fn need(data: &[u8], n: usize) -> Result<(), EventDecodeError> {
    if data.len() < n {
        Err(EventDecodeError::TooShort {
            got: data.len(),
            need: n,
        })
    } else {
        Ok(())
    }
}

/// Top-level entry point for `NOTIFY_ALARM` payloads: `[ts:8][event:1][mac:8][...]`.
pub fn decode_alarm_payload(payload: &[u8]) -> Result<SensorEvent, EventDecodeError> {
    need(payload, 17)?;
    let timestamp_ms = u64::from_be_bytes(payload[0..8].try_into().unwrap());
    let event_byte = payload[8];
    let mac = read_mac(&payload[9..17])?;
    let data = &payload[17..];

    match event_byte {
        0xA1 => decode_contact_like(EventKind::Status, mac, timestamp_ms, data),
        0xA2 => decode_contact_like(EventKind::Alarm, mac, timestamp_ms, data),
        0xE8 => decode_climate(mac, timestamp_ms, data),
        0xEA => decode_leak(mac, timestamp_ms, data),
        other => Ok(SensorEvent {
            mac,
            timestamp_ms,
            kind: EventKind::Raw(other),
            sensor_type: SensorType::Unknown(data.first().copied().unwrap_or(other)),
            state: SensorState::Raw(data.to_vec()),
            battery: 0,
            signal_dbm: 0,
        }),
    }
}

fn decode_contact_like(
    kind: EventKind,
    mac: String,
    timestamp_ms: u64,
    data: &[u8],
) -> Result<SensorEvent, EventDecodeError> {
    need(data, 6)?;
    let sensor_type = SensorType::from_byte(data[0]);
    let battery = sensor_type.normalize_battery(data[2]);
    let state = sensor_type.state_label(data[5]);
    let signal_raw = *data.last().unwrap();

    Ok(SensorEvent {
        mac,
        timestamp_ms,
        kind,
        sensor_type,
        state: SensorState::Binary(state),
        battery,
        signal_dbm: -(signal_raw as i16),
    })
}

fn decode_leak(mac: String, timestamp_ms: u64, data: &[u8]) -> Result<SensorEvent, EventDecodeError> {
    need(data, 6)?;
    let sensor_type = SensorType::from_byte(data[0]);
    let battery = sensor_type.normalize_battery(data[2]);
    let state = sensor_type.state_label(data[5]);
    let (probe_state, probe_present) = if data.len() >= 8 {
        (Some(sensor_type.state_label(data[6])), data[7] != 0)
    } else {
        (None, false)
    };
    let signal_raw = *data.last().unwrap();

    Ok(SensorEvent {
        mac,
        timestamp_ms,
        kind: EventKind::Leak,
        sensor_type,
        state: SensorState::Leak {
            state,
            probe_state,
            probe_present,
        },
        battery,
        signal_dbm: -(signal_raw as i16),
    })
}

fn decode_climate(mac: String, timestamp_ms: u64, data: &[u8]) -> Result<SensorEvent, EventDecodeError> {
    need(data, 8)?;
    let sensor_type = SensorType::from_byte(data[0]);
    let battery = sensor_type.normalize_battery(data[2]);
    let raw_integer = data[5];
    let raw_fraction = data[6];
    let humidity_pct = data[7];
    let temperature_c = raw_integer as f32 + (raw_fraction as f32) / 100.0;
    let signal_raw = *data.last().unwrap();

    Ok(SensorEvent {
        mac,
        timestamp_ms,
        kind: EventKind::Climate,
        sensor_type,
        state: SensorState::Climate(ClimateReading {
            temperature_c,
            raw_integer,
            raw_fraction,
            humidity_pct,
        }),
        battery,
        signal_dbm: -(signal_raw as i16),
    })
}

/// Decodes a `NOTIFY_HMS_EVENT` payload: `[_:1][mac:8][_:1][event_data...]`.
/// Battery is scaled `raw * 100 / 155`, an empirical keypad battery scale;
/// revisit per-type if another HMS-class sensor needs a different factor.
pub fn decode_hms_payload(payload: &[u8]) -> Result<SensorEvent, EventDecodeError> {
    need(payload, 10)?;
    let mac = read_mac(&payload[1..9])?;
    let data = &payload[10..];
    need(data, 6)?;

    let event_type = data[4];
    let battery = (((data[2] as u32) * 100) / 155).min(100) as u8;
    let signal_raw = *data.last().unwrap();

    let (sub_event, label) = match event_type {
        0x02 => {
            const STATES: [&str; 5] = [
                "unknown",
                "disarmed",
                "armed_home",
                "armed_away",
                "triggered",
            ];
            let label = STATES
                .get(data[5] as usize)
                .copied()
                .unwrap_or("unknown")
                .to_string();
            (KeypadSubEvent::Mode(label.clone()), label)
        }
        0x0A => {
            let label = if data[5] == 1 { "active" } else { "inactive" }.to_string();
            (KeypadSubEvent::Motion(label.clone()), label)
        }
        0x06 => (KeypadSubEvent::PinStart, "pinStart".to_string()),
        0x08 => {
            let digit_count = (data[0] as usize).saturating_sub(6);
            let start = 5.min(data.len());
            let end = (start + digit_count).min(data.len());
            let pin: String = data[start..end].iter().map(|d| d.to_string()).collect();
            (KeypadSubEvent::PinConfirm(pin.clone()), pin)
        }
        other => (
            KeypadSubEvent::Unknown(other),
            format!("unknown({other})"),
        ),
    };

    Ok(SensorEvent {
        mac,
        timestamp_ms: host_now_ms(),
        kind: EventKind::Keypad,
        sensor_type: SensorType::Keypad,
        state: SensorState::Keypad { sub_event, label },
        battery,
        signal_dbm: -(signal_raw as i16),
    })
}

/// Decodes a `NOTIFY_EVENT_LOG` payload: advisory only, logged by the
/// caller and never turned into a `SensorEvent`.
pub fn decode_event_log_payload(payload: &[u8]) -> Result<(u64, Vec<u8>), EventDecodeError> {
    need(payload, 9)?;
    let timestamp_ms = u64::from_be_bytes(payload[0..8].try_into().unwrap());
    Ok((timestamp_ms, payload[9..].to_vec()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alarm_payload(event_byte: u8, mac: &str, data: &[u8]) -> Vec<u8> {
        let mut p = Vec::new();
        p.extend_from_slice(&0u64.to_be_bytes());
        p.push(event_byte);
        p.extend_from_slice(mac.as_bytes());
        p.extend_from_slice(data);
        p
    }

    #[test]
    fn switchv2_open_event_doubles_and_caps_battery() {
        // sensor_type=0x0E, _, battery=60, _, _, state=1, signal=75
        let data = [0x0E, 0x00, 60, 0x00, 0x00, 0x01, 75];
        let payload = alarm_payload(0xA2, "776A5CE1", &data);
        let event = decode_alarm_payload(&payload).unwrap();

        assert_eq!(event.kind, EventKind::Alarm);
        assert_eq!(event.sensor_type, SensorType::SwitchV2);
        assert_eq!(event.state, SensorState::Binary("open".into()));
        assert_eq!(event.battery, 100);
        assert_eq!(event.signal_dbm, -75);
        assert_eq!(event.mac, "776A5CE1");
    }

    #[test]
    fn battery_clamped_for_non_switchv2_sensors() {
        let data = [0x02, 0x00, 250, 0x00, 0x00, 0x01, 10];
        let payload = alarm_payload(0xA1, "AABBCCDD", &data);
        let event = decode_alarm_payload(&payload).unwrap();
        assert_eq!(event.battery, 100);
    }

    #[test]
    fn leak_event_reads_probe_fields() {
        let data = [0x03, 0x00, 80, 0x00, 0x00, 0x01, 0x00, 0x01, 20];
        let payload = alarm_payload(0xEA, "AABBCCDD", &data);
        let event = decode_alarm_payload(&payload).unwrap();
        match event.state {
            SensorState::Leak {
                state,
                probe_state,
                probe_present,
            } => {
                assert_eq!(state, "wet");
                assert_eq!(probe_state, Some("dry".to_string()));
                assert!(probe_present);
            }
            other => panic!("expected Leak state, got {other:?}"),
        }
    }

    #[test]
    fn climate_event_decodes_temperature_and_humidity() {
        let data = [0x07, 0x00, 90, 0x00, 0x00, 21, 50, 45, 30];
        let payload = alarm_payload(0xE8, "AABBCCDD", &data);
        let event = decode_alarm_payload(&payload).unwrap();
        match event.state {
            SensorState::Climate(reading) => {
                assert_eq!(reading.raw_integer, 21);
                assert_eq!(reading.raw_fraction, 50);
                assert!((reading.temperature_c - 21.5).abs() < 0.001);
                assert_eq!(reading.humidity_pct, 45);
            }
            other => panic!("expected Climate state, got {other:?}"),
        }
        assert_eq!(event.signal_dbm, -30);
    }

    #[test]
    fn unknown_event_byte_surfaces_as_raw() {
        let payload = alarm_payload(0x99, "AABBCCDD", &[1, 2, 3]);
        let event = decode_alarm_payload(&payload).unwrap();
        assert_eq!(event.kind, EventKind::Raw(0x99));
        assert_eq!(event.kind.tag(), "raw:99");
    }

    #[test]
    fn too_short_payload_is_rejected() {
        let err = decode_alarm_payload(&[0u8; 10]).unwrap_err();
        assert_eq!(err, EventDecodeError::TooShort { got: 10, need: 17 });
    }

    #[test]
    fn hms_mode_event_decodes() {
        let mut payload = vec![0u8; 10];
        payload[1..9].copy_from_slice(b"AABBCCDD");
        payload.extend_from_slice(&[0, 0, 100, 0, 0x02, 0x02, 40]);
        let event = decode_hms_payload(&payload).unwrap();
        assert_eq!(event.mac, "AABBCCDD");
        match event.state {
            SensorState::Keypad { label, .. } => assert_eq!(label, "armed_home"),
            other => panic!("expected Keypad state, got {other:?}"),
        }
        assert_eq!(event.battery, 64); // 100*100/155 = 64
    }

    #[test]
    fn published_state_bit_applies_invert() {
        assert_eq!(published_state_bit("open", false), 1);
        assert_eq!(published_state_bit("open", true), 0);
        assert_eq!(published_state_bit("closed", false), 0);
        assert_eq!(published_state_bit("closed", true), 1);
    }
}
