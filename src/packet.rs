//! Typed packet model and constructors for every command the session
//! issues.
//!
//! `Packet::AsyncAck` is a distinct variant rather than an opcode with an
//! empty payload: its wire form reuses the length byte to carry the
//! acknowledged subcode, which doesn't fit the regular
//! opcode+payload+checksum shape.

use crate::opcode::{self, ASYNC_ACK};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    /// A regular command, reply, or notification frame.
    Command { opcode: u16, payload: Vec<u8> },
    /// Acknowledges receipt of an asynchronous notification.
    AsyncAck { acked_opcode: u16 },
}

impl Packet {
    pub fn opcode(&self) -> u16 {
        match self {
            Packet::Command { opcode, .. } => *opcode,
            Packet::AsyncAck { .. } => ASYNC_ACK,
        }
    }

    pub fn payload(&self) -> &[u8] {
        match self {
            Packet::Command { payload, .. } => payload,
            Packet::AsyncAck { .. } => &[],
        }
    }

    fn command(opcode: u16, payload: Vec<u8>) -> Self {
        Packet::Command { opcode, payload }
    }

    pub fn inquiry() -> Self {
        Self::command(opcode::INQUIRY, Vec::new())
    }

    pub fn get_enr(random_block: [u32; 4]) -> Self {
        let mut payload = Vec::with_capacity(16);
        for word in random_block {
            payload.extend_from_slice(&word.to_le_bytes());
        }
        Self::command(opcode::GET_ENR, payload)
    }

    pub fn get_mac() -> Self {
        Self::command(opcode::GET_MAC, Vec::new())
    }

    pub fn get_key() -> Self {
        Self::command(opcode::GET_KEY, Vec::new())
    }

    pub fn get_version() -> Self {
        Self::command(opcode::GET_VERSION, Vec::new())
    }

    pub fn finish_auth() -> Self {
        Self::command(opcode::FINISH_AUTH, vec![0xFF])
    }

    pub fn enable_scan() -> Self {
        Self::command(opcode::START_STOP_SCAN, vec![0x01])
    }

    pub fn disable_scan() -> Self {
        Self::command(opcode::START_STOP_SCAN, vec![0x00])
    }

    pub fn get_sensor_count() -> Self {
        Self::command(opcode::GET_SENSOR_COUNT, Vec::new())
    }

    /// `count` is the number of paired sensors to enumerate, as returned
    /// by `GetSensorCount`.
    pub fn get_sensor_list(count: u8) -> Self {
        Self::command(opcode::GET_SENSOR_LIST, vec![count])
    }

    /// Panics if `mac` isn't exactly 8 ASCII bytes; callers are expected to
    /// have validated the MAC first (see `registry::valid_sensor_mac`).
    pub fn get_sensor_r1(mac: &str, r: &[u8; 16]) -> Self {
        assert_eq!(mac.len(), 8, "sensor MAC must be 8 ASCII characters");
        let mut payload = Vec::with_capacity(24);
        payload.extend_from_slice(mac.as_bytes());
        payload.extend_from_slice(r);
        Self::command(opcode::GET_SENSOR_R1, payload)
    }

    pub fn verify_sensor(mac: &str) -> Self {
        assert_eq!(mac.len(), 8, "sensor MAC must be 8 ASCII characters");
        let mut payload = Vec::with_capacity(10);
        payload.extend_from_slice(mac.as_bytes());
        payload.extend_from_slice(&[0xFF, 0x04]);
        Self::command(opcode::VERIFY_SENSOR, payload)
    }

    pub fn del_sensor(mac: &str) -> Self {
        assert_eq!(mac.len(), 8, "sensor MAC must be 8 ASCII characters");
        Self::command(opcode::DEL_SENSOR, mac.as_bytes().to_vec())
    }

    pub fn del_all_sensors() -> Self {
        Self::command(opcode::DEL_ALL_SENSORS, Vec::new())
    }

    /// `volume` is clamped to the dongle's accepted range of 1..9.
    pub fn play_chime(mac: &str, ring: u8, repeat: u8, volume: u8) -> Self {
        assert_eq!(mac.len(), 8, "sensor MAC must be 8 ASCII characters");
        let volume = volume.clamp(1, 9);
        let mut payload = Vec::with_capacity(11);
        payload.extend_from_slice(mac.as_bytes());
        payload.push(ring);
        payload.push(repeat);
        payload.push(volume);
        Self::command(opcode::PLAY_CHIME, payload)
    }

    pub fn sync_time_ack(now_millis: u64) -> Self {
        Self::command(
            opcode::reply_opcode(opcode::NOTIFY_SYNC_TIME),
            now_millis.to_be_bytes().to_vec(),
        )
    }

    pub fn async_ack(acked_opcode: u16) -> Self {
        assert!(
            opcode::is_async(acked_opcode),
            "only asynchronous notifications are ACKed"
        );
        Packet::AsyncAck { acked_opcode }
    }
}
