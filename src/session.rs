//! Bring-up handshake and the high-level operations exposed to callers:
//! `List`, `Scan`, `Delete`, `PlayChime`, `DeleteAll`, `Stop`.
//!
//! Decoded sensor events are handed off through a bounded channel rather
//! than processed inline in the notification handler, keeping the reader
//! thread free to keep draining the transport.

use std::sync::mpsc;
use std::sync::Mutex;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::config::Config;
use crate::dispatcher::{Dispatcher, Handler};
use crate::error::{DongleError, DongleResult};
use crate::event::{self, SensorEvent, SensorType};
use crate::opcode;
use crate::packet::Packet;
use crate::transport::HidTransport;

const SENSOR_R1_CHALLENGE: &[u8; 16] = b"Ok5HPNQ4lf77u754";
const EVENT_CHANNEL_CAPACITY: usize = 256;

pub struct DongleSession {
    dispatcher: std::sync::Arc<Dispatcher>,
    reader_handle: Mutex<Option<JoinHandle<()>>>,
    config: Config,
    events_rx: Mutex<mpsc::Receiver<SensorEvent>>,
    pub mac: String,
    pub enr: [u8; 16],
    pub version: String,
}

impl DongleSession {
    /// Runs the bring-up handshake and installs the persistent
    /// notification handlers. Tears down the reader thread and
    /// propagates on any handshake failure.
    pub fn new(transport: Box<dyn HidTransport>, config: Config) -> DongleResult<Self> {
        let (dispatcher, reader_handle) = Dispatcher::spawn(transport);

        match Self::handshake(&dispatcher, &config) {
            Ok((enr, mac, version)) => {
                let (tx, rx) = mpsc::sync_channel(EVENT_CHANNEL_CAPACITY);
                install_notification_handlers(&dispatcher, tx);
                Ok(DongleSession {
                    dispatcher,
                    reader_handle: Mutex::new(Some(reader_handle)),
                    config,
                    events_rx: Mutex::new(rx),
                    mac,
                    enr,
                    version,
                })
            }
            Err(e) => {
                dispatcher.stop();
                let _ = reader_handle.join();
                Err(e)
            }
        }
    }

    fn handshake(
        dispatcher: &Dispatcher,
        config: &Config,
    ) -> DongleResult<([u8; 16], String, String)> {
        let timeout = config.default_timeout;

        let inquiry = dispatcher.do_command(Packet::inquiry(), timeout)?;
        if inquiry.payload() != [0x01] {
            return Err(DongleError::ProtocolViolation(
                "Inquiry did not return 0x01".into(),
            ));
        }

        let enr_reply = dispatcher.do_command(Packet::get_enr([0x30303030; 4]), timeout)?;
        let enr: [u8; 16] = enr_reply
            .payload()
            .try_into()
            .map_err(|_| DongleError::ProtocolViolation("GetEnr reply was not 16 bytes".into()))?;

        let mac_reply = dispatcher.do_command(Packet::get_mac(), timeout)?;
        let mac = ascii_string(mac_reply.payload())
            .ok_or_else(|| DongleError::ProtocolViolation("GetMAC reply was not ASCII".into()))?;

        let version_reply = dispatcher.do_command(Packet::get_version(), timeout)?;
        let version = ascii_string(version_reply.payload()).ok_or_else(|| {
            DongleError::ProtocolViolation("GetVersion reply was not ASCII".into())
        })?;

        dispatcher.do_command(Packet::finish_auth(), timeout)?;

        Ok((enr, mac, version))
    }

    /// Enumerates paired sensors. Empty if none are paired.
    pub fn list(&self) -> DongleResult<Vec<String>> {
        let count_reply = self
            .dispatcher
            .do_command(Packet::get_sensor_count(), self.config.enumeration_timeout)?;
        let count = *count_reply.payload().first().unwrap_or(&0) as usize;
        if count == 0 {
            return Ok(Vec::new());
        }

        let reply_opcode = opcode::reply_opcode(opcode::GET_SENSOR_LIST);
        let (tx, rx) = mpsc::channel::<Vec<u8>>();
        let handler: Handler = Box::new(move |pkt| {
            let _ = tx.send(pkt.payload().to_vec());
        });

        let deadline = Instant::now() + self.config.enumeration_timeout;
        self.dispatcher.with_temporary_handler(reply_opcode, handler, move || {
            self.dispatcher.send(&Packet::get_sensor_list(count as u8))?;
            let mut macs = Vec::with_capacity(count);
            while macs.len() < count {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    return Err(timeout_err(opcode::GET_SENSOR_LIST, self.config.enumeration_timeout));
                }
                let bytes = rx
                    .recv_timeout(remaining)
                    .map_err(|_| timeout_err(opcode::GET_SENSOR_LIST, self.config.enumeration_timeout))?;
                let mac = ascii_string(&bytes).ok_or_else(|| {
                    DongleError::ProtocolViolation("sensor list entry was not ASCII".into())
                })?;
                macs.push(mac);
            }
            Ok(macs)
        })
    }

    /// Opens the pairing window, waits up to `timeout` for a scan-found
    /// notification, then runs the per-sensor key exchange and
    /// verification. Restores the prior scan-found handler on every exit
    /// path.
    pub fn scan(&self, timeout: Duration) -> DongleResult<(String, String, String)> {
        let (tx, rx) = mpsc::sync_channel::<Packet>(1);
        let handler: Handler = Box::new(move |pkt| {
            let _ = tx.try_send(pkt);
        });

        let found = self
            .dispatcher
            .with_temporary_handler(opcode::NOTIFY_SCAN_FOUND, handler, || {
                self.dispatcher.send(&Packet::enable_scan())?;
                rx.recv_timeout(timeout)
                    .map_err(|_| timeout_err(opcode::NOTIFY_SCAN_FOUND, timeout))
            })?;

        let _ = self.dispatcher.send(&Packet::disable_scan());

        let (mac, type_tag, version) = decode_scan_found(found.payload())?;

        self.dispatcher
            .do_command(Packet::get_sensor_r1(&mac, SENSOR_R1_CHALLENGE), self.config.enumeration_timeout)?;
        self.dispatcher
            .do_command(Packet::verify_sensor(&mac), self.config.enumeration_timeout)?;

        Ok((mac, type_tag, version))
    }

    /// Unpairs `mac`. The dongle's reply echoes the MAC followed by a
    /// `0xFF` terminator; any other reply is a protocol violation.
    pub fn delete(&self, mac: &str) -> DongleResult<()> {
        let reply = self
            .dispatcher
            .do_command(Packet::del_sensor(mac), self.config.default_timeout)?;
        let mut expected = mac.as_bytes().to_vec();
        expected.push(0xFF);
        if reply.payload() != expected.as_slice() {
            return Err(DongleError::ProtocolViolation(format!(
                "unexpected DelSensor reply for {mac}"
            )));
        }
        Ok(())
    }

    /// Experimental: unpairs every sensor. Callers should tolerate
    /// `Unsupported` from this on firmware that never acknowledges it.
    pub fn delete_all(&self) -> DongleResult<()> {
        match self
            .dispatcher
            .do_command(Packet::del_all_sensors(), self.config.default_timeout)
        {
            Ok(_) => Ok(()),
            Err(DongleError::Timeout { .. }) => Err(DongleError::Unsupported(
                "DelAllSensors is experimental and was not acknowledged by this dongle".into(),
            )),
            Err(e) => Err(e),
        }
    }

    /// Plays a chime on `mac`. `volume` is clamped to 1..9 by the packet
    /// factory. Firmware that doesn't support chime playback surfaces as
    /// `Unsupported` rather than a bare timeout.
    pub fn play_chime(&self, mac: &str, ring: u8, repeat: u8, volume: u8) -> DongleResult<()> {
        match self.dispatcher.do_command(
            Packet::play_chime(mac, ring, repeat, volume),
            self.config.default_timeout,
        ) {
            Ok(_) => Ok(()),
            Err(DongleError::Timeout { .. }) => Err(DongleError::Unsupported(
                "PlayChime was not acknowledged by this dongle firmware".into(),
            )),
            Err(e) => Err(e),
        }
    }

    /// Blocks for up to `timeout` for the next decoded sensor event.
    pub fn recv_event(&self, timeout: Duration) -> Option<SensorEvent> {
        self.events_rx.lock().unwrap().recv_timeout(timeout).ok()
    }

    pub fn check_error(&self) -> Option<String> {
        self.dispatcher.check_error()
    }

    /// Two-phase shutdown: flag the reader thread to exit, then join it.
    pub fn stop(&self) {
        self.dispatcher.stop();
        if let Some(handle) = self.reader_handle.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

fn timeout_err(opcode: u16, timeout: Duration) -> DongleError {
    DongleError::Timeout {
        opcode,
        millis: timeout.as_millis() as u64,
    }
}

fn ascii_string(bytes: &[u8]) -> Option<String> {
    std::str::from_utf8(bytes).ok().map(|s| s.to_string())
}

/// Parses a `NOTIFY_SCAN_FOUND` payload:
/// `[_:1][mac_raw:4][_:4][sensor_type:1][version:1]`.
fn decode_scan_found(payload: &[u8]) -> DongleResult<(String, String, String)> {
    if payload.len() < 11 {
        return Err(DongleError::ProtocolViolation(format!(
            "scan-found payload too short: got {} bytes, need 11",
            payload.len()
        )));
    }
    let mac = payload[1..5]
        .iter()
        .map(|b| format!("{b:02X}"))
        .collect::<String>();
    let sensor_type = SensorType::from_byte(payload[9]).tag();
    let version = payload[10].to_string();
    Ok((mac, sensor_type, version))
}

fn install_notification_handlers(dispatcher: &std::sync::Arc<Dispatcher>, tx: mpsc::SyncSender<SensorEvent>) {
    {
        let tx = tx.clone();
        dispatcher.set_persistent_handler(
            opcode::NOTIFY_ALARM,
            Box::new(move |pkt| match event::decode_alarm_payload(pkt.payload()) {
                Ok(event) => {
                    if tx.try_send(event).is_err() {
                        warn!("sensor event channel full, dropping event");
                    }
                }
                Err(e) => warn!(error = %e, "failed to decode alarm payload"),
            }),
        );
    }

    dispatcher.set_persistent_handler(opcode::NOTIFY_SCAN_FOUND, Box::new(|_pkt| {}));

    dispatcher.set_persistent_handler(
        opcode::NOTIFY_EVENT_LOG,
        Box::new(|pkt| match event::decode_event_log_payload(pkt.payload()) {
            Ok((timestamp_ms, message)) => {
                debug!(timestamp_ms, message = ?message, "dongle event log");
            }
            Err(e) => warn!(error = %e, "failed to decode event-log payload"),
        }),
    );

    {
        let dispatcher_for_handler = dispatcher.clone();
        dispatcher.set_persistent_handler(
            opcode::NOTIFY_SYNC_TIME,
            Box::new(move |_pkt| {
                let now_ms = std::time::SystemTime::now()
                    .duration_since(std::time::UNIX_EPOCH)
                    .unwrap_or_default()
                    .as_millis() as u64;
                if let Err(e) = dispatcher_for_handler.send(&Packet::sync_time_ack(now_ms)) {
                    warn!(error = %e, "failed to send sync-time ack");
                }
            }),
        );
    }

    dispatcher.set_persistent_handler(
        opcode::NOTIFY_HMS_EVENT,
        Box::new(move |pkt| match event::decode_hms_payload(pkt.payload()) {
            Ok(event) => {
                if tx.try_send(event).is_err() {
                    warn!("sensor event channel full, dropping event");
                }
            }
            Err(e) => warn!(error = %e, "failed to decode HMS payload"),
        }),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame;
    use crate::transport::scripted::ScriptedTransport;

    fn reply(opcode: u16, payload: Vec<u8>) -> Vec<u8> {
        frame::encode(&Packet::Command { opcode, payload })
    }

    fn handshake_reads() -> Vec<Vec<u8>> {
        vec![
            reply(opcode::reply_opcode(opcode::INQUIRY), vec![0x01]),
            reply(opcode::reply_opcode(opcode::GET_ENR), vec![0u8; 16]),
            reply(opcode::reply_opcode(opcode::GET_MAC), b"AABBCCDD".to_vec()),
            reply(opcode::reply_opcode(opcode::GET_VERSION), b"4.0.1".to_vec()),
            reply(opcode::reply_opcode(opcode::FINISH_AUTH), Vec::new()),
        ]
    }

    fn open_session(extra_reads: Vec<Vec<u8>>) -> DongleSession {
        let mut transport = ScriptedTransport::new();
        for r in handshake_reads() {
            transport.push_read(r);
        }
        for r in extra_reads {
            transport.push_read(r);
        }
        DongleSession::new(Box::new(transport), Config::default()).expect("handshake should succeed")
    }

    #[test]
    fn handshake_populates_session_fields() {
        let session = open_session(vec![]);
        assert_eq!(session.mac, "AABBCCDD");
        assert_eq!(session.version, "4.0.1");
        assert_eq!(session.enr, [0u8; 16]);
        session.stop();
    }

    #[test]
    fn handshake_failure_tears_down_reader() {
        let mut transport = ScriptedTransport::new();
        transport.push_read(reply(opcode::reply_opcode(opcode::INQUIRY), vec![0x02]));
        let result = DongleSession::new(Box::new(transport), Config::default());
        assert!(matches!(result, Err(DongleError::ProtocolViolation(_))));
    }

    #[test]
    fn list_returns_empty_when_count_is_zero() {
        let session = open_session(vec![reply(opcode::reply_opcode(opcode::GET_SENSOR_COUNT), vec![0])]);
        let macs = session.list().unwrap();
        assert!(macs.is_empty());
        session.stop();
    }

    #[test]
    fn list_collects_n_mac_frames() {
        let session = open_session(vec![
            reply(opcode::reply_opcode(opcode::GET_SENSOR_COUNT), vec![2]),
            reply(opcode::reply_opcode(opcode::GET_SENSOR_LIST), b"AAAAAAAA".to_vec()),
            reply(opcode::reply_opcode(opcode::GET_SENSOR_LIST), b"BBBBBBBB".to_vec()),
        ]);
        let macs = session.list().unwrap();
        assert_eq!(macs, vec!["AAAAAAAA".to_string(), "BBBBBBBB".to_string()]);
        session.stop();
    }

    #[test]
    fn delete_accepts_mac_plus_ff_terminator() {
        let mut echoed = b"AABBCCDD".to_vec();
        echoed.push(0xFF);
        let session = open_session(vec![reply(opcode::reply_opcode(opcode::DEL_SENSOR), echoed)]);
        session.delete("AABBCCDD").unwrap();
        session.stop();
    }

    #[test]
    fn play_chime_timeout_surfaces_as_unsupported() {
        let session = open_session(vec![]);
        let result = session.play_chime("AABBCCDD", 1, 1, 5);
        assert!(matches!(result, Err(DongleError::Unsupported(_))));
        session.stop();
    }

    #[test]
    fn scan_runs_key_exchange_and_verify() {
        // scan-found payload: [_][mac raw 77 6A 5C E1][_ x4][type=switch][version=23]
        let found_payload = vec![0x00, 0x77, 0x6A, 0x5C, 0xE1, 0x30, 0x30, 0x30, 0x30, 0x01, 0x17];
        let session = open_session(vec![
            reply(opcode::NOTIFY_SCAN_FOUND, found_payload),
            reply(opcode::reply_opcode(opcode::GET_SENSOR_R1), Vec::new()),
            reply(opcode::reply_opcode(opcode::VERIFY_SENSOR), Vec::new()),
        ]);

        let (mac, type_tag, version) = session.scan(Duration::from_secs(5)).unwrap();
        assert_eq!(mac, "776A5CE1");
        assert_eq!(type_tag, "switch");
        assert_eq!(version, "23");
        session.stop();
    }

    #[test]
    fn alarm_notification_is_decoded_and_delivered() {
        let mut payload = 0u64.to_be_bytes().to_vec();
        payload.push(0xA2);
        payload.extend_from_slice(b"776A5CE1");
        payload.extend_from_slice(&[0x0E, 0x00, 60, 0x00, 0x00, 0x01, 75]);
        let session = open_session(vec![reply(opcode::NOTIFY_ALARM, payload)]);

        let event = session
            .recv_event(Duration::from_secs(2))
            .expect("alarm event should arrive");
        assert_eq!(event.mac, "776A5CE1");
        assert_eq!(event.battery, 100);
        assert_eq!(event.signal_dbm, -75);
        session.stop();
    }
}
