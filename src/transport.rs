//! Raw-HID transport to the dongle: open, read, write 64-byte reports.
//!
//! The dispatcher only ever talks to the `HidTransport` trait, not to
//! `hidapi` directly, so the reader-thread tests in `dispatcher` can
//! substitute a scripted in-memory transport instead of a real device.

use crate::error::{DongleError, DongleResult};

const REPORT_SIZE: usize = 64;
const MAX_PAYLOAD: usize = 0x3F;

pub trait HidTransport: Send {
    /// Returns the payload bytes of at most one HID report. An empty
    /// vector means no data was available right now (not an error); the
    /// dispatcher sleeps briefly and retries.
    fn read(&mut self) -> DongleResult<Vec<u8>>;

    /// Writes an already-serialised packet. A short write is reported as
    /// `TransportFailure`, never silently retried.
    fn write(&mut self, frame: &[u8]) -> DongleResult<()>;
}

/// Splits a raw 64-byte HID report into its declared payload.
///
/// Exposed standalone so it can be unit-tested without a real device.
pub fn extract_payload(report: &[u8]) -> &[u8] {
    if report.is_empty() {
        return &[];
    }
    let declared_len = (report[0] as usize).min(MAX_PAYLOAD);
    let available = report.len().saturating_sub(1).min(declared_len);
    &report[1..1 + available]
}

pub struct HidapiTransport {
    device: hidapi::HidDevice,
}

impl HidapiTransport {
    pub fn open(vendor_id: u16, product_id: u16) -> DongleResult<Self> {
        let api = hidapi::HidApi::new()
            .map_err(|e| DongleError::TransportFailure(format!("hidapi init failed: {e}")))?;
        let device = api
            .open(vendor_id, product_id)
            .map_err(|e| DongleError::TransportFailure(format!("open failed: {e}")))?;
        device.set_blocking_mode(false).map_err(|e| {
            DongleError::TransportFailure(format!("failed to set non-blocking mode: {e}"))
        })?;
        Ok(Self { device })
    }

    pub fn open_path(path: &std::ffi::CStr) -> DongleResult<Self> {
        let api = hidapi::HidApi::new()
            .map_err(|e| DongleError::TransportFailure(format!("hidapi init failed: {e}")))?;
        let device = api
            .open_path(path)
            .map_err(|e| DongleError::TransportFailure(format!("open failed: {e}")))?;
        device.set_blocking_mode(false).map_err(|e| {
            DongleError::TransportFailure(format!("failed to set non-blocking mode: {e}"))
        })?;
        Ok(Self { device })
    }
}

impl HidTransport for HidapiTransport {
    fn read(&mut self) -> DongleResult<Vec<u8>> {
        let mut report = [0u8; REPORT_SIZE];
        match self.device.read(&mut report) {
            Ok(0) => Ok(Vec::new()),
            Ok(n) => Ok(extract_payload(&report[..n]).to_vec()),
            // hidapi surfaces "no data" as an error on some platforms in
            // non-blocking mode; treat every read error as an empty read,
            // matching the raw-hidraw `ERROR -> empty read` contract.
            Err(_) => Ok(Vec::new()),
        }
    }

    fn write(&mut self, frame: &[u8]) -> DongleResult<()> {
        let written = self
            .device
            .write(frame)
            .map_err(|e| DongleError::TransportFailure(format!("write failed: {e}")))?;
        if written != frame.len() {
            return Err(DongleError::TransportFailure(format!(
                "short write: wrote {written} of {} bytes",
                frame.len()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
pub mod scripted {
    use super::*;
    use std::collections::VecDeque;

    /// An in-memory transport for dispatcher/session tests: reads are
    /// served from a queue of pre-scripted chunks, writes are captured.
    pub struct ScriptedTransport {
        pub pending_reads: VecDeque<Vec<u8>>,
        pub writes: Vec<Vec<u8>>,
    }

    impl ScriptedTransport {
        pub fn new() -> Self {
            Self {
                pending_reads: VecDeque::new(),
                writes: Vec::new(),
            }
        }

        pub fn push_read(&mut self, bytes: Vec<u8>) {
            self.pending_reads.push_back(bytes);
        }
    }

    impl HidTransport for ScriptedTransport {
        fn read(&mut self) -> DongleResult<Vec<u8>> {
            Ok(self.pending_reads.pop_front().unwrap_or_default())
        }

        fn write(&mut self, frame: &[u8]) -> DongleResult<()> {
            self.writes.push(frame.to_vec());
            Ok(())
        }
    }
}
