use thiserror::Error;

/// Errors surfaced by the dongle protocol engine.
///
/// `FrameShort` from the wire codec never reaches here — it is resolved
/// internally by the dispatcher, which just waits for more bytes.
#[derive(Debug, Error)]
pub enum DongleError {
    #[error("HID transport failure: {0}")]
    TransportFailure(String),

    #[error("invalid frame: {0}")]
    FrameInvalid(String),

    #[error("command {opcode:#06x} timed out after {millis}ms")]
    Timeout { opcode: u16, millis: u64 },

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("dongle firmware does not support this operation: {0}")]
    Unsupported(String),

    #[error("reader thread fault: {0}")]
    WorkerFault(String),
}

pub type DongleResult<T> = Result<T, DongleError>;
