//! Dongle protocol engine and sensor-event model for a 433 MHz
//! sensor-to-dongle bridge.
//!
//! The engine layer (`transport` → `frame` → `packet` → `dispatcher` →
//! `session`) speaks the dongle's half-duplex framed protocol; `event`
//! decodes the notification payloads it carries into `SensorEvent`s;
//! `registry` tracks paired sensors and their derived availability.
//! Wiring this engine to an MQTT broker is outside this crate.

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod event;
pub mod frame;
pub mod opcode;
pub mod packet;
pub mod registry;
pub mod session;
pub mod transport;

pub use config::Config;
pub use error::{DongleError, DongleResult};
pub use event::SensorEvent;
pub use session::DongleSession;
