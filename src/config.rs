//! Typed, `serde`-serializable configuration surface.
//!
//! No YAML loader lives here — that's the out-of-scope gateway binary's
//! job. `Config::default()` gives the floor values from the dongle's
//! timeout contract; callers override fields programmatically.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    pub hid_device_path: Option<PathBuf>,
    #[serde(with = "duration_millis")]
    pub default_timeout: Duration,
    #[serde(with = "duration_millis")]
    pub enumeration_timeout: Duration,
    #[serde(with = "duration_millis")]
    pub scan_timeout: Duration,
    #[serde(with = "duration_millis")]
    pub availability_tick_interval: Duration,
    pub registry_config_path: PathBuf,
    pub registry_state_path: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            hid_device_path: None,
            default_timeout: Duration::from_secs(2),
            enumeration_timeout: Duration::from_secs(10),
            scan_timeout: Duration::from_secs(60),
            availability_tick_interval: Duration::from_secs(5),
            registry_config_path: PathBuf::from("sensors.json"),
            registry_state_path: PathBuf::from("sensors_state.json"),
        }
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let millis = u64::deserialize(d)?;
        Ok(Duration::from_millis(millis))
    }
}
