//! In-memory and persisted model of paired sensors, with last-seen /
//! online derivation and a periodic availability sweep.
//!
//! Mutation from the dispatcher thread and reads from the availability
//! tick happen on different threads, so entries are kept behind an
//! `RwLock` even though writes are effectively single-writer in practice.

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::{Arc, RwLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::event::SensorType;

const V2_FIRMWARE_VERSIONS: &[&str] = &["23", "24", "25"];
const DEFAULT_TIMEOUT_V1: Duration = Duration::from_secs(8 * 3600);
const DEFAULT_TIMEOUT_V2: Duration = Duration::from_secs(4 * 3600);
const STALE_STATE_AGE: Duration = Duration::from_secs(3600);

const INVALID_MACS: &[&str] = &["00000000", "\0\0\0\0\0\0\0\0", "ffffffffffffffff"];

/// An ASCII string of exactly 8 characters, rejecting known-bad sentinels.
pub fn valid_sensor_mac(mac: &str) -> bool {
    mac.chars().count() == 8 && mac.is_ascii() && !INVALID_MACS.contains(&mac)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceClass {
    Motion,
    Opening,
    Moisture,
    Temperature,
}

impl DeviceClass {
    pub fn from_sensor_type(t: SensorType) -> Option<Self> {
        match t {
            SensorType::Switch | SensorType::SwitchV2 => Some(DeviceClass::Opening),
            SensorType::Motion | SensorType::MotionV2 => Some(DeviceClass::Motion),
            SensorType::Leak => Some(DeviceClass::Moisture),
            SensorType::Climate => Some(DeviceClass::Temperature),
            _ => None,
        }
    }
}

/// Durable part of a registry entry: what a human or the pairing flow
/// configured. Persisted as the "configuration document".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorConfig {
    pub name: String,
    pub declared_type: SensorType,
    pub device_class: Option<DeviceClass>,
    pub sw_version: Option<String>,
    pub invert_state: bool,
    pub timeout: Option<Duration>,
}

impl SensorConfig {
    fn new_default(mac: &str, declared_type: SensorType, sw_version: Option<String>) -> Self {
        SensorConfig {
            name: format!("Wyze Sense {mac}"),
            declared_type,
            device_class: DeviceClass::from_sensor_type(declared_type),
            sw_version,
            invert_state: false,
            timeout: None,
        }
    }
}

/// Volatile part of a registry entry: derived from traffic. Persisted as
/// the "state document".
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SensorRuntimeState {
    pub last_seen_ms: u64,
    pub online: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorEntry {
    pub mac: String,
    pub config: SensorConfig,
    pub runtime: SensorRuntimeState,
}

impl SensorEntry {
    fn effective_timeout(&self) -> Duration {
        if let Some(t) = self.config.timeout {
            return t;
        }
        let is_v2 = self
            .config
            .sw_version
            .as_deref()
            .map(|v| V2_FIRMWARE_VERSIONS.contains(&v))
            .unwrap_or(false);
        if is_v2 {
            DEFAULT_TIMEOUT_V2
        } else {
            DEFAULT_TIMEOUT_V1
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AvailabilityChange {
    WentOnline,
    WentOffline,
}

#[derive(Debug, Serialize, Deserialize)]
struct StateDocument {
    modified_ms: u64,
    sensors: HashMap<String, SensorRuntimeState>,
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

pub struct SensorRegistry {
    entries: RwLock<HashMap<String, SensorEntry>>,
}

impl SensorRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(SensorRegistry {
            entries: RwLock::new(HashMap::new()),
        })
    }

    pub fn snapshot(&self) -> Vec<SensorEntry> {
        self.entries.read().unwrap().values().cloned().collect()
    }

    pub fn get(&self, mac: &str) -> Option<SensorEntry> {
        self.entries.read().unwrap().get(mac).cloned()
    }

    pub fn contains(&self, mac: &str) -> bool {
        self.entries.read().unwrap().contains_key(mac)
    }

    /// Creates a fresh entry if `mac` isn't already known. Returns `false`
    /// (and logs a warning) for an invalid MAC.
    pub fn ensure_sensor(
        &self,
        mac: &str,
        declared_type: SensorType,
        sw_version: Option<String>,
    ) -> bool {
        if !valid_sensor_mac(mac) {
            warn!(mac, "refusing to register invalid sensor MAC");
            return false;
        }
        let mut entries = self.entries.write().unwrap();
        entries.entry(mac.to_string()).or_insert_with(|| {
            info!(mac, "adding sensor to registry");
            SensorEntry {
                mac: mac.to_string(),
                config: SensorConfig::new_default(mac, declared_type, sw_version),
                runtime: SensorRuntimeState {
                    last_seen_ms: now_ms(),
                    online: true,
                },
            }
        });
        true
    }

    pub fn remove(&self, mac: &str) {
        self.entries.write().unwrap().remove(mac);
    }

    pub fn set_invert_state(&self, mac: &str, invert: bool) {
        if let Some(entry) = self.entries.write().unwrap().get_mut(mac) {
            entry.config.invert_state = invert;
        }
    }

    /// Records a sighting: updates `last_seen` and flips the sensor
    /// online if it wasn't already, returning the transition if one
    /// occurred.
    pub fn record_sighting(&self, mac: &str, timestamp_ms: u64) -> Option<AvailabilityChange> {
        let mut entries = self.entries.write().unwrap();
        let entry = entries.get_mut(mac)?;
        entry.runtime.last_seen_ms = timestamp_ms;
        if entry.runtime.online {
            None
        } else {
            entry.runtime.online = true;
            info!(mac, "sensor back online");
            Some(AvailabilityChange::WentOnline)
        }
    }

    /// One availability sweep: compares `now - last_seen` against each
    /// sensor's timeout, flipping stale sensors offline. Returns the MACs
    /// that transitioned, for the caller to notify downstream.
    pub fn sweep_availability(&self, now: SystemTime) -> Vec<(String, AvailabilityChange)> {
        let now_ms = now
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        let mut transitions = Vec::new();
        let mut entries = self.entries.write().unwrap();
        for entry in entries.values_mut() {
            if !entry.runtime.online {
                continue;
            }
            let age = Duration::from_millis(now_ms.saturating_sub(entry.runtime.last_seen_ms));
            if age > entry.effective_timeout() {
                entry.runtime.online = false;
                info!(mac = %entry.mac, "sensor went offline");
                transitions.push((entry.mac.clone(), AvailabilityChange::WentOffline));
            }
        }
        transitions
    }

    pub fn save(&self, config_path: &Path, state_path: &Path) -> std::io::Result<()> {
        let entries = self.entries.read().unwrap();
        let configs: HashMap<&String, &SensorConfig> =
            entries.iter().map(|(mac, e)| (mac, &e.config)).collect();
        let states: HashMap<String, SensorRuntimeState> = entries
            .iter()
            .map(|(mac, e)| (mac.clone(), e.runtime))
            .collect();
        let state_doc = StateDocument {
            modified_ms: now_ms(),
            sensors: states,
        };

        fs::write(config_path, serde_json::to_vec_pretty(&configs)?)?;
        fs::write(state_path, serde_json::to_vec_pretty(&state_doc)?)?;
        Ok(())
    }

    /// Loads the two registry documents. A state document older than
    /// `STALE_STATE_AGE` is discarded, leaving every sensor's runtime
    /// state at its defaults (last_seen = now, online = true) until the
    /// next real sighting or availability sweep corrects it.
    pub fn load(config_path: &Path, state_path: &Path) -> std::io::Result<Arc<Self>> {
        let configs: HashMap<String, SensorConfig> = match fs::read(config_path) {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(e),
        };

        let state_doc: Option<StateDocument> = match fs::read(state_path) {
            Ok(bytes) => Some(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(e),
        };

        let fresh_states = match &state_doc {
            Some(doc) => {
                let age_ms = now_ms().saturating_sub(doc.modified_ms);
                if Duration::from_millis(age_ms) > STALE_STATE_AGE {
                    warn!("discarding stale sensor state document on load");
                    HashMap::new()
                } else {
                    doc.sensors.clone()
                }
            }
            None => HashMap::new(),
        };

        let mut entries = HashMap::new();
        for (mac, config) in configs {
            let runtime = fresh_states.get(&mac).copied().unwrap_or(SensorRuntimeState {
                last_seen_ms: now_ms(),
                online: true,
            });
            entries.insert(mac.clone(), SensorEntry { mac, config, runtime });
        }

        Ok(Arc::new(SensorRegistry {
            entries: RwLock::new(entries),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration as StdDuration;

    #[test]
    fn rejects_known_bad_macs() {
        assert!(!valid_sensor_mac("00000000"));
        assert!(!valid_sensor_mac("ffffffffffffffff"));
        assert!(!valid_sensor_mac("short"));
        assert!(valid_sensor_mac("AABBCCDD"));
    }

    #[test]
    fn first_sighting_creates_entry_online() {
        let registry = SensorRegistry::new();
        assert!(registry.ensure_sensor("AABBCCDD", SensorType::Switch, None));
        let entry = registry.get("AABBCCDD").unwrap();
        assert!(entry.runtime.online);
        assert_eq!(entry.config.name, "Wyze Sense AABBCCDD");
    }

    #[test]
    fn invalid_mac_is_refused() {
        let registry = SensorRegistry::new();
        assert!(!registry.ensure_sensor("00000000", SensorType::Switch, None));
        assert!(!registry.contains("00000000"));
    }

    #[test]
    fn sensor_goes_offline_after_timeout() {
        let registry = SensorRegistry::new();
        registry.ensure_sensor("AABBCCDD", SensorType::Switch, Some("23".to_string()));
        let base = SystemTime::now() - StdDuration::from_secs(3 * 3600);
        registry.record_sighting("AABBCCDD", base.duration_since(UNIX_EPOCH).unwrap().as_millis() as u64);

        let past_timeout = base + DEFAULT_TIMEOUT_V2 + StdDuration::from_secs(1);
        let transitions = registry.sweep_availability(past_timeout);
        assert_eq!(transitions, vec![("AABBCCDD".to_string(), AvailabilityChange::WentOffline)]);
        assert!(!registry.get("AABBCCDD").unwrap().runtime.online);

        let back_online = registry.record_sighting(
            "AABBCCDD",
            past_timeout.duration_since(UNIX_EPOCH).unwrap().as_millis() as u64,
        );
        assert_eq!(back_online, Some(AvailabilityChange::WentOnline));
        assert!(registry.get("AABBCCDD").unwrap().runtime.online);
    }

    #[test]
    fn save_and_load_round_trips_configuration() {
        let registry = SensorRegistry::new();
        registry.ensure_sensor("AABBCCDD", SensorType::Motion, Some("23".into()));
        registry.set_invert_state("AABBCCDD", true);

        let dir = std::env::temp_dir().join(format!("sense-dongle-gateway-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let config_path = dir.join("sensors.json");
        let state_path = dir.join("state.json");

        registry.save(&config_path, &state_path).unwrap();
        let reloaded = SensorRegistry::load(&config_path, &state_path).unwrap();
        let entry = reloaded.get("AABBCCDD").unwrap();
        assert!(entry.config.invert_state);
        assert_eq!(entry.config.declared_type, SensorType::Motion);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn stale_state_document_discarded_on_load() {
        let registry = SensorRegistry::new();
        registry.ensure_sensor("AABBCCDD", SensorType::Switch, None);

        let dir = std::env::temp_dir().join(format!("sense-dongle-gateway-test-stale-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let config_path = dir.join("sensors.json");
        let state_path = dir.join("state.json");
        registry.save(&config_path, &state_path).unwrap();

        let mut stale_doc: StateDocument = serde_json::from_slice(&std::fs::read(&state_path).unwrap()).unwrap();
        stale_doc.modified_ms = now_ms() - Duration::from_secs(3600 * 2).as_millis() as u64;
        std::fs::write(&state_path, serde_json::to_vec(&stale_doc).unwrap()).unwrap();

        let reloaded = SensorRegistry::load(&config_path, &state_path).unwrap();
        let entry = reloaded.get("AABBCCDD").unwrap();
        // runtime state was discarded and re-defaulted, so it reports online
        // again rather than carrying over the (stale) persisted value.
        assert!(entry.runtime.online);

        std::fs::remove_dir_all(&dir).ok();
    }
}
