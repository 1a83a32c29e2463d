//! Configuration loading: environment plus `transport.json`.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::location::{Location, MicroscopeId, Slot, Specimen};

pub const CONFIG_FILE_NAME: &str = "transport.json";

/// Whether a microscope receives physical specimens or virtual datasets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MicroscopeKind {
    Physical,
    Virtual,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MicroscopeConfig {
    pub id: MicroscopeId,
    pub name: String,
    pub kind: MicroscopeKind,
}

/// Transport settings persisted in `transport.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    #[serde(default = "default_microscopes")]
    pub microscopes: Vec<MicroscopeConfig>,
    #[serde(default = "default_specimens")]
    pub virtual_specimens: Vec<Specimen>,
    /// Upper bound for every incubator and microscope call.
    #[serde(default = "default_device_timeout")]
    pub device_call_timeout_secs: u64,
    /// Upper bound for the arm's incubator/microscope moves.
    #[serde(default = "default_arm_timeout")]
    pub arm_transport_timeout_secs: u64,
    /// Push every registry write to the incubator's location store.
    #[serde(default = "default_true")]
    pub sync_incubator_location: bool,
    /// Slot layout served by the in-memory incubator.
    #[serde(default = "default_bench_slots")]
    pub bench_slots: Vec<Slot>,
    /// Path to config file (not serialized).
    #[serde(skip)]
    pub config_path: PathBuf,
}

fn default_microscopes() -> Vec<MicroscopeConfig> {
    vec![
        MicroscopeConfig {
            id: 1,
            name: "Microscope 1".into(),
            kind: MicroscopeKind::Physical,
        },
        MicroscopeConfig {
            id: 99,
            name: "Virtual microscope".into(),
            kind: MicroscopeKind::Virtual,
        },
    ]
}
fn default_specimens() -> Vec<Specimen> {
    vec![
        Specimen::new("hela-live", "HeLa live imaging"),
        Specimen::new("organoid-z", "Organoid z-stack"),
        Specimen::new("neuron-ca", "Neuron calcium series"),
    ]
}
fn default_device_timeout() -> u64 {
    60
}
fn default_arm_timeout() -> u64 {
    300
}
fn default_true() -> bool {
    true
}
fn default_bench_slots() -> Vec<Slot> {
    (1..=6)
        .map(|n| {
            let name = if n <= 3 { format!("S{}", n) } else { String::new() };
            Slot::new(n, name, Location::IncubatorSlot)
        })
        .collect()
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            microscopes: default_microscopes(),
            virtual_specimens: default_specimens(),
            device_call_timeout_secs: default_device_timeout(),
            arm_transport_timeout_secs: default_arm_timeout(),
            sync_incubator_location: true,
            bench_slots: default_bench_slots(),
            config_path: PathBuf::new(),
        }
    }
}

impl TransportConfig {
    /// Load config from `transport.json` in `config_dir`, or return defaults.
    pub fn load(config_dir: &Path) -> Result<Self> {
        let config_path = config_dir.join(CONFIG_FILE_NAME);
        let mut config: TransportConfig = match std::fs::read_to_string(&config_path) {
            Ok(s) => serde_json::from_str(&s)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("No {} in {}, using defaults", CONFIG_FILE_NAME, config_dir.display());
                TransportConfig::default()
            }
            Err(e) => return Err(e.into()),
        };
        config.config_path = config_path;
        Ok(config)
    }

    /// Reject layouts the orchestrator cannot run against.
    pub fn validate(&self) -> Result<()> {
        if self.device_call_timeout_secs == 0 || self.arm_transport_timeout_secs == 0 {
            return Err(Error::Config("device timeouts must be non-zero".into()));
        }

        let mut ids = HashSet::new();
        for microscope in &self.microscopes {
            if !ids.insert(microscope.id) {
                return Err(Error::Config(format!(
                    "duplicate microscope id {}",
                    microscope.id
                )));
            }
        }

        let mut specimens = HashSet::new();
        for specimen in &self.virtual_specimens {
            if !specimens.insert(specimen.id.as_str()) {
                return Err(Error::Config(format!(
                    "duplicate virtual specimen id {}",
                    specimen.id
                )));
            }
        }

        let mut slots = HashSet::new();
        let mut on_stage = HashMap::new();
        for slot in &self.bench_slots {
            if !slots.insert(slot.slot_number) {
                return Err(Error::Config(format!(
                    "duplicate bench slot {}",
                    slot.slot_number
                )));
            }
            if let Location::Microscope(microscope) = slot.location {
                if let Some(other) = on_stage.insert(microscope, slot.slot_number) {
                    return Err(Error::Config(format!(
                        "bench slots {} and {} are both on microscope {}",
                        other, slot.slot_number, microscope
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn microscope(&self, id: MicroscopeId) -> Option<&MicroscopeConfig> {
        self.microscopes.iter().find(|m| m.id == id)
    }

    pub fn device_call_timeout(&self) -> Duration {
        Duration::from_secs(self.device_call_timeout_secs)
    }

    pub fn arm_transport_timeout(&self) -> Duration {
        Duration::from_secs(self.arm_transport_timeout_secs)
    }
}

/// Top-level LabTransit configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LabTransitConfig {
    /// HTTP server port.
    pub port: u16,
    pub config_dir: PathBuf,
    pub transport: TransportConfig,
}

impl LabTransitConfig {
    /// Create configuration from environment, `transport.json`, and defaults.
    pub fn from_env(config_dir: impl AsRef<Path>) -> Result<Self> {
        let port = std::env::var("PORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(3010);

        let config_dir = config_dir.as_ref().to_path_buf();
        let mut transport = TransportConfig::load(&config_dir)?;

        if let Some(secs) = env_secs("LABTRANSIT_DEVICE_TIMEOUT_SECS") {
            transport.device_call_timeout_secs = secs;
        }
        if let Some(secs) = env_secs("LABTRANSIT_ARM_TIMEOUT_SECS") {
            transport.arm_transport_timeout_secs = secs;
        }
        transport.validate()?;

        Ok(Self {
            port,
            config_dir,
            transport,
        })
    }
}

fn env_secs(name: &str) -> Option<u64> {
    let raw = std::env::var(name).ok()?;
    match raw.parse() {
        Ok(secs) => Some(secs),
        Err(_) => {
            warn!("Ignoring {}={:?}: not a whole number of seconds", name, raw);
            None
        }
    }
}
