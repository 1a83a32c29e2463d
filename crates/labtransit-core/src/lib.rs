//! LabTransit Core — location model, error taxonomy, configuration.

pub mod config;
pub mod error;
pub mod location;

pub use config::{LabTransitConfig, MicroscopeConfig, MicroscopeKind, TransportConfig};
pub use error::{DeviceError, Error, Result};
pub use location::{Location, MicroscopeId, Slot, SlotNumber, Specimen};
