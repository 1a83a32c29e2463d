//! Device collaborator contracts.
//!
//! Every call is asynchronous and may reject. Callers bound each call with a
//! timeout; implementations do not need to.

use async_trait::async_trait;
use labtransit_core::{DeviceError, Location, MicroscopeId, Slot, SlotNumber, Specimen};
use serde::Serialize;

pub type DeviceResult<T> = std::result::Result<T, DeviceError>;

pub const INCUBATOR: &str = "incubator";
pub const ARM: &str = "arm";
pub const MICROSCOPE: &str = "microscope";
pub const VIRTUAL_MICROSCOPE: &str = "virtual-microscope";

/// Physical presence reported by the incubator for a slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SampleStatus {
    In,
    Out,
    Other(String),
}

impl SampleStatus {
    /// Parse the incubator's raw status string (`"IN"` means present).
    pub fn from_report(raw: &str) -> Self {
        match raw.trim().to_ascii_uppercase().as_str() {
            "IN" => Self::In,
            "OUT" => Self::Out,
            _ => Self::Other(raw.trim().to_string()),
        }
    }

    pub fn is_in(&self) -> bool {
        *self == Self::In
    }
}

/// Stage position of a physical microscope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StagePosition {
    Home,
    Working,
    Unknown,
}

#[derive(Debug, Clone, Serialize)]
pub struct MicroscopeStatus {
    #[serde(rename = "microscopeId")]
    pub microscope_id: MicroscopeId,
    pub ready: bool,
    pub stage: StagePosition,
}

#[async_trait]
pub trait Incubator: Send + Sync {
    async fn get_slot_information(&self) -> DeviceResult<Vec<Slot>>;

    async fn get_sample_status(&self, slot: SlotNumber) -> DeviceResult<SampleStatus>;

    async fn get_sample_from_slot_to_transfer_station(&self, slot: SlotNumber) -> DeviceResult<()>;

    async fn put_sample_from_transfer_station_to_slot(&self, slot: SlotNumber) -> DeviceResult<()>;

    /// Persist a tracked location on the incubator side.
    async fn update_sample_location(&self, slot: SlotNumber, location: Location)
        -> DeviceResult<()>;
}

#[async_trait]
pub trait RoboticArm: Send + Sync {
    async fn connect(&self) -> DeviceResult<()>;

    async fn disconnect(&self) -> DeviceResult<()>;

    async fn light_on(&self) -> DeviceResult<()>;

    async fn light_off(&self) -> DeviceResult<()>;

    /// Pick up at the transfer station and place on the microscope stage.
    async fn incubator_to_microscope(&self, microscope: MicroscopeId) -> DeviceResult<()>;

    /// Pick up from the microscope stage and place at the transfer station.
    async fn microscope_to_incubator(&self, microscope: MicroscopeId) -> DeviceResult<()>;
}

#[async_trait]
pub trait Microscope: Send + Sync {
    async fn home_stage(&self) -> DeviceResult<()>;

    async fn return_stage(&self) -> DeviceResult<()>;

    async fn get_status(&self) -> DeviceResult<MicroscopeStatus>;
}

/// Microscope that shows stored datasets instead of physical specimens.
///
/// Binding is a single atomic call; there is nothing to transport.
#[async_trait]
pub trait VirtualMicroscope: Send + Sync {
    async fn bind(&self, specimen: &Specimen) -> DeviceResult<()>;

    async fn unbind(&self) -> DeviceResult<()>;
}
