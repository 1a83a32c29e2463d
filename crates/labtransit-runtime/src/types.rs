//! Runtime types.

use std::time::Duration;

use chrono::{DateTime, Utc};
use labtransit_core::{
    DeviceError, Error, Location, MicroscopeId, SlotNumber, TransportConfig,
};
use serde::Serialize;
use uuid::Uuid;

use crate::workflow::{TransportStep, WorkflowState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Load,
    Unload,
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Load => write!(f, "load"),
            Self::Unload => write!(f, "unload"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
}

/// What an operation moves: a physical slot or a virtual specimen.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", content = "id", rename_all = "lowercase")]
pub enum OperationTarget {
    Slot(SlotNumber),
    Specimen(String),
}

impl std::fmt::Display for OperationTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Slot(n) => write!(f, "slot {}", n),
            Self::Specimen(id) => write!(f, "specimen {}", id),
        }
    }
}

/// The in-flight operation. Discarded once it terminates.
#[derive(Debug, Clone, Serialize)]
pub struct Operation {
    pub id: Uuid,
    pub kind: OperationKind,
    pub target: OperationTarget,
    #[serde(rename = "microscopeId")]
    pub microscope_id: MicroscopeId,
    pub status: OperationStatus,
    pub state: WorkflowState,
    #[serde(rename = "startedAt")]
    pub started_at: DateTime<Utc>,
    pub log: Vec<String>,
}

/// Why an operation ended in `Failed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", content = "detail", rename_all = "lowercase")]
pub enum TransportFailure {
    /// A device rejected a call or did not answer in time.
    Device(DeviceError),
    /// The orchestrator attempted an illegal transition.
    Defect(String),
}

impl std::fmt::Display for TransportFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Device(e) => write!(f, "{}", e),
            Self::Defect(msg) => write!(f, "internal defect: {}", msg),
        }
    }
}

impl From<DeviceError> for TransportFailure {
    fn from(e: DeviceError) -> Self {
        Self::Device(e)
    }
}

impl From<Error> for TransportFailure {
    fn from(e: Error) -> Self {
        match e {
            Error::DeviceCall(device) => Self::Device(device),
            other => Self::Defect(other.to_string()),
        }
    }
}

/// Terminal report of an operation, returned to whoever ran it.
#[derive(Debug, Clone, Serialize)]
pub struct OperationOutcome {
    #[serde(rename = "operationId")]
    pub operation_id: Uuid,
    pub kind: OperationKind,
    pub target: OperationTarget,
    #[serde(rename = "microscopeId")]
    pub microscope_id: MicroscopeId,
    pub status: OperationStatus,
    /// `Succeeded`, or the state that was active when the operation failed.
    #[serde(rename = "lastState")]
    pub last_state: WorkflowState,
    /// Registry location of the slot after the operation (physical only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<Location>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<TransportFailure>,
    #[serde(rename = "completedSteps")]
    pub completed_steps: Vec<TransportStep>,
    pub log: Vec<String>,
    #[serde(rename = "startedAt")]
    pub started_at: DateTime<Utc>,
    #[serde(rename = "finishedAt")]
    pub finished_at: DateTime<Utc>,
}

impl OperationOutcome {
    pub fn succeeded(&self) -> bool {
        self.status == OperationStatus::Succeeded
    }
}

/// Upper bounds for device calls. Expiry counts as a rejection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportTimeouts {
    pub device_call: Duration,
    pub arm_transport: Duration,
}

impl Default for TransportTimeouts {
    fn default() -> Self {
        Self {
            device_call: Duration::from_secs(60),
            arm_transport: Duration::from_secs(300),
        }
    }
}

impl From<&TransportConfig> for TransportTimeouts {
    fn from(config: &TransportConfig) -> Self {
        Self {
            device_call: config.device_call_timeout(),
            arm_transport: config.arm_transport_timeout(),
        }
    }
}
