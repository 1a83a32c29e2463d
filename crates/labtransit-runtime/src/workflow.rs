//! Workflow state machines and the saga log.
//!
//! Each operation kind walks a fixed path of states; `Failed` is reachable
//! from any non-terminal state. The saga log records completed device steps
//! and the location each one established, which is what compensation
//! restores.

use chrono::{DateTime, Utc};
use labtransit_core::{Error, Location, Result};
use serde::Serialize;

use crate::types::OperationKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum WorkflowState {
    Idle,
    // Load
    PreparingTransfer,
    AwaitingArmAndStage,
    TransportingToMicroscope,
    // Unload
    HomingStage,
    PreparingArm,
    TransportingToIncubator,
    StoringInSlot,
    // Virtual microscopes
    Binding,
    // Shared tail
    Finalizing,
    Succeeded,
    Failed,
}

impl WorkflowState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

/// Which path a machine follows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum WorkflowPath {
    Load,
    Unload,
    VirtualLoad,
    VirtualUnload,
}

impl WorkflowPath {
    pub fn physical(kind: OperationKind) -> Self {
        match kind {
            OperationKind::Load => Self::Load,
            OperationKind::Unload => Self::Unload,
        }
    }

    pub fn virtual_(kind: OperationKind) -> Self {
        match kind {
            OperationKind::Load => Self::VirtualLoad,
            OperationKind::Unload => Self::VirtualUnload,
        }
    }

    /// Legal forward sequence, `Idle` to `Succeeded`.
    pub fn states(&self) -> &'static [WorkflowState] {
        use WorkflowState::*;
        match self {
            Self::Load => &[
                Idle,
                PreparingTransfer,
                AwaitingArmAndStage,
                TransportingToMicroscope,
                Finalizing,
                Succeeded,
            ],
            Self::Unload => &[
                Idle,
                HomingStage,
                PreparingArm,
                TransportingToIncubator,
                StoringInSlot,
                Finalizing,
                Succeeded,
            ],
            Self::VirtualLoad | Self::VirtualUnload => &[Idle, Binding, Succeeded],
        }
    }

    pub fn allows(&self, from: WorkflowState, to: WorkflowState) -> bool {
        if to == WorkflowState::Failed {
            return !from.is_terminal();
        }
        self.states()
            .windows(2)
            .any(|pair| pair[0] == from && pair[1] == to)
    }
}

/// Explicit state machine for one operation.
#[derive(Debug, Clone)]
pub struct WorkflowMachine {
    path: WorkflowPath,
    state: WorkflowState,
    /// State before `Failed`, kept for reporting.
    last_active: WorkflowState,
}

impl WorkflowMachine {
    pub fn new(path: WorkflowPath) -> Self {
        Self {
            path,
            state: WorkflowState::Idle,
            last_active: WorkflowState::Idle,
        }
    }

    pub fn state(&self) -> WorkflowState {
        self.state
    }

    pub fn path(&self) -> WorkflowPath {
        self.path
    }

    /// Last state reached before failing (or the current state).
    pub fn last_active(&self) -> WorkflowState {
        self.last_active
    }

    pub fn advance(&mut self, to: WorkflowState) -> Result<()> {
        if !self.path.allows(self.state, to) {
            return Err(Error::Internal(format!(
                "illegal {:?} workflow transition {:?} -> {:?}",
                self.path, self.state, to
            )));
        }
        if to != WorkflowState::Failed {
            self.last_active = to;
        }
        self.state = to;
        Ok(())
    }
}

/// Device steps that can complete within a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum TransportStep {
    ArmConnected,
    ArmLightOn,
    SampleAtStation,
    StageHomed,
    SampleOnMicroscope,
    SampleInSlot,
    StageReturned,
    ArmLightOff,
    ArmDisconnected,
    SpecimenBound,
    SpecimenUnbound,
}

#[derive(Debug, Clone, Serialize)]
pub struct CompletedStep {
    pub step: TransportStep,
    /// Location this step established, if it moved the specimen.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<Location>,
    pub at: DateTime<Utc>,
}

/// Completed steps of one operation, in order.
#[derive(Debug, Clone)]
pub struct SagaLog {
    /// Location before the operation; `None` for virtual microscopes.
    origin: Option<Location>,
    completed: Vec<CompletedStep>,
}

impl SagaLog {
    pub fn new(origin: Location) -> Self {
        Self {
            origin: Some(origin),
            completed: Vec::new(),
        }
    }

    /// Saga for an operation that moves no physical specimen.
    pub fn detached() -> Self {
        Self {
            origin: None,
            completed: Vec::new(),
        }
    }

    pub fn record(&mut self, step: TransportStep, location: Option<Location>) {
        self.completed.push(CompletedStep {
            step,
            location,
            at: Utc::now(),
        });
    }

    pub fn has(&self, step: TransportStep) -> bool {
        self.completed.iter().any(|c| c.step == step)
    }

    pub fn steps(&self) -> Vec<TransportStep> {
        self.completed.iter().map(|c| c.step).collect()
    }

    /// Location established by the last completed moving step, falling
    /// back to the origin.
    pub fn settled_location(&self) -> Option<Location> {
        self.completed
            .iter()
            .rev()
            .find_map(|c| c.location)
            .or(self.origin)
    }

    /// The arm was connected and not yet disconnected.
    pub fn arm_engaged(&self) -> bool {
        self.has(TransportStep::ArmConnected) && !self.has(TransportStep::ArmDisconnected)
    }

    /// The arm light was switched on and not yet off.
    pub fn light_left_on(&self) -> bool {
        self.has(TransportStep::ArmLightOn) && !self.has(TransportStep::ArmLightOff)
    }
}
