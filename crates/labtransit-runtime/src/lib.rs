//! Runtime orchestrator — moves specimens between incubator, arm and
//! microscope while keeping the location registry consistent.
//!
//! The [`TransportOrchestrator`] is the only writer of the
//! [`LocationRegistry`]. Every operation runs under the process-wide
//! [`SingleFlightGuard`], reports progress to the [`WorkflowLog`], and on
//! failure compensates the registry from its saga log.

pub mod guard;
pub mod log;
pub mod orchestrator;
pub mod registry;
pub mod selection;
pub mod types;
pub mod workflow;

pub use guard::{FlightHolder, FlightPermit, SingleFlightGuard};
pub use log::{LogEntry, LogEvent, LogLevel, Notification, NotificationKind, WorkflowLog};
pub use orchestrator::{PendingTransport, TransportOrchestrator};
pub use registry::LocationRegistry;
pub use selection::{Selection, SelectionPolicy};
pub use types::*;
pub use workflow::{
    CompletedStep, SagaLog, TransportStep, WorkflowMachine, WorkflowPath, WorkflowState,
};
