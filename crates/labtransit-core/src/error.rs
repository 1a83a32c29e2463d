//! Error types for LabTransit.

use serde::Serialize;
use thiserror::Error;

use crate::location::{Location, SlotNumber};

#[derive(Error, Debug)]
pub enum Error {
    /// Selection or tracked state is invalid before any device call.
    #[error("Precondition failed: {0}")]
    Precondition(String),

    /// An incubator, arm or microscope call rejected or timed out.
    #[error("Device call failed: {0}")]
    DeviceCall(#[from] DeviceError),

    /// Another transport operation holds the single-flight guard.
    #[error("Transport busy: {0}")]
    GuardBusy(String),

    /// A registry write outside the location edge set. Indicates a defect.
    #[error("Invalid location transition for slot {slot}: {from} -> {to}")]
    InvalidTransition {
        slot: SlotNumber,
        from: Location,
        to: Location,
    },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Failure reported by a device collaborator.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum DeviceError {
    #[error("{device} rejected {call}: {message}")]
    Rejected {
        device: &'static str,
        call: &'static str,
        message: String,
    },

    #[error("{device} {call} timed out after {after_ms}ms")]
    Timeout {
        device: &'static str,
        call: &'static str,
        #[serde(rename = "afterMs")]
        after_ms: u64,
    },

    #[error("{device} unavailable: {message}")]
    Unavailable {
        device: &'static str,
        message: String,
    },
}

impl DeviceError {
    pub fn rejected(device: &'static str, call: &'static str, message: impl Into<String>) -> Self {
        Self::Rejected {
            device,
            call,
            message: message.into(),
        }
    }

    /// Name of the device that produced the error.
    pub fn device(&self) -> &'static str {
        match self {
            Self::Rejected { device, .. }
            | Self::Timeout { device, .. }
            | Self::Unavailable { device, .. } => device,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}
