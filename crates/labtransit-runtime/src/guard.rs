//! Single-flight guard: at most one transport operation system-wide.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use labtransit_core::{Error, Result};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::debug;
use uuid::Uuid;

/// Who currently holds the guard.
#[derive(Debug, Clone, Serialize)]
pub struct FlightHolder {
    #[serde(rename = "operationId")]
    pub operation_id: Uuid,
    pub label: String,
    #[serde(rename = "acquiredAt")]
    pub acquired_at: DateTime<Utc>,
    #[serde(skip)]
    token: u64,
}

#[derive(Debug, Default)]
struct GuardState {
    holder: Option<FlightHolder>,
    next_token: u64,
}

#[derive(Debug, Default)]
pub struct SingleFlightGuard {
    state: Mutex<GuardState>,
}

impl SingleFlightGuard {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Take the guard, or fail with `GuardBusy` if anyone holds it.
    ///
    /// The returned permit releases the guard when dropped.
    pub fn acquire(self: &Arc<Self>, operation_id: Uuid, label: impl Into<String>) -> Result<FlightPermit> {
        let mut state = self.state.lock();
        if let Some(holder) = &state.holder {
            return Err(Error::GuardBusy(format!(
                "{} is running since {}",
                holder.label,
                holder.acquired_at.to_rfc3339()
            )));
        }

        state.next_token += 1;
        let token = state.next_token;
        let label = label.into();
        debug!("Guard acquired: {} ({})", label, operation_id);
        state.holder = Some(FlightHolder {
            operation_id,
            label,
            acquired_at: Utc::now(),
            token,
        });

        Ok(FlightPermit {
            guard: Arc::clone(self),
            token,
        })
    }

    /// Clear the guard whoever holds it. Idempotent.
    pub fn release(&self) {
        if let Some(holder) = self.state.lock().holder.take() {
            debug!("Guard released: {}", holder.label);
        }
    }

    fn release_token(&self, token: u64) {
        let mut state = self.state.lock();
        if state.holder.as_ref().map(|h| h.token) == Some(token) {
            if let Some(holder) = state.holder.take() {
                debug!("Guard released: {}", holder.label);
            }
        }
    }

    pub fn is_held(&self) -> bool {
        self.state.lock().holder.is_some()
    }

    pub fn holder(&self) -> Option<FlightHolder> {
        self.state.lock().holder.clone()
    }
}

/// Proof of holding the guard. Dropping it releases the guard, but only if
/// this permit's holder is still the current one.
#[derive(Debug)]
pub struct FlightPermit {
    guard: Arc<SingleFlightGuard>,
    token: u64,
}

impl FlightPermit {
    pub fn release(self) {
        drop(self);
    }
}

impl Drop for FlightPermit {
    fn drop(&mut self) {
        self.guard.release_token(self.token);
    }
}
