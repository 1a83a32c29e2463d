//! Call journal and fault injection shared by the in-memory devices.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use labtransit_core::DeviceError;
use parking_lot::Mutex;
use tracing::debug;

use crate::traits::DeviceResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Start,
    End,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalEntry {
    pub device: &'static str,
    pub call: &'static str,
    pub phase: Phase,
}

impl JournalEntry {
    /// `device.call`, e.g. `arm.connect`.
    pub fn label(&self) -> String {
        format!("{}.{}", self.device, self.call)
    }
}

/// Ordered record of device calls across a whole rig.
#[derive(Debug, Clone, Default)]
pub struct CallJournal {
    entries: Arc<Mutex<Vec<JournalEntry>>>,
}

impl CallJournal {
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&self, device: &'static str, call: &'static str, phase: Phase) {
        self.entries.lock().push(JournalEntry {
            device,
            call,
            phase,
        });
    }

    pub fn entries(&self) -> Vec<JournalEntry> {
        self.entries.lock().clone()
    }

    /// Labels of every call that was started, in order.
    pub fn calls(&self) -> Vec<String> {
        self.entries
            .lock()
            .iter()
            .filter(|e| e.phase == Phase::Start)
            .map(JournalEntry::label)
            .collect()
    }

    /// Number of calls started.
    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .iter()
            .filter(|e| e.phase == Phase::Start)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Position of an entry, if it was recorded.
    pub fn position(&self, label: &str, phase: Phase) -> Option<usize> {
        self.entries
            .lock()
            .iter()
            .position(|e| e.phase == phase && e.label() == label)
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}

#[derive(Debug, Clone)]
enum Fault {
    Once(String),
    Always(String),
}

/// Per-device scripted latency and failures.
#[derive(Debug)]
pub struct FaultInjector {
    device: &'static str,
    journal: CallJournal,
    faults: Mutex<HashMap<&'static str, Fault>>,
    latency: Mutex<HashMap<&'static str, Duration>>,
}

impl FaultInjector {
    pub fn new(device: &'static str, journal: CallJournal) -> Self {
        Self {
            device,
            journal,
            faults: Mutex::new(HashMap::new()),
            latency: Mutex::new(HashMap::new()),
        }
    }

    /// Reject every future `call` with `message`.
    pub fn fail_on(&self, call: &'static str, message: impl Into<String>) {
        self.faults.lock().insert(call, Fault::Always(message.into()));
    }

    /// Reject only the next `call`.
    pub fn fail_once(&self, call: &'static str, message: impl Into<String>) {
        self.faults.lock().insert(call, Fault::Once(message.into()));
    }

    /// Make `call` take at least `delay`.
    pub fn delay(&self, call: &'static str, delay: Duration) {
        self.latency.lock().insert(call, delay);
    }

    pub fn clear(&self) {
        self.faults.lock().clear();
        self.latency.lock().clear();
    }

    fn take_fault(&self, call: &'static str) -> Option<String> {
        let mut faults = self.faults.lock();
        match faults.get(call).cloned() {
            Some(Fault::Always(message)) => Some(message),
            Some(Fault::Once(message)) => {
                faults.remove(call);
                Some(message)
            }
            None => None,
        }
    }

    /// Journal the call, apply latency and faults, then run `apply`.
    pub async fn perform<T>(
        &self,
        call: &'static str,
        apply: impl FnOnce() -> DeviceResult<T>,
    ) -> DeviceResult<T> {
        self.journal.record(self.device, call, Phase::Start);

        let delay = self.latency.lock().get(call).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let result = match self.take_fault(call) {
            Some(message) => Err(DeviceError::rejected(self.device, call, message)),
            None => apply(),
        };

        if let Err(e) = &result {
            debug!("{}", e);
        }
        self.journal.record(self.device, call, Phase::End);
        result
    }
}
