//! LabTransit Devices — collaborator contracts for the incubator, robotic arm
//! and microscopes.
//!
//! The orchestrator only sees the async traits in [`traits`]. The concrete RPC
//! transport to real hardware lives outside this workspace; [`memory`]
//! provides in-memory devices with latency and fault injection, used by the
//! bench rig and by tests.

pub mod journal;
pub mod memory;
pub mod traits;

pub use journal::{CallJournal, FaultInjector, JournalEntry, Phase};
pub use memory::{
    InMemoryArm, InMemoryIncubator, InMemoryMicroscope, InMemoryVirtualMicroscope,
};
pub use traits::*;

use std::collections::HashMap;
use std::sync::Arc;

use labtransit_core::{MicroscopeId, MicroscopeKind, TransportConfig};

/// Devices the orchestrator drives, addressed through their contracts.
#[derive(Clone)]
pub struct DeviceSet {
    pub incubator: Arc<dyn Incubator>,
    pub arm: Arc<dyn RoboticArm>,
    pub microscopes: HashMap<MicroscopeId, Arc<dyn Microscope>>,
    pub virtual_microscopes: HashMap<MicroscopeId, Arc<dyn VirtualMicroscope>>,
}

/// In-memory rig with typed handles kept for fault injection and inspection.
pub struct BenchRig {
    pub incubator: Arc<InMemoryIncubator>,
    pub arm: Arc<InMemoryArm>,
    pub microscopes: HashMap<MicroscopeId, Arc<InMemoryMicroscope>>,
    pub virtual_microscopes: HashMap<MicroscopeId, Arc<InMemoryVirtualMicroscope>>,
    pub journal: CallJournal,
}

impl BenchRig {
    /// Erase the concrete types for the orchestrator.
    pub fn device_set(&self) -> DeviceSet {
        DeviceSet {
            incubator: self.incubator.clone(),
            arm: self.arm.clone(),
            microscopes: self
                .microscopes
                .iter()
                .map(|(id, m)| (*id, m.clone() as Arc<dyn Microscope>))
                .collect(),
            virtual_microscopes: self
                .virtual_microscopes
                .iter()
                .map(|(id, m)| (*id, m.clone() as Arc<dyn VirtualMicroscope>))
                .collect(),
        }
    }
}

/// Build an in-memory rig matching the configured microscopes and slot layout.
pub fn create_bench_rig(config: &TransportConfig) -> BenchRig {
    let journal = CallJournal::new();
    let incubator = Arc::new(InMemoryIncubator::new(
        config.bench_slots.clone(),
        journal.clone(),
    ));
    let arm = Arc::new(InMemoryArm::new(journal.clone()));

    let mut microscopes = HashMap::new();
    let mut virtual_microscopes = HashMap::new();
    for microscope in &config.microscopes {
        match microscope.kind {
            MicroscopeKind::Physical => {
                microscopes.insert(
                    microscope.id,
                    Arc::new(InMemoryMicroscope::new(microscope.id, journal.clone())),
                );
            }
            MicroscopeKind::Virtual => {
                virtual_microscopes.insert(
                    microscope.id,
                    Arc::new(InMemoryVirtualMicroscope::new(microscope.id, journal.clone())),
                );
            }
        }
    }

    tracing::info!(
        "Bench rig: {} slots, {} physical and {} virtual microscopes",
        config.bench_slots.len(),
        microscopes.len(),
        virtual_microscopes.len()
    );

    BenchRig {
        incubator,
        arm,
        microscopes,
        virtual_microscopes,
        journal,
    }
}
