//! Shared application state.

use std::sync::Arc;

use labtransit_core::LabTransitConfig;
use labtransit_devices::{create_bench_rig, BenchRig};
use labtransit_runtime::TransportOrchestrator;

/// Shared application state accessible from all route handlers.
pub struct AppState {
    pub config: LabTransitConfig,
    pub orchestrator: Arc<TransportOrchestrator>,
    /// Concrete devices behind the orchestrator's traits.
    pub rig: BenchRig,
}

impl AppState {
    pub fn new(config: LabTransitConfig) -> Self {
        let rig = create_bench_rig(&config.transport);
        let orchestrator = Arc::new(TransportOrchestrator::new(
            rig.device_set(),
            &config.transport,
        ));

        Self {
            config,
            orchestrator,
            rig,
        }
    }
}
