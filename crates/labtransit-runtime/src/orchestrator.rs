//! Transport orchestrator: runs Load and Unload as compensable sagas.
//!
//! An operation is split in two phases. `prepare_*` takes the single-flight
//! guard and checks every precondition without moving anything; the
//! returned [`PendingTransport`] owns the guard permit and runs the device
//! sequence when awaited. Callers that want a synchronous answer use
//! `load`/`unload`, which do both.
//!
//! Registry updates follow physical progress: a location is written only
//! after the device call that established it returned. When a step fails,
//! the registry is set back to the location established by the last
//! completed moving step.

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use labtransit_core::{
    DeviceError, Error, Location, MicroscopeConfig, MicroscopeId, MicroscopeKind, Result,
    SlotNumber, Specimen, TransportConfig,
};
use labtransit_devices::{
    DeviceResult, DeviceSet, Microscope, MicroscopeStatus, VirtualMicroscope, ARM, INCUBATOR,
    MICROSCOPE, VIRTUAL_MICROSCOPE,
};
use parking_lot::RwLock;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::guard::{FlightPermit, SingleFlightGuard};
use crate::log::{LogLevel, NotificationKind, WorkflowLog};
use crate::registry::LocationRegistry;
use crate::selection::{Selection, SelectionPolicy};
use crate::types::{
    Operation, OperationKind, OperationOutcome, OperationStatus, OperationTarget,
    TransportFailure, TransportTimeouts,
};
use crate::workflow::{SagaLog, TransportStep, WorkflowMachine, WorkflowPath, WorkflowState};

type StepResult = std::result::Result<(), TransportFailure>;

/// Await a device call, mapping expiry of `limit` to [`DeviceError::Timeout`].
async fn bounded<T>(
    device: &'static str,
    call: &'static str,
    limit: Duration,
    fut: impl Future<Output = DeviceResult<T>>,
) -> DeviceResult<T> {
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(DeviceError::Timeout {
            device,
            call,
            after_ms: limit.as_millis() as u64,
        }),
    }
}

pub struct TransportOrchestrator {
    devices: DeviceSet,
    microscopes: Vec<MicroscopeConfig>,
    specimens: Vec<Specimen>,
    timeouts: TransportTimeouts,
    sync_incubator_location: bool,
    registry: Arc<LocationRegistry>,
    guard: Arc<SingleFlightGuard>,
    log: Arc<WorkflowLog>,
    current: RwLock<Option<Operation>>,
    virtual_bindings: RwLock<HashMap<MicroscopeId, Specimen>>,
}

impl TransportOrchestrator {
    pub fn new(devices: DeviceSet, config: &TransportConfig) -> Self {
        Self {
            devices,
            microscopes: config.microscopes.clone(),
            specimens: config.virtual_specimens.clone(),
            timeouts: TransportTimeouts::from(config),
            sync_incubator_location: config.sync_incubator_location,
            registry: Arc::new(LocationRegistry::new()),
            guard: SingleFlightGuard::new(),
            log: Arc::new(WorkflowLog::new()),
            current: RwLock::new(None),
            virtual_bindings: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_timeouts(mut self, timeouts: TransportTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Start from an existing registry instead of an empty one.
    pub fn with_registry(mut self, registry: Arc<LocationRegistry>) -> Self {
        self.registry = registry;
        self
    }

    pub fn registry(&self) -> &Arc<LocationRegistry> {
        &self.registry
    }

    pub fn guard(&self) -> &Arc<SingleFlightGuard> {
        &self.guard
    }

    pub fn log(&self) -> &Arc<WorkflowLog> {
        &self.log
    }

    pub fn timeouts(&self) -> TransportTimeouts {
        self.timeouts
    }

    pub fn microscopes(&self) -> &[MicroscopeConfig] {
        &self.microscopes
    }

    pub fn specimens(&self) -> &[Specimen] {
        &self.specimens
    }

    pub fn microscope_config(&self, id: MicroscopeId) -> Option<&MicroscopeConfig> {
        self.microscopes.iter().find(|m| m.id == id)
    }

    /// The operation holding the guard, if any.
    pub fn current_operation(&self) -> Option<Operation> {
        let holder = self.guard.holder()?;
        self.current
            .read()
            .as_ref()
            .filter(|op| op.id == holder.operation_id)
            .cloned()
    }

    /// Dataset currently shown on a virtual microscope.
    pub fn virtual_binding(&self, microscope: MicroscopeId) -> Option<Specimen> {
        self.virtual_bindings.read().get(&microscope).cloned()
    }

    /// What may be selected for `microscope` right now.
    pub fn selection(&self, microscope: MicroscopeId) -> Result<Selection> {
        let config = self
            .microscope_config(microscope)
            .ok_or_else(|| Error::NotFound(format!("microscope {}", microscope)))?;
        Ok(SelectionPolicy::evaluate(
            config,
            &self.registry.snapshot(),
            &self.specimens,
            self.guard.is_held(),
        ))
    }

    pub async fn microscope_status(&self, microscope: MicroscopeId) -> Result<MicroscopeStatus> {
        let device = self.physical_microscope(microscope)?;
        let status = bounded(
            MICROSCOPE,
            "get_status",
            self.timeouts.device_call,
            device.get_status(),
        )
        .await?;
        Ok(status)
    }

    /// Replace the registry with the incubator's slot information.
    ///
    /// Refused while an operation is in flight.
    pub async fn refresh_slots(&self) -> Result<usize> {
        let _permit = self.guard.acquire(Uuid::new_v4(), "slot refresh")?;
        let slots = bounded(
            INCUBATOR,
            "get_slot_information",
            self.timeouts.device_call,
            self.devices.incubator.get_slot_information(),
        )
        .await?;
        let count = slots.len();
        if let Err(e) = self.registry.refresh(slots) {
            self.log.error(None, format!("Slot refresh refused: {}", e));
            return Err(e);
        }
        self.log
            .info(None, format!("Refreshed {} slots from the incubator", count));
        Ok(count)
    }

    /// Operator override after a failure that needed manual intervention.
    ///
    /// Skips the edge check but still refuses to put a second specimen on a
    /// microscope. Returns the previous location.
    pub async fn correct_location(&self, slot: SlotNumber, location: Location) -> Result<Location> {
        let id = Uuid::new_v4();
        let _permit = self
            .guard
            .acquire(id, format!("location correction of slot {}", slot))?;

        if let Location::Microscope(microscope) = location {
            self.physical_microscope(microscope)?;
            if let Some(other) = self.registry.bound_to(microscope) {
                if other != slot {
                    return Err(Error::Precondition(format!(
                        "microscope {} already holds slot {}",
                        microscope, other
                    )));
                }
            }
        }

        let previous = self.registry.set(slot, location)?;
        self.log.warn(
            Some(id),
            format!(
                "Operator corrected slot {}: {} -> {}",
                slot, previous, location
            ),
        );
        self.sync_location(Some(id), slot, location).await;
        Ok(previous)
    }

    // ---------------------------------------------------------------
    // Preparation
    // ---------------------------------------------------------------

    /// Validate a load of `slot` onto `microscope` and reserve the guard.
    pub async fn prepare_load(
        self: &Arc<Self>,
        slot: SlotNumber,
        microscope: MicroscopeId,
    ) -> Result<PendingTransport> {
        let id = Uuid::new_v4();
        let permit = self.guard.acquire(
            id,
            format!("load of slot {} onto microscope {}", slot, microscope),
        )?;

        match self.check_load(slot, microscope).await {
            Ok(device) => Ok(self.pending(
                permit,
                id,
                OperationKind::Load,
                microscope,
                Plan::Load {
                    slot,
                    microscope,
                    device,
                },
            )),
            Err(e) => Err(self.rejected(
                format!("Load of slot {} onto microscope {}", slot, microscope),
                e,
            )),
        }
    }

    /// Validate an unload of `slot` from `microscope` and reserve the guard.
    pub async fn prepare_unload(
        self: &Arc<Self>,
        slot: SlotNumber,
        microscope: MicroscopeId,
    ) -> Result<PendingTransport> {
        let id = Uuid::new_v4();
        let permit = self.guard.acquire(
            id,
            format!("unload of slot {} from microscope {}", slot, microscope),
        )?;

        match self.check_unload(slot, microscope) {
            Ok(device) => Ok(self.pending(
                permit,
                id,
                OperationKind::Unload,
                microscope,
                Plan::Unload {
                    slot,
                    microscope,
                    device,
                },
            )),
            Err(e) => Err(self.rejected(
                format!("Unload of slot {} from microscope {}", slot, microscope),
                e,
            )),
        }
    }

    pub async fn prepare_virtual_load(
        self: &Arc<Self>,
        microscope: MicroscopeId,
        specimen_id: &str,
    ) -> Result<PendingTransport> {
        let id = Uuid::new_v4();
        let permit = self.guard.acquire(
            id,
            format!("binding of {} to microscope {}", specimen_id, microscope),
        )?;

        let checked = self.virtual_microscope(microscope).and_then(|device| {
            let specimen = self
                .specimens
                .iter()
                .find(|s| s.id == specimen_id)
                .cloned()
                .ok_or_else(|| {
                    Error::Precondition(format!("unknown virtual specimen {}", specimen_id))
                })?;
            Ok((device, specimen))
        });

        match checked {
            Ok((device, specimen)) => Ok(self.pending(
                permit,
                id,
                OperationKind::Load,
                microscope,
                Plan::VirtualLoad {
                    microscope,
                    specimen,
                    device,
                },
            )),
            Err(e) => Err(self.rejected(
                format!("Binding of {} to microscope {}", specimen_id, microscope),
                e,
            )),
        }
    }

    pub async fn prepare_virtual_unload(
        self: &Arc<Self>,
        microscope: MicroscopeId,
    ) -> Result<PendingTransport> {
        let id = Uuid::new_v4();
        let permit = self
            .guard
            .acquire(id, format!("unbinding of microscope {}", microscope))?;

        let checked = self.virtual_microscope(microscope).and_then(|device| {
            let specimen = self.virtual_binding(microscope).ok_or_else(|| {
                Error::Precondition(format!("nothing is bound to microscope {}", microscope))
            })?;
            Ok((device, specimen))
        });

        match checked {
            Ok((device, specimen)) => Ok(self.pending(
                permit,
                id,
                OperationKind::Unload,
                microscope,
                Plan::VirtualUnload {
                    microscope,
                    specimen,
                    device,
                },
            )),
            Err(e) => Err(self.rejected(format!("Unbinding of microscope {}", microscope), e)),
        }
    }

    // ---------------------------------------------------------------
    // One-shot entry points
    // ---------------------------------------------------------------

    /// Load `slot` onto `microscope` and wait for the outcome.
    ///
    /// `Err` means nothing was attempted. Device failures during the run
    /// come back as a failed [`OperationOutcome`].
    pub async fn load(
        self: &Arc<Self>,
        slot: SlotNumber,
        microscope: MicroscopeId,
    ) -> Result<OperationOutcome> {
        Ok(self.prepare_load(slot, microscope).await?.run().await)
    }

    pub async fn unload(
        self: &Arc<Self>,
        slot: SlotNumber,
        microscope: MicroscopeId,
    ) -> Result<OperationOutcome> {
        Ok(self.prepare_unload(slot, microscope).await?.run().await)
    }

    pub async fn load_virtual(
        self: &Arc<Self>,
        microscope: MicroscopeId,
        specimen_id: &str,
    ) -> Result<OperationOutcome> {
        Ok(self
            .prepare_virtual_load(microscope, specimen_id)
            .await?
            .run()
            .await)
    }

    pub async fn unload_virtual(self: &Arc<Self>, microscope: MicroscopeId) -> Result<OperationOutcome> {
        Ok(self.prepare_virtual_unload(microscope).await?.run().await)
    }

    // ---------------------------------------------------------------
    // Checks
    // ---------------------------------------------------------------

    fn physical_microscope(&self, id: MicroscopeId) -> Result<Arc<dyn Microscope>> {
        let config = self
            .microscope_config(id)
            .ok_or_else(|| Error::Precondition(format!("microscope {} is not configured", id)))?;
        if config.kind != MicroscopeKind::Physical {
            return Err(Error::Precondition(format!(
                "microscope {} is virtual and takes no physical specimens",
                id
            )));
        }
        self.devices
            .microscopes
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::Config(format!("no device attached for microscope {}", id)))
    }

    fn virtual_microscope(&self, id: MicroscopeId) -> Result<Arc<dyn VirtualMicroscope>> {
        let config = self
            .microscope_config(id)
            .ok_or_else(|| Error::Precondition(format!("microscope {} is not configured", id)))?;
        if config.kind != MicroscopeKind::Virtual {
            return Err(Error::Precondition(format!(
                "microscope {} is physical and needs a slot",
                id
            )));
        }
        self.devices
            .virtual_microscopes
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::Config(format!("no device attached for microscope {}", id)))
    }

    async fn check_load(
        &self,
        slot: SlotNumber,
        microscope: MicroscopeId,
    ) -> Result<Arc<dyn Microscope>> {
        let device = self.physical_microscope(microscope)?;
        SelectionPolicy::validate_slot(
            &self.registry.snapshot(),
            microscope,
            slot,
            OperationKind::Load,
        )?;

        // The guard is held, so nothing else writes the registry while we wait.
        let status = bounded(
            INCUBATOR,
            "get_sample_status",
            self.timeouts.device_call,
            self.devices.incubator.get_sample_status(slot),
        )
        .await?;
        if !status.is_in() {
            return Err(Error::Precondition(format!(
                "incubator reports slot {} as {:?}, expected IN",
                slot, status
            )));
        }
        Ok(device)
    }

    fn check_unload(&self, slot: SlotNumber, microscope: MicroscopeId) -> Result<Arc<dyn Microscope>> {
        let device = self.physical_microscope(microscope)?;
        SelectionPolicy::validate_slot(
            &self.registry.snapshot(),
            microscope,
            slot,
            OperationKind::Unload,
        )?;
        Ok(device)
    }

    /// Record a refused request. Nothing ran, so there is no notification.
    fn rejected(&self, what: String, e: Error) -> Error {
        self.log.warn(None, format!("{} rejected: {}", what, e));
        e
    }

    fn pending(
        self: &Arc<Self>,
        permit: FlightPermit,
        id: Uuid,
        kind: OperationKind,
        microscope: MicroscopeId,
        plan: Plan,
    ) -> PendingTransport {
        *self.current.write() = Some(Operation {
            id,
            kind,
            target: plan.target(),
            microscope_id: microscope,
            status: OperationStatus::Pending,
            state: WorkflowState::Idle,
            started_at: Utc::now(),
            log: Vec::new(),
        });
        PendingTransport {
            orchestrator: Arc::clone(self),
            permit,
            id,
            kind,
            plan,
        }
    }

    // ---------------------------------------------------------------
    // Execution
    // ---------------------------------------------------------------

    async fn execute(&self, id: Uuid, kind: OperationKind, plan: Plan) -> OperationOutcome {
        let mut run = self.start_run(id, kind, &plan);
        let started = format!("{} started", run.describe());
        self.progress(&mut run, LogLevel::Info, started);

        let result = match &plan {
            Plan::Load {
                slot,
                microscope,
                device,
            } => self.run_load(&mut run, *slot, *microscope, device.as_ref()).await,
            Plan::Unload {
                slot,
                microscope,
                device,
            } => self.run_unload(&mut run, *slot, *microscope, device.as_ref()).await,
            Plan::VirtualLoad {
                microscope,
                specimen,
                device,
            } => {
                self.run_bind(&mut run, *microscope, specimen, device.as_ref())
                    .await
            }
            Plan::VirtualUnload {
                microscope,
                specimen,
                device,
            } => {
                self.run_unbind(&mut run, *microscope, specimen, device.as_ref())
                    .await
            }
        };
        let result = result.and_then(|()| {
            self.enter(&mut run, WorkflowState::Succeeded)
                .map_err(TransportFailure::from)
        });

        let outcome = match result {
            Ok(()) => self.succeed(run),
            Err(failure) => self.fail(run, failure).await,
        };
        self.current.write().take();
        outcome
    }

    fn start_run(&self, id: Uuid, kind: OperationKind, plan: &Plan) -> WorkflowRun {
        let (path, saga, slot) = match plan {
            Plan::Load { slot, .. } | Plan::Unload { slot, .. } => {
                // Checked during preparation; the guard has been held since.
                let origin = self.registry.get(*slot).unwrap_or(Location::IncubatorSlot);
                (WorkflowPath::physical(kind), SagaLog::new(origin), Some(*slot))
            }
            Plan::VirtualLoad { .. } | Plan::VirtualUnload { .. } => {
                (WorkflowPath::virtual_(kind), SagaLog::detached(), None)
            }
        };
        let run = WorkflowRun {
            id,
            kind,
            target: plan.target(),
            microscope: plan.microscope(),
            slot,
            machine: WorkflowMachine::new(path),
            saga,
            status: OperationStatus::Running,
            lines: Vec::new(),
            started_at: Utc::now(),
        };
        self.publish(&run);
        run
    }

    async fn run_load(
        &self,
        run: &mut WorkflowRun,
        slot: SlotNumber,
        microscope: MicroscopeId,
        device: &dyn Microscope,
    ) -> StepResult {
        let arm = &self.devices.arm;
        let incubator = &self.devices.incubator;
        let limit = self.timeouts.device_call;

        self.enter(run, WorkflowState::PreparingTransfer)?;
        self.progress(run, LogLevel::Info, "Connecting to robotic arm");
        bounded(ARM, "connect", limit, arm.connect()).await?;
        run.saga.record(TransportStep::ArmConnected, None);
        bounded(ARM, "light_on", limit, arm.light_on()).await?;
        run.saga.record(TransportStep::ArmLightOn, None);

        self.enter(run, WorkflowState::AwaitingArmAndStage)?;
        self.progress(
            run,
            LogLevel::Info,
            format!(
                "Moving slot {} to the transfer station while homing microscope {}",
                slot, microscope
            ),
        );
        let (released, homed) = tokio::join!(
            bounded(
                INCUBATOR,
                "get_sample_from_slot_to_transfer_station",
                limit,
                incubator.get_sample_from_slot_to_transfer_station(slot),
            ),
            bounded(MICROSCOPE, "home_stage", limit, device.home_stage()),
        );
        match (&released, &homed) {
            (Err(_), Err(e)) => {
                self.progress(run, LogLevel::Error, format!("Stage homing also failed: {}", e))
            }
            (Err(_), Ok(())) => run.saga.record(TransportStep::StageHomed, None),
            _ => {}
        }
        released?;
        run.saga
            .record(TransportStep::SampleAtStation, Some(Location::IncubatorStation));
        self.track(run, slot, Location::IncubatorStation).await?;
        homed?;
        run.saga.record(TransportStep::StageHomed, None);

        self.enter(run, WorkflowState::TransportingToMicroscope)?;
        self.track(run, slot, Location::RoboticArm).await?;
        self.progress(
            run,
            LogLevel::Info,
            format!("Robotic arm carrying slot {} to microscope {}", slot, microscope),
        );
        bounded(
            ARM,
            "incubator_to_microscope",
            self.timeouts.arm_transport,
            arm.incubator_to_microscope(microscope),
        )
        .await?;
        run.saga.record(
            TransportStep::SampleOnMicroscope,
            Some(Location::Microscope(microscope)),
        );
        self.track(run, slot, Location::Microscope(microscope)).await?;

        self.finalize(run, microscope, device).await
    }

    async fn run_unload(
        &self,
        run: &mut WorkflowRun,
        slot: SlotNumber,
        microscope: MicroscopeId,
        device: &dyn Microscope,
    ) -> StepResult {
        let arm = &self.devices.arm;
        let limit = self.timeouts.device_call;

        self.enter(run, WorkflowState::HomingStage)?;
        self.progress(
            run,
            LogLevel::Info,
            format!("Homing microscope {} stage", microscope),
        );
        bounded(MICROSCOPE, "home_stage", limit, device.home_stage()).await?;
        run.saga.record(TransportStep::StageHomed, None);

        self.enter(run, WorkflowState::PreparingArm)?;
        self.progress(run, LogLevel::Info, "Connecting to robotic arm");
        bounded(ARM, "connect", limit, arm.connect()).await?;
        run.saga.record(TransportStep::ArmConnected, None);
        bounded(ARM, "light_on", limit, arm.light_on()).await?;
        run.saga.record(TransportStep::ArmLightOn, None);

        self.enter(run, WorkflowState::TransportingToIncubator)?;
        self.track(run, slot, Location::RoboticArm).await?;
        self.progress(
            run,
            LogLevel::Info,
            format!(
                "Robotic arm carrying slot {} from microscope {} to the transfer station",
                slot, microscope
            ),
        );
        bounded(
            ARM,
            "microscope_to_incubator",
            self.timeouts.arm_transport,
            arm.microscope_to_incubator(microscope),
        )
        .await?;
        run.saga
            .record(TransportStep::SampleAtStation, Some(Location::IncubatorStation));
        self.track(run, slot, Location::IncubatorStation).await?;

        self.enter(run, WorkflowState::StoringInSlot)?;
        self.progress(run, LogLevel::Info, format!("Storing sample in slot {}", slot));
        bounded(
            INCUBATOR,
            "put_sample_from_transfer_station_to_slot",
            limit,
            self.devices
                .incubator
                .put_sample_from_transfer_station_to_slot(slot),
        )
        .await?;
        run.saga
            .record(TransportStep::SampleInSlot, Some(Location::IncubatorSlot));
        self.track(run, slot, Location::IncubatorSlot).await?;

        self.finalize(run, microscope, device).await
    }

    /// Shared tail: stage back to working position, arm released.
    async fn finalize(
        &self,
        run: &mut WorkflowRun,
        microscope: MicroscopeId,
        device: &dyn Microscope,
    ) -> StepResult {
        let arm = &self.devices.arm;
        let limit = self.timeouts.device_call;

        self.enter(run, WorkflowState::Finalizing)?;
        self.progress(
            run,
            LogLevel::Info,
            format!("Returning microscope {} stage and releasing the arm", microscope),
        );
        bounded(MICROSCOPE, "return_stage", limit, device.return_stage()).await?;
        run.saga.record(TransportStep::StageReturned, None);
        bounded(ARM, "light_off", limit, arm.light_off()).await?;
        run.saga.record(TransportStep::ArmLightOff, None);
        bounded(ARM, "disconnect", limit, arm.disconnect()).await?;
        run.saga.record(TransportStep::ArmDisconnected, None);
        Ok(())
    }

    async fn run_bind(
        &self,
        run: &mut WorkflowRun,
        microscope: MicroscopeId,
        specimen: &Specimen,
        device: &dyn VirtualMicroscope,
    ) -> StepResult {
        self.enter(run, WorkflowState::Binding)?;
        self.progress(
            run,
            LogLevel::Info,
            format!(
                "Binding dataset {} to microscope {}",
                specimen.dataset_alias, microscope
            ),
        );
        bounded(
            VIRTUAL_MICROSCOPE,
            "bind",
            self.timeouts.device_call,
            device.bind(specimen),
        )
        .await?;
        run.saga.record(TransportStep::SpecimenBound, None);
        self.virtual_bindings
            .write()
            .insert(microscope, specimen.clone());
        Ok(())
    }

    async fn run_unbind(
        &self,
        run: &mut WorkflowRun,
        microscope: MicroscopeId,
        specimen: &Specimen,
        device: &dyn VirtualMicroscope,
    ) -> StepResult {
        self.enter(run, WorkflowState::Binding)?;
        self.progress(
            run,
            LogLevel::Info,
            format!(
                "Unbinding dataset {} from microscope {}",
                specimen.dataset_alias, microscope
            ),
        );
        bounded(
            VIRTUAL_MICROSCOPE,
            "unbind",
            self.timeouts.device_call,
            device.unbind(),
        )
        .await?;
        run.saga.record(TransportStep::SpecimenUnbound, None);
        self.virtual_bindings.write().remove(&microscope);
        Ok(())
    }

    // ---------------------------------------------------------------
    // Bookkeeping
    // ---------------------------------------------------------------

    fn enter(&self, run: &mut WorkflowRun, state: WorkflowState) -> Result<()> {
        run.machine.advance(state)?;
        debug!("Operation {} -> {:?}", run.id, state);
        self.publish(run);
        Ok(())
    }

    fn progress(&self, run: &mut WorkflowRun, level: LogLevel, message: impl Into<String>) {
        let entry = self.log.append(Some(run.id), level, message);
        run.lines.push(entry.message);
        self.publish(run);
    }

    fn publish(&self, run: &WorkflowRun) {
        *self.current.write() = Some(Operation {
            id: run.id,
            kind: run.kind,
            target: run.target.clone(),
            microscope_id: run.microscope,
            status: run.status,
            state: run.machine.state(),
            started_at: run.started_at,
            log: run.lines.clone(),
        });
    }

    /// Checked registry write followed by the incubator side channel.
    async fn track(&self, run: &mut WorkflowRun, slot: SlotNumber, location: Location) -> StepResult {
        self.registry.advance(slot, location)?;
        self.sync_location(Some(run.id), slot, location).await;
        Ok(())
    }

    /// Mirror a registry write to the incubator. Failures only warn.
    async fn sync_location(&self, operation: Option<Uuid>, slot: SlotNumber, location: Location) {
        if !self.sync_incubator_location {
            return;
        }
        let synced = bounded(
            INCUBATOR,
            "update_sample_location",
            self.timeouts.device_call,
            self.devices.incubator.update_sample_location(slot, location),
        )
        .await;
        if let Err(e) = synced {
            self.log.warn(
                operation,
                format!("Incubator location sync for slot {} failed: {}", slot, e),
            );
        }
    }

    fn succeed(&self, mut run: WorkflowRun) -> OperationOutcome {
        run.status = OperationStatus::Succeeded;
        let message = format!("{} succeeded", run.describe());
        self.progress(&mut run, LogLevel::Info, message.clone());
        self.log.notify(run.id, NotificationKind::Success, message);
        self.outcome(run, None)
    }

    async fn fail(&self, mut run: WorkflowRun, failure: TransportFailure) -> OperationOutcome {
        run.status = OperationStatus::Failed;
        if let Err(e) = run.machine.advance(WorkflowState::Failed) {
            warn!("{}", e);
        }
        let message = format!("{} failed: {}", run.describe(), failure);
        self.progress(&mut run, LogLevel::Error, message.clone());

        if let Some(slot) = run.slot {
            self.compensate(&mut run, slot).await;
        }
        self.release_arm(&mut run).await;

        self.log.notify(run.id, NotificationKind::Error, message);
        self.outcome(run, Some(failure))
    }

    /// Point the registry at the last location a completed step established.
    async fn compensate(&self, run: &mut WorkflowRun, slot: SlotNumber) {
        let Some(settled) = run.saga.settled_location() else {
            return;
        };
        let tracked = match self.registry.get(slot) {
            Ok(location) => location,
            Err(e) => {
                self.progress(
                    run,
                    LogLevel::Error,
                    format!("Cannot compensate slot {}: {}", slot, e),
                );
                return;
            }
        };

        if tracked == Location::RoboticArm {
            self.progress(
                run,
                LogLevel::Warn,
                format!(
                    "Transport of slot {} was interrupted on the robotic arm; check the arm and correct the location if needed",
                    slot
                ),
            );
        }
        if tracked == settled {
            self.progress(
                run,
                LogLevel::Info,
                format!("Slot {} remains at the {}", slot, settled),
            );
            return;
        }

        match self.registry.set(slot, settled) {
            Ok(previous) => {
                self.progress(
                    run,
                    LogLevel::Warn,
                    format!("Compensated slot {}: {} -> {}", slot, previous, settled),
                );
                self.sync_location(Some(run.id), slot, settled).await;
            }
            Err(e) => self.progress(
                run,
                LogLevel::Error,
                format!("Cannot compensate slot {}: {}", slot, e),
            ),
        }
    }

    /// Best effort: switch the light off and disconnect an engaged arm.
    async fn release_arm(&self, run: &mut WorkflowRun) {
        if !run.saga.arm_engaged() {
            return;
        }
        let arm = &self.devices.arm;
        let limit = self.timeouts.device_call;

        if run.saga.light_left_on() {
            match bounded(ARM, "light_off", limit, arm.light_off()).await {
                Ok(()) => run.saga.record(TransportStep::ArmLightOff, None),
                Err(e) => self.progress(run, LogLevel::Warn, format!("Cleanup: {}", e)),
            }
        }
        match bounded(ARM, "disconnect", limit, arm.disconnect()).await {
            Ok(()) => run.saga.record(TransportStep::ArmDisconnected, None),
            Err(e) => self.progress(run, LogLevel::Warn, format!("Cleanup: {}", e)),
        }
    }

    /// Record an operation cut short by a panic inside a device call.
    fn abandoned(&self, id: Uuid, kind: OperationKind, slot: Option<SlotNumber>) {
        self.current.write().take();
        let message = match slot.map(|slot| (slot, self.registry.get(slot))) {
            Some((slot, Ok(location))) => format!(
                "Transport {} ({}) aborted by a device panic; slot {} is tracked at the {}, check the hardware and correct the location if needed",
                id, kind, slot, location
            ),
            _ => format!("Transport {} ({}) aborted by a device panic", id, kind),
        };
        self.log.error(Some(id), message.clone());
        self.log.notify(id, NotificationKind::Error, message);
    }

    fn outcome(&self, run: WorkflowRun, failure: Option<TransportFailure>) -> OperationOutcome {
        let location = run.slot.and_then(|slot| self.registry.get(slot).ok());
        OperationOutcome {
            operation_id: run.id,
            kind: run.kind,
            target: run.target,
            microscope_id: run.microscope,
            status: run.status,
            last_state: run.machine.last_active(),
            location,
            failure,
            completed_steps: run.saga.steps(),
            log: run.lines,
            started_at: run.started_at,
            finished_at: Utc::now(),
        }
    }
}

/// Validated work for one operation.
enum Plan {
    Load {
        slot: SlotNumber,
        microscope: MicroscopeId,
        device: Arc<dyn Microscope>,
    },
    Unload {
        slot: SlotNumber,
        microscope: MicroscopeId,
        device: Arc<dyn Microscope>,
    },
    VirtualLoad {
        microscope: MicroscopeId,
        specimen: Specimen,
        device: Arc<dyn VirtualMicroscope>,
    },
    VirtualUnload {
        microscope: MicroscopeId,
        specimen: Specimen,
        device: Arc<dyn VirtualMicroscope>,
    },
}

impl Plan {
    fn target(&self) -> OperationTarget {
        match self {
            Self::Load { slot, .. } | Self::Unload { slot, .. } => OperationTarget::Slot(*slot),
            Self::VirtualLoad { specimen, .. } | Self::VirtualUnload { specimen, .. } => {
                OperationTarget::Specimen(specimen.id.clone())
            }
        }
    }

    fn slot(&self) -> Option<SlotNumber> {
        match self {
            Self::Load { slot, .. } | Self::Unload { slot, .. } => Some(*slot),
            Self::VirtualLoad { .. } | Self::VirtualUnload { .. } => None,
        }
    }

    fn microscope(&self) -> MicroscopeId {
        match self {
            Self::Load { microscope, .. }
            | Self::Unload { microscope, .. }
            | Self::VirtualLoad { microscope, .. }
            | Self::VirtualUnload { microscope, .. } => *microscope,
        }
    }
}

/// Mutable state of one running operation.
struct WorkflowRun {
    id: Uuid,
    kind: OperationKind,
    target: OperationTarget,
    microscope: MicroscopeId,
    slot: Option<SlotNumber>,
    machine: WorkflowMachine,
    saga: SagaLog,
    status: OperationStatus,
    lines: Vec<String>,
    started_at: DateTime<Utc>,
}

impl WorkflowRun {
    fn describe(&self) -> String {
        match (self.kind, self.slot) {
            (OperationKind::Load, Some(_)) => {
                format!("Load of {} onto microscope {}", self.target, self.microscope)
            }
            (OperationKind::Unload, Some(_)) => {
                format!("Unload of {} from microscope {}", self.target, self.microscope)
            }
            (kind, None) => format!(
                "Virtual {} of {} on microscope {}",
                kind, self.target, self.microscope
            ),
        }
    }
}

/// A validated operation holding the guard. Awaiting [`run`](Self::run)
/// performs it; dropping it instead releases the guard untouched.
pub struct PendingTransport {
    orchestrator: Arc<TransportOrchestrator>,
    permit: FlightPermit,
    id: Uuid,
    kind: OperationKind,
    plan: Plan,
}

impl PendingTransport {
    pub fn operation_id(&self) -> Uuid {
        self.id
    }

    pub fn kind(&self) -> OperationKind {
        self.kind
    }

    pub fn target(&self) -> OperationTarget {
        self.plan.target()
    }

    /// Run to a terminal state. The guard is released on return, and also
    /// if the future is dropped or a device panics.
    ///
    /// A panicking device skips compensation: the slot keeps whatever
    /// location was last tracked, an error entry and notification ask the
    /// operator to check it, and the panic is resumed.
    pub async fn run(self) -> OperationOutcome {
        let PendingTransport {
            orchestrator,
            permit,
            id,
            kind,
            plan,
        } = self;
        let slot = plan.slot();
        let executed = AssertUnwindSafe(orchestrator.execute(id, kind, plan))
            .catch_unwind()
            .await;
        match executed {
            Ok(outcome) => {
                permit.release();
                outcome
            }
            Err(panic) => {
                orchestrator.abandoned(id, kind, slot);
                permit.release();
                std::panic::resume_unwind(panic)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use labtransit_core::Slot;
    use labtransit_devices::{
        create_bench_rig, BenchRig, Phase, RoboticArm, StagePosition,
    };

    fn config() -> TransportConfig {
        TransportConfig {
            bench_slots: vec![
                Slot::new(3, "S3", Location::IncubatorSlot),
                Slot::new(4, "", Location::IncubatorSlot),
                Slot::new(5, "S5", Location::IncubatorSlot),
            ],
            ..TransportConfig::default()
        }
    }

    async fn setup() -> (Arc<TransportOrchestrator>, BenchRig) {
        setup_with(config()).await
    }

    async fn setup_with(config: TransportConfig) -> (Arc<TransportOrchestrator>, BenchRig) {
        let rig = create_bench_rig(&config);
        let orchestrator = Arc::new(TransportOrchestrator::new(rig.device_set(), &config));
        orchestrator.refresh_slots().await.unwrap();
        rig.journal.clear();
        (orchestrator, rig)
    }

    /// Device calls without the location side channel.
    fn moves(rig: &BenchRig) -> Vec<String> {
        rig.journal
            .calls()
            .into_iter()
            .filter(|c| c != "incubator.update_sample_location")
            .collect()
    }

    #[tokio::test]
    async fn test_load_happy_path() {
        let (orch, rig) = setup().await;
        let outcome = orch.load(3, 1).await.unwrap();

        assert!(outcome.succeeded(), "{:?}", outcome.failure);
        assert_eq!(outcome.location, Some(Location::Microscope(1)));
        assert_eq!(orch.registry().get(3).unwrap(), Location::Microscope(1));
        assert_eq!(
            moves(&rig),
            vec![
                "incubator.get_sample_status",
                "arm.connect",
                "arm.light_on",
                "incubator.get_sample_from_slot_to_transfer_station",
                "microscope.home_stage",
                "arm.incubator_to_microscope",
                "microscope.return_stage",
                "arm.light_off",
                "arm.disconnect",
            ]
        );

        assert!(!orch.guard().is_held());
        assert!(orch.current_operation().is_none());
        assert!(!rig.arm.is_connected());
        assert!(!rig.arm.is_light_on());
        assert_eq!(rig.microscopes[&1].stage(), StagePosition::Working);
        assert_eq!(
            rig.incubator.recorded_location(3),
            Some(Location::Microscope(1))
        );

        let notifications = orch.log().notifications();
        assert_eq!(notifications.len(), 1);
        assert_eq!(notifications[0].kind, NotificationKind::Success);
        assert_eq!(notifications[0].operation_id, outcome.operation_id);
    }

    #[tokio::test]
    async fn test_homing_failure_compensates_to_station() {
        let (orch, rig) = setup().await;
        rig.microscopes[&1].faults.fail_on("home_stage", "stage jammed");

        let outcome = orch.load(3, 1).await.unwrap();
        assert_eq!(outcome.status, OperationStatus::Failed);
        assert_eq!(outcome.last_state, WorkflowState::AwaitingArmAndStage);
        assert!(matches!(
            outcome.failure,
            Some(TransportFailure::Device(DeviceError::Rejected { call: "home_stage", .. }))
        ));
        assert_eq!(orch.registry().get(3).unwrap(), Location::IncubatorStation);
        assert!(!rig.incubator.is_present(3));

        // Arm released even though finalization never ran.
        assert!(!rig.arm.is_connected());
        assert!(!orch.guard().is_held());
        assert_eq!(
            orch.log().notifications()[0].kind,
            NotificationKind::Error
        );
    }

    #[tokio::test]
    async fn test_release_failure_leaves_slot() {
        let (orch, rig) = setup().await;
        rig.incubator
            .faults
            .fail_on("get_sample_from_slot_to_transfer_station", "door stuck");

        let outcome = orch.load(3, 1).await.unwrap();
        assert!(!outcome.succeeded());
        assert_eq!(orch.registry().get(3).unwrap(), Location::IncubatorSlot);
        assert!(outcome
            .completed_steps
            .contains(&TransportStep::StageHomed));
    }

    #[tokio::test]
    async fn test_arm_failure_restores_station_and_warns() {
        let (orch, rig) = setup().await;
        rig.arm
            .faults
            .fail_on("incubator_to_microscope", "gripper fault");

        let outcome = orch.load(3, 1).await.unwrap();
        assert!(!outcome.succeeded());
        assert_eq!(outcome.location, Some(Location::IncubatorStation));
        assert_eq!(
            rig.incubator.recorded_location(3),
            Some(Location::IncubatorStation)
        );
        assert!(outcome.log.iter().any(|l| l.contains("interrupted on the robotic arm")));
    }

    #[tokio::test]
    async fn test_timeout_compensates_like_rejection() {
        let (orch, rig) = setup().await;
        let orch = Arc::new(
            TransportOrchestrator::new(rig.device_set(), &config())
                .with_registry(Arc::clone(orch.registry()))
                .with_timeouts(TransportTimeouts {
                    device_call: Duration::from_secs(5),
                    arm_transport: Duration::from_millis(20),
                }),
        );
        rig.arm
            .faults
            .delay("incubator_to_microscope", Duration::from_millis(500));

        let outcome = orch.load(3, 1).await.unwrap();
        match outcome.failure {
            Some(TransportFailure::Device(e)) => assert!(e.is_timeout()),
            other => panic!("unexpected failure: {:?}", other),
        }
        assert_eq!(orch.registry().get(3).unwrap(), Location::IncubatorStation);
        assert!(!orch.guard().is_held());
    }

    #[tokio::test]
    async fn test_finalize_failure_keeps_microscope() {
        let (orch, rig) = setup().await;
        rig.microscopes[&1].faults.fail_on("return_stage", "motor fault");

        let outcome = orch.load(3, 1).await.unwrap();
        assert_eq!(outcome.status, OperationStatus::Failed);
        assert_eq!(outcome.last_state, WorkflowState::Finalizing);
        assert_eq!(orch.registry().get(3).unwrap(), Location::Microscope(1));
        assert!(!rig.arm.is_connected());
    }

    #[tokio::test]
    async fn test_empty_slot_rejected_without_device_calls() {
        let (orch, rig) = setup().await;
        let err = orch.load(4, 1).await.unwrap_err();
        assert!(matches!(err, Error::Precondition(_)));
        assert!(rig.journal.is_empty());
        assert!(!orch.guard().is_held());
        assert!(orch.log().notifications().is_empty());
    }

    #[tokio::test]
    async fn test_unload_requires_bound_slot() {
        let (orch, rig) = setup().await;
        let before = orch.registry().snapshot();

        let err = orch.unload(3, 1).await.unwrap_err();
        assert!(matches!(err, Error::Precondition(_)));
        assert_eq!(orch.registry().snapshot(), before);
        assert!(rig.journal.is_empty());
    }

    #[tokio::test]
    async fn test_incubator_status_must_be_in() {
        let (orch, rig) = setup().await;
        rig.incubator.set_present(3, false);

        let err = orch.load(3, 1).await.unwrap_err();
        assert!(matches!(err, Error::Precondition(msg) if msg.contains("Out")));
        assert_eq!(rig.journal.calls(), vec!["incubator.get_sample_status"]);
        assert_eq!(orch.registry().get(3).unwrap(), Location::IncubatorSlot);
    }

    #[tokio::test]
    async fn test_status_query_failure_surfaces() {
        let (orch, rig) = setup().await;
        rig.incubator
            .faults
            .fail_on("get_sample_status", "offline");
        let err = orch.load(3, 1).await.unwrap_err();
        assert!(matches!(err, Error::DeviceCall(_)));
        assert!(!orch.guard().is_held());
    }

    #[tokio::test]
    async fn test_second_operation_is_busy() {
        let (orch, rig) = setup().await;
        rig.arm.faults.delay("connect", Duration::from_millis(50));

        let pending = orch.prepare_load(3, 1).await.unwrap();
        let id = pending.operation_id();
        let handle = tokio::spawn(pending.run());

        assert!(matches!(orch.load(5, 1).await, Err(Error::GuardBusy(_))));
        assert!(matches!(orch.unload(3, 1).await, Err(Error::GuardBusy(_))));
        assert!(matches!(orch.refresh_slots().await, Err(Error::GuardBusy(_))));
        assert_eq!(orch.current_operation().map(|op| op.id), Some(id));
        assert!(orch.selection(1).unwrap().slots.is_empty());

        let outcome = handle.await.unwrap();
        assert!(outcome.succeeded());
        assert!(!orch.guard().is_held());
    }

    #[tokio::test]
    async fn test_release_and_homing_overlap() {
        let (orch, rig) = setup().await;
        rig.incubator.faults.delay(
            "get_sample_from_slot_to_transfer_station",
            Duration::from_millis(30),
        );
        rig.microscopes[&1]
            .faults
            .delay("home_stage", Duration::from_millis(30));

        assert!(orch.load(3, 1).await.unwrap().succeeded());

        let journal = &rig.journal;
        let release_end = journal
            .position("incubator.get_sample_from_slot_to_transfer_station", Phase::End)
            .unwrap();
        let home_start = journal
            .position("microscope.home_stage", Phase::Start)
            .unwrap();
        let home_end = journal.position("microscope.home_stage", Phase::End).unwrap();
        let arm_start = journal
            .position("arm.incubator_to_microscope", Phase::Start)
            .unwrap();
        assert!(home_start < release_end);
        assert!(arm_start > release_end && arm_start > home_end);
    }

    #[tokio::test]
    async fn test_unload_round_trip() {
        let (orch, rig) = setup().await;
        assert!(orch.load(3, 1).await.unwrap().succeeded());
        rig.journal.clear();

        let outcome = orch.unload(3, 1).await.unwrap();
        assert!(outcome.succeeded(), "{:?}", outcome.failure);
        assert_eq!(orch.registry().get(3).unwrap(), Location::IncubatorSlot);
        assert!(rig.incubator.is_present(3));
        assert_eq!(
            moves(&rig),
            vec![
                "microscope.home_stage",
                "arm.connect",
                "arm.light_on",
                "arm.microscope_to_incubator",
                "incubator.put_sample_from_transfer_station_to_slot",
                "microscope.return_stage",
                "arm.light_off",
                "arm.disconnect",
            ]
        );
    }

    #[tokio::test]
    async fn test_unload_store_failure_leaves_station() {
        let (orch, rig) = setup().await;
        assert!(orch.load(3, 1).await.unwrap().succeeded());
        rig.incubator
            .faults
            .fail_on("put_sample_from_transfer_station_to_slot", "slot blocked");

        let outcome = orch.unload(3, 1).await.unwrap();
        assert_eq!(outcome.last_state, WorkflowState::StoringInSlot);
        assert_eq!(orch.registry().get(3).unwrap(), Location::IncubatorStation);
    }

    #[tokio::test]
    async fn test_unload_arm_failure_restores_microscope() {
        let (orch, rig) = setup().await;
        assert!(orch.load(3, 1).await.unwrap().succeeded());
        rig.arm
            .faults
            .fail_on("microscope_to_incubator", "gripper fault");

        let outcome = orch.unload(3, 1).await.unwrap();
        assert_eq!(outcome.status, OperationStatus::Failed);
        assert_eq!(outcome.last_state, WorkflowState::TransportingToIncubator);
        assert_eq!(outcome.location, Some(Location::Microscope(1)));
        assert_eq!(orch.registry().get(3).unwrap(), Location::Microscope(1));
        assert_eq!(
            rig.incubator.recorded_location(3),
            Some(Location::Microscope(1))
        );
        assert!(outcome
            .log
            .iter()
            .any(|l| l.contains("interrupted on the robotic arm")));
        assert!(outcome
            .log
            .iter()
            .any(|l| l.contains("robotic arm -> microscope 1")));
        assert!(!rig.arm.is_connected());
        assert!(!orch.guard().is_held());
    }

    #[tokio::test]
    async fn test_barrier_both_fail_leaves_slot() {
        let (orch, rig) = setup().await;
        rig.incubator
            .faults
            .fail_on("get_sample_from_slot_to_transfer_station", "door stuck");
        rig.microscopes[&1].faults.fail_on("home_stage", "stage jammed");

        let outcome = orch.load(3, 1).await.unwrap();
        assert_eq!(outcome.last_state, WorkflowState::AwaitingArmAndStage);
        assert!(matches!(
            outcome.failure,
            Some(TransportFailure::Device(DeviceError::Rejected {
                call: "get_sample_from_slot_to_transfer_station",
                ..
            }))
        ));
        assert_eq!(orch.registry().get(3).unwrap(), Location::IncubatorSlot);
        assert!(!outcome.completed_steps.contains(&TransportStep::StageHomed));

        let errors: Vec<_> = orch
            .log()
            .entries_for(outcome.operation_id)
            .into_iter()
            .filter(|e| e.level == LogLevel::Error)
            .collect();
        assert_eq!(errors.len(), 2);
        assert!(errors[0].message.contains("Stage homing also failed"));
        assert!(errors[1].message.contains("failed"));
        assert!(!rig.arm.is_connected());
    }

    #[tokio::test]
    async fn test_refresh_refuses_shared_microscope() {
        let config = TransportConfig {
            bench_slots: vec![
                Slot::new(3, "S3", Location::Microscope(1)),
                Slot::new(5, "S5", Location::Microscope(1)),
            ],
            ..TransportConfig::default()
        };
        let rig = create_bench_rig(&config);
        let orch = Arc::new(TransportOrchestrator::new(rig.device_set(), &config));

        let err = orch.refresh_slots().await.unwrap_err();
        assert!(matches!(err, Error::Precondition(_)));
        assert!(orch.registry().is_empty());
        assert!(orch.selection(1).unwrap().slots.is_empty());
        assert!(orch
            .log()
            .entries()
            .iter()
            .any(|e| e.level == LogLevel::Error && e.message.contains("refresh refused")));
        assert!(!orch.guard().is_held());
    }

    #[tokio::test]
    async fn test_one_specimen_per_microscope() {
        let (orch, _rig) = setup().await;
        assert!(orch.load(3, 1).await.unwrap().succeeded());
        assert_eq!(orch.registry().bound_count(1), 1);

        let err = orch.load(5, 1).await.unwrap_err();
        assert!(matches!(err, Error::Precondition(msg) if msg.contains("already holds slot 3")));
        assert_eq!(orch.registry().bound_count(1), 1);

        assert!(orch.unload(3, 1).await.unwrap().succeeded());
        assert_eq!(orch.registry().bound_count(1), 0);
        assert!(orch.load(5, 1).await.unwrap().succeeded());
        assert_eq!(orch.registry().bound_to(1), Some(5));
    }

    #[tokio::test]
    async fn test_selection_follows_registry() {
        let (orch, _rig) = setup().await;
        let selection = orch.selection(1).unwrap();
        assert_eq!(selection.intent, Some(OperationKind::Load));
        assert!(selection.allows_slot(3) && selection.allows_slot(5));
        assert!(!selection.allows_slot(4));

        orch.load(3, 1).await.unwrap();
        let selection = orch.selection(1).unwrap();
        assert_eq!(selection.intent, Some(OperationKind::Unload));
        assert_eq!(selection.slots.iter().copied().collect::<Vec<_>>(), vec![3]);
        assert!(matches!(orch.selection(7), Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn test_sync_failure_only_warns() {
        let (orch, rig) = setup().await;
        rig.incubator
            .faults
            .fail_on("update_sample_location", "database locked");

        let outcome = orch.load(3, 1).await.unwrap();
        assert!(outcome.succeeded());
        assert!(orch
            .log()
            .entries_for(outcome.operation_id)
            .iter()
            .any(|e| e.level == LogLevel::Warn && e.message.contains("sync")));
    }

    #[tokio::test]
    async fn test_sync_can_be_disabled() {
        let config = TransportConfig {
            sync_incubator_location: false,
            ..config()
        };
        let (orch, rig) = setup_with(config).await;
        assert!(orch.load(3, 1).await.unwrap().succeeded());
        assert!(!rig
            .journal
            .calls()
            .contains(&"incubator.update_sample_location".to_string()));
    }

    #[tokio::test]
    async fn test_virtual_bind_and_unbind() {
        let (orch, rig) = setup().await;
        let outcome = orch.load_virtual(99, "hela-live").await.unwrap();
        assert!(outcome.succeeded());
        assert_eq!(outcome.location, None);
        assert_eq!(orch.virtual_binding(99).unwrap().id, "hela-live");
        assert_eq!(rig.virtual_microscopes[&99].bound().unwrap().id, "hela-live");
        assert_eq!(
            orch.selection(99).unwrap().specimens.len(),
            orch.specimens().len()
        );

        let outcome = orch.unload_virtual(99).await.unwrap();
        assert!(outcome.succeeded());
        assert!(orch.virtual_binding(99).is_none());
        assert!(matches!(
            orch.unload_virtual(99).await,
            Err(Error::Precondition(_))
        ));
    }

    #[tokio::test]
    async fn test_microscope_kinds_are_not_interchangeable() {
        let (orch, _rig) = setup().await;
        assert!(matches!(orch.load(3, 99).await, Err(Error::Precondition(_))));
        assert!(matches!(
            orch.load_virtual(1, "hela-live").await,
            Err(Error::Precondition(_))
        ));
        assert!(matches!(
            orch.load_virtual(99, "missing").await,
            Err(Error::Precondition(_))
        ));
    }

    #[tokio::test]
    async fn test_dropped_pending_releases_guard() {
        let (orch, rig) = setup().await;
        let pending = orch.prepare_load(3, 1).await.unwrap();
        assert!(orch.guard().is_held());
        assert!(orch.current_operation().is_some());
        drop(pending);

        assert!(!orch.guard().is_held());
        assert!(orch.current_operation().is_none());
        assert_eq!(rig.journal.calls(), vec!["incubator.get_sample_status"]);
    }

    #[tokio::test]
    async fn test_correct_location() {
        let (orch, rig) = setup().await;
        rig.arm.faults.fail_on("incubator_to_microscope", "gripper fault");
        orch.load(3, 1).await.unwrap();
        assert_eq!(orch.registry().get(3).unwrap(), Location::IncubatorStation);

        let previous = orch
            .correct_location(3, Location::IncubatorSlot)
            .await
            .unwrap();
        assert_eq!(previous, Location::IncubatorStation);
        assert_eq!(orch.registry().get(3).unwrap(), Location::IncubatorSlot);

        orch.correct_location(5, Location::Microscope(1)).await.unwrap();
        assert!(matches!(
            orch.correct_location(3, Location::Microscope(1)).await,
            Err(Error::Precondition(_))
        ));
    }

    #[tokio::test]
    async fn test_microscope_status() {
        let (orch, _rig) = setup().await;
        let status = orch.microscope_status(1).await.unwrap();
        assert!(status.ready);
        assert_eq!(status.stage, StagePosition::Working);
        assert!(orch.microscope_status(99).await.is_err());
    }

    struct PanickingArm;

    #[async_trait]
    impl RoboticArm for PanickingArm {
        async fn connect(&self) -> DeviceResult<()> {
            Ok(())
        }
        async fn disconnect(&self) -> DeviceResult<()> {
            Ok(())
        }
        async fn light_on(&self) -> DeviceResult<()> {
            Ok(())
        }
        async fn light_off(&self) -> DeviceResult<()> {
            Ok(())
        }
        async fn incubator_to_microscope(&self, _: MicroscopeId) -> DeviceResult<()> {
            panic!("driver crashed")
        }
        async fn microscope_to_incubator(&self, _: MicroscopeId) -> DeviceResult<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_panicking_device_releases_guard() {
        let config = config();
        let rig = create_bench_rig(&config);
        let mut devices = rig.device_set();
        devices.arm = Arc::new(PanickingArm);
        let orch = Arc::new(TransportOrchestrator::new(devices, &config));
        orch.refresh_slots().await.unwrap();

        let pending = orch.prepare_load(3, 1).await.unwrap();
        let id = pending.operation_id();
        let joined = tokio::spawn(pending.run()).await;
        assert!(joined.unwrap_err().is_panic());
        assert!(!orch.guard().is_held());
        assert!(orch.current_operation().is_none());

        // No compensation ran; the operator is told where the slot was last seen.
        assert_eq!(orch.registry().get(3).unwrap(), Location::RoboticArm);
        assert!(orch
            .log()
            .entries_for(id)
            .iter()
            .any(|e| e.level == LogLevel::Error && e.message.contains("tracked at the robotic arm")));
        let notifications = orch.log().notifications();
        assert_eq!(notifications.last().map(|n| n.kind), Some(NotificationKind::Error));
        assert_eq!(notifications.last().map(|n| n.operation_id), Some(id));

        assert!(orch.prepare_load(5, 1).await.is_ok());
    }
}
