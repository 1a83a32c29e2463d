//! In-memory devices for the bench rig and tests.
//!
//! Each device keeps just enough physical state to reject impossible
//! requests (taking a sample out of an empty slot, moving an arm that is not
//! connected). All of them expose a [`FaultInjector`] as `faults`.

use std::collections::{BTreeMap, HashSet};

use async_trait::async_trait;
use labtransit_core::{DeviceError, Location, MicroscopeId, Slot, SlotNumber, Specimen};
use parking_lot::{Mutex, RwLock};

use crate::journal::{CallJournal, FaultInjector};
use crate::traits::*;

// ---------------------------------------------------------------
// Incubator
// ---------------------------------------------------------------

pub struct InMemoryIncubator {
    slots: RwLock<BTreeMap<SlotNumber, Slot>>,
    /// Slots whose specimen is physically inside the incubator.
    stored: RwLock<HashSet<SlotNumber>>,
    pub faults: FaultInjector,
}

impl InMemoryIncubator {
    pub fn new(slots: Vec<Slot>, journal: CallJournal) -> Self {
        let stored = slots
            .iter()
            .filter(|s| s.is_occupied() && s.location == Location::IncubatorSlot)
            .map(|s| s.slot_number)
            .collect();
        let slots = slots.into_iter().map(|s| (s.slot_number, s)).collect();

        Self {
            slots: RwLock::new(slots),
            stored: RwLock::new(stored),
            faults: FaultInjector::new(INCUBATOR, journal),
        }
    }

    /// Override whether the incubator senses a specimen in `slot`.
    pub fn set_present(&self, slot: SlotNumber, present: bool) {
        let mut stored = self.stored.write();
        if present {
            stored.insert(slot);
        } else {
            stored.remove(&slot);
        }
    }

    pub fn is_present(&self, slot: SlotNumber) -> bool {
        self.stored.read().contains(&slot)
    }

    /// Location last pushed through `update_sample_location`.
    pub fn recorded_location(&self, slot: SlotNumber) -> Option<Location> {
        self.slots.read().get(&slot).map(|s| s.location)
    }

    fn ensure_known(&self, call: &'static str, slot: SlotNumber) -> DeviceResult<()> {
        if self.slots.read().contains_key(&slot) {
            Ok(())
        } else {
            Err(DeviceError::rejected(INCUBATOR, call, format!("unknown slot {}", slot)))
        }
    }
}

#[async_trait]
impl Incubator for InMemoryIncubator {
    async fn get_slot_information(&self) -> DeviceResult<Vec<Slot>> {
        self.faults
            .perform("get_slot_information", || {
                Ok(self.slots.read().values().cloned().collect())
            })
            .await
    }

    async fn get_sample_status(&self, slot: SlotNumber) -> DeviceResult<SampleStatus> {
        self.faults
            .perform("get_sample_status", || {
                self.ensure_known("get_sample_status", slot)?;
                Ok(if self.stored.read().contains(&slot) {
                    SampleStatus::In
                } else {
                    SampleStatus::Out
                })
            })
            .await
    }

    async fn get_sample_from_slot_to_transfer_station(&self, slot: SlotNumber) -> DeviceResult<()> {
        const CALL: &str = "get_sample_from_slot_to_transfer_station";
        self.faults
            .perform(CALL, || {
                self.ensure_known(CALL, slot)?;
                if !self.stored.write().remove(&slot) {
                    return Err(DeviceError::rejected(
                        INCUBATOR,
                        CALL,
                        format!("slot {} is empty", slot),
                    ));
                }
                Ok(())
            })
            .await
    }

    async fn put_sample_from_transfer_station_to_slot(&self, slot: SlotNumber) -> DeviceResult<()> {
        const CALL: &str = "put_sample_from_transfer_station_to_slot";
        self.faults
            .perform(CALL, || {
                self.ensure_known(CALL, slot)?;
                if !self.stored.write().insert(slot) {
                    return Err(DeviceError::rejected(
                        INCUBATOR,
                        CALL,
                        format!("slot {} is already occupied", slot),
                    ));
                }
                Ok(())
            })
            .await
    }

    async fn update_sample_location(
        &self,
        slot: SlotNumber,
        location: Location,
    ) -> DeviceResult<()> {
        self.faults
            .perform("update_sample_location", || {
                let mut slots = self.slots.write();
                let entry = slots.get_mut(&slot).ok_or_else(|| {
                    DeviceError::rejected(
                        INCUBATOR,
                        "update_sample_location",
                        format!("unknown slot {}", slot),
                    )
                })?;
                entry.location = location;
                Ok(())
            })
            .await
    }
}

// ---------------------------------------------------------------
// Robotic arm
// ---------------------------------------------------------------

pub struct InMemoryArm {
    connected: Mutex<bool>,
    light: Mutex<bool>,
    pub faults: FaultInjector,
}

impl InMemoryArm {
    pub fn new(journal: CallJournal) -> Self {
        Self {
            connected: Mutex::new(false),
            light: Mutex::new(false),
            faults: FaultInjector::new(ARM, journal),
        }
    }

    pub fn is_connected(&self) -> bool {
        *self.connected.lock()
    }

    pub fn is_light_on(&self) -> bool {
        *self.light.lock()
    }

    fn ensure_connected(&self, call: &'static str) -> DeviceResult<()> {
        if *self.connected.lock() {
            Ok(())
        } else {
            Err(DeviceError::rejected(ARM, call, "not connected"))
        }
    }
}

#[async_trait]
impl RoboticArm for InMemoryArm {
    async fn connect(&self) -> DeviceResult<()> {
        self.faults
            .perform("connect", || {
                *self.connected.lock() = true;
                Ok(())
            })
            .await
    }

    async fn disconnect(&self) -> DeviceResult<()> {
        self.faults
            .perform("disconnect", || {
                *self.connected.lock() = false;
                Ok(())
            })
            .await
    }

    async fn light_on(&self) -> DeviceResult<()> {
        self.faults
            .perform("light_on", || {
                self.ensure_connected("light_on")?;
                *self.light.lock() = true;
                Ok(())
            })
            .await
    }

    async fn light_off(&self) -> DeviceResult<()> {
        self.faults
            .perform("light_off", || {
                self.ensure_connected("light_off")?;
                *self.light.lock() = false;
                Ok(())
            })
            .await
    }

    async fn incubator_to_microscope(&self, _microscope: MicroscopeId) -> DeviceResult<()> {
        self.faults
            .perform("incubator_to_microscope", || {
                self.ensure_connected("incubator_to_microscope")
            })
            .await
    }

    async fn microscope_to_incubator(&self, _microscope: MicroscopeId) -> DeviceResult<()> {
        self.faults
            .perform("microscope_to_incubator", || {
                self.ensure_connected("microscope_to_incubator")
            })
            .await
    }
}

// ---------------------------------------------------------------
// Microscopes
// ---------------------------------------------------------------

pub struct InMemoryMicroscope {
    id: MicroscopeId,
    stage: Mutex<StagePosition>,
    pub faults: FaultInjector,
}

impl InMemoryMicroscope {
    pub fn new(id: MicroscopeId, journal: CallJournal) -> Self {
        Self {
            id,
            stage: Mutex::new(StagePosition::Working),
            faults: FaultInjector::new(MICROSCOPE, journal),
        }
    }

    pub fn stage(&self) -> StagePosition {
        *self.stage.lock()
    }
}

#[async_trait]
impl Microscope for InMemoryMicroscope {
    async fn home_stage(&self) -> DeviceResult<()> {
        self.faults
            .perform("home_stage", || {
                *self.stage.lock() = StagePosition::Home;
                Ok(())
            })
            .await
    }

    async fn return_stage(&self) -> DeviceResult<()> {
        self.faults
            .perform("return_stage", || {
                *self.stage.lock() = StagePosition::Working;
                Ok(())
            })
            .await
    }

    async fn get_status(&self) -> DeviceResult<MicroscopeStatus> {
        self.faults
            .perform("get_status", || {
                Ok(MicroscopeStatus {
                    microscope_id: self.id,
                    ready: true,
                    stage: *self.stage.lock(),
                })
            })
            .await
    }
}

pub struct InMemoryVirtualMicroscope {
    id: MicroscopeId,
    bound: Mutex<Option<Specimen>>,
    pub faults: FaultInjector,
}

impl InMemoryVirtualMicroscope {
    pub fn new(id: MicroscopeId, journal: CallJournal) -> Self {
        Self {
            id,
            bound: Mutex::new(None),
            faults: FaultInjector::new(VIRTUAL_MICROSCOPE, journal),
        }
    }

    pub fn id(&self) -> MicroscopeId {
        self.id
    }

    pub fn bound(&self) -> Option<Specimen> {
        self.bound.lock().clone()
    }
}

#[async_trait]
impl VirtualMicroscope for InMemoryVirtualMicroscope {
    async fn bind(&self, specimen: &Specimen) -> DeviceResult<()> {
        self.faults
            .perform("bind", || {
                *self.bound.lock() = Some(specimen.clone());
                Ok(())
            })
            .await
    }

    async fn unbind(&self) -> DeviceResult<()> {
        self.faults
            .perform("unbind", || {
                *self.bound.lock() = None;
                Ok(())
            })
            .await
    }
}
