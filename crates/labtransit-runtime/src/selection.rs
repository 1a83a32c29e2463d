//! Selection policy: which specimens may be chosen for the next operation.
//!
//! Pure functions over a registry snapshot and the in-flight flag.

use std::collections::BTreeSet;

use labtransit_core::{
    Error, Location, MicroscopeConfig, MicroscopeId, MicroscopeKind, Result, Slot, SlotNumber,
    Specimen,
};
use serde::Serialize;

use crate::types::OperationKind;

/// What the UI may offer for one microscope right now.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Selection {
    #[serde(rename = "microscopeId")]
    pub microscope_id: MicroscopeId,
    pub kind: MicroscopeKind,
    /// Selectable slots (physical microscopes).
    pub slots: BTreeSet<SlotNumber>,
    /// Selectable specimen ids (virtual microscopes).
    pub specimens: Vec<String>,
    /// Operation a selection would start on a physical microscope.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub intent: Option<OperationKind>,
    #[serde(rename = "operationInFlight")]
    pub operation_in_flight: bool,
}

impl Selection {
    pub fn allows_slot(&self, slot: SlotNumber) -> bool {
        self.slots.contains(&slot)
    }

    pub fn allows_specimen(&self, id: &str) -> bool {
        self.specimens.iter().any(|s| s == id)
    }
}

pub struct SelectionPolicy;

impl SelectionPolicy {
    /// Selectable slots for a physical microscope.
    ///
    /// With a specimen on the stage only that slot qualifies (unload);
    /// otherwise occupied slots still in the incubator (load).
    pub fn selectable_slots(
        slots: &[Slot],
        microscope: MicroscopeId,
        in_flight: bool,
    ) -> BTreeSet<SlotNumber> {
        if in_flight {
            return BTreeSet::new();
        }

        let bound: BTreeSet<SlotNumber> = slots
            .iter()
            .filter(|s| s.location.is_on_microscope(microscope))
            .map(|s| s.slot_number)
            .collect();
        if !bound.is_empty() {
            return bound;
        }

        slots
            .iter()
            .filter(|s| s.is_occupied() && s.location == Location::IncubatorSlot)
            .map(|s| s.slot_number)
            .collect()
    }

    /// Selectable specimens for a virtual microscope: all of them when idle.
    pub fn selectable_specimens(specimens: &[Specimen], in_flight: bool) -> Vec<String> {
        if in_flight {
            return Vec::new();
        }
        specimens.iter().map(|s| s.id.clone()).collect()
    }

    pub fn evaluate(
        microscope: &MicroscopeConfig,
        slots: &[Slot],
        specimens: &[Specimen],
        in_flight: bool,
    ) -> Selection {
        match microscope.kind {
            MicroscopeKind::Physical => {
                let selectable = Self::selectable_slots(slots, microscope.id, in_flight);
                let bound = slots.iter().any(|s| s.location.is_on_microscope(microscope.id));
                let intent = match (in_flight, bound) {
                    (true, _) => None,
                    (false, true) => Some(OperationKind::Unload),
                    (false, false) => Some(OperationKind::Load),
                };
                Selection {
                    microscope_id: microscope.id,
                    kind: MicroscopeKind::Physical,
                    slots: selectable,
                    specimens: Vec::new(),
                    intent,
                    operation_in_flight: in_flight,
                }
            }
            MicroscopeKind::Virtual => Selection {
                microscope_id: microscope.id,
                kind: MicroscopeKind::Virtual,
                slots: BTreeSet::new(),
                specimens: Self::selectable_specimens(specimens, in_flight),
                intent: None,
                operation_in_flight: in_flight,
            },
        }
    }

    /// Check a concrete slot choice for a physical microscope.
    ///
    /// The caller holds the guard, so the in-flight flag is not consulted.
    pub fn validate_slot(
        slots: &[Slot],
        microscope: MicroscopeId,
        slot: SlotNumber,
        kind: OperationKind,
    ) -> Result<()> {
        let entry = slots
            .iter()
            .find(|s| s.slot_number == slot)
            .ok_or_else(|| Error::Precondition(format!("slot {} is unknown", slot)))?;

        match kind {
            OperationKind::Load => {
                if !entry.is_occupied() {
                    return Err(Error::Precondition(format!("slot {} holds no sample", slot)));
                }
                if entry.location != Location::IncubatorSlot {
                    return Err(Error::Precondition(format!(
                        "sample {} is at the {}, not in its incubator slot",
                        entry.sample_name, entry.location
                    )));
                }
                if let Some(other) = slots.iter().find(|s| s.location.is_on_microscope(microscope)) {
                    return Err(Error::Precondition(format!(
                        "microscope {} already holds slot {}",
                        microscope, other.slot_number
                    )));
                }
            }
            OperationKind::Unload => {
                if !entry.location.is_on_microscope(microscope) {
                    return Err(Error::Precondition(format!(
                        "slot {} is at the {}, not on microscope {}",
                        slot, entry.location, microscope
                    )));
                }
            }
        }

        if Self::selectable_slots(slots, microscope, false).contains(&slot) {
            Ok(())
        } else {
            Err(Error::Precondition(format!(
                "slot {} is not selectable for microscope {}",
                slot, microscope
            )))
        }
    }
}
