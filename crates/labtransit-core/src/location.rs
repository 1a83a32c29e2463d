//! Physical location model for incubator slots and specimens.

use serde::{Deserialize, Serialize};

/// Incubator slot number.
pub type SlotNumber = u32;

/// Microscope identifier.
pub type MicroscopeId = u32;

/// Where a physical specimen is right now.
///
/// Exactly one value per specimen at any instant. The legal moves form a
/// chain: `IncubatorSlot ↔ IncubatorStation ↔ RoboticArm ↔ Microscope(id)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "microscopeId", rename_all = "camelCase")]
pub enum Location {
    /// Stored in its numbered incubator slot.
    IncubatorSlot,
    /// At the incubator's hand-off point.
    IncubatorStation,
    /// Held by the transfer arm.
    RoboticArm,
    /// On the stage of the given microscope.
    Microscope(MicroscopeId),
}

impl Location {
    /// Whether moving from `self` to `next` follows the location edge set.
    ///
    /// Staying put is always allowed.
    pub fn can_transition_to(&self, next: &Location) -> bool {
        use Location::*;
        if self == next {
            return true;
        }
        matches!(
            (self, next),
            (IncubatorSlot, IncubatorStation)
                | (IncubatorStation, IncubatorSlot)
                | (IncubatorStation, RoboticArm)
                | (RoboticArm, IncubatorStation)
                | (RoboticArm, Microscope(_))
                | (Microscope(_), RoboticArm)
        )
    }

    /// Microscope id if the specimen is on a microscope stage.
    pub fn microscope_id(&self) -> Option<MicroscopeId> {
        match self {
            Self::Microscope(id) => Some(*id),
            _ => None,
        }
    }

    pub fn is_on_microscope(&self, id: MicroscopeId) -> bool {
        *self == Self::Microscope(id)
    }
}

impl std::fmt::Display for Location {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::IncubatorSlot => write!(f, "incubator slot"),
            Self::IncubatorStation => write!(f, "transfer station"),
            Self::RoboticArm => write!(f, "robotic arm"),
            Self::Microscope(id) => write!(f, "microscope {}", id),
        }
    }
}

/// A numbered storage position inside the incubator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Slot {
    #[serde(rename = "slotNumber")]
    pub slot_number: SlotNumber,
    /// Empty when the slot holds no specimen.
    #[serde(rename = "sampleName", default)]
    pub sample_name: String,
    pub location: Location,
}

impl Slot {
    pub fn new(slot_number: SlotNumber, sample_name: impl Into<String>, location: Location) -> Self {
        Self {
            slot_number,
            sample_name: sample_name.into(),
            location,
        }
    }

    pub fn is_occupied(&self) -> bool {
        !self.sample_name.trim().is_empty()
    }
}

/// Logical specimen handle used by virtual microscopes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Specimen {
    pub id: String,
    #[serde(rename = "datasetAlias")]
    pub dataset_alias: String,
}

impl Specimen {
    pub fn new(id: impl Into<String>, dataset_alias: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            dataset_alias: dataset_alias.into(),
        }
    }
}
