//! Location registry, the authoritative record of where each slot's
//! specimen is.
//!
//! Reads are open to everyone. Writes are crate-private: only the
//! orchestrator mutates the registry.

use std::collections::{BTreeMap, HashMap};

use labtransit_core::{Error, Location, MicroscopeId, Result, Slot, SlotNumber};
use parking_lot::RwLock;
use tracing::debug;

#[derive(Debug, Default)]
pub struct LocationRegistry {
    slots: RwLock<BTreeMap<SlotNumber, Slot>>,
}

impl LocationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_slots(slots: Vec<Slot>) -> Result<Self> {
        let registry = Self::new();
        registry.refresh(slots)?;
        Ok(registry)
    }

    /// Current location of `slot`.
    pub fn get(&self, slot: SlotNumber) -> Result<Location> {
        self.slots
            .read()
            .get(&slot)
            .map(|s| s.location)
            .ok_or_else(|| Error::NotFound(format!("slot {}", slot)))
    }

    pub fn slot(&self, slot: SlotNumber) -> Result<Slot> {
        self.slots
            .read()
            .get(&slot)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("slot {}", slot)))
    }

    /// All slots ordered by slot number.
    pub fn snapshot(&self) -> Vec<Slot> {
        self.slots.read().values().cloned().collect()
    }

    /// Slot currently on the given microscope's stage.
    pub fn bound_to(&self, microscope: MicroscopeId) -> Option<SlotNumber> {
        self.slots
            .read()
            .values()
            .find(|s| s.location.is_on_microscope(microscope))
            .map(|s| s.slot_number)
    }

    /// Number of slots on the given microscope's stage.
    pub fn bound_count(&self, microscope: MicroscopeId) -> usize {
        self.slots
            .read()
            .values()
            .filter(|s| s.location.is_on_microscope(microscope))
            .count()
    }

    pub fn len(&self) -> usize {
        self.slots.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.read().is_empty()
    }

    /// Unconditional overwrite. Returns the previous location.
    pub(crate) fn set(&self, slot: SlotNumber, location: Location) -> Result<Location> {
        let mut slots = self.slots.write();
        let entry = slots
            .get_mut(&slot)
            .ok_or_else(|| Error::NotFound(format!("slot {}", slot)))?;
        let previous = std::mem::replace(&mut entry.location, location);
        debug!("Registry: slot {} {} -> {}", slot, previous, location);
        Ok(previous)
    }

    /// Checked write: only moves along the location edge set.
    pub(crate) fn advance(&self, slot: SlotNumber, next: Location) -> Result<Location> {
        let mut slots = self.slots.write();
        let entry = slots
            .get_mut(&slot)
            .ok_or_else(|| Error::NotFound(format!("slot {}", slot)))?;
        if !entry.location.can_transition_to(&next) {
            return Err(Error::InvalidTransition {
                slot,
                from: entry.location,
                to: next,
            });
        }
        let previous = std::mem::replace(&mut entry.location, next);
        debug!("Registry: slot {} {} -> {}", slot, previous, next);
        Ok(previous)
    }

    /// Replace the whole registry with a fresh incubator snapshot.
    ///
    /// A snapshot that puts two slots on one microscope is refused and the
    /// current contents are kept.
    pub(crate) fn refresh(&self, slots: Vec<Slot>) -> Result<()> {
        let mut on_stage: HashMap<MicroscopeId, SlotNumber> = HashMap::new();
        for slot in &slots {
            if let Location::Microscope(microscope) = slot.location {
                if let Some(other) = on_stage.insert(microscope, slot.slot_number) {
                    return Err(Error::Precondition(format!(
                        "incubator reports slots {} and {} both on microscope {}",
                        other, slot.slot_number, microscope
                    )));
                }
            }
        }

        let fresh: BTreeMap<SlotNumber, Slot> =
            slots.into_iter().map(|s| (s.slot_number, s)).collect();
        *self.slots.write() = fresh;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> LocationRegistry {
        LocationRegistry::from_slots(vec![
            Slot::new(1, "S1", Location::IncubatorSlot),
            Slot::new(3, "S3", Location::Microscope(1)),
            Slot::new(4, "", Location::IncubatorSlot),
        ])
        .unwrap()
    }

    #[test]
    fn test_get_and_not_found() {
        let reg = registry();
        assert_eq!(reg.get(1).unwrap(), Location::IncubatorSlot);
        assert_eq!(reg.get(3).unwrap(), Location::Microscope(1));
        assert!(matches!(reg.get(9), Err(Error::NotFound(_))));
        assert!(matches!(reg.slot(9), Err(Error::NotFound(_))));
    }

    #[test]
    fn test_set_is_unconditional() {
        let reg = registry();
        let previous = reg.set(1, Location::Microscope(2)).unwrap();
        assert_eq!(previous, Location::IncubatorSlot);
        assert_eq!(reg.get(1).unwrap(), Location::Microscope(2));
        assert!(reg.set(9, Location::RoboticArm).is_err());
    }

    #[test]
    fn test_advance_rejects_jumps() {
        let reg = registry();
        let err = reg.advance(1, Location::RoboticArm).unwrap_err();
        assert!(matches!(
            err,
            Error::InvalidTransition {
                slot: 1,
                from: Location::IncubatorSlot,
                to: Location::RoboticArm
            }
        ));
        assert_eq!(reg.get(1).unwrap(), Location::IncubatorSlot);

        reg.advance(1, Location::IncubatorStation).unwrap();
        reg.advance(1, Location::RoboticArm).unwrap();
        assert_eq!(reg.get(1).unwrap(), Location::RoboticArm);
    }

    #[test]
    fn test_bound_to() {
        let reg = registry();
        assert_eq!(reg.bound_to(1), Some(3));
        assert_eq!(reg.bound_to(2), None);
        assert_eq!(reg.bound_count(1), 1);
    }

    #[test]
    fn test_refresh_replaces_everything() {
        let reg = registry();
        reg.refresh(vec![Slot::new(7, "S7", Location::IncubatorSlot)])
            .unwrap();
        assert_eq!(reg.len(), 1);
        assert!(reg.get(1).is_err());
        assert_eq!(reg.snapshot()[0].slot_number, 7);

        reg.refresh(Vec::new()).unwrap();
        assert!(reg.is_empty());
    }

    #[test]
    fn test_refresh_rejects_shared_microscope() {
        let reg = registry();
        let err = reg
            .refresh(vec![
                Slot::new(3, "S3", Location::Microscope(1)),
                Slot::new(5, "S5", Location::Microscope(1)),
                Slot::new(6, "S6", Location::Microscope(2)),
            ])
            .unwrap_err();
        assert!(matches!(err, Error::Precondition(msg) if msg.contains("slots 3 and 5")));

        // Previous contents survive.
        assert_eq!(reg.len(), 3);
        assert_eq!(reg.bound_to(1), Some(3));
        assert_eq!(reg.bound_count(1), 1);
    }

    #[test]
    fn test_snapshot_is_ordered() {
        let reg = LocationRegistry::from_slots(vec![
            Slot::new(5, "b", Location::IncubatorSlot),
            Slot::new(2, "a", Location::IncubatorSlot),
        ])
        .unwrap();
        let numbers: Vec<_> = reg.snapshot().iter().map(|s| s.slot_number).collect();
        assert_eq!(numbers, vec![2, 5]);
    }
}
