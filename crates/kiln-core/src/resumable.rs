//! Descriptors produced by state-machine lowering and consumed by code
//! generation and the module builder.

use std::sync::Arc;

use rustc_hash::FxHashMap;

use crate::symbols::{FieldDescriptor, RoutineDescriptor, TypeDescriptor};
use crate::{SymbolId, Ty};

/// Which state-machine shape a routine was lowered into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResumableKind {
    /// Generator-style: produces values through `yield`.
    Generator,
    /// Suspend-style: pauses at `await` points.
    Async,
}

/// A local hoisted into a state-machine field.
#[derive(Debug, Clone, PartialEq)]
pub struct HoistedVariable {
    pub name: Arc<str>,
    pub field: Arc<FieldDescriptor>,
}

/// The synthesized resumable type behind a generator or async routine.
///
/// A routine has at most one of these; the two kinds are exclusive.
#[derive(Debug, Clone, PartialEq)]
pub struct ResumableTypeDescriptor {
    pub kind: ResumableKind,
    pub ty: Arc<TypeDescriptor>,
    /// The routine whose body was replaced by state-machine setup.
    pub kickoff: SymbolId,
    /// The resumption entry point holding the original logic.
    pub move_next: Arc<RoutineDescriptor>,
    pub state_field: Arc<FieldDescriptor>,
    pub hoisted: Vec<HoistedVariable>,
}

impl ResumableTypeDescriptor {
    pub fn name(&self) -> &str {
        &self.ty.name
    }
}

/// Local slots of the previous generation of a routine.
///
/// Patch builds keep surviving locals in the slot they had before, so a
/// running frame can be remapped onto the new body.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VariableSlotAllocator {
    previous: FxHashMap<Arc<str>, (u16, Ty)>,
    slot_count: u16,
}

impl VariableSlotAllocator {
    pub fn new<'a>(previous: impl IntoIterator<Item = (&'a str, u16, Ty)>) -> Self {
        let mut map = FxHashMap::default();
        let mut slot_count = 0u16;
        for (name, slot, ty) in previous {
            slot_count = slot_count.max(slot.saturating_add(1));
            map.insert(Arc::from(name), (slot, ty));
        }
        Self {
            previous: map,
            slot_count,
        }
    }

    /// Previous slot of a local with this name, if the type is unchanged.
    pub fn slot_for(&self, name: &str, ty: &Ty) -> Option<u16> {
        self.previous
            .get(name)
            .filter(|(_, previous_ty)| previous_ty == ty)
            .map(|(slot, _)| *slot)
    }

    /// Slots below this index are reserved for the previous generation.
    pub fn previous_slot_count(&self) -> u16 {
        self.slot_count
    }

    /// Name of whatever occupied `slot` in the previous generation.
    pub fn previous_name(&self, slot: u16) -> Option<&Arc<str>> {
        self.previous
            .iter()
            .find(|(_, (previous_slot, _))| *previous_slot == slot)
            .map(|(name, _)| name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_survives_only_with_same_type() {
        let allocator = VariableSlotAllocator::new([("x", 0, Ty::Int), ("s", 2, Ty::String)]);
        assert_eq!(allocator.slot_for("x", &Ty::Int), Some(0));
        assert_eq!(allocator.slot_for("x", &Ty::Bool), None);
        assert_eq!(allocator.slot_for("missing", &Ty::Int), None);
        assert_eq!(allocator.previous_slot_count(), 3);
    }
}
