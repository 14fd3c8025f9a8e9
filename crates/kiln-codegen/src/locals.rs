//! Local slot assignment.
//!
//! Locals get slots on first use. Synthesized temporaries are pooled by
//! type and handed out again once released. In a patch build, locals that
//! survive from the previous generation keep their old slot and every
//! other previous slot stays reserved.

use std::sync::Arc;

use kiln_core::symbols::{LocalId, LocalKind, LocalSymbol};
use kiln_core::{Ty, VariableSlotAllocator};
use rustc_hash::FxHashMap;

/// Highest number of local slots a body may use.
pub const MAX_LOCALS: usize = 0xFFFE;

/// Handed out once the table is full. Never stored, never reused; the
/// body is discarded with a capacity diagnostic.
const OVERFLOW_SLOT: u16 = u16::MAX;

/// Signature entry for one local slot.
#[derive(Debug, Clone, PartialEq)]
pub struct LocalInfo {
    pub name: Option<Arc<str>>,
    pub ty: Ty,
    pub by_ref: bool,
    pub synthesized: bool,
    /// Held for a previous generation and never used by this body.
    pub retired: bool,
}

/// A borrowed temporary slot. Give it back with [`LocalSlotManager::free_temp`].
#[derive(Debug, Clone, PartialEq)]
pub struct TempHandle {
    pub slot: u16,
    pub ty: Ty,
}

#[derive(Debug, Default)]
pub struct LocalSlotManager {
    slots: Vec<LocalInfo>,
    by_id: FxHashMap<LocalId, u16>,
    free: Vec<u16>,
    allocator: Option<Arc<VariableSlotAllocator>>,
    overflowed: bool,
}

impl LocalSlotManager {
    pub fn new(allocator: Option<Arc<VariableSlotAllocator>>) -> Self {
        let mut manager = Self::default();
        if let Some(previous) = &allocator {
            for slot in 0..previous.previous_slot_count() {
                manager.slots.push(LocalInfo {
                    name: previous.previous_name(slot).cloned(),
                    ty: Ty::Void,
                    by_ref: false,
                    synthesized: false,
                    retired: true,
                });
            }
        }
        manager.allocator = allocator;
        manager
    }

    /// Slot for `local`, assigning one on first use.
    pub fn declare(&mut self, local: &LocalSymbol) -> u16 {
        if let Some(&slot) = self.by_id.get(&local.id) {
            return slot;
        }
        let info = LocalInfo {
            name: Some(local.name.clone()),
            ty: local.ty.clone(),
            by_ref: local.ref_kind.is_by_ref(),
            synthesized: local.kind == LocalKind::Synthesized,
            retired: false,
        };

        let preserved = match (&self.allocator, local.kind) {
            (Some(previous), LocalKind::User) => previous.slot_for(&local.name, &local.ty),
            _ => None,
        };
        let slot = match preserved {
            Some(slot) if self.slots.get(slot as usize).is_some_and(|s| s.retired) => {
                self.slots[slot as usize] = info;
                slot
            }
            _ => self.push(info),
        };
        self.by_id.insert(local.id, slot);
        slot
    }

    pub fn slot_of(&self, id: LocalId) -> Option<u16> {
        self.by_id.get(&id).copied()
    }

    /// Borrow a temporary slot of type `ty`, reusing a released one if possible.
    pub fn allocate_temp(&mut self, ty: &Ty) -> TempHandle {
        let reuse = self
            .free
            .iter()
            .position(|&slot| self.slots.get(slot as usize).is_some_and(|info| info.ty == *ty));
        let slot = match reuse {
            Some(at) => self.free.swap_remove(at),
            None => self.push(LocalInfo {
                name: None,
                ty: ty.clone(),
                by_ref: false,
                synthesized: true,
                retired: false,
            }),
        };
        TempHandle {
            slot,
            ty: ty.clone(),
        }
    }

    pub fn free_temp(&mut self, temp: TempHandle) {
        if self.is_assigned(temp.slot) && !self.free.contains(&temp.slot) {
            self.free.push(temp.slot);
        }
    }

    /// Release the slot of a local whose scope has ended.
    pub fn free_local(&mut self, id: LocalId) {
        if let Some(slot) = self.by_id.remove(&id) {
            if self.is_assigned(slot) {
                self.free.push(slot);
            }
        }
    }

    fn is_assigned(&self, slot: u16) -> bool {
        (slot as usize) < self.slots.len()
    }

    /// Stop tracking `id` without releasing its slot.
    ///
    /// The caller takes over the slot as a temporary, which keeps a scope
    /// local alive past the end of its scope.
    pub fn detach(&mut self, id: LocalId) -> Option<TempHandle> {
        let slot = self.by_id.remove(&id)?;
        let ty = self.slots.get(slot as usize)?.ty.clone();
        Some(TempHandle { slot, ty })
    }

    pub fn is_free(&self, slot: u16) -> bool {
        self.free.contains(&slot)
    }

    pub fn info(&self, slot: u16) -> Option<&LocalInfo> {
        self.slots.get(slot as usize)
    }

    pub fn count(&self) -> usize {
        self.slots.len()
    }

    /// More slots were requested than a body may hold.
    pub fn overflowed(&self) -> bool {
        self.overflowed
    }

    pub fn into_infos(self) -> Vec<LocalInfo> {
        self.slots
    }

    fn push(&mut self, info: LocalInfo) -> u16 {
        if self.slots.len() >= MAX_LOCALS {
            self.overflowed = true;
            return OVERFLOW_SLOT;
        }
        self.slots.push(info);
        (self.slots.len() - 1) as u16
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn declare_is_idempotent() {
        let mut locals = LocalSlotManager::new(None);
        let x = LocalSymbol::user(1, "x", Ty::Int);
        let y = LocalSymbol::user(2, "y", Ty::Int);
        assert_eq!(locals.declare(&x), 0);
        assert_eq!(locals.declare(&y), 1);
        assert_eq!(locals.declare(&x), 0);
        assert_eq!(locals.slot_of(y.id), Some(1));
    }

    #[test]
    fn temps_are_reused_by_type() {
        let mut locals = LocalSlotManager::new(None);
        let a = locals.allocate_temp(&Ty::Int);
        let slot = a.slot;
        locals.free_temp(a);
        assert!(locals.is_free(slot));

        let s = locals.allocate_temp(&Ty::String);
        assert_ne!(s.slot, slot);
        let b = locals.allocate_temp(&Ty::Int);
        assert_eq!(b.slot, slot);
        assert!(!locals.is_free(slot));
    }

    fn fill_to_capacity(locals: &mut LocalSlotManager) {
        for id in 0..MAX_LOCALS as u32 {
            locals.declare(&LocalSymbol::user(id, "filler", Ty::Int));
        }
        assert!(!locals.overflowed());
    }

    #[test]
    fn full_table_overflows_without_reusing_the_overflow_slot() {
        let mut locals = LocalSlotManager::new(None);
        fill_to_capacity(&mut locals);

        let first = locals.allocate_temp(&Ty::Int);
        assert!(locals.overflowed());
        let slot = first.slot;
        locals.free_temp(first);
        assert!(!locals.is_free(slot));

        let second = locals.allocate_temp(&Ty::Int);
        assert_eq!(second.slot, slot);
        assert_eq!(locals.count(), MAX_LOCALS);
    }

    #[test]
    fn overflowed_local_is_not_released_at_scope_exit() {
        let mut locals = LocalSlotManager::new(None);
        fill_to_capacity(&mut locals);
        let late = LocalSymbol::synthesized("late", Ty::Int);
        let slot = locals.declare(&late);
        locals.free_local(late.id);
        assert!(locals.overflowed());
        assert!(!locals.is_free(slot));
        assert!(locals.info(slot).is_none());
    }

    #[test]
    fn patch_build_keeps_previous_slots() {
        let previous = VariableSlotAllocator::new([("total", 1, Ty::Int), ("gone", 0, Ty::Int)]);
        let mut locals = LocalSlotManager::new(Some(Arc::new(previous)));
        let fresh = LocalSymbol::user(5, "fresh", Ty::Int);
        let total = LocalSymbol::user(6, "total", Ty::Int);
        assert_eq!(locals.declare(&fresh), 2);
        assert_eq!(locals.declare(&total), 1);
        assert!(locals.info(0).is_some_and(|info| info.retired));
    }

    #[test]
    fn changed_type_gets_a_new_slot() {
        let previous = VariableSlotAllocator::new([("total", 0, Ty::Int)]);
        let mut locals = LocalSlotManager::new(Some(Arc::new(previous)));
        let total = LocalSymbol::user(6, "total", Ty::String);
        assert_eq!(locals.declare(&total), 1);
    }
}
