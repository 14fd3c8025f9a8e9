use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use super::RefKind;
use crate::Ty;

/// Ids handed out to compiler-introduced locals and labels start here, well
/// above anything a binder assigns to source locals.
const SYNTHESIZED_ID_BASE: u32 = 1 << 24;

static NEXT_LOCAL: AtomicU32 = AtomicU32::new(SYNTHESIZED_ID_BASE);
static NEXT_LABEL: AtomicU32 = AtomicU32::new(SYNTHESIZED_ID_BASE);

/// Identity of a local within its routine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LocalId(pub u32);

impl LocalId {
    /// A fresh id for a compiler-introduced local.
    pub fn fresh() -> Self {
        LocalId(NEXT_LOCAL.fetch_add(1, Ordering::Relaxed))
    }
}

/// A jump target in a lowered statement list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LabelId(pub u32);

impl LabelId {
    /// A fresh label for lowering-introduced control flow.
    pub fn fresh() -> Self {
        LabelId(NEXT_LABEL.fetch_add(1, Ordering::Relaxed))
    }
}

/// Who introduced a local.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LocalKind {
    /// Declared in source.
    User,
    /// Introduced by lowering (spills, frames, pending exceptions).
    Synthesized,
}

/// A local variable referenced by the bound tree.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LocalSymbol {
    pub id: LocalId,
    pub name: Arc<str>,
    pub ty: Ty,
    pub ref_kind: RefKind,
    pub kind: LocalKind,
    /// Lives only on the evaluation stack; has no slot and no address.
    pub stack_only: bool,
}

impl LocalSymbol {
    /// A source-declared local with a binder-assigned id.
    pub fn user(id: u32, name: &str, ty: Ty) -> Self {
        Self {
            id: LocalId(id),
            name: Arc::from(name),
            ty,
            ref_kind: RefKind::None,
            kind: LocalKind::User,
            stack_only: false,
        }
    }

    /// A compiler-introduced local with a fresh id.
    pub fn synthesized(name: &str, ty: Ty) -> Self {
        Self {
            id: LocalId::fresh(),
            name: Arc::from(name),
            ty,
            ref_kind: RefKind::None,
            kind: LocalKind::Synthesized,
            stack_only: false,
        }
    }

    pub fn with_ref_kind(mut self, ref_kind: RefKind) -> Self {
        self.ref_kind = ref_kind;
        self
    }

    pub fn on_stack(mut self) -> Self {
        self.stack_only = true;
        self
    }

    pub fn is_synthesized(&self) -> bool {
        self.kind == LocalKind::Synthesized
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_ids_do_not_collide_with_binder_ids() {
        let user = LocalSymbol::user(3, "x", Ty::Int);
        let temp = LocalSymbol::synthesized("t", Ty::Int);
        assert_ne!(user.id, temp.id);
        assert!(temp.id.0 >= SYNTHESIZED_ID_BASE);
        assert!(temp.is_synthesized());
    }

    #[test]
    fn labels_are_unique() {
        assert_ne!(LabelId::fresh(), LabelId::fresh());
    }
}
