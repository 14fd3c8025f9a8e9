//! Code generator for lowered routine bodies.
//!
//! The [`CodeGenerator`] walks a fully lowered statement tree once, in
//! order, and drives an [`InstructionBuilder`]. It never sees sugared
//! nodes: `If`, `While`, lambdas, awaits and dynamic operations are gone by
//! the time a tree gets here, and meeting one is an internal fault.
//!
//! The work is split the same way the tree is:
//!
//! - `address`: the home resolver, deciding how to get a reference to a
//!   value and when a temporary has to be materialized
//! - `expr`: value emission, assignments and calls
//! - `stmt`: statements, exception regions and suspension points

mod address;
mod expr;
mod stmt;

use std::sync::Arc;

use kiln_core::bound::Stmt;
use kiln_core::symbols::{LabelId, RoutineDescriptor, RoutineKind, SynthesizedKind};
use kiln_core::{InternalFault, ResumableKind, ResumableTypeDescriptor, VariableSlotAllocator};
use rustc_hash::FxHashMap;

use crate::builder::{BuiltCode, HandlerKind, InstructionBuilder, Label};
use crate::locals::{LocalSlotManager, TempHandle};
use crate::OpCode;

pub use address::AddressKind;

type Result<T> = std::result::Result<T, InternalFault>;

/// Switches that change the shape of emitted code.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CodeGenOptions {
    /// Emit sequence points and debug scopes.
    pub debug_info: bool,
    /// Drop `NoOp` statements and free user locals at scope exit.
    pub optimize: bool,
}

/// What the generator observed while emitting a resumable body.
#[derive(Debug, Clone, Default)]
pub(crate) struct SuspensionOffsets {
    pub yields: Vec<usize>,
    pub resumes: Vec<usize>,
}

/// Single-use generator for one routine body.
pub(crate) struct CodeGenerator<'a> {
    routine: &'a RoutineDescriptor,
    builder: InstructionBuilder,
    locals: LocalSlotManager,
    labels: FxHashMap<LabelId, Label>,
    options: CodeGenOptions,

    /// Shared exit for returns inside protected regions.
    return_label: Option<Label>,
    return_temp: Option<TempHandle>,

    /// Temporaries that live until the end of the current statement.
    statement_temps: Vec<TempHandle>,

    suspensions: SuspensionOffsets,
}

/// Result of a successful generation.
pub(crate) struct Generated {
    pub code: BuiltCode,
    pub locals: LocalSlotManager,
    pub suspensions: SuspensionOffsets,
}

impl<'a> CodeGenerator<'a> {
    pub(crate) fn new(
        routine: &'a RoutineDescriptor,
        slot_allocator: Option<Arc<VariableSlotAllocator>>,
        options: CodeGenOptions,
    ) -> Self {
        Self {
            routine,
            builder: InstructionBuilder::new(routine.id, options.debug_info),
            locals: LocalSlotManager::new(slot_allocator),
            labels: FxHashMap::default(),
            options,
            return_label: None,
            return_temp: None,
            statement_temps: Vec::new(),
            suspensions: SuspensionOffsets::default(),
        }
    }

    /// Emit `body` and close the routine.
    #[cfg_attr(feature = "profiling", profiling::function)]
    pub(crate) fn generate(mut self, body: &Stmt) -> Result<Generated> {
        self.emit_stmt(body)?;

        if self.builder.is_reachable() {
            if self.routine.returns_void() {
                self.builder.emit_ret(false);
            } else {
                let ty = self.routine.return_type.clone();
                self.emit_default(&ty);
                self.builder.emit_ret(true);
            }
        }

        if let Some(label) = self.return_label {
            self.builder.mark_label(label);
            match self.return_temp.take() {
                Some(temp) => {
                    self.builder.emit_u16(OpCode::LoadLocal, temp.slot);
                    self.builder.emit_ret(true);
                    self.locals.free_temp(temp);
                }
                None => self.builder.emit_ret(false),
            }
        }

        let code = self.builder.finish()?;
        Ok(Generated {
            code,
            locals: self.locals,
            suspensions: self.suspensions,
        })
    }

    fn label_for(&mut self, id: LabelId) -> Label {
        if let Some(&label) = self.labels.get(&id) {
            return label;
        }
        let label = self.builder.define_label();
        self.labels.insert(id, label);
        label
    }

    fn free_optional_temp(&mut self, temp: Option<TempHandle>) {
        if let Some(temp) = temp {
            self.locals.free_temp(temp);
        }
    }

    fn free_statement_temps(&mut self) {
        for temp in std::mem::take(&mut self.statement_temps) {
            self.locals.free_temp(temp);
        }
    }

    /// Argument slot of declared parameter `index`.
    fn argument_slot(&self, index: u16) -> u16 {
        index + self.routine.implicit_argument_count()
    }
}

/// Handler offset of the catch-all wrapped around an async `MoveNext`.
pub(crate) fn async_catch_handler_offset(code: &BuiltCode) -> Option<usize> {
    code.exception_regions
        .iter()
        .rev()
        .find(|region| matches!(region.kind, HandlerKind::Catch(_)))
        .map(|region| region.handler_start)
}

pub(crate) fn is_async_move_next(
    routine: &RoutineDescriptor,
    resumable: Option<&ResumableTypeDescriptor>,
) -> bool {
    routine.kind == RoutineKind::Synthesized(SynthesizedKind::StateMachineMoveNext)
        && resumable.is_some_and(|r| r.kind == ResumableKind::Async)
}
