//! Code generation for lowered routine bodies.
//!
//! Takes the output of the lowering chain for one routine and produces a
//! [`MethodBody`]: instruction stream, token table, local signature,
//! exception regions and optional debug and state-machine metadata.
//!
//! ## Modules
//!
//! - [`opcode`]: the instruction set
//! - [`stream`]: raw instruction bytes, decoding and test helpers
//! - [`tokens`]: per-body token table
//! - [`builder`]: stack simulation, labels, regions and debug scopes
//! - [`locals`]: local slot assignment and temporaries
//! - [`body`]: the packaged result
//!
//! Internal-consistency faults come back as `Err(InternalFault)`.
//! Capacity problems are user diagnostics: they land in the caller's bag
//! and the result is `Ok(None)`.

pub mod body;
pub mod builder;
mod generator;
pub mod locals;
pub mod opcode;
pub mod stream;
pub mod tokens;

use std::sync::Arc;

use kiln_core::bound::Stmt;
use kiln_core::symbols::RoutineDescriptor;
use kiln_core::{
    DiagnosticBag, DiagnosticKind, ImportScope, InternalFault, ResumableTypeDescriptor,
    VariableSlotAllocator,
};
use tracing::{debug, error};

pub use body::{MethodBody, ResumableInfo};
pub use builder::{DebugScope, ExceptionRegion, HandlerKind, ScopeVariable};
pub use generator::{AddressKind, CodeGenOptions};
pub use locals::{LocalInfo, MAX_LOCALS};
pub use opcode::OpCode;
pub use tokens::Token;

use generator::CodeGenerator;

/// Everything besides the tree that shapes one generated body.
#[derive(Debug, Clone, Default)]
pub struct GenerationInput<'a> {
    /// State machine the routine was lowered into, if any.
    pub resumable: Option<&'a ResumableTypeDescriptor>,
    /// Slots of the previous generation in a patch build.
    pub slot_allocator: Option<Arc<VariableSlotAllocator>>,
    /// Debug import scopes, innermost first.
    pub namespace_scopes: Vec<ImportScope>,
    pub options: CodeGenOptions,
}

/// Generate the body of `routine` from its lowered tree.
#[cfg_attr(feature = "profiling", profiling::function)]
pub fn generate_method_body(
    routine: &RoutineDescriptor,
    body: &Stmt,
    input: GenerationInput<'_>,
    diagnostics: &mut DiagnosticBag,
) -> Result<Option<MethodBody>, InternalFault> {
    let generated = CodeGenerator::new(routine, input.slot_allocator, input.options)
        .generate(body)
        .inspect_err(|fault| error!(routine = %routine.qualified_name(), %fault, "code generation fault"))?;

    if generated.locals.overflowed() {
        diagnostics.add(
            DiagnosticKind::TooManyLocals {
                routine: routine.qualified_name(),
                limit: MAX_LOCALS,
            },
            routine.span,
        );
        return Ok(None);
    }

    let resumable = input.resumable.map(|descriptor| {
        let catch_handler_offset = if generator::is_async_move_next(routine, Some(descriptor)) {
            generator::async_catch_handler_offset(&generated.code)
        } else {
            None
        };
        ResumableInfo {
            type_name: Arc::from(descriptor.name()),
            kind: descriptor.kind,
            move_next: descriptor.move_next.id,
            yield_offsets: generated.suspensions.yields.clone(),
            resume_offsets: generated.suspensions.resumes.clone(),
            catch_handler_offset,
            hoisted: descriptor
                .hoisted
                .iter()
                .map(|h| (h.name.clone(), h.field.id))
                .collect(),
        }
    });

    let code = generated.code;
    debug!(
        routine = %routine.qualified_name(),
        bytes = code.code.len(),
        max_stack = code.max_stack,
        "generated body"
    );

    let namespace_scopes = if input.options.debug_info {
        input.namespace_scopes
    } else {
        Vec::new()
    };

    Ok(Some(MethodBody {
        routine: routine.id,
        code: code.code,
        tokens: code.tokens.into_vec(),
        max_stack: code.max_stack,
        locals: generated.locals.into_infos(),
        exception_regions: code.exception_regions,
        sequence_points: code.sequence_points,
        debug_scopes: code.debug_scopes,
        namespace_scopes,
        resumable,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_core::bound::{BinaryOp, Expr};
    use kiln_core::symbols::{LocalSymbol, RoutineFlags, RoutineKind};
    use kiln_core::{NamedType, Ty, TypeKind};

    fn create_test_routine() -> Arc<RoutineDescriptor> {
        let owner = NamedType::new("Crowded", TypeKind::Class);
        RoutineDescriptor::builder(&owner, "Run", RoutineKind::Ordinary)
            .flags(RoutineFlags::STATIC)
            .build()
    }

    fn spill() -> Stmt {
        Stmt::expr(Expr::address_of(Expr::binary(
            BinaryOp::Add,
            Expr::int(2),
            Expr::int(3),
        )))
    }

    #[test]
    fn body_past_local_capacity_is_reported_not_generated() {
        let routine = create_test_routine();
        let locals: Vec<_> = (0..MAX_LOCALS as u32)
            .map(|id| LocalSymbol::user(id, "filler", Ty::Int))
            .collect();
        let body = Stmt::block(locals, vec![spill(), spill()]);

        let mut diagnostics = DiagnosticBag::new();
        let result =
            generate_method_body(&routine, &body, GenerationInput::default(), &mut diagnostics);

        assert!(matches!(result, Ok(None)));
        assert_eq!(diagnostics.len(), 1);
        assert!(diagnostics.iter().any(|d| matches!(
            &d.kind,
            DiagnosticKind::TooManyLocals { limit, .. } if *limit == MAX_LOCALS
        )));
    }

    #[test]
    fn body_within_capacity_is_generated() {
        let routine = create_test_routine();
        let body = Stmt::block(vec![], vec![spill(), spill()]);

        let mut diagnostics = DiagnosticBag::new();
        let generated =
            generate_method_body(&routine, &body, GenerationInput::default(), &mut diagnostics)
                .unwrap()
                .unwrap();

        assert!(diagnostics.is_empty());
        assert_eq!(generated.locals.len(), 1);
    }
}
