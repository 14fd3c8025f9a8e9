//! The lowering chain.
//!
//! Turns a bound routine body into the flat form the code generator
//! accepts. The steps run in a fixed order and each one is skipped when it
//! has nothing to do:
//!
//! 1. [`local_rewriter`]: desugars declarations, `if`/`while`, compound
//!    assignment and dynamic operations, and reports [`LocalFacts`]
//! 2. [`handler_rewriter`]: only when a suspension point sits inside a
//!    `try`; moves handlers out of the way of the state machine
//! 3. [`closures`]: only when lambdas were found
//! 4. [`iterator`]: generator routines
//! 5. [`async_rewriter`]: routines with suspension points that are not
//!    generators
//!
//! A tree that already carries the error marker is returned unchanged by
//! every step. Synthesized routines discovered along the way (lambda
//! bodies, frame and state-machine members) are handed to the
//! [`LoweringHost`], which owns them until the synthesis phase.

pub mod async_rewriter;
pub mod closures;
mod factory;
pub mod handler_rewriter;
pub mod initializers;
pub mod iterator;
pub mod local_rewriter;
mod state_machine;
pub mod well_known;

use std::sync::Arc;

use kiln_core::bound::Stmt;
use kiln_core::symbols::RoutineDescriptor;
use kiln_core::{DiagnosticBag, ResumableTypeDescriptor, VariableSlotAllocator};
use tracing::trace;

pub use initializers::{FieldInitializer, lower_field_initializers};
pub use local_rewriter::LocalFacts;

/// A routine created by lowering, with the body it will be compiled from.
#[derive(Debug, Clone)]
pub struct SynthesizedMethod {
    pub routine: Arc<RoutineDescriptor>,
    pub body: Stmt,
    /// Set for a state machine's `MoveNext`.
    pub resumable: Option<Arc<ResumableTypeDescriptor>>,
}

/// Receives what lowering creates outside the routine being lowered.
pub trait LoweringHost {
    /// Queue a synthesized routine for the synthesis phase.
    fn record_synthesized(&mut self, method: SynthesizedMethod);

    /// Next ordinal for naming a synthesized member or type.
    fn next_ordinal(&mut self) -> u32;
}

/// Everything one lowering run reads or writes besides the tree.
pub struct LoweringContext<'a> {
    pub routine: &'a Arc<RoutineDescriptor>,
    pub host: &'a mut dyn LoweringHost,
    pub diagnostics: &'a mut DiagnosticBag,
    /// Dynamic operations are rejected in an incremental patch build.
    pub patch_build: bool,
    pub slot_allocator: Option<Arc<VariableSlotAllocator>>,
}

/// A step of the chain that actually ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LoweringStep {
    LocalRewrite,
    HandlerRewrite,
    ClosureConversion,
    GeneratorStateMachine,
    AsyncStateMachine,
}

/// Output of the chain for one routine.
#[derive(Debug, Clone)]
pub struct LoweringResult {
    pub body: Stmt,
    pub resumable: Option<Arc<ResumableTypeDescriptor>>,
    pub slot_allocator: Option<Arc<VariableSlotAllocator>>,
    pub facts: LocalFacts,
    pub steps: Vec<LoweringStep>,
}

impl LoweringResult {
    fn unchanged(body: Stmt, cx: &LoweringContext<'_>) -> Self {
        Self {
            body,
            resumable: None,
            slot_allocator: cx.slot_allocator.clone(),
            facts: LocalFacts::default(),
            steps: Vec::new(),
        }
    }

    pub fn has_errors(&self) -> bool {
        self.body.has_errors
    }
}

/// Run the whole chain over a routine body.
#[cfg_attr(feature = "profiling", profiling::function)]
pub fn lower_body(body: Stmt, cx: &mut LoweringContext<'_>) -> LoweringResult {
    if body.has_errors {
        return LoweringResult::unchanged(body, cx);
    }

    let routine = cx.routine.clone();
    let mut steps = vec![LoweringStep::LocalRewrite];
    let (mut body, facts) = local_rewriter::rewrite(body);
    trace!(routine = %routine.qualified_name(), ?facts, "local rewrite");

    if facts.has_dynamic && cx.patch_build {
        cx.diagnostics.add(
            kiln_core::DiagnosticKind::DynamicOperationInPatchBuild,
            routine.span,
        );
        body = body.with_errors();
    }

    if !body.has_errors && facts.suspends_in_handler {
        steps.push(LoweringStep::HandlerRewrite);
        body = handler_rewriter::rewrite(body);
    }

    if !body.has_errors && facts.has_closures {
        steps.push(LoweringStep::ClosureConversion);
        body = closures::convert(&routine, body, cx);
    }

    let mut resumable = None;
    if !body.has_errors {
        if routine.is_generator() {
            steps.push(LoweringStep::GeneratorStateMachine);
            let (kickoff, descriptor) = iterator::convert(&routine, body, cx);
            body = kickoff;
            resumable = descriptor;
        } else if facts.has_suspensions || routine.is_async() {
            steps.push(LoweringStep::AsyncStateMachine);
            let (kickoff, descriptor) = async_rewriter::convert(&routine, body, cx);
            body = kickoff;
            resumable = descriptor;
        }
    }

    LoweringResult {
        body,
        resumable,
        slot_allocator: cx.slot_allocator.clone(),
        facts,
        steps,
    }
}

/// Lower a routine synthesized by an earlier lowering run.
///
/// Its body is already flat; only generator and suspend-style lambdas
/// still need their state machine.
pub fn lower_synthesized(body: Stmt, cx: &mut LoweringContext<'_>) -> LoweringResult {
    let routine = cx.routine.clone();
    if body.has_errors || !(routine.is_async() || routine.is_generator()) {
        return LoweringResult::unchanged(body, cx);
    }
    let (step, (body, resumable)) = if routine.is_generator() {
        (
            LoweringStep::GeneratorStateMachine,
            iterator::convert(&routine, body, cx),
        )
    } else {
        (
            LoweringStep::AsyncStateMachine,
            async_rewriter::convert(&routine, body, cx),
        )
    };
    LoweringResult {
        body,
        resumable,
        slot_allocator: cx.slot_allocator.clone(),
        facts: LocalFacts::default(),
        steps: vec![step],
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use kiln_core::bound::{CatchClause, Expr, StmtKind, contains_expr, contains_stmt};
    use kiln_core::symbols::{RoutineFlags, RoutineKind};
    use kiln_core::{DiagnosticKind, NamedType, Ty, TypeKind};

    fn create_test_routine(flags: RoutineFlags, returns: Ty) -> Arc<RoutineDescriptor> {
        let owner = NamedType::new("Chain", TypeKind::Class);
        RoutineDescriptor::builder(&owner, "Run", RoutineKind::Ordinary)
            .flags(flags)
            .returns(returns)
            .build()
    }

    #[test]
    fn erroneous_body_is_returned_unchanged() {
        let routine = create_test_routine(RoutineFlags::GENERATOR, Ty::Object);
        let body = Stmt::expr(Expr::error(Ty::Int));
        let mut host = RecordingHost::default();
        let mut diagnostics = DiagnosticBag::new();
        let mut cx = create_test_context(&routine, &mut host, &mut diagnostics);

        let result = lower_body(body.clone(), &mut cx);
        assert_eq!(result.body, body);
        assert!(result.steps.is_empty());
        assert!(result.resumable.is_none());
        assert!(host.methods.is_empty());
    }

    #[test]
    fn generator_with_yield_in_try_rewrites_handlers_first() {
        let routine = create_test_routine(RoutineFlags::GENERATOR, Ty::Object);
        let body = Stmt::block(
            vec![],
            vec![Stmt::try_(
                Stmt::yield_(Expr::int(1)),
                vec![],
                Some(Stmt::no_op()),
            )],
        );
        let mut host = RecordingHost::default();
        let mut diagnostics = DiagnosticBag::new();
        let mut cx = create_test_context(&routine, &mut host, &mut diagnostics);

        let result = lower_body(body, &mut cx);
        assert_eq!(
            result.steps,
            vec![
                LoweringStep::LocalRewrite,
                LoweringStep::HandlerRewrite,
                LoweringStep::GeneratorStateMachine
            ]
        );
        let descriptor = result.resumable.expect("generator descriptor");
        assert_eq!(descriptor.kind, kiln_core::ResumableKind::Generator);

        let move_next = host
            .methods
            .iter()
            .find(|m| m.resumable.is_some())
            .expect("MoveNext recorded");
        // The finally moved out of the protected region.
        assert!(!contains_stmt(&move_next.body, &|s| matches!(
            &s.kind,
            StmtKind::Try { finally: Some(_), .. }
        )));
        assert!(contains_stmt(&move_next.body, &|s| matches!(
            s.kind,
            StmtKind::Suspend { .. }
        )));
    }

    #[test]
    fn dynamic_operation_in_patch_build_is_rejected() {
        let routine = create_test_routine(RoutineFlags::STATIC, Ty::Void);
        let body = Stmt::expr(Expr::dynamic("Go", Expr::null(Ty::Dynamic), vec![]));
        let mut host = RecordingHost::default();
        let mut diagnostics = DiagnosticBag::new();
        let mut cx = create_test_context(&routine, &mut host, &mut diagnostics);
        cx.patch_build = true;

        let result = lower_body(body, &mut cx);
        assert!(result.has_errors());
        assert!(result.facts.has_dynamic);
        assert!(
            diagnostics
                .iter()
                .any(|d| d.kind == DiagnosticKind::DynamicOperationInPatchBuild)
        );
    }

    #[test]
    fn plain_routine_runs_only_the_local_rewrite() {
        let routine = create_test_routine(RoutineFlags::STATIC, Ty::Void);
        let clause = CatchClause {
            local: None,
            exception_type: Ty::Object,
            body: Stmt::no_op(),
        };
        let body = Stmt::try_(
            Stmt::if_(Expr::boolean(true), Stmt::no_op(), None),
            vec![clause],
            None,
        );
        let mut host = RecordingHost::default();
        let mut diagnostics = DiagnosticBag::new();
        let mut cx = create_test_context(&routine, &mut host, &mut diagnostics);

        let result = lower_body(body, &mut cx);
        assert_eq!(result.steps, vec![LoweringStep::LocalRewrite]);
        assert!(!contains_stmt(&result.body, &|s| matches!(s.kind, StmtKind::If { .. })));
        assert!(!contains_expr(&result.body, &|e| e.has_errors));
    }
}
