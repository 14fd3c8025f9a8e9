//! The per-routine pipeline.
//!
//! ```text
//! Unbound ─► Bound ─► Diagnosed ─► Lowered ─► Generated ─► Packaged
//!    │          └─────────┴────────────┴──────────┴──► Failed
//!    └──► Skipped
//! ```
//!
//! Every run owns one scoped bag. It is merged into the aggregate sink
//! exactly once, whatever state the run ends in. A run that ends in
//! `Failed` sets the global error flag and hands nothing to the module.

use std::sync::Arc;

use kiln_codegen::{GenerationInput, generate_method_body};
use kiln_core::bound::{Expr, Stmt};
use kiln_core::symbols::{AccessorKind, RoutineDescriptor, RoutineFlags, RoutineKind};
use kiln_core::{
    DiagnosticBag, DiagnosticKind, ImportChain, ResumableTypeDescriptor, Ty,
    VariableSlotAllocator,
};
use kiln_lowering::{LoweringContext, SynthesizedMethod, lower_body, lower_synthesized};
use tracing::{debug, error, trace};

use crate::collaborators::{ConstructorInitializer, ModuleBuilder};
use crate::ctor_init::bind_constructor_initializer;
use crate::env::CompilationEnv;
use crate::passes::{self, CheckContext, FlowTarget};
use crate::type_state::{InitializerKind, LoweredInitializers, TypeCompilationState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PipelineState {
    Unbound,
    Bound,
    /// Terminal when no module is being built.
    Diagnosed,
    Lowered,
    Generated,
    Packaged,
    Skipped,
    Failed,
}

/// A bound body before it is combined with its constructor prefix.
struct BoundRoutine {
    body: Stmt,
    imports: ImportChain,
    initializer: ConstructorInitializer,
}

impl BoundRoutine {
    fn synthesized(body: Stmt) -> Self {
        Self {
            body,
            imports: ImportChain::empty(),
            initializer: ConstructorInitializer::Implicit,
        }
    }
}

/// One routine on its way through the pipeline.
pub struct MethodPipeline<'a> {
    env: &'a CompilationEnv,
    state: &'a mut TypeCompilationState,
    routine: Arc<RoutineDescriptor>,
    diagnostics: DiagnosticBag,
    stage: PipelineState,
}

impl<'a> MethodPipeline<'a> {
    pub fn new(
        env: &'a CompilationEnv,
        state: &'a mut TypeCompilationState,
        routine: Arc<RoutineDescriptor>,
    ) -> Self {
        Self {
            env,
            state,
            routine,
            diagnostics: DiagnosticBag::new(),
            stage: PipelineState::Unbound,
        }
    }

    /// Drive the routine to a terminal state.
    #[cfg_attr(feature = "profiling", profiling::function)]
    pub fn run(mut self) -> PipelineState {
        let outcome = if self.should_skip() {
            PipelineState::Skipped
        } else {
            self.compile()
        };
        self.finish(outcome)
    }

    fn transition(&mut self, next: PipelineState) {
        trace!(
            routine = %self.routine.qualified_name(),
            from = ?self.stage,
            to = ?next,
            "pipeline transition"
        );
        self.stage = next;
    }

    fn should_skip(&mut self) -> bool {
        let routine = &self.routine;
        if !self.env.options.admits(routine) || routine.is_abstract() {
            return true;
        }
        if routine.is_extern() {
            if !routine
                .flags
                .contains(RoutineFlags::IMPLEMENTATION_ANNOTATED)
            {
                let name = routine.qualified_name();
                let kind = if routine.is_constructor() {
                    DiagnosticKind::ExternConstructorNoImplementation { routine: name }
                } else {
                    DiagnosticKind::ExternMethodNoImplementation { routine: name }
                };
                self.diagnostics.add(kind, routine.span);
            }
            return true;
        }
        // With instance initializers the default constructor has work to do.
        routine.is_default_value_type_constructor()
            && !self.state.has_initializers(InitializerKind::Instance)
    }

    fn bind(&mut self) -> BoundRoutine {
        let routine = &self.routine;
        if let Some(body) = &routine.synthesized_body {
            return BoundRoutine::synthesized((**body).clone());
        }
        if routine.is_auto_property_accessor() {
            return BoundRoutine::synthesized(auto_property_body(routine));
        }
        if routine.is_implicit() {
            return BoundRoutine::synthesized(Stmt::block(Vec::new(), Vec::new()).at(routine.span));
        }

        let mut bound = self.env.binder.bind(routine);
        self.diagnostics.append(&mut bound.diagnostics);
        BoundRoutine {
            body: bound.body,
            imports: bound.imports,
            initializer: bound.initializer,
        }
    }

    fn included_initializers(&self, initializer: &ConstructorInitializer) -> Option<InitializerKind> {
        let kind = if self.routine.is_static_constructor() {
            InitializerKind::Static
        } else if self.routine.kind == RoutineKind::Constructor
            && !matches!(initializer, ConstructorInitializer::This { .. })
        {
            InitializerKind::Instance
        } else {
            return None;
        };
        self.state.has_initializers(kind).then_some(kind)
    }

    fn compile(&mut self) -> PipelineState {
        let BoundRoutine {
            body,
            imports,
            initializer,
        } = self.bind();
        self.transition(PipelineState::Bound);

        let initializers = self
            .included_initializers(&initializer)
            .map(|kind| self.state.get_or_compute_initializers(kind));
        let imports = match &initializers {
            Some(lowered) if imports.is_empty() => lowered.imports.clone(),
            _ => imports,
        };

        let previous = self.state.swap_imports(imports);
        let outcome = self.compile_bound(body, &initializer, initializers.as_deref());
        self.state.swap_imports(previous);
        outcome
    }

    fn compile_bound(
        &mut self,
        body: Stmt,
        initializer: &ConstructorInitializer,
        initializers: Option<&LoweredInitializers>,
    ) -> PipelineState {
        passes::check(&body, CheckContext::of(&self.routine), &mut self.diagnostics);
        let flow = passes::analyze(&body, &FlowTarget::of(&self.routine), &mut self.diagnostics);
        let body = if flow.end_reachable && self.routine.returns_void() {
            let span = body.span;
            Stmt::list(vec![body, Stmt::ret(None)]).at(span)
        } else {
            body
        };

        let body = self.with_prefix(body, initializer, initializers);
        if body.has_errors || self.diagnostics.has_errors() {
            return PipelineState::Failed;
        }
        self.transition(PipelineState::Diagnosed);

        let Some(module) = self.env.module.clone() else {
            return PipelineState::Diagnosed;
        };

        let lowered = {
            let mut cx = LoweringContext {
                routine: &self.routine,
                host: &mut *self.state,
                diagnostics: &mut self.diagnostics,
                patch_build: module.is_patch_build(),
                slot_allocator: module.slot_allocator(&self.routine),
            };
            lower_body(body, &mut cx)
        };
        if lowered.has_errors() || self.diagnostics.has_errors() {
            return PipelineState::Failed;
        }
        self.transition(PipelineState::Lowered);
        trace!(routine = %self.routine.qualified_name(), steps = ?lowered.steps, "lowered");

        generate_and_package(
            self.env,
            module.as_ref(),
            &self.routine,
            &lowered.body,
            lowered.resumable.as_deref(),
            lowered.slot_allocator,
            self.state.imports(),
            &mut self.diagnostics,
        )
    }

    /// Constructor prologue: `this = default`, field initializers, then the
    /// base or chained call, in that order, ahead of the body.
    fn with_prefix(
        &mut self,
        body: Stmt,
        initializer: &ConstructorInitializer,
        initializers: Option<&LoweredInitializers>,
    ) -> Stmt {
        let mut prologue = Vec::new();
        let ty = self.state.ty().clone();
        let is_instance_constructor = self.routine.kind == RoutineKind::Constructor;

        if is_instance_constructor && self.routine.is_implicit() && ty.is_value_type() {
            let this = Expr::this(ty.ty());
            prologue.push(Stmt::expr(Expr::assign(this, Expr::default_value(ty.ty()))));
        }
        if let Some(lowered) = initializers {
            let statements = if lowered.has_errors {
                lowered.body.clone().with_errors()
            } else {
                lowered.body.clone()
            };
            prologue.push(statements);
        }
        if is_instance_constructor {
            prologue.extend(bind_constructor_initializer(
                &self.routine,
                &ty,
                initializer,
                &mut self.diagnostics,
            ));
        }

        if prologue.is_empty() {
            return body;
        }
        let span = body.span;
        prologue.push(body);
        Stmt::list(prologue).at(span)
    }

    fn finish(mut self, outcome: PipelineState) -> PipelineState {
        self.transition(outcome);
        let stats = &self.env.stats;
        match outcome {
            PipelineState::Packaged => stats.routine_packaged(),
            PipelineState::Skipped => stats.routine_skipped(),
            PipelineState::Failed => {
                stats.routine_failed();
                self.env.error_flag.set();
            }
            _ => {}
        }
        debug!(
            routine = %self.routine.qualified_name(),
            ?outcome,
            diagnostics = self.diagnostics.len(),
            "pipeline finished"
        );
        self.env.sink.merge(self.diagnostics);
        outcome
    }
}

/// `return this.<backing>` or `this.<backing> = value`.
fn auto_property_body(routine: &RoutineDescriptor) -> Stmt {
    let Some(field) = &routine.backing_field else {
        return Stmt::expr(Expr::error(Ty::Void));
    };
    let receiver = (!field.is_static()).then(|| Expr::this(routine.this_type()));
    let storage = Expr::field(receiver, field);
    let body = match routine.kind {
        RoutineKind::Accessor(AccessorKind::Set) => match routine.parameters.first() {
            Some(value) => Stmt::expr(Expr::assign(storage, Expr::parameter(0, value))),
            None => Stmt::expr(Expr::error(Ty::Void)),
        },
        _ => Stmt::ret(Some(storage)),
    };
    body.at(routine.span)
}

/// Generate a lowered body and hand it to the module.
#[allow(clippy::too_many_arguments)]
fn generate_and_package(
    env: &CompilationEnv,
    module: &dyn ModuleBuilder,
    routine: &RoutineDescriptor,
    body: &Stmt,
    resumable: Option<&ResumableTypeDescriptor>,
    slot_allocator: Option<Arc<VariableSlotAllocator>>,
    imports: &ImportChain,
    diagnostics: &mut DiagnosticBag,
) -> PipelineState {
    let namespace_scopes = match &env.debug_info {
        Some(provider) if env.options.generate_debug_info => provider.namespace_scopes(imports),
        _ => Vec::new(),
    };
    let input = GenerationInput {
        resumable,
        slot_allocator,
        namespace_scopes,
        options: env.options.codegen(),
    };

    match generate_method_body(routine, body, input, diagnostics) {
        Ok(Some(generated)) if !diagnostics.has_errors() => {
            trace!(routine = %routine.qualified_name(), "generated");
            module.set_body(routine, generated);
            PipelineState::Packaged
        }
        Ok(_) => PipelineState::Failed,
        Err(fault) => {
            error!(routine = %routine.qualified_name(), %fault, "internal fault");
            env.record_fault(fault);
            PipelineState::Failed
        }
    }
}

/// Compile one routine created by lowering.
fn compile_synthesized(
    env: &CompilationEnv,
    module: &dyn ModuleBuilder,
    state: &mut TypeCompilationState,
    method: SynthesizedMethod,
    diagnostics: &mut DiagnosticBag,
) -> PipelineState {
    let SynthesizedMethod {
        routine,
        body,
        resumable,
    } = method;

    // A MoveNext body is final already; everything else may still need
    // its own state machine.
    let (body, resumable, slot_allocator) = match resumable {
        Some(descriptor) => (body, Some(descriptor), None),
        None => {
            let mut cx = LoweringContext {
                routine: &routine,
                host: &mut *state,
                diagnostics: &mut *diagnostics,
                patch_build: module.is_patch_build(),
                slot_allocator: module.slot_allocator(&routine),
            };
            let lowered = lower_synthesized(body, &mut cx);
            if lowered.has_errors() || diagnostics.has_errors() {
                return PipelineState::Failed;
            }
            (lowered.body, lowered.resumable, lowered.slot_allocator)
        }
    };

    generate_and_package(
        env,
        module,
        &routine,
        &body,
        resumable.as_deref(),
        slot_allocator,
        state.imports(),
        diagnostics,
    )
}

/// Compile every routine recorded on `state`, in recording order.
///
/// Does nothing once the global error flag is set, and stops at the first
/// failure. Returns whether every recorded routine was packaged.
pub fn run_synthesis_phase(env: &CompilationEnv, state: &mut TypeCompilationState) -> bool {
    let Some(module) = env.module.clone() else {
        return true;
    };
    if env.error_flag.is_set() {
        debug!(
            ty = %state.ty().name,
            pending = state.pending_synthesized(),
            "skipping synthesis phase"
        );
        return false;
    }

    while let Some(method) = state.take_next_synthesized() {
        if env.cancel.is_cancelled() {
            return false;
        }
        let routine = method.routine.clone();
        let mut diagnostics = DiagnosticBag::new();
        let outcome = compile_synthesized(env, module.as_ref(), state, method, &mut diagnostics);
        env.sink.merge(diagnostics);

        if outcome != PipelineState::Packaged {
            env.stats.routine_failed();
            env.error_flag.set();
            debug!(routine = %routine.qualified_name(), "synthesized routine failed");
            return false;
        }
        module.add_synthesized_definition(&routine.containing_type, &routine);
        env.stats.synthesized_packaged();
    }
    true
}
