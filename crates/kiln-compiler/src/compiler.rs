//! The whole-program driver.

use std::sync::Arc;

use kiln_core::symbols::{
    NamespaceDescriptor, Program, RoutineDescriptor, RoutineFlags, RoutineKind, SynthesizedKind,
    TypeDescriptor,
};
use kiln_core::{ConstantValue, Diagnostic, DiagnosticKind, InternalFault, Span};
use tracing::{Span as TraceSpan, debug, info, info_span, trace, warn};

use crate::cancel::CancellationToken;
use crate::collaborators::{Binder, DebugInfoProvider, ModuleBuilder};
use crate::env::CompilationEnv;
use crate::error::{FatalError, SchedulerError};
use crate::options::CompileOptions;
use crate::pipeline::{MethodPipeline, PipelineState, run_synthesis_phase};
use crate::scheduler::Scheduler;
use crate::stats::StatsSnapshot;
use crate::type_state::{InitializerKind, TypeCompilationState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompilationOutcome {
    Succeeded,
    /// Errors were diagnosed; no module must be emitted.
    HasErrors,
    /// Cancelled before every unit finished.
    Abandoned,
}

/// Everything a caller learns from one compilation.
#[derive(Debug, Clone)]
pub struct CompilationReport {
    pub outcome: CompilationOutcome,
    /// Sorted by location, duplicates removed.
    pub diagnostics: Vec<Diagnostic>,
    pub faults: Vec<InternalFault>,
    pub stats: StatsSnapshot,
}

impl CompilationReport {
    pub fn succeeded(&self) -> bool {
        self.outcome == CompilationOutcome::Succeeded
    }

    pub fn errors(&self) -> impl Iterator<Item = &Diagnostic> {
        self.diagnostics.iter().filter(|d| d.is_error())
    }
}

/// Compiles every routine body of a program.
///
/// ```ignore
/// let report = MethodCompiler::new(binder, CompileOptions::new())
///     .with_module(module.clone())
///     .compile_method_bodies(&program)?;
/// assert!(report.succeeded());
/// ```
pub struct MethodCompiler {
    binder: Arc<dyn Binder>,
    module: Option<Arc<dyn ModuleBuilder>>,
    debug_info: Option<Arc<dyn DebugInfoProvider>>,
    options: CompileOptions,
    cancel: CancellationToken,
}

impl MethodCompiler {
    /// A compiler in diagnostics-only mode until a module is supplied.
    pub fn new(binder: Arc<dyn Binder>, options: CompileOptions) -> Self {
        Self {
            binder,
            module: None,
            debug_info: None,
            options,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_module(mut self, module: Arc<dyn ModuleBuilder>) -> Self {
        self.module = Some(module);
        self
    }

    pub fn with_debug_info(mut self, provider: Arc<dyn DebugInfoProvider>) -> Self {
        self.debug_info = Some(provider);
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    fn environment(&self) -> CompilationEnv {
        let mut env = CompilationEnv::new(self.binder.clone(), self.options.clone())
            .with_cancellation(self.cancel.clone());
        if let Some(module) = &self.module {
            env = env.with_module(module.clone());
        }
        if let Some(provider) = &self.debug_info {
            env = env.with_debug_info(provider.clone());
        }
        env
    }

    /// Compile `program`, blocking until every unit has finished.
    ///
    /// Returns `Err` only when a unit failed unexpectedly. Everything the
    /// user can fix is in the report.
    #[cfg_attr(feature = "profiling", profiling::function)]
    pub fn compile_method_bodies(&self, program: &Program) -> Result<CompilationReport, FatalError> {
        let span = info_span!("compile_method_bodies", program = %program.name);
        let _guard = span.enter();

        let env = Arc::new(self.environment());
        let scheduler = Scheduler::from_options(&env.options, env.cancel.clone())?;
        info!(
            concurrent = scheduler.is_concurrent(),
            emitting = env.is_emitting(),
            "compiling method bodies"
        );

        schedule_namespace(&scheduler, &env, program.global.clone(), span.clone());
        let abandoned = match scheduler.drain() {
            Ok(()) => false,
            Err(SchedulerError::Fatal(fatal)) => return Err(fatal),
            Err(SchedulerError::Abandoned) => true,
        };

        Ok(final_gate(&env, program, abandoned))
    }
}

fn final_gate(env: &CompilationEnv, program: &Program, abandoned: bool) -> CompilationReport {
    let outcome = if abandoned {
        warn!("compilation abandoned");
        CompilationOutcome::Abandoned
    } else if env.error_flag.is_set() || env.sink.has_errors() {
        // Declaration errors were reported by the front end already.
        if env.is_emitting() && !env.sink.has_errors() && !env.options.has_declaration_errors {
            env.sink.push(Diagnostic::new(
                DiagnosticKind::ModuleEmitFailure {
                    module: program.name.to_string(),
                },
                Span::default(),
            ));
        }
        CompilationOutcome::HasErrors
    } else {
        CompilationOutcome::Succeeded
    };

    let report = CompilationReport {
        outcome,
        diagnostics: env.sink.sorted(),
        faults: env.faults(),
        stats: env.stats.snapshot(),
    };
    info!(
        ?outcome,
        diagnostics = report.diagnostics.len(),
        packaged = report.stats.routines_packaged,
        "compilation finished"
    );
    report
}

fn schedule_namespace(
    scheduler: &Scheduler,
    env: &Arc<CompilationEnv>,
    namespace: Arc<NamespaceDescriptor>,
    parent: TraceSpan,
) {
    let env = env.clone();
    env.stats.unit_scheduled();
    scheduler.schedule(format!("namespace {}", namespace.name), move |scheduler| {
        for child in &namespace.namespaces {
            schedule_namespace(scheduler, &env, child.clone(), parent.clone());
        }
        for ty in &namespace.types {
            schedule_type(scheduler, &env, ty.clone(), parent.clone());
        }
    });
}

fn schedule_type(
    scheduler: &Scheduler,
    env: &Arc<CompilationEnv>,
    ty: Arc<TypeDescriptor>,
    parent: TraceSpan,
) {
    let env = env.clone();
    env.stats.unit_scheduled();
    scheduler.schedule(format!("type {}", ty.name), move |scheduler| {
        for nested in &ty.nested {
            schedule_type(scheduler, &env, nested.clone(), parent.clone());
        }
        compile_type(&env, &ty, &parent);
    });
}

fn has_bad_constant(ty: &TypeDescriptor) -> bool {
    ty.fields
        .iter()
        .any(|field| field.constant.as_ref().is_some_and(ConstantValue::is_bad))
}

#[cfg_attr(feature = "profiling", profiling::function)]
fn compile_type(env: &CompilationEnv, ty: &Arc<TypeDescriptor>, parent: &TraceSpan) {
    let span = info_span!(parent: parent, "compile_type", ty = %ty.name);
    let _guard = span.enter();

    if ty.is_error() {
        trace!("skipping error type");
        return;
    }
    if has_bad_constant(ty) {
        env.error_flag.set();
    }

    let statics = env.binder.bind_field_initializers(ty, true);
    let instances = env.binder.bind_field_initializers(ty, false);
    let mut state =
        TypeCompilationState::new(ty.clone(), statics, instances).with_stats(env.stats.clone());

    for routine in &ty.routines {
        if env.cancel.is_cancelled() {
            debug!("cancelled between routines");
            break;
        }
        MethodPipeline::new(env, &mut state, routine.clone()).run();
    }

    if !env.cancel.is_cancelled()
        && ty.static_constructor().is_none()
        && state.has_initializers(InitializerKind::Static)
    {
        compile_static_constructor(env, &mut state);
    }

    if !env.cancel.is_cancelled() {
        run_synthesis_phase(env, &mut state);
    }

    let diagnostics = state.release();
    if diagnostics.has_errors() {
        env.error_flag.set();
    }
    env.sink.merge(diagnostics);
}

/// Synthesize `.cctor` to run the static initializers of a type that
/// declares no static constructor.
fn compile_static_constructor(env: &CompilationEnv, state: &mut TypeCompilationState) {
    let ty = state.ty().clone();
    let cctor = RoutineDescriptor::builder(
        &ty.named(),
        ".cctor",
        RoutineKind::Synthesized(SynthesizedKind::StaticConstructor),
    )
    .flags(RoutineFlags::STATIC | RoutineFlags::IMPLICIT)
    .span(ty.span)
    .build();

    let outcome = MethodPipeline::new(env, state, cctor.clone()).run();
    let Some(module) = &env.module else {
        return;
    };
    if outcome == PipelineState::Packaged && module.get_method_body(&cctor).is_some() {
        module.add_synthesized_definition(&cctor.containing_type, &cctor);
    }
}
