//! Whole-program orchestration of method body compilation.
//!
//! [`MethodCompiler`] walks a [`Program`](kiln_core::symbols::Program),
//! schedules one unit per namespace and per type, and drives every routine
//! through its pipeline:
//!
//! ```text
//! bind ─► check/flow ─► lower ─► generate ─► package
//! ```
//!
//! Types own a [`TypeCompilationState`] for the duration of their unit.
//! Routines created by lowering are compiled afterwards, in the type's
//! synthesis phase. Errors in any unit set a program-wide flag; the final
//! gate reads it once, after the scheduler has drained.
//!
//! # Example
//!
//! ```ignore
//! use kiln_compiler::{CompileOptions, InMemoryModule, MethodCompiler};
//!
//! let module = Arc::new(InMemoryModule::new());
//! let report = MethodCompiler::new(binder, CompileOptions::new())
//!     .with_module(module.clone())
//!     .compile_method_bodies(&program)?;
//! ```

mod cancel;
mod collaborators;
mod compiler;
pub mod ctor_init;
mod env;
mod error;
mod error_flag;
mod options;
pub mod passes;
pub mod pipeline;
mod scheduler;
mod sink;
mod stats;
mod type_state;

#[cfg(test)]
mod test_support;

pub use cancel::CancellationToken;
pub use collaborators::{
    Binder, BoundBody, BoundInitializers, ChainScopes, ConstructorInitializer, DebugInfoProvider,
    InMemoryModule, ModuleBuilder,
};
pub use compiler::{CompilationOutcome, CompilationReport, MethodCompiler};
pub use env::CompilationEnv;
pub use error::{Cancelled, FatalError, SchedulerError};
pub use error_flag::GlobalErrorFlag;
pub use options::{CompileOptions, RoutineFilter};
pub use pipeline::{MethodPipeline, PipelineState};
pub use scheduler::Scheduler;
pub use sink::DiagnosticSink;
pub use stats::{CompileStats, StatsSnapshot};
pub use type_state::{InitializerKind, LoweredInitializers, TypeCompilationState};
