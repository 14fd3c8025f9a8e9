//! Kiln: the method-body backend of a managed-language compiler.
//!
//! Kiln takes bound routine bodies from a front end and turns them into
//! packaged method bodies for a stack machine. The work is split over four
//! crates, re-exported here:
//!
//! - [`core`]: descriptors, the bound tree, diagnostics, import chains
//! - [`lowering`]: the lowering chain, closures and state machines
//! - [`codegen`]: address resolution and instruction generation
//! - [`compiler`]: the per-routine pipeline, scheduling and the driver
//!
//! # Example
//!
//! ```ignore
//! use kiln::prelude::*;
//!
//! let module = Arc::new(InMemoryModule::new());
//! let report = MethodCompiler::new(binder, CompileOptions::new())
//!     .with_module(module.clone())
//!     .compile_method_bodies(&program)?;
//! assert!(report.succeeded());
//! ```

pub use kiln_codegen as codegen;
pub use kiln_compiler as compiler;
pub use kiln_core as core;
pub use kiln_lowering as lowering;

// Re-export main types
pub mod prelude {
    pub use kiln_codegen::{CodeGenOptions, MethodBody, OpCode};
    pub use kiln_compiler::{
        Binder, BoundBody, BoundInitializers, CancellationToken, CompilationOutcome,
        CompilationReport, CompileOptions, ConstructorInitializer, DebugInfoProvider, FatalError,
        InMemoryModule, MethodCompiler, ModuleBuilder,
    };
    pub use kiln_core::bound::{Expr, Stmt};
    pub use kiln_core::symbols::{
        FieldDescriptor, NamespaceDescriptor, Program, RoutineDescriptor, RoutineFlags,
        RoutineKind, TypeDescriptor,
    };
    pub use kiln_core::{Diagnostic, DiagnosticKind, ImportChain, Span, Ty, TypeKind};
}
