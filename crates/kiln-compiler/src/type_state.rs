//! State shared by the routines of one type while that type compiles.
//!
//! Owned by the single unit compiling the type and passed by `&mut` to each
//! routine's pipeline in turn, so nothing here needs a lock.

use std::collections::VecDeque;
use std::sync::Arc;

use kiln_core::bound::Stmt;
use kiln_core::symbols::TypeDescriptor;
use kiln_core::{DiagnosticBag, ImportChain};
use kiln_lowering::{LoweringHost, SynthesizedMethod, lower_field_initializers};
use tracing::trace;

use crate::collaborators::BoundInitializers;
use crate::passes::{self, CheckContext, FlowTarget};
use crate::stats::CompileStats;

/// Which field initializers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InitializerKind {
    Static,
    Instance,
}

impl InitializerKind {
    fn index(self) -> usize {
        match self {
            InitializerKind::Static => 0,
            InitializerKind::Instance => 1,
        }
    }

    pub fn is_static(self) -> bool {
        self == InitializerKind::Static
    }
}

/// Field initializers as statements, analysed once.
#[derive(Debug, Clone)]
pub struct LoweredInitializers {
    /// One assignment per non-constant initializer, in declaration order.
    pub body: Stmt,
    /// Debug imports the initializers were bound under.
    pub imports: ImportChain,
    /// Binding or analysis found an error.
    pub has_errors: bool,
}

impl LoweredInitializers {
    pub fn is_empty(&self) -> bool {
        match &self.body.kind {
            kiln_core::bound::StmtKind::List(statements) => statements.is_empty(),
            _ => false,
        }
    }
}

#[derive(Debug)]
pub struct TypeCompilationState {
    ty: Arc<TypeDescriptor>,
    initializers: [BoundInitializers; 2],
    binding_errors: [bool; 2],
    lowered: [Option<Arc<LoweredInitializers>>; 2],
    analyses: usize,
    imports: ImportChain,
    synthesized: VecDeque<SynthesizedMethod>,
    recorded: usize,
    next_ordinal: u32,
    diagnostics: DiagnosticBag,
    stats: Option<Arc<CompileStats>>,
}

impl TypeCompilationState {
    /// Takes ownership of the bound initializers; their binding diagnostics
    /// move into the type-level bag.
    pub fn new(
        ty: Arc<TypeDescriptor>,
        mut statics: BoundInitializers,
        mut instances: BoundInitializers,
    ) -> Self {
        let binding_errors = [
            statics.diagnostics.has_errors(),
            instances.diagnostics.has_errors(),
        ];
        let mut diagnostics = DiagnosticBag::new();
        diagnostics.append(&mut statics.diagnostics);
        diagnostics.append(&mut instances.diagnostics);

        Self {
            ty,
            initializers: [statics, instances],
            binding_errors,
            lowered: [None, None],
            analyses: 0,
            imports: ImportChain::empty(),
            synthesized: VecDeque::new(),
            recorded: 0,
            next_ordinal: 0,
            diagnostics,
            stats: None,
        }
    }

    pub fn with_stats(mut self, stats: Arc<CompileStats>) -> Self {
        self.stats = Some(stats);
        self
    }

    pub fn ty(&self) -> &Arc<TypeDescriptor> {
        &self.ty
    }

    pub fn has_initializers(&self, kind: InitializerKind) -> bool {
        !self.initializers[kind.index()].is_empty()
    }

    /// The lowered and analysed initializers of `kind`, computed on first use.
    pub fn get_or_compute_initializers(&mut self, kind: InitializerKind) -> Arc<LoweredInitializers> {
        if let Some(cached) = &self.lowered[kind.index()] {
            return cached.clone();
        }

        let bound = &self.initializers[kind.index()];
        let body = lower_field_initializers(&bound.initializers, &self.ty.ty());

        let mut analysis = DiagnosticBag::new();
        passes::check(&body, CheckContext::initializer(kind.is_static()), &mut analysis);
        passes::analyze(&body, &FlowTarget::initializers(&self.ty.name), &mut analysis);
        self.analyses += 1;
        if let Some(stats) = &self.stats {
            stats.initializer_analyzed();
        }
        trace!(ty = %self.ty.name, ?kind, diagnostics = analysis.len(), "analysed initializers");

        let lowered = Arc::new(LoweredInitializers {
            has_errors: body.has_errors
                || self.binding_errors[kind.index()]
                || analysis.has_errors(),
            body,
            imports: bound.imports.clone(),
        });
        self.diagnostics.append(&mut analysis);
        self.lowered[kind.index()] = Some(lowered.clone());
        lowered
    }

    /// How many times initializer analysis actually ran.
    pub fn initializer_analysis_count(&self) -> usize {
        self.analyses
    }

    pub fn imports(&self) -> &ImportChain {
        &self.imports
    }

    /// Install `imports` for the current member and return the previous chain.
    pub fn swap_imports(&mut self, imports: ImportChain) -> ImportChain {
        std::mem::replace(&mut self.imports, imports)
    }

    /// Next synthesized routine in recording order.
    pub fn take_next_synthesized(&mut self) -> Option<SynthesizedMethod> {
        self.synthesized.pop_front()
    }

    pub fn pending_synthesized(&self) -> usize {
        self.synthesized.len()
    }

    /// Everything ever recorded, drained or not.
    pub fn recorded_synthesized(&self) -> usize {
        self.recorded
    }

    /// Type-level diagnostics: initializer binding and analysis.
    pub fn diagnostics_mut(&mut self) -> &mut DiagnosticBag {
        &mut self.diagnostics
    }

    /// Drop every cache and hand back the type-level diagnostics.
    pub fn release(self) -> DiagnosticBag {
        trace!(
            ty = %self.ty.name,
            analyses = self.analyses,
            synthesized = self.recorded,
            "released type state"
        );
        self.diagnostics
    }
}

impl LoweringHost for TypeCompilationState {
    fn record_synthesized(&mut self, method: SynthesizedMethod) {
        self.recorded += 1;
        self.synthesized.push_back(method);
    }

    fn next_ordinal(&mut self) -> u32 {
        let ordinal = self.next_ordinal;
        self.next_ordinal += 1;
        ordinal
    }
}
