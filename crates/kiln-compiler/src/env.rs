//! What every unit of one compilation shares.

use std::sync::{Arc, Mutex, PoisonError};

use kiln_core::InternalFault;

use crate::cancel::CancellationToken;
use crate::collaborators::{Binder, DebugInfoProvider, ModuleBuilder};
use crate::error_flag::GlobalErrorFlag;
use crate::options::CompileOptions;
use crate::sink::DiagnosticSink;
use crate::stats::CompileStats;

/// Collaborators plus the aggregates units write into.
///
/// Created fresh for every compilation and dropped after the final gate.
pub struct CompilationEnv {
    pub binder: Arc<dyn Binder>,
    /// Absent in diagnostics-only mode.
    pub module: Option<Arc<dyn ModuleBuilder>>,
    pub debug_info: Option<Arc<dyn DebugInfoProvider>>,
    pub options: CompileOptions,
    pub cancel: CancellationToken,
    pub error_flag: GlobalErrorFlag,
    pub sink: DiagnosticSink,
    pub stats: Arc<CompileStats>,
    faults: Mutex<Vec<InternalFault>>,
}

impl CompilationEnv {
    pub fn new(binder: Arc<dyn Binder>, options: CompileOptions) -> Self {
        Self {
            binder,
            module: None,
            debug_info: None,
            error_flag: GlobalErrorFlag::new(options.has_declaration_errors),
            options,
            cancel: CancellationToken::new(),
            sink: DiagnosticSink::new(),
            stats: Arc::new(CompileStats::default()),
            faults: Mutex::new(Vec::new()),
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

    pub fn is_emitting(&self) -> bool {
        self.module.is_some()
    }

    pub fn record_fault(&self, fault: InternalFault) {
        self.faults
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(fault);
    }

    pub fn faults(&self) -> Vec<InternalFault> {
        self.faults
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}
