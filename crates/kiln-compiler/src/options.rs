//! Compilation options.

use std::fmt;
use std::sync::Arc;

use kiln_codegen::CodeGenOptions;
use kiln_core::symbols::RoutineDescriptor;

/// Predicate selecting the routines to compile.
pub type RoutineFilter = Arc<dyn Fn(&RoutineDescriptor) -> bool + Send + Sync>;

/// Options for one whole-program compilation.
#[derive(Clone)]
pub struct CompileOptions {
    /// Schedule namespaces and types on a worker pool instead of the
    /// calling thread.
    pub concurrent_build: bool,
    /// Pool size in concurrent mode; `None` uses rayon's default.
    pub worker_threads: Option<usize>,
    pub generate_debug_info: bool,
    pub optimize: bool,
    /// The front end already reported declaration errors.
    pub has_declaration_errors: bool,
    pub filter: Option<RoutineFilter>,
}

impl Default for CompileOptions {
    fn default() -> Self {
        Self {
            concurrent_build: true,
            worker_threads: None,
            generate_debug_info: false,
            optimize: false,
            has_declaration_errors: false,
            filter: None,
        }
    }
}

impl CompileOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sequential() -> Self {
        Self::default().concurrent(false)
    }

    pub fn concurrent(mut self, enabled: bool) -> Self {
        self.concurrent_build = enabled;
        self
    }

    pub fn worker_threads(mut self, threads: usize) -> Self {
        self.worker_threads = Some(threads.max(1));
        self
    }

    pub fn debug_info(mut self, enabled: bool) -> Self {
        self.generate_debug_info = enabled;
        self
    }

    pub fn optimize(mut self, enabled: bool) -> Self {
        self.optimize = enabled;
        self
    }

    pub fn declaration_errors(mut self, present: bool) -> Self {
        self.has_declaration_errors = present;
        self
    }

    pub fn filter(
        mut self,
        filter: impl Fn(&RoutineDescriptor) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.filter = Some(Arc::new(filter));
        self
    }

    /// Whether `routine` passes the filter. No filter admits everything.
    pub fn admits(&self, routine: &RoutineDescriptor) -> bool {
        self.filter.as_ref().is_none_or(|filter| filter(routine))
    }

    pub(crate) fn codegen(&self) -> CodeGenOptions {
        CodeGenOptions {
            debug_info: self.generate_debug_info,
            optimize: self.optimize,
        }
    }
}

impl fmt::Debug for CompileOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompileOptions")
            .field("concurrent_build", &self.concurrent_build)
            .field("worker_threads", &self.worker_threads)
            .field("generate_debug_info", &self.generate_debug_info)
            .field("optimize", &self.optimize)
            .field("has_declaration_errors", &self.has_declaration_errors)
            .field("filter", &self.filter.as_ref().map(|_| "<fn>"))
            .finish()
    }
}
