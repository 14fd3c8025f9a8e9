//! Located diagnostics and the scoped bag that collects them.
//!
//! ```text
//! DiagnosticBag (one per pipeline invocation, append-only)
//!     │  merged exactly once
//!     ▼
//! aggregate sink (shared, sorted and deduplicated for presentation)
//! ```

use std::fmt;

use thiserror::Error;

use crate::Span;

/// How serious a diagnostic is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Severity {
    Error,
    Warning,
    Info,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Error => f.write_str("error"),
            Severity::Warning => f.write_str("warning"),
            Severity::Info => f.write_str("info"),
        }
    }
}

/// Everything the backend (and its binder) can report.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Error)]
pub enum DiagnosticKind {
    // ========================================================================
    // Binding
    // ========================================================================
    /// Reported by the binder collaborator.
    #[error("{message}")]
    Binding { message: String },

    #[error("'{type_name}' does not contain a constructor that takes {arg_count} arguments")]
    NoMatchingConstructor { type_name: String, arg_count: usize },

    #[error("the call is ambiguous between constructors of '{type_name}'")]
    AmbiguousConstructor { type_name: String },

    #[error("'{member}' is inaccessible due to its protection level")]
    InaccessibleMember { member: String },

    #[error("generator '{routine}' cannot have by-reference parameter '{parameter}'")]
    BadIteratorArgType { routine: String, parameter: String },

    #[error("'{routine}' is marked extern and has no implementation annotation")]
    ExternMethodNoImplementation { routine: String },

    #[error("constructor '{routine}' is marked extern and has no implementation annotation")]
    ExternConstructorNoImplementation { routine: String },

    // ========================================================================
    // Structural and flow analysis
    // ========================================================================
    #[error("keyword 'this' is not valid in a static routine")]
    ThisInStaticRoutine,

    #[error("assignment made to same variable '{name}'")]
    AssignmentToSelf { name: String },

    #[error("yield statements are only valid inside a generator routine")]
    YieldOutsideGenerator,

    #[error("await is only valid inside an async routine")]
    AwaitOutsideAsync,

    #[error("use of unassigned local variable '{name}'")]
    UseOfUnassignedLocal { name: String },

    #[error("unreachable code detected")]
    UnreachableCode,

    #[error("'{routine}': not all code paths return a value")]
    NotAllPathsReturn { routine: String },

    // ========================================================================
    // Lowering policy
    // ========================================================================
    #[error("dynamic operations cannot be compiled in an incremental patch build")]
    DynamicOperationInPatchBuild,

    #[error("await cannot be moved out of this expression")]
    UnsupportedAwaitPosition,

    // ========================================================================
    // Code generation and emission
    // ========================================================================
    #[error("'{routine}' needs more than {limit} local slots")]
    TooManyLocals { routine: String, limit: usize },

    #[error("module '{module}' was not emitted because the compilation has errors")]
    ModuleEmitFailure { module: String },
}

impl DiagnosticKind {
    pub fn default_severity(&self) -> Severity {
        match self {
            DiagnosticKind::AssignmentToSelf { .. }
            | DiagnosticKind::UnreachableCode
            | DiagnosticKind::ExternMethodNoImplementation { .. }
            | DiagnosticKind::ExternConstructorNoImplementation { .. } => Severity::Warning,
            _ => Severity::Error,
        }
    }

    /// Stable code for presentation and filtering.
    pub fn code(&self) -> &'static str {
        match self {
            DiagnosticKind::Binding { .. } => "KL0001",
            DiagnosticKind::NoMatchingConstructor { .. } => "KL0002",
            DiagnosticKind::AmbiguousConstructor { .. } => "KL0003",
            DiagnosticKind::InaccessibleMember { .. } => "KL0004",
            DiagnosticKind::BadIteratorArgType { .. } => "KL0005",
            DiagnosticKind::ExternMethodNoImplementation { .. } => "KL0006",
            DiagnosticKind::ExternConstructorNoImplementation { .. } => "KL0007",
            DiagnosticKind::ThisInStaticRoutine => "KL0101",
            DiagnosticKind::AssignmentToSelf { .. } => "KL0102",
            DiagnosticKind::YieldOutsideGenerator => "KL0103",
            DiagnosticKind::AwaitOutsideAsync => "KL0104",
            DiagnosticKind::UseOfUnassignedLocal { .. } => "KL0105",
            DiagnosticKind::UnreachableCode => "KL0106",
            DiagnosticKind::NotAllPathsReturn { .. } => "KL0107",
            DiagnosticKind::DynamicOperationInPatchBuild => "KL0201",
            DiagnosticKind::UnsupportedAwaitPosition => "KL0202",
            DiagnosticKind::TooManyLocals { .. } => "KL0301",
            DiagnosticKind::ModuleEmitFailure { .. } => "KL0302",
        }
    }
}

/// A located diagnostic.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Diagnostic {
    pub severity: Severity,
    pub kind: DiagnosticKind,
    pub span: Span,
}

impl Diagnostic {
    /// A diagnostic with its kind's default severity.
    pub fn new(kind: DiagnosticKind, span: Span) -> Self {
        Self {
            severity: kind.default_severity(),
            kind,
            span,
        }
    }

    pub fn is_error(&self) -> bool {
        self.severity == Severity::Error
    }

    pub fn message(&self) -> String {
        self.kind.to_string()
    }
}

impl PartialOrd for Diagnostic {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Diagnostic {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.span
            .cmp(&other.span)
            .then_with(|| self.severity.cmp(&other.severity))
            .then_with(|| self.kind.cmp(&other.kind))
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} at {}: {}",
            self.severity,
            self.kind.code(),
            self.span,
            self.kind
        )
    }
}

/// Append-only diagnostics owned by exactly one unit of work.
#[derive(Debug, Default, Clone)]
pub struct DiagnosticBag {
    items: Vec<Diagnostic>,
}

impl DiagnosticBag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, kind: DiagnosticKind, span: Span) {
        self.items.push(Diagnostic::new(kind, span));
    }

    pub fn push(&mut self, diagnostic: Diagnostic) {
        self.items.push(diagnostic);
    }

    /// Move every diagnostic of `other` into this bag.
    pub fn append(&mut self, other: &mut DiagnosticBag) {
        self.items.append(&mut other.items);
    }

    pub fn has_errors(&self) -> bool {
        self.items.iter().any(Diagnostic::is_error)
    }

    pub fn error_count(&self) -> usize {
        self.items.iter().filter(|d| d.is_error()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Diagnostic> {
        self.items.iter()
    }

    pub fn into_vec(self) -> Vec<Diagnostic> {
        self.items
    }
}
