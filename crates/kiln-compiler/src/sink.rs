//! Aggregate diagnostics collector shared by all units.
//!
//! Units fill a private bag and merge it here once. Arrival order depends
//! on scheduling, so consumers take the sorted, deduplicated view.

use std::sync::{Mutex, MutexGuard, PoisonError};

use kiln_core::{Diagnostic, DiagnosticBag};

#[derive(Debug, Default)]
pub struct DiagnosticSink {
    items: Mutex<Vec<Diagnostic>>,
}

impl DiagnosticSink {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Diagnostic>> {
        self.items.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Move a scoped bag into the aggregate.
    pub fn merge(&self, bag: DiagnosticBag) {
        if bag.is_empty() {
            return;
        }
        self.lock().extend(bag.into_vec());
    }

    pub fn push(&self, diagnostic: Diagnostic) {
        self.lock().push(diagnostic);
    }

    pub fn has_errors(&self) -> bool {
        self.lock().iter().any(Diagnostic::is_error)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Everything collected, sorted by location and without duplicates.
    pub fn sorted(&self) -> Vec<Diagnostic> {
        let mut items = self.lock().clone();
        items.sort();
        items.dedup();
        items
    }
}
