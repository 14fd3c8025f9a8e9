//! Counters updated by every unit, read as one snapshot at the end.

use std::sync::atomic::{AtomicUsize, Ordering};

#[derive(Debug, Default)]
pub struct CompileStats {
    units_scheduled: AtomicUsize,
    routines_packaged: AtomicUsize,
    routines_failed: AtomicUsize,
    routines_skipped: AtomicUsize,
    initializer_analyses: AtomicUsize,
    synthesized_packaged: AtomicUsize,
}

/// Plain copy of [`CompileStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub units_scheduled: usize,
    pub routines_packaged: usize,
    pub routines_failed: usize,
    pub routines_skipped: usize,
    pub initializer_analyses: usize,
    pub synthesized_packaged: usize,
}

macro_rules! counter {
    ($($name:ident => $field:ident),* $(,)?) => {
        $(
            pub fn $name(&self) {
                self.$field.fetch_add(1, Ordering::Relaxed);
            }
        )*
    };
}

impl CompileStats {
    counter! {
        unit_scheduled => units_scheduled,
        routine_packaged => routines_packaged,
        routine_failed => routines_failed,
        routine_skipped => routines_skipped,
        initializer_analyzed => initializer_analyses,
        synthesized_packaged => synthesized_packaged,
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            units_scheduled: self.units_scheduled.load(Ordering::Relaxed),
            routines_packaged: self.routines_packaged.load(Ordering::Relaxed),
            routines_failed: self.routines_failed.load(Ordering::Relaxed),
            routines_skipped: self.routines_skipped.load(Ordering::Relaxed),
            initializer_analyses: self.initializer_analyses.load(Ordering::Relaxed),
            synthesized_packaged: self.synthesized_packaged.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_increments() {
        let stats = CompileStats::default();
        stats.routine_packaged();
        stats.routine_packaged();
        stats.initializer_analyzed();
        let snapshot = stats.snapshot();
        assert_eq!(snapshot.routines_packaged, 2);
        assert_eq!(snapshot.initializer_analyses, 1);
        assert_eq!(snapshot.routines_failed, 0);
    }
}
