//! Work scheduling for compilation units.
//!
//! A unit is a namespace or a type. Units may schedule further units while
//! they run; [`Scheduler::drain`] returns once every unit ever scheduled
//! has finished. Concurrent builds run units on a rayon pool. Sequential
//! builds run each unit inline, at the point it is scheduled.
//!
//! A unit that panics is caught and reported as a [`FatalError`]; units not
//! yet started are then dropped without running.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};

use tracing::{error, trace};

use crate::cancel::CancellationToken;
use crate::error::{FatalError, SchedulerError};
use crate::options::CompileOptions;

struct Inner {
    pool: Option<rayon::ThreadPool>,
    in_flight: AtomicUsize,
    idle: Mutex<()>,
    drained: Condvar,
    halted: AtomicBool,
    fatal: Mutex<Vec<FatalError>>,
    cancel: CancellationToken,
}

#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    fn with_pool(pool: Option<rayon::ThreadPool>, cancel: CancellationToken) -> Self {
        Self {
            inner: Arc::new(Inner {
                pool,
                in_flight: AtomicUsize::new(0),
                idle: Mutex::new(()),
                drained: Condvar::new(),
                halted: AtomicBool::new(false),
                fatal: Mutex::new(Vec::new()),
                cancel,
            }),
        }
    }

    /// Run every unit inline on the calling thread.
    pub fn sequential(cancel: CancellationToken) -> Self {
        Self::with_pool(None, cancel)
    }

    /// Run units on a dedicated pool of `threads` workers, or one per core.
    pub fn concurrent(threads: Option<usize>, cancel: CancellationToken) -> Result<Self, FatalError> {
        let mut builder = rayon::ThreadPoolBuilder::new()
            .thread_name(|index| format!("kiln-compile-{index}"));
        if let Some(threads) = threads {
            builder = builder.num_threads(threads);
        }
        let pool = builder.build().map_err(|e| FatalError {
            unit: "scheduler".to_string(),
            message: e.to_string(),
        })?;
        Ok(Self::with_pool(Some(pool), cancel))
    }

    pub fn from_options(options: &CompileOptions, cancel: CancellationToken) -> Result<Self, FatalError> {
        if options.concurrent_build {
            Self::concurrent(options.worker_threads, cancel)
        } else {
            Ok(Self::sequential(cancel))
        }
    }

    pub fn is_concurrent(&self) -> bool {
        self.inner.pool.is_some()
    }

    /// Stop accepting work: cancelled, or a unit already failed.
    fn is_stopped(&self) -> bool {
        self.inner.halted.load(Ordering::Acquire) || self.inner.cancel.is_cancelled()
    }

    /// Queue `work` as a unit named `unit`.
    pub fn schedule<F>(&self, unit: impl Into<String>, work: F)
    where
        F: FnOnce(&Scheduler) + Send + 'static,
    {
        let unit = unit.into();
        if self.is_stopped() {
            trace!(%unit, "dropped unit");
            return;
        }
        trace!(%unit, "scheduled unit");

        let Some(pool) = &self.inner.pool else {
            self.run_unit(&unit, work);
            return;
        };

        self.inner.in_flight.fetch_add(1, Ordering::AcqRel);
        let scheduler = self.clone();
        pool.spawn(move || {
            if !scheduler.is_stopped() {
                scheduler.run_unit(&unit, work);
            }
            scheduler.finish_one();
        });
    }

    fn run_unit<F>(&self, unit: &str, work: F)
    where
        F: FnOnce(&Scheduler),
    {
        if let Err(payload) = catch_unwind(AssertUnwindSafe(|| work(self))) {
            let fatal = FatalError::from_panic(unit, payload.as_ref());
            error!(%unit, message = %fatal.message, "unit failed unexpectedly");
            self.inner.halted.store(true, Ordering::Release);
            self.inner
                .fatal
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(fatal);
        }
    }

    fn finish_one(&self) {
        if self.inner.in_flight.fetch_sub(1, Ordering::AcqRel) == 1 {
            let _idle = self.inner.idle.lock().unwrap_or_else(PoisonError::into_inner);
            self.inner.drained.notify_all();
        }
    }

    /// Block until no unit is queued or running.
    ///
    /// Reports the first unit that failed, then cancellation.
    pub fn drain(&self) -> Result<(), SchedulerError> {
        let idle = self.inner.idle.lock().unwrap_or_else(PoisonError::into_inner);
        let _idle = self
            .inner
            .drained
            .wait_while(idle, |_| self.inner.in_flight.load(Ordering::Acquire) > 0)
            .unwrap_or_else(PoisonError::into_inner);

        let fatal = self
            .inner
            .fatal
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(first) = fatal.first() {
            return Err(SchedulerError::Fatal(first.clone()));
        }
        self.inner.cancel.check()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_schedulers() -> Vec<Scheduler> {
        vec![
            Scheduler::sequential(CancellationToken::new()),
            Scheduler::concurrent(Some(4), CancellationToken::new()).expect("pool"),
        ]
    }

    #[test]
    fn drain_waits_for_nested_units() {
        for scheduler in create_schedulers() {
            let done = Arc::new(AtomicUsize::new(0));
            for _ in 0..8 {
                let done = done.clone();
                scheduler.schedule("namespace", move |s| {
                    for _ in 0..8 {
                        let done = done.clone();
                        s.schedule("type", move |_| {
                            done.fetch_add(1, Ordering::Relaxed);
                        });
                    }
                });
            }
            assert_eq!(scheduler.drain(), Ok(()));
            assert_eq!(done.load(Ordering::Relaxed), 64);
        }
    }

    #[test]
    fn panicking_unit_becomes_fatal() {
        for scheduler in create_schedulers() {
            scheduler.schedule("Broken", |_| panic!("descriptor table corrupt"));
            match scheduler.drain() {
                Err(SchedulerError::Fatal(fatal)) => {
                    assert_eq!(fatal.unit, "Broken");
                    assert_eq!(fatal.message, "descriptor table corrupt");
                }
                other => panic!("expected fatal error, got {other:?}"),
            }
        }
    }

    #[test]
    fn cancelled_scheduler_is_abandoned() {
        let cancel = CancellationToken::new();
        let scheduler = Scheduler::concurrent(Some(2), cancel.clone()).expect("pool");
        let ran = Arc::new(AtomicUsize::new(0));
        cancel.cancel();
        let counter = ran.clone();
        scheduler.schedule("late", move |_| {
            counter.fetch_add(1, Ordering::Relaxed);
        });
        assert_eq!(scheduler.drain(), Err(SchedulerError::Abandoned));
        assert_eq!(ran.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn sequential_runs_units_in_schedule_order() {
        let scheduler = Scheduler::sequential(CancellationToken::new());
        let order = Arc::new(Mutex::new(Vec::new()));
        for name in ["a", "b"] {
            let order = order.clone();
            scheduler.schedule(name, move |s| {
                order.lock().unwrap().push(name.to_string());
                let order = order.clone();
                s.schedule("nested", move |_| {
                    order.lock().unwrap().push(format!("{name}.nested"));
                });
            });
        }
        assert!(!scheduler.is_concurrent());
        assert_eq!(scheduler.drain(), Ok(()));
        assert_eq!(
            *order.lock().unwrap(),
            vec!["a", "a.nested", "b", "b.nested"]
        );
    }
}
