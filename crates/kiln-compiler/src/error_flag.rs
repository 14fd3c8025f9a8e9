//! The program-wide sticky error flag.
//!
//! Lifecycle: created before any unit is scheduled, set by any unit that
//! observes an error, read once after the scheduler has drained. Writers
//! and readers use relaxed ordering: a late observation only means some
//! wasted work, and the definitive read happens after the drain barrier,
//! which already orders every write before it.

use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Debug, Default)]
pub struct GlobalErrorFlag {
    set: AtomicBool,
}

impl GlobalErrorFlag {
    /// `initial` is true when declaration errors were already reported.
    pub fn new(initial: bool) -> Self {
        Self {
            set: AtomicBool::new(initial),
        }
    }

    /// Record that an error exists. There is no way to clear it.
    pub fn set(&self) {
        self.set.store(true, Ordering::Relaxed);
    }

    /// Advisory read while units are still running.
    pub fn is_set(&self) -> bool {
        self.set.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn flag_is_monotonic() {
        let flag = GlobalErrorFlag::new(false);
        assert!(!flag.is_set());
        flag.set();
        flag.set();
        assert!(flag.is_set());
    }

    #[test]
    fn writes_from_other_threads_are_visible_after_join() {
        let flag = Arc::new(GlobalErrorFlag::default());
        let handles: Vec<_> = (0..4)
            .map(|i| {
                let flag = Arc::clone(&flag);
                std::thread::spawn(move || {
                    if i == 3 {
                        flag.set();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("thread");
        }
        assert!(flag.is_set());
    }
}
