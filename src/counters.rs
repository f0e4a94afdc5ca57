//! Per-run resolved / non-resolved totals.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct RunCounters {
    resolved: AtomicU64,
    non_resolved: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct CountersSnapshot {
    pub resolved: u64,
    pub non_resolved: u64,
}

impl CountersSnapshot {
    pub fn completed(&self) -> u64 {
        self.resolved + self.non_resolved
    }
}

impl RunCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_resolved(&self) {
        self.resolved.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_non_resolved(&self) {
        self.non_resolved.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CountersSnapshot {
        CountersSnapshot {
            resolved: self.resolved.load(Ordering::Relaxed),
            non_resolved: self.non_resolved.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn concurrent_increments_are_not_lost() {
        let counters = Arc::new(RunCounters::new());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let counters = Arc::clone(&counters);
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        if i % 2 == 0 {
                            counters.record_resolved();
                        } else {
                            counters.record_non_resolved();
                        }
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let snap = counters.snapshot();
        assert_eq!(snap.resolved, 4000);
        assert_eq!(snap.non_resolved, 4000);
        assert_eq!(snap.completed(), 8000);
    }
}
