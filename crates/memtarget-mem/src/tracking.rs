//! Current/peak usage accumulator for one target node.
//!
//! Lock-free and cheap; every grant and release of a leaf goes through here.

use std::sync::atomic::{AtomicI64, Ordering};

use memtarget_core::error::{Error, Result};
use memtarget_core::stats::StatsSnapshot;

#[derive(Debug, Default)]
pub struct UsageRecorder {
    current: AtomicI64,
    peak: AtomicI64,
}

impl UsageRecorder {
    pub fn new() -> Self {
        Self {
            current: AtomicI64::new(0),
            peak: AtomicI64::new(0),
        }
    }

    /// Apply a signed delta. A result below zero is rejected and leaves the
    /// recorder untouched.
    pub fn inc(&self, delta: i64) -> Result<()> {
        let mut cur = self.current.load(Ordering::Relaxed);
        let next = loop {
            let next = cur.checked_add(delta).filter(|n| *n >= 0).ok_or_else(|| {
                Error::InvariantViolation(format!(
                    "usage would drop below zero: current {cur}, delta {delta}"
                ))
            })?;
            match self
                .current
                .compare_exchange(cur, next, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => break next,
                Err(observed) => cur = observed,
            }
        };
        self.record_peak(next);
        #[cfg(feature = "tracing")]
        tracing::trace!(delta, current = next, peak = self.peak(), "usage");
        Ok(())
    }

    fn record_peak(&self, used: i64) {
        let mut cur = self.peak.load(Ordering::Relaxed);
        while used > cur {
            match self
                .peak
                .compare_exchange(cur, used, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => break,
                Err(observed) => cur = observed,
            }
        }
    }

    pub fn current(&self) -> i64 {
        self.current.load(Ordering::Relaxed)
    }

    pub fn peak(&self) -> i64 {
        self.peak.load(Ordering::Relaxed)
    }

    pub fn to_stats(&self) -> StatsSnapshot {
        StatsSnapshot::leaf(self.current(), self.peak())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracks_current_and_peak() {
        let r = UsageRecorder::new();
        r.inc(100).unwrap();
        r.inc(50).unwrap();
        r.inc(-120).unwrap();
        assert_eq!(r.current(), 30);
        assert_eq!(r.peak(), 150);
        assert_eq!(r.to_stats(), StatsSnapshot::leaf(30, 150));
    }

    #[test]
    fn rejects_going_negative() {
        let r = UsageRecorder::new();
        r.inc(10).unwrap();
        let err = r.inc(-11).unwrap_err();
        assert!(matches!(err, Error::InvariantViolation(_)));
        // Rejected delta is not applied.
        assert_eq!(r.current(), 10);
    }

    #[test]
    fn concurrent_increments_balance_out() {
        use std::sync::Arc;
        use std::thread;

        let r = Arc::new(UsageRecorder::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let r = Arc::clone(&r);
                thread::spawn(move || {
                    for _ in 0..1000 {
                        r.inc(3).unwrap();
                        r.inc(-3).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().expect("thread panicked");
        }
        assert_eq!(r.current(), 0);
        assert!(r.peak() >= 3 && r.peak() <= 24);
    }
}
