//! Over-acquisition: a hidden reserve kept proportional to a target's usage.
//!
//! Some operators can only spill in certain phases (e.g. while building a hash
//! table, but not while probing it). If they enter the non-spillable phase
//! without enough memory, a later allocation failure cannot be resolved by
//! spilling. Wrapping such an operator's target in [`OverAcquireTarget`] makes
//! every borrow also top up a sibling reserve consumer to
//! `floor(ratio * target.used_bytes())`. The reserve is an ordinary spillable
//! consumer of the same task, so the host can hand it over when memory gets
//! tight, and it is drained completely on every repay.

use std::sync::{Arc, Weak};

use memtarget_core::error::{check_argument, check_invariant, Error, Result};
use memtarget_core::host::{Spillable, TaskMemoryAllocator};
use memtarget_core::id::ConsumerId;
use memtarget_core::stats::StatsSnapshot;

use crate::leaf::HostConsumer;
use crate::target::{check_size, MemoryTarget, TaskScopedTarget};

const RESERVE_NAME: &str = "OverAcquire.Reserve";

pub struct OverAcquireTarget {
    target: Arc<dyn TaskScopedTarget>,
    over_target: Arc<ReserveTarget>,
    ratio: f64,
}

impl OverAcquireTarget {
    /// Wrap `target`. The reserve is registered with the same task allocator.
    pub fn new(target: Arc<dyn TaskScopedTarget>, ratio: f64) -> Result<Self> {
        check_argument(ratio.is_finite() && ratio >= 0.0, || {
            format!("over-acquire ratio must be finite and >= 0, got {ratio}")
        })?;
        let over_target = ReserveTarget::new(target.task_allocator())?;
        Ok(Self {
            target,
            over_target,
            ratio,
        })
    }

    pub fn ratio(&self) -> f64 {
        self.ratio
    }

    /// Bytes currently parked in the hidden reserve.
    pub fn reserved_bytes(&self) -> i64 {
        self.over_target.used_bytes()
    }

    /// Host-side id of the reserve, for targeted spills.
    pub fn reserve_consumer_id(&self) -> ConsumerId {
        self.over_target.consumer.id()
    }
}

impl MemoryTarget for OverAcquireTarget {
    fn borrow(&self, size: i64) -> Result<i64> {
        check_size("borrow", size)?;
        let granted = self.target.borrow(size)?;
        let major = self.target.used_bytes();
        let expected = (self.ratio * major as f64) as i64;
        let over_acquired = self.over_target.used_bytes();
        let diff = expected - over_acquired;
        // A negative diff means a spill shrank the target since it granted;
        // the reserve is left alone until the next borrow or repay.
        if diff >= 0 {
            // Best effort: `granted` is already held by the wrapped target, so a
            // failed top-up must not hide it. The next borrow retries.
            match self.over_target.borrow(diff) {
                Ok(_reserved) => {
                    #[cfg(feature = "tracing")]
                    tracing::trace!(major, expected, diff, reserved = _reserved, "over-acquire top-up");
                }
                Err(_e) => {
                    #[cfg(feature = "tracing")]
                    tracing::warn!(major, expected, diff, error = %_e, "over-acquire top-up failed");
                }
            }
        } else {
            #[cfg(feature = "tracing")]
            tracing::trace!(major, expected, over_acquired, "reserve above target, skipped");
        }
        Ok(granted)
    }

    fn repay(&self, size: i64) -> Result<i64> {
        check_size("repay", size)?;
        let freed = self.target.repay(size)?;
        check_invariant(freed == size, || {
            format!("repaid {freed} bytes but {size} were requested")
        })?;
        let over_acquired = self.over_target.used_bytes();
        let freed_over = self.over_target.repay(over_acquired)?;
        let left = self.over_target.used_bytes();
        check_invariant(freed_over == over_acquired && left == 0, || {
            format!("reserve not drained: freed {freed_over} of {over_acquired}, {left} left")
        })?;
        Ok(size)
    }

    fn name(&self) -> String {
        format!(
            "OverAcquire-[{}][{}]",
            self.target.name(),
            self.over_target.name()
        )
    }

    fn used_bytes(&self) -> i64 {
        self.target.used_bytes() + self.over_target.used_bytes()
    }

    fn stats(&self) -> StatsSnapshot {
        // The two peaks are never observed together, so the sum is unknown.
        StatsSnapshot::merged([
            (self.target.name(), self.target.stats()),
            (self.over_target.name(), self.over_target.stats()),
        ])
    }
}

impl TaskScopedTarget for OverAcquireTarget {
    fn task_allocator(&self) -> Weak<dyn TaskMemoryAllocator> {
        self.target.task_allocator()
    }
}

/// The hidden reserve. Zero-sized borrows are no-ops, repay is clamped to
/// what is held, and a host spill is just a repay.
struct ReserveTarget {
    consumer: HostConsumer,
}

impl ReserveTarget {
    fn new(allocator: Weak<dyn TaskMemoryAllocator>) -> Result<Arc<Self>> {
        let host = allocator
            .upgrade()
            .ok_or_else(|| Error::TaskReleased("cannot create over-acquire reserve".into()))?;
        Ok(Arc::new_cyclic(|me: &Weak<Self>| {
            let me: Weak<dyn Spillable> = me.clone();
            Self {
                consumer: HostConsumer::register(allocator, host.as_ref(), me),
            }
        }))
    }
}

impl MemoryTarget for ReserveTarget {
    fn borrow(&self, size: i64) -> Result<i64> {
        if size == 0 {
            return Ok(0);
        }
        self.consumer.acquire(size)
    }

    fn repay(&self, size: i64) -> Result<i64> {
        self.consumer.release_up_to(size)
    }

    fn name(&self) -> String {
        RESERVE_NAME.to_string()
    }

    fn used_bytes(&self) -> i64 {
        self.consumer.used()
    }

    fn stats(&self) -> StatsSnapshot {
        self.consumer.stats()
    }
}

impl Spillable for ReserveTarget {
    fn consumer_name(&self) -> String {
        RESERVE_NAME.to_string()
    }

    fn spill(&self, size: i64, _trigger: Option<ConsumerId>) -> Result<i64> {
        self.repay(size)
    }
}
