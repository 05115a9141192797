//! Leaf targets that talk to the task allocator directly.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Weak};

use memtarget_core::error::{check_invariant, Error, Result};
use memtarget_core::host::{Spillable, TaskMemoryAllocator};
use memtarget_core::id::ConsumerId;
use memtarget_core::stats::StatsSnapshot;

use crate::target::{check_size, MemoryTarget, TaskScopedTarget};
use crate::tracking::UsageRecorder;

/// Operator-supplied spill callback.
///
/// Invoked when the host needs memory back. Implementations free their own
/// data and repay the freed bytes through `target`, returning the amount.
pub trait Spiller: Send + Sync {
    fn spill(&self, target: &dyn MemoryTarget, size: i64) -> Result<i64>;
}

impl<F> Spiller for F
where
    F: Fn(&dyn MemoryTarget, i64) -> Result<i64> + Send + Sync,
{
    fn spill(&self, target: &dyn MemoryTarget, size: i64) -> Result<i64> {
        self(target, size)
    }
}

/// One registration with the task allocator plus its local ledger.
///
/// Shared by every leaf flavour. Unregisters on drop, which lets the host
/// reclaim anything still outstanding.
pub(crate) struct HostConsumer {
    id: ConsumerId,
    allocator: Weak<dyn TaskMemoryAllocator>,
    used: AtomicI64,
    usage: UsageRecorder,
}

impl HostConsumer {
    pub(crate) fn register(
        allocator: Weak<dyn TaskMemoryAllocator>,
        host: &dyn TaskMemoryAllocator,
        me: Weak<dyn Spillable>,
    ) -> Self {
        Self {
            id: host.register(me),
            allocator,
            used: AtomicI64::new(0),
            usage: UsageRecorder::new(),
        }
    }

    pub(crate) fn id(&self) -> ConsumerId {
        self.id
    }

    pub(crate) fn allocator(&self) -> Weak<dyn TaskMemoryAllocator> {
        self.allocator.clone()
    }

    fn host(&self) -> Result<Arc<dyn TaskMemoryAllocator>> {
        self.allocator
            .upgrade()
            .ok_or_else(|| Error::TaskReleased(format!("{} has no live allocator", self.id)))
    }

    pub(crate) fn acquire(&self, size: i64) -> Result<i64> {
        let granted = self.host()?.acquire(self.id, size)?;
        if granted > 0 {
            // Recorder first: a concurrent spill releases `used` before it
            // touches the recorder, so the recorder never dips below zero.
            self.usage.inc(granted)?;
            self.used.fetch_add(granted, Ordering::AcqRel);
        }
        Ok(granted)
    }

    /// Release exactly `size`; holding less is an accounting bug.
    pub(crate) fn release_exact(&self, size: i64) -> Result<i64> {
        let mut cur = self.used.load(Ordering::Acquire);
        loop {
            check_invariant(size <= cur, || {
                format!("{} repays {size} bytes but holds only {cur}", self.id)
            })?;
            match self
                .used
                .compare_exchange(cur, cur - size, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => break,
                Err(observed) => cur = observed,
            }
        }
        self.give_back(size)
    }

    /// Release `min(size, held)`. Returns the released amount.
    pub(crate) fn release_up_to(&self, size: i64) -> Result<i64> {
        let mut cur = self.used.load(Ordering::Acquire);
        let to_free = loop {
            let to_free = size.min(cur).max(0);
            match self
                .used
                .compare_exchange(cur, cur - to_free, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => break to_free,
                Err(observed) => cur = observed,
            }
        };
        if to_free == 0 {
            return Ok(0);
        }
        self.give_back(to_free)
    }

    /// Hand `size` (already taken off `used`) back to the host. If the host
    /// refuses, `used` is restored so the ledger still matches the host.
    fn give_back(&self, size: i64) -> Result<i64> {
        let freed = match self.host().and_then(|host| host.release(self.id, size)) {
            Ok(freed) => freed,
            Err(e) => {
                self.used.fetch_add(size, Ordering::AcqRel);
                return Err(e);
            }
        };
        self.usage.inc(-size)?;
        check_invariant(freed == size, || {
            format!("host freed {freed} bytes of {size} for {}", self.id)
        })?;
        Ok(freed)
    }

    pub(crate) fn used(&self) -> i64 {
        self.used.load(Ordering::Acquire)
    }

    pub(crate) fn stats(&self) -> StatsSnapshot {
        self.usage.to_stats()
    }
}

impl Drop for HostConsumer {
    fn drop(&mut self) {
        if let Some(host) = self.allocator.upgrade() {
            #[cfg(feature = "tracing")]
            {
                let used = *self.used.get_mut();
                if used > 0 {
                    tracing::warn!(consumer = %self.id, bytes = used, "target dropped while holding memory");
                }
            }
            host.unregister(self.id);
        }
    }
}

/// Operator-facing leaf: every borrow/repay maps 1:1 onto the task allocator.
///
/// Registered with the allocator for spill callbacks; when the host asks for
/// memory back, the injected [`Spiller`] (if any) is run against this target.
pub struct HostBackedTarget {
    name: String,
    consumer: HostConsumer,
    spiller: Option<Box<dyn Spiller>>,
}

impl HostBackedTarget {
    pub fn new(
        allocator: Weak<dyn TaskMemoryAllocator>,
        name: impl Into<String>,
        spiller: Option<Box<dyn Spiller>>,
    ) -> Result<Arc<Self>> {
        let name = name.into();
        let host = allocator
            .upgrade()
            .ok_or_else(|| Error::TaskReleased(format!("cannot create target '{name}'")))?;
        Ok(Arc::new_cyclic(|me: &Weak<Self>| {
            let me: Weak<dyn Spillable> = me.clone();
            Self {
                consumer: HostConsumer::register(allocator, host.as_ref(), me),
                name,
                spiller,
            }
        }))
    }

    pub fn consumer_id(&self) -> ConsumerId {
        self.consumer.id()
    }
}

impl MemoryTarget for HostBackedTarget {
    fn borrow(&self, size: i64) -> Result<i64> {
        check_size("borrow", size)?;
        self.consumer.acquire(size)
    }

    fn repay(&self, size: i64) -> Result<i64> {
        check_size("repay", size)?;
        self.consumer.release_exact(size)
    }

    fn name(&self) -> String {
        self.name.clone()
    }

    fn used_bytes(&self) -> i64 {
        self.consumer.used()
    }

    fn stats(&self) -> StatsSnapshot {
        self.consumer.stats()
    }
}

impl TaskScopedTarget for HostBackedTarget {
    fn task_allocator(&self) -> Weak<dyn TaskMemoryAllocator> {
        self.consumer.allocator()
    }
}

impl Spillable for HostBackedTarget {
    fn consumer_name(&self) -> String {
        self.name.clone()
    }

    fn spill(&self, size: i64, _trigger: Option<ConsumerId>) -> Result<i64> {
        match &self.spiller {
            Some(spiller) => spiller.spill(self, size),
            None => Ok(0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::TaskMemoryManager;
    use memtarget_core::id::TaskId;

    fn manager(capacity: i64) -> (Arc<TaskMemoryManager>, Weak<dyn TaskMemoryAllocator>) {
        let m = TaskMemoryManager::new(TaskId::new(0), capacity).unwrap();
        let alloc: Arc<dyn TaskMemoryAllocator> = m.clone();
        (m, Arc::downgrade(&alloc))
    }

    #[test]
    fn borrow_and_repay_round_through_host() {
        let (m, alloc) = manager(1000);
        let t = HostBackedTarget::new(alloc, "leaf", None).unwrap();
        assert_eq!(t.borrow(300).unwrap(), 300);
        assert_eq!(m.used_bytes(), 300);
        assert_eq!(t.repay(100).unwrap(), 100);
        assert_eq!(t.used_bytes(), 200);
        assert_eq!(m.used_bytes(), 200);
        assert_eq!(t.stats(), StatsSnapshot::leaf(200, 300));
    }

    #[test]
    fn zero_and_negative_sizes_are_rejected() {
        let (_m, alloc) = manager(1000);
        let t = HostBackedTarget::new(alloc, "leaf", None).unwrap();
        assert!(matches!(t.borrow(0), Err(Error::InvalidArgument(_))));
        assert!(matches!(t.repay(0), Err(Error::InvalidArgument(_))));
        assert!(matches!(t.borrow(-5), Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn over_repay_is_invariant_violation() {
        let (m, alloc) = manager(1000);
        let t = HostBackedTarget::new(alloc, "leaf", None).unwrap();
        t.borrow(10).unwrap();
        assert!(matches!(t.repay(11), Err(Error::InvariantViolation(_))));
        assert_eq!(t.used_bytes(), 10);
        assert_eq!(m.used_bytes(), 10);
    }

    #[test]
    fn partial_grant_is_not_an_error() {
        let (_m, alloc) = manager(64);
        let t = HostBackedTarget::new(alloc, "leaf", None).unwrap();
        assert_eq!(t.borrow(100).unwrap(), 64);
        assert_eq!(t.borrow(1).unwrap(), 0);
        assert_eq!(t.used_bytes(), 64);
    }

    #[test]
    fn spiller_is_invoked_under_pressure() {
        let (m, alloc) = manager(100);
        let spilling = HostBackedTarget::new(
            alloc.clone(),
            "spilling",
            Some(Box::new(|t: &dyn MemoryTarget, size: i64| {
                let held = t.used_bytes();
                if held == 0 {
                    return Ok(0);
                }
                t.repay(size.min(held))
            })),
        )
        .unwrap();
        let other = HostBackedTarget::new(alloc, "other", None).unwrap();
        assert_eq!(spilling.borrow(90).unwrap(), 90);
        assert_eq!(other.borrow(50).unwrap(), 50);
        assert_eq!(spilling.used_bytes(), 50);
        assert_eq!(m.used_bytes(), 100);
    }

    #[test]
    fn drop_unregisters_and_frees() {
        let (m, alloc) = manager(100);
        let t = HostBackedTarget::new(alloc, "leaf", None).unwrap();
        t.borrow(40).unwrap();
        drop(t);
        assert_eq!(m.used_bytes(), 0);
        assert!(m.consumer_usage().is_empty());
    }

    #[test]
    fn released_task_is_reported() {
        let (m, alloc) = manager(100);
        let t = HostBackedTarget::new(alloc.clone(), "leaf", None).unwrap();
        drop(m);
        assert!(matches!(t.borrow(1), Err(Error::TaskReleased(_))));
        assert!(matches!(
            HostBackedTarget::new(alloc, "late", None),
            Err(Error::TaskReleased(_))
        ));
    }

    #[test]
    fn failed_release_keeps_local_ledger() {
        let (m, alloc) = manager(100);
        let t = HostBackedTarget::new(alloc, "leaf", None).unwrap();
        t.borrow(60).unwrap();
        drop(m);
        assert!(matches!(t.repay(20), Err(Error::TaskReleased(_))));
        assert_eq!(t.used_bytes(), 60);
        assert_eq!(t.stats(), StatsSnapshot::leaf(60, 60));
    }
}
