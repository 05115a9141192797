//! In-process task memory manager.
//!
//! One instance per task. Enforces the task's hard cap, keeps a per-consumer
//! ledger, and arbitrates spills when a request does not fit: other consumers
//! are asked first (largest holder first), the requester itself last.
//!
//! The state mutex is never held while a spill callback runs, so callbacks may
//! re-enter `release` (and `acquire`) on the same manager.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use memtarget_core::error::{check_argument, check_invariant, Error, Result};
use memtarget_core::host::{Spillable, TaskMemoryAllocator};
use memtarget_core::id::{ConsumerId, TaskId};
use memtarget_core::stats::StatsSnapshot;

use crate::tracking::UsageRecorder;

struct ConsumerEntry {
    consumer: Weak<dyn Spillable>,
    granted: i64,
    peak: i64,
}

struct ManagerState {
    used: i64,
    consumers: BTreeMap<ConsumerId, ConsumerEntry>,
}

impl ManagerState {
    fn grant(&mut self, consumer: ConsumerId, bytes: i64) -> Result<()> {
        let entry = self.consumers.get_mut(&consumer).ok_or_else(|| {
            Error::InvalidArgument(format!("{consumer} is not registered"))
        })?;
        entry.granted += bytes;
        entry.peak = entry.peak.max(entry.granted);
        self.used += bytes;
        Ok(())
    }
}

/// Per-consumer view of the ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerUsage {
    pub id: ConsumerId,
    pub name: String,
    pub used: i64,
}

pub struct TaskMemoryManager {
    task: TaskId,
    capacity: i64,
    next_id: AtomicU64,
    state: Mutex<ManagerState>,
    usage: UsageRecorder,
}

impl TaskMemoryManager {
    pub fn new(task: TaskId, capacity_bytes: i64) -> Result<Arc<Self>> {
        check_argument(capacity_bytes >= 0, || {
            format!("task capacity must be >= 0, got {capacity_bytes}")
        })?;
        Ok(Arc::new(Self {
            task,
            capacity: capacity_bytes,
            next_id: AtomicU64::new(0),
            state: Mutex::new(ManagerState {
                used: 0,
                consumers: BTreeMap::new(),
            }),
            usage: UsageRecorder::new(),
        }))
    }

    fn state(&self) -> MutexGuard<'_, ManagerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn available_bytes(&self) -> i64 {
        self.capacity - self.state().used
    }

    /// Host-issued spill of a single consumer.
    pub fn spill_consumer(
        &self,
        id: ConsumerId,
        size: i64,
        trigger: Option<ConsumerId>,
    ) -> Result<i64> {
        check_argument(size > 0, || format!("size to spill must be positive, got {size}"))?;
        let consumer = {
            let st = self.state();
            st.consumers
                .get(&id)
                .and_then(|e| e.consumer.upgrade())
                .ok_or_else(|| Error::InvalidArgument(format!("{id} is not registered")))?
        };
        let freed = consumer.spill(size, trigger)?;
        #[cfg(feature = "tracing")]
        tracing::debug!(task = %self.task, consumer = %id, requested = size, freed, "host spill");
        Ok(freed)
    }

    pub fn consumer_usage(&self) -> Vec<ConsumerUsage> {
        let entries: Vec<_> = {
            let st = self.state();
            st.consumers
                .iter()
                .map(|(id, e)| (*id, e.consumer.clone(), e.granted))
                .collect()
        };
        entries
            .into_iter()
            .filter_map(|(id, weak, used)| {
                weak.upgrade().map(|c| ConsumerUsage {
                    id,
                    name: c.consumer_name(),
                    used,
                })
            })
            .collect()
    }

    /// Task-level snapshot: one child per live consumer, keyed `name#id`.
    pub fn stats(&self) -> StatsSnapshot {
        let (entries, current): (Vec<_>, i64) = {
            let st = self.state();
            let entries = st
                .consumers
                .iter()
                .map(|(id, e)| (*id, e.consumer.clone(), e.granted, e.peak))
                .collect();
            (entries, st.used)
        };
        let mut snapshot = StatsSnapshot::leaf(current, self.usage.peak());
        for (id, weak, granted, peak) in entries {
            if let Some(c) = weak.upgrade() {
                snapshot = snapshot.with_child(
                    format!("{}#{}", c.consumer_name(), id.get()),
                    StatsSnapshot::leaf(granted, peak),
                );
            }
        }
        snapshot
    }

    /// Spill candidates for a request by `requester`: the others by descending
    /// grant, then the requester.
    fn spill_order(&self, requester: ConsumerId) -> Vec<(ConsumerId, Weak<dyn Spillable>)> {
        let st = self.state();
        let mut others: Vec<_> = st
            .consumers
            .iter()
            .filter(|(id, e)| **id != requester && e.granted > 0)
            .map(|(id, e)| (*id, e.granted, e.consumer.clone()))
            .collect();
        others.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        let mut order: Vec<_> = others.into_iter().map(|(id, _, c)| (id, c)).collect();
        if let Some(e) = st.consumers.get(&requester) {
            if e.granted > 0 {
                order.push((requester, e.consumer.clone()));
            }
        }
        order
    }

    fn reclaim(&self, st: &mut ManagerState, _id: ConsumerId, entry: ConsumerEntry) {
        if entry.granted > 0 {
            #[cfg(feature = "tracing")]
            tracing::warn!(task = %self.task, consumer = %_id, bytes = entry.granted, "reclaiming bytes of unregistered consumer");
            st.used -= entry.granted;
            // Recorder mirrors `used` under the same lock, so this cannot go
            // below zero.
            let recorded = self.usage.inc(-entry.granted);
            debug_assert!(recorded.is_ok(), "task recorder out of sync: {recorded:?}");
        }
    }
}

impl TaskMemoryAllocator for TaskMemoryManager {
    fn task_id(&self) -> TaskId {
        self.task
    }

    fn register(&self, consumer: Weak<dyn Spillable>) -> ConsumerId {
        let id = ConsumerId::new(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.state().consumers.insert(
            id,
            ConsumerEntry {
                consumer,
                granted: 0,
                peak: 0,
            },
        );
        #[cfg(feature = "tracing")]
        tracing::trace!(task = %self.task, consumer = %id, "registered");
        id
    }

    fn unregister(&self, consumer: ConsumerId) {
        let mut st = self.state();
        if let Some(entry) = st.consumers.remove(&consumer) {
            self.reclaim(&mut st, consumer, entry);
        }
    }

    fn acquire(&self, consumer: ConsumerId, bytes: i64) -> Result<i64> {
        check_argument(bytes >= 0, || format!("cannot acquire negative bytes: {bytes}"))?;
        if bytes == 0 {
            return Ok(0);
        }
        {
            let mut st = self.state();
            if self.capacity - st.used >= bytes {
                st.grant(consumer, bytes)?;
                self.usage.inc(bytes)?;
                return Ok(bytes);
            }
        }

        for (_victim, weak) in self.spill_order(consumer) {
            let shortfall = bytes - self.available_bytes();
            if shortfall <= 0 {
                break;
            }
            let Some(c) = weak.upgrade() else {
                continue;
            };
            let _freed = c.spill(shortfall, Some(consumer))?;
            #[cfg(feature = "tracing")]
            tracing::debug!(task = %self.task, victim = %_victim, trigger = %consumer, shortfall, freed = _freed, "spilled for acquire");
        }

        let mut st = self.state();
        let granted = bytes.min(self.capacity - st.used).max(0);
        if granted > 0 {
            st.grant(consumer, granted)?;
            self.usage.inc(granted)?;
        }
        Ok(granted)
    }

    fn release(&self, consumer: ConsumerId, bytes: i64) -> Result<i64> {
        check_argument(bytes >= 0, || format!("cannot release negative bytes: {bytes}"))?;
        if bytes == 0 {
            return Ok(0);
        }
        {
            let mut st = self.state();
            let entry = st.consumers.get_mut(&consumer).ok_or_else(|| {
                Error::InvalidArgument(format!("{consumer} is not registered"))
            })?;
            check_invariant(entry.granted >= bytes, || {
                format!(
                    "{consumer} releases {bytes} bytes but holds only {}",
                    entry.granted
                )
            })?;
            entry.granted -= bytes;
            st.used -= bytes;
            self.usage.inc(-bytes)?;
        }
        Ok(bytes)
    }

    fn used_bytes(&self) -> i64 {
        self.state().used
    }

    fn capacity_bytes(&self) -> i64 {
        self.capacity
    }
}
