//! Decorator that turns backpressure into a hard error.
//!
//! For operators with no spill path of their own: a partial grant is handed
//! straight back and reported as [`Error::OutOfMemory`] with a stats dump.

use std::sync::{Arc, Weak};

use memtarget_core::error::{Error, Result};
use memtarget_core::host::TaskMemoryAllocator;
use memtarget_core::stats::StatsSnapshot;

use crate::target::{check_size, MemoryTarget, TaskScopedTarget};

pub struct ThrowOnOomTarget {
    target: Arc<dyn TaskScopedTarget>,
}

impl ThrowOnOomTarget {
    pub fn new(target: Arc<dyn TaskScopedTarget>) -> Self {
        Self { target }
    }
}

impl MemoryTarget for ThrowOnOomTarget {
    fn borrow(&self, size: i64) -> Result<i64> {
        check_size("borrow", size)?;
        let granted = self.target.borrow(size)?;
        if granted >= size {
            return Ok(granted);
        }
        if granted != 0 {
            self.target.repay(granted)?;
        }
        let name = self.target.name();
        #[cfg(feature = "tracing")]
        tracing::warn!(target_name = %name, requested = size, granted, "out of memory");
        Err(Error::OutOfMemory {
            stats: self.target.stats().pretty(&name),
            target: name,
            requested: size,
            granted,
        })
    }

    fn repay(&self, size: i64) -> Result<i64> {
        check_size("repay", size)?;
        self.target.repay(size)
    }

    fn name(&self) -> String {
        self.target.name()
    }

    fn used_bytes(&self) -> i64 {
        self.target.used_bytes()
    }

    fn stats(&self) -> StatsSnapshot {
        self.target.stats()
    }
}

impl TaskScopedTarget for ThrowOnOomTarget {
    fn task_allocator(&self) -> Weak<dyn TaskMemoryAllocator> {
        self.target.task_allocator()
    }
}
