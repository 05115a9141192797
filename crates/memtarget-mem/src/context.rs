//! Task-scope wiring.
//!
//! A [`TaskMemoryContext`] is the only strong owner of a task's allocator.
//! Every target it hands out holds a weak handle, so targets outliving the
//! task fail with `TaskReleased` instead of keeping the task alive.

use std::sync::{Arc, Weak};

use memtarget_core::config::MemoryConfig;
use memtarget_core::error::Result;
use memtarget_core::host::TaskMemoryAllocator;
use memtarget_core::id::TaskId;
use memtarget_core::stats::StatsSnapshot;

use crate::leaf::{HostBackedTarget, Spiller};
use crate::manager::TaskMemoryManager;
use crate::target::TaskScopedTarget;
use crate::targets;

pub struct TaskMemoryContext {
    config: MemoryConfig,
    manager: Arc<TaskMemoryManager>,
}

impl TaskMemoryContext {
    pub fn new(task: TaskId, config: MemoryConfig) -> Result<Self> {
        config.validate()?;
        let manager = TaskMemoryManager::new(task, config.task_capacity_bytes)?;
        #[cfg(feature = "tracing")]
        tracing::debug!(%task, capacity = config.task_capacity_bytes, ratio = config.over_acquire_ratio, "task memory context");
        Ok(Self { config, manager })
    }

    pub fn config(&self) -> &MemoryConfig {
        &self.config
    }

    pub fn manager(&self) -> &Arc<TaskMemoryManager> {
        &self.manager
    }

    pub fn allocator(&self) -> Weak<dyn TaskMemoryAllocator> {
        let allocator: Arc<dyn TaskMemoryAllocator> = self.manager.clone();
        Arc::downgrade(&allocator)
    }

    /// A bare leaf registered with this task.
    pub fn new_consumer(
        &self,
        name: impl Into<String>,
        spiller: Option<Box<dyn Spiller>>,
    ) -> Result<Arc<HostBackedTarget>> {
        HostBackedTarget::new(self.allocator(), name, spiller)
    }

    /// The configured chain for an operator: leaf, then over-acquire when the
    /// ratio is non-zero, then throw-on-OOM when enabled.
    pub fn operator_target(
        &self,
        name: impl Into<String>,
        spiller: Option<Box<dyn Spiller>>,
    ) -> Result<Arc<dyn TaskScopedTarget>> {
        let leaf = targets::host_backed(self.allocator(), name, spiller)?;
        let target = targets::over_acquire(leaf, self.config.over_acquire_ratio)?;
        Ok(if self.config.throw_on_oom {
            targets::throw_on_oom(target)
        } else {
            target
        })
    }

    pub fn used_bytes(&self) -> i64 {
        self.manager.used_bytes()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.manager.stats()
    }
}
