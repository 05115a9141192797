//! Constructors for the usual target chains.

use std::sync::{Arc, Weak};

use memtarget_core::error::Result;
use memtarget_core::host::TaskMemoryAllocator;

use crate::leaf::{HostBackedTarget, Spiller};
use crate::over_acquire::OverAcquireTarget;
use crate::target::TaskScopedTarget;
use crate::throw_on_oom::ThrowOnOomTarget;

pub fn host_backed(
    allocator: Weak<dyn TaskMemoryAllocator>,
    name: impl Into<String>,
    spiller: Option<Box<dyn Spiller>>,
) -> Result<Arc<dyn TaskScopedTarget>> {
    Ok(HostBackedTarget::new(allocator, name, spiller)?)
}

/// Wrap `target` in an over-acquire decorator; a zero ratio returns it as is.
pub fn over_acquire(
    target: Arc<dyn TaskScopedTarget>,
    ratio: f64,
) -> Result<Arc<dyn TaskScopedTarget>> {
    if ratio == 0.0 {
        return Ok(target);
    }
    Ok(Arc::new(OverAcquireTarget::new(target, ratio)?))
}

pub fn throw_on_oom(target: Arc<dyn TaskScopedTarget>) -> Arc<dyn TaskScopedTarget> {
    Arc::new(ThrowOnOomTarget::new(target))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::TaskMemoryManager;
    use crate::target::MemoryTarget;
    use memtarget_core::id::TaskId;

    #[test]
    fn zero_ratio_skips_the_decorator() {
        let m = TaskMemoryManager::new(TaskId::new(0), 100).unwrap();
        let alloc: Arc<dyn TaskMemoryAllocator> = m.clone();
        let leaf = host_backed(Arc::downgrade(&alloc), "op", None).unwrap();
        let same = over_acquire(leaf.clone(), 0.0).unwrap();
        assert!(Arc::ptr_eq(&leaf, &same));
        let wrapped = over_acquire(leaf, 0.5).unwrap();
        assert_eq!(wrapped.name(), "OverAcquire-[op][OverAcquire.Reserve]");
    }
}
