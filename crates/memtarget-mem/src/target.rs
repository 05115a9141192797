//! The memory target capability.
//!
//! Leaves and decorators implement the same trait; callers never need to know
//! which one they hold.

use std::sync::Weak;

use memtarget_core::error::{check_argument, Result};
use memtarget_core::host::TaskMemoryAllocator;
use memtarget_core::stats::StatsSnapshot;

/// A node in a task's memory-accounting tree.
///
/// Invariants:
/// - `borrow` returns `0..=size`. Anything less than `size` is backpressure,
///   not an error; the caller decides whether to retry, spill, or fail.
/// - `used_bytes` equals the sum of all granted amounts minus all returned
///   amounts and is never negative.
pub trait MemoryTarget: Send + Sync {
    /// Request `size` bytes. `size` must be positive.
    fn borrow(&self, size: i64) -> Result<i64>;

    /// Return `size` bytes. `size` must be positive. Returns what was released.
    fn repay(&self, size: i64) -> Result<i64>;

    /// Stable diagnostic name; the key of this node in its parent's stats.
    fn name(&self) -> String;

    fn used_bytes(&self) -> i64;

    fn stats(&self) -> StatsSnapshot;
}

/// A target bound to one task's allocator.
///
/// Every target of a task hands out the same non-owning handle, so decorators
/// can create sibling consumers in the same task.
pub trait TaskScopedTarget: MemoryTarget {
    fn task_allocator(&self) -> Weak<dyn TaskMemoryAllocator>;
}

pub(crate) fn check_size(op: &str, size: i64) -> Result<()> {
    check_argument(size != 0, || format!("size to {op} is zero"))?;
    check_argument(size > 0, || format!("size to {op} is negative: {size}"))
}
