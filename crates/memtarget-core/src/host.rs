//! Host allocator contract.
//!
//! The concrete task memory manager lives in `memtarget-mem`. Only the traits
//! live here so any operator crate (or a foreign host binding) can implement
//! or consume them without the accounting logic.

use std::sync::Weak;

use crate::error::Result;
use crate::id::{ConsumerId, TaskId};

/// A consumer the host can ask to give memory back.
///
/// Registered weakly with the allocator at construction time. `spill` may be
/// invoked from inside an in-flight `acquire` of any consumer of the same
/// task, including the consumer being spilled, so implementations must not
/// hold locks across calls back into the allocator.
pub trait Spillable: Send + Sync {
    /// Diagnostic name, used as a stats key by the host.
    fn consumer_name(&self) -> String;

    /// Release up to `size` bytes. Returns what was actually released.
    /// `trigger` identifies the consumer whose request caused the spill, if any.
    fn spill(&self, size: i64, trigger: Option<ConsumerId>) -> Result<i64>;
}

/// Task-scoped allocator: one instance per task, shared by every target in
/// that task's tree through a non-owning handle.
pub trait TaskMemoryAllocator: Send + Sync {
    fn task_id(&self) -> TaskId;

    /// Register a consumer for spill callbacks and per-consumer accounting.
    fn register(&self, consumer: Weak<dyn Spillable>) -> ConsumerId;

    /// Forget a consumer. Idempotent.
    fn unregister(&self, consumer: ConsumerId);

    /// Request `bytes` for `consumer`. May spill other consumers (or the
    /// requester) first. Returns the granted amount, `0..=bytes`.
    fn acquire(&self, consumer: ConsumerId, bytes: i64) -> Result<i64>;

    /// Return `bytes` previously granted to `consumer`. Returns the freed amount.
    fn release(&self, consumer: ConsumerId, bytes: i64) -> Result<i64>;

    /// Bytes currently granted across all consumers of the task.
    fn used_bytes(&self) -> i64;

    /// Hard ceiling for the task.
    fn capacity_bytes(&self) -> i64;
}

// NOTE: no blanket impls here. Only the mem crate (or a host binding) decides
// how bytes are granted.
