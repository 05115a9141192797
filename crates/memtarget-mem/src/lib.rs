#![forbid(unsafe_code)]
//! memtarget-mem: memory targets, over-acquisition, and spill arbitration.
//!
//! Concrete implementations for the contracts in `memtarget-core::host`.
//! Operators borrow and repay through a [`MemoryTarget`]; leaves talk to the
//! task's [`TaskMemoryAllocator`](memtarget_core::host::TaskMemoryAllocator),
//! decorators compose on top.

pub mod context;
pub mod leaf;
pub mod manager;
pub mod over_acquire;
pub mod target;
pub mod targets;
pub mod throw_on_oom;
pub mod tracking;

pub use context::TaskMemoryContext;
pub use leaf::{HostBackedTarget, Spiller};
pub use manager::{ConsumerUsage, TaskMemoryManager};
pub use over_acquire::OverAcquireTarget;
pub use target::{MemoryTarget, TaskScopedTarget};
pub use throw_on_oom::ThrowOnOomTarget;
pub use tracking::UsageRecorder;
