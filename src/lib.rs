#![forbid(unsafe_code)]
//! memtarget: task-scoped memory accounting with over-acquisition.
//!
//! Facade over the workspace crates:
//! - `memtarget-core`: errors, ids, the host allocator contract, stats, config.
//! - `memtarget-mem`: memory targets, the task memory manager, task wiring.

pub use memtarget_core;
pub use memtarget_mem;

pub use memtarget_core::prelude::*;
pub use memtarget_mem::{
    targets, HostBackedTarget, MemoryTarget, OverAcquireTarget, Spiller, TaskMemoryContext,
    TaskMemoryManager, TaskScopedTarget, ThrowOnOomTarget, UsageRecorder,
};
