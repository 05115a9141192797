//! Convenient re-exports for downstream crates.

pub use crate::config::MemoryConfig;
pub use crate::error::{Error, Result};
pub use crate::host::{Spillable, TaskMemoryAllocator};
pub use crate::id::{ConsumerId, TaskId};
pub use crate::stats::{StatsSnapshot, PEAK_UNKNOWN};
