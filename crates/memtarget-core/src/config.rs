//! Memory configuration that downstream crates can serialize/deserialize.

use serde::{Deserialize, Serialize};

use crate::error::{check_argument, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Hard per-task memory cap (bytes) enforced by the task allocator.
    pub task_capacity_bytes: i64,

    /// Hidden reserve kept proportional to an operator's usage. 0 disables it.
    pub over_acquire_ratio: f64,

    /// Turn partial grants into `Error::OutOfMemory` for operator targets.
    pub throw_on_oom: bool,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            task_capacity_bytes: 512 * 1024 * 1024, // 512 MiB
            over_acquire_ratio: 0.3,
            throw_on_oom: false,
        }
    }
}

impl MemoryConfig {
    /// Defaults overridden by `MEMTARGET_*` environment variables.
    /// Unparsable values are ignored.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Ok(s) = std::env::var("MEMTARGET_TASK_CAPACITY_BYTES") {
            if let Ok(v) = s.parse::<i64>() {
                cfg.task_capacity_bytes = v;
            }
        }

        if let Ok(s) = std::env::var("MEMTARGET_OVER_ACQUIRE_RATIO") {
            if let Ok(v) = s.parse::<f64>() {
                cfg.over_acquire_ratio = v;
            }
        }

        if let Ok(s) = std::env::var("MEMTARGET_THROW_ON_OOM") {
            if let Ok(v) = s.parse::<bool>() {
                cfg.throw_on_oom = v;
            }
        }

        cfg
    }

    pub fn validate(&self) -> Result<()> {
        check_argument(self.task_capacity_bytes >= 0, || {
            format!(
                "task_capacity_bytes must be >= 0, got {}",
                self.task_capacity_bytes
            )
        })?;
        let ratio = self.over_acquire_ratio;
        check_argument(ratio.is_finite() && ratio >= 0.0, || {
            format!("over_acquire_ratio must be finite and >= 0, got {ratio}")
        })
    }
}
