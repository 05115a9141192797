#![forbid(unsafe_code)]
//! memtarget-core: shared vocabulary for task-scoped memory accounting.
//!
//! Nothing in here grants or tracks bytes. The host allocator contract, the
//! stats tree, ids, errors and config live here so operator crates can depend
//! on the API without pulling in `memtarget-mem`.

pub mod config;
pub mod error;
pub mod host;
pub mod id;
pub mod prelude;
pub mod stats;
