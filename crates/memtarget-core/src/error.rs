use thiserror::Error;

/// Canonical result for every memtarget crate.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Caller bug, e.g. a zero-sized borrow. Never retried.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Accounting corruption. Fatal to the enclosing task.
    #[error("memory accounting invariant violated: {0}")]
    InvariantViolation(String),

    #[error("not enough memory in '{target}': requested {requested} bytes, granted {granted}\n{stats}")]
    OutOfMemory {
        target: String,
        requested: i64,
        granted: i64,
        stats: String,
    },

    /// The weak handle to the task allocator no longer upgrades.
    #[error("task memory allocator released: {0}")]
    TaskReleased(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Config(e.to_string())
    }
}

/// Precondition on caller-supplied values.
pub fn check_argument(cond: bool, msg: impl FnOnce() -> String) -> Result<()> {
    if cond {
        Ok(())
    } else {
        Err(Error::InvalidArgument(msg()))
    }
}

/// Precondition on internal bookkeeping.
pub fn check_invariant(cond: bool, msg: impl FnOnce() -> String) -> Result<()> {
    if cond {
        Ok(())
    } else {
        Err(Error::InvariantViolation(msg()))
    }
}
