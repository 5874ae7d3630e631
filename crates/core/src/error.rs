use thiserror::Error;

/// Errors surfaced by the dispatch system.
///
/// Queue timeouts are not represented here: an empty poll is a normal
/// `None` branch of the dispatcher loop.
#[derive(Error, Debug)]
pub enum SchedError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("task cap of {0} reached")]
    CapacityExceeded(usize),

    #[error("execution fault in {task}: {reason}")]
    ExecutionFault { task: String, reason: String },

    #[error("worker pool error: {0}")]
    Pool(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl SchedError {
    /// Shorthand for an [`SchedError::InvalidInput`] with a formatted reason.
    pub fn invalid(reason: impl Into<String>) -> Self {
        SchedError::InvalidInput(reason.into())
    }

    /// Shorthand for an [`SchedError::ExecutionFault`].
    pub fn fault(task: impl Into<String>, reason: impl Into<String>) -> Self {
        SchedError::ExecutionFault {
            task: task.into(),
            reason: reason.into(),
        }
    }
}
