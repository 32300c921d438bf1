use std::path::PathBuf;
use thiserror::Error;

/// Main error type for engine operations.
///
/// Submission errors (`NotStarted`, `TooManyTasks`, `UnknownBuilder`,
/// `InvalidRequest`) are raised synchronously and never create a task.
/// Build failures themselves are not errors: they surface as an
/// unsuccessful [`crate::task::BuildResult`].
#[derive(Debug, Error)]
pub enum BuilderError {
    /// Operation invoked before `start()`
    #[error("builder `{0}` is not started")]
    NotStarted(String),

    /// `start()` invoked twice
    #[error("builder `{0}` is already started")]
    AlreadyStarted(String),

    /// Task id was never registered or has already expired
    #[error("no build task with id {0}")]
    TaskNotFound(u64),

    /// Worker pool and its bounded queue are both full
    #[error("too many builds in progress (limit {limit})")]
    TooManyTasks { limit: usize },

    /// No builder registered under the requested name
    #[error("no builder registered under `{0}`")]
    UnknownBuilder(String),

    /// Request fails validation before a configuration is derived
    #[error("invalid build request: {0}")]
    InvalidRequest(String),

    /// Repository or build directory could not be set up
    #[error("repository setup failed at {path}: {source}")]
    Infrastructure {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The engine itself malfunctioned (not the build)
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}
