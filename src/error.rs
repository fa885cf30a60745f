use crate::core::task::TaskId;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("No home directory")]
    NoHomeDir,

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Task queue is closed")]
    QueueClosed,

    #[error("Queue store error: {0}")]
    Store(String),

    #[error("Orchestrator has not been started")]
    NotStarted,

    #[error("Orchestrator is already running")]
    AlreadyStarted,

    #[error("Unknown task: {0}")]
    UnknownTask(TaskId),

    #[error("Operation timed out after {0:?}")]
    Timeout(std::time::Duration),
}

pub type Result<T> = std::result::Result<T, Error>;
