use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Git error: {0}")]
    Git(#[from] git2::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("No home directory")]
    NoHomeDir,

    #[error("Task not found: {0}")]
    TaskNotFound(crate::task::TaskId),

    #[error("Subtask {subtask_id} not found in task {task_id}")]
    SubtaskNotFound {
        task_id: crate::task::TaskId,
        subtask_id: u32,
    },

    #[error("Agent session not found: {0}")]
    SessionNotFound(crate::supervisor::ThreadId),

    #[error("No worktree registered for task {0}")]
    WorktreeNotFound(crate::task::TaskId),

    #[error("An agent is already running for task {0}")]
    AgentConflict(crate::task::TaskId),

    #[error("Task record {0} is stale (concurrently modified)")]
    StaleTask(crate::task::TaskId),

    #[error("Worktree for task {0} has uncommitted changes (use force to discard)")]
    WorktreeDirty(crate::task::TaskId),

    #[error("Git is not available on this system")]
    GitUnavailable,

    #[error("Capability error: {0}")]
    Capability(String),

    #[error("Operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Invalid phase transition from {from} to {to}")]
    InvalidPhaseTransition { from: String, to: String },

    #[error("Task join error: {0}")]
    TaskJoin(String),
}

pub type Result<T> = std::result::Result<T, Error>;
