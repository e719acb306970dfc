//! Error taxonomy returned by every supervisor operation.

use crate::lifecycle::LifecycleState;
use crate::persistence::PersistenceError;
use crate::project::IdError;
use crate::protocol::{
    ERR_ALREADY_RUNNING, ERR_DEPENDENCY_INSTALL, ERR_DUPLICATE_PROJECT, ERR_INFRA,
    ERR_INVALID_COMMAND, ERR_INVALID_IDENTIFIER, ERR_NOT_FOUND, ERR_NOT_RUNNING,
    ERR_PROCESS_GONE, ERR_SPAWN, ERR_STARTUP_FAILED, ERR_TIMEOUT,
};
use crate::runner::SpawnError;

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("invalid project id {id:?}: {source}")]
    InvalidIdentifier {
        id: String,
        #[source]
        source: IdError,
    },

    #[error("project {0} already exists")]
    DuplicateProject(String),

    #[error("project {0} not found")]
    NotFound(String),

    #[error("project {id} is already {state}")]
    AlreadyRunning { id: String, state: LifecycleState },

    #[error("project {0} is not running")]
    NotRunning(String),

    #[error("failed to start {id}: {source}")]
    Spawn {
        id: String,
        #[source]
        source: SpawnError,
    },

    #[error("{id} exited during startup (exit code {})", fmt_code(*.exit_code))]
    StartupFailed { id: String, exit_code: Option<i32> },

    #[error("project {0} has no live process")]
    ProcessGone(String),

    #[error("{id}: {operation} timed out")]
    Timeout { id: String, operation: String },

    #[error("dependency install for {id} failed: {reason}")]
    DependencyInstall { id: String, reason: String },

    #[error("invalid run command: {0}")]
    InvalidCommand(String),

    #[error("persistence error: {0}")]
    Persistence(#[from] PersistenceError),
}

impl SupervisorError {
    /// JSON-RPC `error.code` for this failure.
    pub fn code(&self) -> i64 {
        match self {
            Self::InvalidIdentifier { .. } => ERR_INVALID_IDENTIFIER,
            Self::DuplicateProject(_) => ERR_DUPLICATE_PROJECT,
            Self::NotFound(_) => ERR_NOT_FOUND,
            Self::AlreadyRunning { .. } => ERR_ALREADY_RUNNING,
            Self::NotRunning(_) => ERR_NOT_RUNNING,
            Self::Spawn { .. } => ERR_SPAWN,
            Self::StartupFailed { .. } => ERR_STARTUP_FAILED,
            Self::ProcessGone(_) => ERR_PROCESS_GONE,
            Self::Timeout { .. } => ERR_TIMEOUT,
            Self::DependencyInstall { .. } => ERR_DEPENDENCY_INSTALL,
            Self::InvalidCommand(_) => ERR_INVALID_COMMAND,
            Self::Persistence(_) => ERR_INFRA,
        }
    }
}

pub type Result<T> = std::result::Result<T, SupervisorError>;

fn fmt_code(code: Option<i32>) -> String {
    code.map_or_else(|| "unknown".to_string(), |c| c.to_string())
}
