use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("template '{0}' not found")]
    TemplateNotFound(String),

    #[error("run '{0}' not found")]
    RunNotFound(String),

    #[error("run '{0}' cannot go from {1} to {2}")]
    IllegalTransition(String, String, String),

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("config file not found at {0}")]
    ConfigNotFound(PathBuf),

    #[error("port space exhausted above {0}")]
    PortsExhausted(u16),

    #[error("supervisor operation failed for '{name}': {reason}")]
    Supervisor { name: String, reason: String },

    #[error("process '{0}' not found")]
    ProcessNotFound(String),

    #[error("services for run '{0}' not ready within {1} seconds")]
    ReadinessTimeout(String, u64),

    #[error("scheduler error: {0}")]
    Scheduler(String),

    #[error("sync failed for run '{run_id}': {reason}")]
    Sync { run_id: String, reason: String },

    #[error("state persistence failed: {0}")]
    State(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;
