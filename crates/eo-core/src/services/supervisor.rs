use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::error::Result;
use crate::models::ExecMode;

/// Capacity of the supervisor event channel. Consumers that fall behind lag
/// and drop packets; the producer never blocks.
pub const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Everything needed to spawn and supervise one (possibly replicated)
/// process.
#[derive(Debug, Clone)]
pub struct ProcessSpec {
    /// Full process name including the run-id suffix.
    pub name: String,
    /// Script or executable path.
    pub script: PathBuf,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub env: Vec<(String, String)>,
    /// Interpreter prepended to the script, when the script is not directly
    /// executable (`node`, `python3`).
    pub interpreter: Option<String>,
    pub instances: u32,
    pub exec_mode: ExecMode,
    /// RSS ceiling in MB; exceeding it restarts the instance.
    pub max_memory_restart_mb: Option<u64>,
    /// 5-field cron expression for periodic restarts.
    pub restart_cron: Option<String>,
    pub out_log: Option<PathBuf>,
    pub err_log: Option<PathBuf>,
    pub combined_log: Option<PathBuf>,
    /// Restart the process when it exits on its own.
    pub autorestart: bool,
}

impl ProcessSpec {
    pub fn new(name: impl Into<String>, script: impl Into<PathBuf>, cwd: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            script: script.into(),
            args: Vec::new(),
            cwd: cwd.into(),
            env: Vec::new(),
            interpreter: None,
            instances: 1,
            exec_mode: ExecMode::Fork,
            max_memory_restart_mb: None,
            restart_cron: None,
            out_log: None,
            err_log: None,
            combined_log: None,
            autorestart: false,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum ProcessState {
    Online,
    Stopped,
    Errored,
    Launching,
    Stopping,
}

/// Snapshot of one live (or tracked) process instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessSnapshot {
    pub name: String,
    pub instance: u32,
    pub state: ProcessState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(default)]
    pub cpu_percent: f32,
    #[serde(default)]
    pub rss_kb: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Stdout,
    Stderr,
}

/// The three event categories multiplexed over one stream: log lines,
/// structured child messages, and lifecycle events.
#[derive(Debug, Clone)]
pub enum SupervisorEvent {
    Log {
        name: String,
        stream: StreamKind,
        line: String,
    },
    Message {
        name: String,
        payload: serde_json::Value,
    },
    Start {
        name: String,
    },
    Restart {
        name: String,
    },
    Exit {
        name: String,
        code: Option<i32>,
    },
}

impl SupervisorEvent {
    pub fn process_name(&self) -> &str {
        match self {
            SupervisorEvent::Log { name, .. }
            | SupervisorEvent::Message { name, .. }
            | SupervisorEvent::Start { name }
            | SupervisorEvent::Restart { name }
            | SupervisorEvent::Exit { name, .. } => name,
        }
    }
}

/// Uniform abstraction over the process backend. `start`/`stop`/`delete`
/// are serialized internally; the event stream is non-blocking fan-out.
#[async_trait]
pub trait ProcessSupervisor: Send + Sync {
    /// Spawn all instances of the spec and begin tracking them.
    async fn start(&self, spec: ProcessSpec) -> Result<()>;

    /// Stop all instances with a kill-grace; the process stays tracked.
    async fn stop(&self, name: &str) -> Result<()>;

    /// Remove a stopped process from tracking.
    async fn delete(&self, name: &str) -> Result<()>;

    /// Snapshot of every tracked process instance.
    async fn list(&self) -> Result<Vec<ProcessSnapshot>>;

    /// Snapshots of one process's instances; empty when unknown.
    async fn describe(&self, name: &str) -> Result<Vec<ProcessSnapshot>>;

    /// Subscribe to the shared event stream.
    fn events(&self) -> broadcast::Receiver<SupervisorEvent>;
}
