use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::allocation::PortAllocation;
use super::template::ServiceKind;

/// Separator between a service name stem and the run id suffix.
pub const SERVICE_NAME_SEPARATOR: char = '_';
/// Fixed prefix of the compute process name; the run id follows after `-`.
pub const COMPUTE_NAME_PREFIX: &str = "kromosynth-run";

/// Name of the compute process for a run.
pub fn compute_process_name(run_id: &str) -> String {
    format!("{COMPUTE_NAME_PREFIX}-{run_id}")
}

/// Extract the run id from a process name. Service names carry it after the
/// final `_`, the compute process after the final `-`. Run ids are ULIDs and
/// contain neither separator, so the final-separator split is unambiguous.
pub fn run_id_of_process(name: &str) -> Option<&str> {
    if let Some(rest) = name.strip_prefix(COMPUTE_NAME_PREFIX) {
        return rest.strip_prefix('-');
    }
    name.rsplit_once(SERVICE_NAME_SEPARATOR).map(|(_, id)| id)
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum RunStatus {
    Starting,
    Running,
    Paused,
    Stopped,
    Terminated,
    Failed,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, RunStatus::Stopped | RunStatus::Terminated | RunStatus::Failed)
    }

    /// The legal transition graph. `Starting` may also unwind to absent,
    /// which is a record deletion rather than a transition.
    pub fn can_transition_to(self, next: RunStatus) -> bool {
        use RunStatus::*;
        match (self, next) {
            (Starting, Running) => true,
            (Running, Stopped | Terminated | Failed | Paused) => true,
            (Paused, Running | Stopped) => true,
            // Resumption out of a terminal state re-enters the machine.
            (Stopped | Failed, Running) => true,
            _ => false,
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunStatus::Starting => "starting",
            RunStatus::Running => "running",
            RunStatus::Paused => "paused",
            RunStatus::Stopped => "stopped",
            RunStatus::Terminated => "terminated",
            RunStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Monotonic progress vector extracted from the compute process logs.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RunProgress {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generation: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_generations: Option<u64>,
    /// Archive coverage in `[0, 1]`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub coverage: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub qd_score: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub best_fitness: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completion_percent: Option<f64>,
}

/// Per-service start outcome inside a run's service cluster.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum ServiceStartStatus {
    Started,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceStatusEntry {
    pub name: String,
    pub kind: ServiceKind,
    pub status: ServiceStartStatus,
}

/// The concrete service cluster brought up for a run: its port interval,
/// per-service statuses, and the WebSocket endpoints handed to the compute
/// process.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceInfo {
    pub allocation: PortAllocation,
    #[serde(default)]
    pub services: Vec<ServiceStatusEntry>,
    #[serde(default)]
    pub service_urls: HashMap<ServiceKind, Vec<String>>,
}

/// Live compute-process stats merged into run snapshots; never persisted.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProcessStats {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(default)]
    pub cpu_percent: f32,
    #[serde(default)]
    pub rss_kb: u64,
}

/// The central entity: one attempt at a long-running evolutionary search.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Run {
    pub id: String,
    pub template_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ecosystem_variant: Option<String>,
    pub status: RunStatus,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub paused_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resumed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stopped_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub pause_count: u32,
    #[serde(default)]
    pub total_active_millis: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_slice_started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub auto_scheduled: bool,
    /// Set only by the scheduler pause path; a user-initiated stop of a
    /// paused run clears it so the scheduler never resumes that run.
    #[serde(default)]
    pub paused_by_scheduler: bool,
    pub working_dir: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_config_path: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hyperparameters_path: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wrapper_config_path: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service_info: Option<ServiceInfo>,
    #[serde(default)]
    pub progress: RunProgress,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    /// Live process stats; refreshed from the supervisor, not persisted state.
    #[serde(default)]
    pub process_stats: ProcessStats,
}

impl Run {
    pub fn new(id: String, template_name: String, ecosystem_variant: Option<String>, working_dir: PathBuf) -> Self {
        Self {
            id,
            template_name,
            ecosystem_variant,
            status: RunStatus::Starting,
            created_at: Utc::now(),
            started_at: None,
            paused_at: None,
            resumed_at: None,
            stopped_at: None,
            ended_at: None,
            pause_count: 0,
            total_active_millis: 0,
            time_slice_started_at: None,
            auto_scheduled: false,
            paused_by_scheduler: false,
            working_dir,
            run_config_path: None,
            hyperparameters_path: None,
            wrapper_config_path: None,
            service_info: None,
            progress: RunProgress::default(),
            exit_code: None,
            process_stats: ProcessStats::default(),
        }
    }

    pub fn compute_process_name(&self) -> String {
        compute_process_name(&self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transition_graph_matches_lifecycle() {
        use RunStatus::*;
        assert!(Starting.can_transition_to(Running));
        assert!(Running.can_transition_to(Paused));
        assert!(Running.can_transition_to(Terminated));
        assert!(Running.can_transition_to(Failed));
        assert!(Running.can_transition_to(Stopped));
        assert!(Paused.can_transition_to(Running));
        assert!(Paused.can_transition_to(Stopped));

        assert!(!Paused.can_transition_to(Terminated));
        assert!(!Terminated.can_transition_to(Running));
        assert!(!Starting.can_transition_to(Paused));
        assert!(!Stopped.can_transition_to(Paused));
    }

    #[test]
    fn terminal_statuses() {
        assert!(RunStatus::Stopped.is_terminal());
        assert!(RunStatus::Terminated.is_terminal());
        assert!(RunStatus::Failed.is_terminal());
        assert!(!RunStatus::Paused.is_terminal());
        assert!(!RunStatus::Running.is_terminal());
    }

    #[test]
    fn run_id_extraction_from_process_names() {
        let id = "01J0QDX2N8K9W5R7T3B1ZYXWVU";
        assert_eq!(
            run_id_of_process(&format!("kromosynth-gRPC-variation_{id}")),
            Some(id)
        );
        assert_eq!(run_id_of_process(&compute_process_name(id)), Some(id));
        assert_eq!(run_id_of_process("no-separator"), None);
    }

    #[test]
    fn run_serializes_camel_case() {
        let run = Run::new(
            "01J0QDX2N8K9W5R7T3B1ZYXWVU".into(),
            "template-a".into(),
            Some("default".into()),
            PathBuf::from("/working/x"),
        );
        let json = serde_json::to_string(&run).unwrap();
        assert!(json.contains("\"templateName\""));
        assert!(json.contains("\"totalActiveMillis\""));
        assert!(json.contains("\"workingDir\""));
        assert!(!json.contains("\"template_name\""));
    }
}
