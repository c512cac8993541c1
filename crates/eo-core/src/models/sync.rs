use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Most recent sync errors kept per run.
pub const SYNC_ERROR_RING_CAPACITY: usize = 20;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncErrorRecord {
    pub at: DateTime<Utc>,
    pub message: String,
}

/// Per-run sync state, persisted across orchestrator restarts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncState {
    pub run_id: String,
    /// The run's working directory, kept here so manual triggers keep
    /// working after an orchestrator restart.
    #[serde(default)]
    pub working_dir: std::path::PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_db_sync: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_file_sync: Option<DateTime<Utc>>,
    #[serde(default)]
    pub cycles_completed: u64,
    #[serde(default)]
    pub files_uploaded: u64,
    #[serde(default)]
    pub db_files_synced: u64,
    #[serde(default)]
    pub consecutive_errors: u32,
    #[serde(default)]
    pub recent_errors: VecDeque<SyncErrorRecord>,
    /// Per-run overrides of the global enable flags.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub db_sync_enabled: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_sync_enabled: Option<bool>,
}

impl SyncState {
    pub fn new(run_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            working_dir: std::path::PathBuf::new(),
            last_db_sync: None,
            last_file_sync: None,
            cycles_completed: 0,
            files_uploaded: 0,
            db_files_synced: 0,
            consecutive_errors: 0,
            recent_errors: VecDeque::new(),
            db_sync_enabled: None,
            file_sync_enabled: None,
        }
    }

    pub fn record_error(&mut self, message: impl Into<String>) {
        if self.recent_errors.len() == SYNC_ERROR_RING_CAPACITY {
            self.recent_errors.pop_front();
        }
        self.recent_errors.push_back(SyncErrorRecord {
            at: Utc::now(),
            message: message.into(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_ring_is_bounded() {
        let mut state = SyncState::new("r1");
        for i in 0..50 {
            state.record_error(format!("error {i}"));
        }
        assert_eq!(state.recent_errors.len(), SYNC_ERROR_RING_CAPACITY);
        assert_eq!(state.recent_errors.back().unwrap().message, "error 49");
        assert_eq!(state.recent_errors.front().unwrap().message, "error 30");
    }
}
