use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;

use crate::models::RunProgress;

/// Events published to external adapters (control surface, daemon log).
///
/// Serialized with a kebab-case `event` tag so adapters see the wire names
/// (`run-started`, `time-slice-expired`, ...).
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum OrchestratorEvent {
    RunStarted {
        run_id: String,
        template_name: String,
    },
    RunStopped {
        run_id: String,
    },
    RunPaused {
        run_id: String,
    },
    RunResumed {
        run_id: String,
    },
    RunProgress {
        run_id: String,
        progress: RunProgress,
    },
    RunLog {
        run_id: String,
        process: String,
        line: String,
    },
    RunEnded {
        run_id: String,
        reason: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        exit_code: Option<i32>,
    },
    TimeSliceStarted {
        run_id: String,
        template_name: String,
    },
    TimeSliceEnding {
        run_id: String,
        expires_at: DateTime<Utc>,
    },
    TimeSliceExpired {
        run_id: String,
        template_name: String,
    },
    AutoRunStatusChange {
        enabled: bool,
        paused: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    TemplateConfigChange {
        template_name: String,
    },
    SyncStarted {
        run_id: String,
    },
    SyncCompleted {
        run_id: String,
        files_uploaded: u64,
        db_files_synced: u64,
    },
    SyncError {
        run_id: String,
        message: String,
    },
}

/// Bounded multi-consumer fan-out. The producer never blocks; a consumer
/// that falls behind the channel capacity lags and misses packets.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<OrchestratorEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn publish(&self, event: OrchestratorEvent) {
        // No receivers is fine; events are fire-and-forget.
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OrchestratorEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscriber_receives_published_events() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        bus.publish(OrchestratorEvent::RunStopped { run_id: "r1".into() });
        match rx.recv().await.unwrap() {
            OrchestratorEvent::RunStopped { run_id } => assert_eq!(run_id, "r1"),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn events_serialize_with_kebab_case_tags() {
        let json = serde_json::to_value(OrchestratorEvent::RunEnded {
            run_id: "r1".into(),
            reason: "terminated".into(),
            exit_code: Some(0),
        })
        .unwrap();
        assert_eq!(json["event"], "run-ended");
        assert_eq!(json["exit_code"], 0);

        let json = serde_json::to_value(OrchestratorEvent::TimeSliceExpired {
            run_id: "r1".into(),
            template_name: "t".into(),
        })
        .unwrap();
        assert_eq!(json["event"], "time-slice-expired");
    }

    #[tokio::test]
    async fn publish_without_subscribers_does_not_error() {
        let bus = EventBus::new(4);
        bus.publish(OrchestratorEvent::RunPaused { run_id: "r".into() });
    }
}
