use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex as StdMutex;

use tokio::sync::broadcast;

use crate::error::{OrchestratorError, Result};

use super::supervisor::{
    ProcessSnapshot, ProcessSpec, ProcessState, ProcessSupervisor, StreamKind, SupervisorEvent,
    EVENT_CHANNEL_CAPACITY,
};

struct FakeProcess {
    spec: ProcessSpec,
    state: ProcessState,
    pid: u32,
}

/// Deterministic in-memory supervisor backend. Processes come online
/// immediately (unless scripted otherwise) and exits and log lines are
/// injected by the test.
pub struct FakeSupervisor {
    table: StdMutex<HashMap<String, FakeProcess>>,
    events: broadcast::Sender<SupervisorEvent>,
    next_pid: AtomicU32,
    /// Names (exact) that refuse to start.
    fail_to_start: StdMutex<HashSet<String>>,
    /// Names that start but stay `Launching` instead of coming online.
    hold_at_launching: StdMutex<HashSet<String>>,
}

impl FakeSupervisor {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            table: StdMutex::new(HashMap::new()),
            events,
            next_pid: AtomicU32::new(1000),
            fail_to_start: StdMutex::new(HashSet::new()),
            hold_at_launching: StdMutex::new(HashSet::new()),
        }
    }

    pub fn fail_next_start_of(&self, name: impl Into<String>) {
        self.fail_to_start.lock().unwrap().insert(name.into());
    }

    pub fn hold_at_launching(&self, name: impl Into<String>) {
        self.hold_at_launching.lock().unwrap().insert(name.into());
    }

    /// Flip a held process online, as if it finished its startup.
    pub fn mark_online(&self, name: &str) {
        let mut table = self.table.lock().unwrap();
        if let Some(p) = table.get_mut(name) {
            p.state = ProcessState::Online;
        }
    }

    /// Simulate the process exiting with the given code.
    pub fn simulate_exit(&self, name: &str, code: i32) {
        let mut table = self.table.lock().unwrap();
        if let Some(p) = table.get_mut(name) {
            p.state = if code == 0 {
                ProcessState::Stopped
            } else {
                ProcessState::Errored
            };
        }
        drop(table);
        let _ = self.events.send(SupervisorEvent::Exit {
            name: name.to_string(),
            code: Some(code),
        });
    }

    /// Inject a stdout line as if the process had printed it.
    pub fn inject_log(&self, name: &str, line: impl Into<String>) {
        let _ = self.events.send(SupervisorEvent::Log {
            name: name.to_string(),
            stream: StreamKind::Stdout,
            line: line.into(),
        });
    }

    pub fn tracked_names(&self) -> Vec<String> {
        self.table.lock().unwrap().keys().cloned().collect()
    }

    pub fn online_count(&self) -> usize {
        self.table
            .lock()
            .unwrap()
            .values()
            .filter(|p| p.state == ProcessState::Online)
            .count()
    }

    fn snapshots_of(process: &FakeProcess) -> Vec<ProcessSnapshot> {
        (0..process.spec.instances.max(1))
            .map(|index| ProcessSnapshot {
                name: process.spec.name.clone(),
                instance: index,
                state: process.state,
                pid: if matches!(process.state, ProcessState::Online | ProcessState::Launching) {
                    Some(process.pid + index)
                } else {
                    None
                },
                cpu_percent: 0.0,
                rss_kb: 0,
            })
            .collect()
    }
}

impl Default for FakeSupervisor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl ProcessSupervisor for FakeSupervisor {
    async fn start(&self, spec: ProcessSpec) -> Result<()> {
        if self.fail_to_start.lock().unwrap().remove(&spec.name) {
            return Err(OrchestratorError::Supervisor {
                name: spec.name,
                reason: "scripted start failure".into(),
            });
        }
        let held = self.hold_at_launching.lock().unwrap().contains(&spec.name);
        let pid = self
            .next_pid
            .fetch_add(spec.instances.max(1), Ordering::Relaxed);
        let name = spec.name.clone();
        let mut table = self.table.lock().unwrap();
        if table.contains_key(&name) {
            return Err(OrchestratorError::Supervisor {
                name,
                reason: "already tracked; delete it first".into(),
            });
        }
        table.insert(
            name.clone(),
            FakeProcess {
                spec,
                state: if held {
                    ProcessState::Launching
                } else {
                    ProcessState::Online
                },
                pid,
            },
        );
        drop(table);
        let _ = self.events.send(SupervisorEvent::Start { name });
        Ok(())
    }

    async fn stop(&self, name: &str) -> Result<()> {
        let mut table = self.table.lock().unwrap();
        let process = table
            .get_mut(name)
            .ok_or_else(|| OrchestratorError::ProcessNotFound(name.to_string()))?;
        process.state = ProcessState::Stopped;
        drop(table);
        let _ = self.events.send(SupervisorEvent::Exit {
            name: name.to_string(),
            code: None,
        });
        Ok(())
    }

    async fn delete(&self, name: &str) -> Result<()> {
        self.table
            .lock()
            .unwrap()
            .remove(name)
            .ok_or_else(|| OrchestratorError::ProcessNotFound(name.to_string()))?;
        Ok(())
    }

    async fn list(&self) -> Result<Vec<ProcessSnapshot>> {
        let table = self.table.lock().unwrap();
        Ok(table.values().flat_map(Self::snapshots_of).collect())
    }

    async fn describe(&self, name: &str) -> Result<Vec<ProcessSnapshot>> {
        let table = self.table.lock().unwrap();
        Ok(table.get(name).map(Self::snapshots_of).unwrap_or_default())
    }

    fn events(&self) -> broadcast::Receiver<SupervisorEvent> {
        self.events.subscribe()
    }
}
