use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::str::FromStr;
use std::sync::{Arc, Mutex as StdMutex};

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{broadcast, Mutex, Notify};
use tokio::time::Duration;
use tracing::{debug, warn};

use crate::error::{OrchestratorError, Result};

use super::supervisor::{
    ProcessSnapshot, ProcessSpec, ProcessState, ProcessSupervisor, StreamKind, SupervisorEvent,
    EVENT_CHANNEL_CAPACITY,
};

/// Lines starting with this prefix carry structured JSON packets from the
/// child and surface as `SupervisorEvent::Message` instead of `Log`.
const MESSAGE_PREFIX: &str = "@@";

/// How often instance RSS and CPU are sampled.
const RESOURCE_POLL: Duration = Duration::from_secs(15);

/// Grace period between the kill signal and giving up on the exit status.
const KILL_GRACE: Duration = Duration::from_secs(5);

/// Stagger between instance restarts when a periodic-restart schedule fires.
const CRON_RESTART_STAGGER: Duration = Duration::from_secs(2);

#[derive(Debug, Default)]
struct InstanceState {
    pid: Option<u32>,
    state: Option<ProcessState>,
    rss_kb: u64,
    cpu_percent: f32,
}

struct Instance {
    index: u32,
    shared: Arc<StdMutex<InstanceState>>,
    stop_notify: Arc<Notify>,
    restart_notify: Arc<Notify>,
    monitor: tokio::task::JoinHandle<()>,
}

struct Managed {
    spec: ProcessSpec,
    instances: Vec<Instance>,
    watchers: Vec<tokio::task::JoinHandle<()>>,
}

/// Real supervisor backend: spawns children with `tokio::process`, pipes
/// their output into per-run log files and the shared event stream, and
/// applies memory-ceiling and periodic restarts.
pub struct LocalSupervisor {
    processes: Arc<Mutex<HashMap<String, Managed>>>,
    events: broadcast::Sender<SupervisorEvent>,
}

impl LocalSupervisor {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            processes: Arc::new(Mutex::new(HashMap::new())),
            events,
        }
    }

    fn spawn_instance(
        spec: &ProcessSpec,
        index: u32,
        shared: Arc<StdMutex<InstanceState>>,
        stop_notify: Arc<Notify>,
        restart_notify: Arc<Notify>,
        events: broadcast::Sender<SupervisorEvent>,
    ) -> tokio::task::JoinHandle<()> {
        let spec = spec.clone();
        tokio::spawn(async move {
            let mut first_spawn = true;
            loop {
                let mut child = match spawn_child(&spec, index) {
                    Ok(child) => child,
                    Err(e) => {
                        warn!(name = %spec.name, index, error = %e, "spawn failed");
                        let mut st = shared.lock().unwrap();
                        st.state = Some(ProcessState::Errored);
                        st.pid = None;
                        return;
                    }
                };

                {
                    let mut st = shared.lock().unwrap();
                    st.pid = child.id();
                    st.state = Some(ProcessState::Online);
                }
                let _ = events.send(if first_spawn {
                    SupervisorEvent::Start {
                        name: spec.name.clone(),
                    }
                } else {
                    SupervisorEvent::Restart {
                        name: spec.name.clone(),
                    }
                });
                first_spawn = false;

                pump_output(&mut child, &spec, events.clone());

                enum Decision {
                    Exited(Option<i32>),
                    StopRequested,
                    RestartRequested,
                }

                let decision = tokio::select! {
                    status = child.wait() => {
                        Decision::Exited(status.ok().and_then(|s| s.code()))
                    }
                    _ = stop_notify.notified() => Decision::StopRequested,
                    _ = restart_notify.notified() => Decision::RestartRequested,
                };

                match decision {
                    Decision::Exited(code) => {
                        let errored = code != Some(0);
                        {
                            let mut st = shared.lock().unwrap();
                            st.pid = None;
                            st.state = Some(if errored {
                                ProcessState::Errored
                            } else {
                                ProcessState::Stopped
                            });
                        }
                        let _ = events.send(SupervisorEvent::Exit {
                            name: spec.name.clone(),
                            code,
                        });
                        if spec.autorestart && errored {
                            continue;
                        }
                        return;
                    }
                    Decision::StopRequested => {
                        {
                            let mut st = shared.lock().unwrap();
                            st.state = Some(ProcessState::Stopping);
                        }
                        let code = kill_with_grace(&mut child).await;
                        {
                            let mut st = shared.lock().unwrap();
                            st.pid = None;
                            st.state = Some(ProcessState::Stopped);
                        }
                        let _ = events.send(SupervisorEvent::Exit {
                            name: spec.name.clone(),
                            code,
                        });
                        return;
                    }
                    Decision::RestartRequested => {
                        kill_with_grace(&mut child).await;
                        debug!(name = %spec.name, index, "instance restarting");
                        continue;
                    }
                }
            }
        })
    }

    fn spawn_resource_watcher(
        name: String,
        instances: Vec<(Arc<StdMutex<InstanceState>>, Arc<Notify>)>,
        max_memory_restart_mb: Option<u64>,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut prev_ticks: HashMap<u32, u64> = HashMap::new();
            let mut tick = tokio::time::interval(RESOURCE_POLL);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tick.tick().await;
                for (shared, restart_notify) in &instances {
                    let pid = {
                        let st = shared.lock().unwrap();
                        match (st.pid, st.state) {
                            (Some(pid), Some(ProcessState::Online)) => pid,
                            _ => continue,
                        }
                    };
                    let rss_kb = read_proc_rss_kb(pid).unwrap_or(0);
                    let ticks = read_proc_cpu_ticks(pid).unwrap_or(0);
                    let cpu_percent = prev_ticks
                        .insert(pid, ticks)
                        .map(|prev| {
                            let delta = ticks.saturating_sub(prev) as f32;
                            // Kernel tick rate is 100 Hz on every supported target.
                            delta / 100.0 / RESOURCE_POLL.as_secs_f32() * 100.0
                        })
                        .unwrap_or(0.0);
                    {
                        let mut st = shared.lock().unwrap();
                        st.rss_kb = rss_kb;
                        st.cpu_percent = cpu_percent;
                    }
                    if let Some(limit_mb) = max_memory_restart_mb {
                        if rss_kb > limit_mb * 1024 {
                            warn!(name = %name, pid, rss_kb, limit_mb, "memory ceiling hit");
                            restart_notify.notify_one();
                        }
                    }
                }
            }
        })
    }

    fn spawn_cron_watcher(
        name: String,
        cron_expr: String,
        restarts: Vec<Arc<Notify>>,
    ) -> Option<tokio::task::JoinHandle<()>> {
        // The cron crate wants 6 fields; standard 5-field expressions get a
        // seconds field prepended.
        let normalized = if cron_expr.split_whitespace().count() == 5 {
            format!("0 {cron_expr}")
        } else {
            cron_expr.clone()
        };
        let schedule = match cron::Schedule::from_str(&normalized) {
            Ok(s) => s,
            Err(e) => {
                warn!(name = %name, cron = %cron_expr, error = %e, "invalid restart schedule");
                return None;
            }
        };
        Some(tokio::spawn(async move {
            loop {
                let Some(next) = schedule.upcoming(chrono::Utc).next() else {
                    return;
                };
                let wait = (next - chrono::Utc::now())
                    .to_std()
                    .unwrap_or(Duration::ZERO);
                tokio::time::sleep(wait).await;
                debug!(name = %name, "periodic restart firing");
                for notify in &restarts {
                    notify.notify_one();
                    tokio::time::sleep(CRON_RESTART_STAGGER).await;
                }
            }
        }))
    }
}

impl Default for LocalSupervisor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl ProcessSupervisor for LocalSupervisor {
    async fn start(&self, spec: ProcessSpec) -> Result<()> {
        let mut processes = self.processes.lock().await;
        if processes.contains_key(&spec.name) {
            return Err(OrchestratorError::Supervisor {
                name: spec.name,
                reason: "already tracked; delete it first".into(),
            });
        }

        let mut instances = Vec::with_capacity(spec.instances as usize);
        for index in 0..spec.instances.max(1) {
            let shared = Arc::new(StdMutex::new(InstanceState {
                state: Some(ProcessState::Launching),
                ..Default::default()
            }));
            let stop_notify = Arc::new(Notify::new());
            let restart_notify = Arc::new(Notify::new());
            let monitor = Self::spawn_instance(
                &spec,
                index,
                shared.clone(),
                stop_notify.clone(),
                restart_notify.clone(),
                self.events.clone(),
            );
            instances.push(Instance {
                index,
                shared,
                stop_notify,
                restart_notify,
                monitor,
            });
        }

        let mut watchers = Vec::new();
        watchers.push(Self::spawn_resource_watcher(
            spec.name.clone(),
            instances
                .iter()
                .map(|i| (i.shared.clone(), i.restart_notify.clone()))
                .collect(),
            spec.max_memory_restart_mb,
        ));
        if let Some(ref cron_expr) = spec.restart_cron {
            if let Some(handle) = Self::spawn_cron_watcher(
                spec.name.clone(),
                cron_expr.clone(),
                instances.iter().map(|i| i.restart_notify.clone()).collect(),
            ) {
                watchers.push(handle);
            }
        }

        processes.insert(
            spec.name.clone(),
            Managed {
                spec,
                instances,
                watchers,
            },
        );
        Ok(())
    }

    async fn stop(&self, name: &str) -> Result<()> {
        let processes = self.processes.lock().await;
        let managed = processes
            .get(name)
            .ok_or_else(|| OrchestratorError::ProcessNotFound(name.to_string()))?;
        for instance in &managed.instances {
            instance.stop_notify.notify_one();
        }
        Ok(())
    }

    async fn delete(&self, name: &str) -> Result<()> {
        let mut processes = self.processes.lock().await;
        let managed = processes
            .remove(name)
            .ok_or_else(|| OrchestratorError::ProcessNotFound(name.to_string()))?;
        for watcher in &managed.watchers {
            watcher.abort();
        }
        for instance in &managed.instances {
            instance.stop_notify.notify_one();
        }
        // Give the monitors a moment to deliver the kill before dropping
        // the handles.
        for instance in managed.instances {
            let _ = tokio::time::timeout(KILL_GRACE, instance.monitor).await;
        }
        Ok(())
    }

    async fn list(&self) -> Result<Vec<ProcessSnapshot>> {
        let processes = self.processes.lock().await;
        let mut snapshots = Vec::new();
        for managed in processes.values() {
            for instance in &managed.instances {
                snapshots.push(snapshot_of(&managed.spec.name, instance));
            }
        }
        Ok(snapshots)
    }

    async fn describe(&self, name: &str) -> Result<Vec<ProcessSnapshot>> {
        let processes = self.processes.lock().await;
        Ok(processes
            .get(name)
            .map(|managed| {
                managed
                    .instances
                    .iter()
                    .map(|i| snapshot_of(&managed.spec.name, i))
                    .collect()
            })
            .unwrap_or_default())
    }

    fn events(&self) -> broadcast::Receiver<SupervisorEvent> {
        self.events.subscribe()
    }
}

fn snapshot_of(name: &str, instance: &Instance) -> ProcessSnapshot {
    let st = instance.shared.lock().unwrap();
    ProcessSnapshot {
        name: name.to_string(),
        instance: instance.index,
        state: st.state.unwrap_or(ProcessState::Launching),
        pid: st.pid,
        cpu_percent: st.cpu_percent,
        rss_kb: st.rss_kb,
    }
}

fn spawn_child(spec: &ProcessSpec, index: u32) -> Result<Child> {
    let mut cmd = match spec.interpreter {
        Some(ref interpreter) => {
            let mut cmd = Command::new(interpreter);
            cmd.arg(&spec.script);
            cmd
        }
        None => Command::new(&spec.script),
    };
    for arg in &spec.args {
        cmd.arg(arg.replace("{instance}", &index.to_string()));
    }
    cmd.current_dir(&spec.cwd);
    for (key, value) in &spec.env {
        // Replicas listen on contiguous ports: PORT is offset per instance,
        // everything else passes through.
        if key == "PORT" {
            if let Ok(base) = value.parse::<u32>() {
                cmd.env(key, (base + index).to_string());
                continue;
            }
        }
        cmd.env(key, value);
    }
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    cmd.kill_on_drop(true);
    cmd.spawn().map_err(|e| OrchestratorError::Supervisor {
        name: spec.name.clone(),
        reason: format!("failed to spawn: {e}"),
    })
}

/// Attach line readers to the child's stdout/stderr, forwarding each line
/// to the log files and the event stream.
fn pump_output(child: &mut Child, spec: &ProcessSpec, events: broadcast::Sender<SupervisorEvent>) {
    if let Some(stdout) = child.stdout.take() {
        spawn_line_pump(
            stdout,
            StreamKind::Stdout,
            spec.name.clone(),
            spec.out_log.clone(),
            spec.combined_log.clone(),
            events.clone(),
        );
    }
    if let Some(stderr) = child.stderr.take() {
        spawn_line_pump(
            stderr,
            StreamKind::Stderr,
            spec.name.clone(),
            spec.err_log.clone(),
            spec.combined_log.clone(),
            events,
        );
    }
}

fn spawn_line_pump<R>(
    reader: R,
    stream: StreamKind,
    name: String,
    log_path: Option<std::path::PathBuf>,
    combined_path: Option<std::path::PathBuf>,
    events: broadcast::Sender<SupervisorEvent>,
) where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut log_file = match log_path {
            Some(path) => open_append(&path).await,
            None => None,
        };
        let mut combined_file = match combined_path {
            Some(path) => open_append(&path).await,
            None => None,
        };

        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if let Some(ref mut f) = log_file {
                let _ = f.write_all(format!("{line}\n").as_bytes()).await;
            }
            if let Some(ref mut f) = combined_file {
                let _ = f.write_all(format!("{line}\n").as_bytes()).await;
            }
            let event = match line.strip_prefix(MESSAGE_PREFIX) {
                Some(rest) => match serde_json::from_str(rest) {
                    Ok(payload) => SupervisorEvent::Message {
                        name: name.clone(),
                        payload,
                    },
                    Err(_) => SupervisorEvent::Log {
                        name: name.clone(),
                        stream,
                        line,
                    },
                },
                None => SupervisorEvent::Log {
                    name: name.clone(),
                    stream,
                    line,
                },
            };
            let _ = events.send(event);
        }
    });
}

async fn open_append(path: &Path) -> Option<tokio::fs::File> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await.ok();
    }
    tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .ok()
}

async fn kill_with_grace(child: &mut Child) -> Option<i32> {
    let _ = child.start_kill();
    match tokio::time::timeout(KILL_GRACE, child.wait()).await {
        Ok(Ok(status)) => status.code(),
        _ => None,
    }
}

#[cfg(target_os = "linux")]
fn read_proc_rss_kb(pid: u32) -> Option<u64> {
    let status = std::fs::read_to_string(format!("/proc/{pid}/status")).ok()?;
    status
        .lines()
        .find(|l| l.starts_with("VmRSS:"))
        .and_then(|l| l.split_whitespace().nth(1))
        .and_then(|v| v.parse().ok())
}

#[cfg(target_os = "linux")]
fn read_proc_cpu_ticks(pid: u32) -> Option<u64> {
    let stat = std::fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
    // "pid (name) state ...": the name may contain spaces, so skip past
    // the closing paren before splitting fields.
    let rest = stat.get(stat.rfind(')')? + 2..)?;
    let fields: Vec<&str> = rest.split_whitespace().collect();
    // Fields 11 and 12 after the comm field are utime and stime.
    let utime: u64 = fields.get(11)?.parse().ok()?;
    let stime: u64 = fields.get(12)?.parse().ok()?;
    Some(utime + stime)
}

#[cfg(not(target_os = "linux"))]
fn read_proc_rss_kb(_pid: u32) -> Option<u64> {
    None
}

#[cfg(not(target_os = "linux"))]
fn read_proc_cpu_ticks(_pid: u32) -> Option<u64> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::supervisor::ProcessSupervisor;

    fn shell_spec(name: &str, script_body: &str, dir: &Path) -> ProcessSpec {
        let script = dir.join(format!("{name}.sh"));
        std::fs::write(&script, format!("#!/bin/sh\n{script_body}\n")).unwrap();
        let mut spec = ProcessSpec::new(name, script, dir);
        spec.interpreter = Some("sh".into());
        spec
    }

    #[tokio::test]
    async fn start_list_and_exit_event() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = LocalSupervisor::new();
        let mut events = supervisor.events();

        let spec = shell_spec("echoer_01J0", "echo hello; exit 0", dir.path());
        supervisor.start(spec).await.unwrap();

        let mut saw_start = false;
        let mut saw_log = false;
        let mut exit_code = None;
        for _ in 0..10 {
            match tokio::time::timeout(Duration::from_secs(5), events.recv()).await {
                Ok(Ok(SupervisorEvent::Start { name })) if name == "echoer_01J0" => {
                    saw_start = true;
                }
                Ok(Ok(SupervisorEvent::Log { line, .. })) if line == "hello" => {
                    saw_log = true;
                }
                Ok(Ok(SupervisorEvent::Exit { code, .. })) => {
                    exit_code = code;
                    break;
                }
                Ok(Ok(_)) => {}
                _ => break,
            }
        }
        assert!(saw_start);
        assert!(saw_log);
        assert_eq!(exit_code, Some(0));
    }

    #[tokio::test]
    async fn stop_kills_long_running_child() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = LocalSupervisor::new();

        let spec = shell_spec("sleeper_01J0", "sleep 60", dir.path());
        supervisor.start(spec).await.unwrap();

        // Wait for it to come online.
        for _ in 0..50 {
            let snaps = supervisor.describe("sleeper_01J0").await.unwrap();
            if snaps.iter().any(|s| s.state == ProcessState::Online) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        supervisor.stop("sleeper_01J0").await.unwrap();
        for _ in 0..50 {
            let snaps = supervisor.describe("sleeper_01J0").await.unwrap();
            if snaps.iter().all(|s| s.state == ProcessState::Stopped) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        panic!("child did not stop");
    }

    #[tokio::test]
    async fn duplicate_start_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = LocalSupervisor::new();
        let spec = shell_spec("dup_01J0", "sleep 10", dir.path());
        supervisor.start(spec.clone()).await.unwrap();
        assert!(supervisor.start(spec).await.is_err());
        supervisor.delete("dup_01J0").await.unwrap();
    }

    #[tokio::test]
    async fn message_prefix_lines_become_structured_packets() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = LocalSupervisor::new();
        let mut events = supervisor.events();

        let spec = shell_spec(
            "msg_01J0",
            r#"echo '@@{"kind":"checkpoint","generation":5}'"#,
            dir.path(),
        );
        supervisor.start(spec).await.unwrap();

        for _ in 0..10 {
            match tokio::time::timeout(Duration::from_secs(5), events.recv()).await {
                Ok(Ok(SupervisorEvent::Message { payload, .. })) => {
                    assert_eq!(payload["generation"], 5);
                    return;
                }
                Ok(Ok(_)) => {}
                _ => break,
            }
        }
        panic!("no message packet received");
    }
}
