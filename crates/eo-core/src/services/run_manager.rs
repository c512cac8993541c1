use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::error::{OrchestratorError, Result};
use crate::models::{
    compute_process_name, run_id_of_process, OrchestratorConfig, Run, RunOptions, RunStatus,
    Template, COMPUTE_NAME_PREFIX,
};

use super::events::{EventBus, OrchestratorEvent};
use super::progress;
use super::run_store::RunStateStore;
use super::service_manager::ServiceDependencyManager;
use super::supervisor::{ProcessSpec, ProcessState, ProcessSupervisor, SupervisorEvent};
use super::sync::SyncManager;
use super::workdir;

/// Variant looked up when a start request names none.
const DEFAULT_VARIANT: &str = "default";

/// Progress is persisted at most this often to bound write amplification.
const PROGRESS_PERSIST_INTERVAL: tokio::time::Duration = tokio::time::Duration::from_secs(30);

/// Owns the run records and their lifecycle state machine. All mutations of
/// a run flow through here; operations on the same run are serialized with a
/// per-run lock, distinct runs proceed independently.
pub struct RunManager {
    supervisor: Arc<dyn ProcessSupervisor>,
    services: Arc<ServiceDependencyManager>,
    store: Arc<RunStateStore>,
    sync: Arc<SyncManager>,
    events: EventBus,
    config: OrchestratorConfig,
    templates: RwLock<HashMap<String, Template>>,
    runs: RwLock<HashMap<String, Run>>,
    run_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    progress_persisted_at: Mutex<HashMap<String, Instant>>,
}

impl RunManager {
    pub fn new(
        supervisor: Arc<dyn ProcessSupervisor>,
        services: Arc<ServiceDependencyManager>,
        store: Arc<RunStateStore>,
        sync: Arc<SyncManager>,
        events: EventBus,
        config: OrchestratorConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            supervisor,
            services,
            store,
            sync,
            events,
            config,
            templates: RwLock::new(HashMap::new()),
            runs: RwLock::new(HashMap::new()),
            run_locks: Mutex::new(HashMap::new()),
            progress_persisted_at: Mutex::new(HashMap::new()),
        })
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub async fn register_template(&self, template: Template) {
        let name = template.name.clone();
        self.templates.write().await.insert(name.clone(), template);
        self.events
            .publish(OrchestratorEvent::TemplateConfigChange {
                template_name: name,
            });
    }

    pub async fn has_template(&self, name: &str) -> bool {
        self.templates.read().await.contains_key(name)
    }

    pub async fn template_names(&self) -> Vec<String> {
        self.templates.read().await.keys().cloned().collect()
    }

    async fn lock_for(&self, run_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.run_locks.lock().await;
        locks
            .entry(run_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Subscribe to the supervisor's event stream and feed progress parsing,
    /// log re-publication, and exit classification.
    pub fn spawn_event_pump(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let manager = Arc::clone(self);
        let mut events = self.supervisor.events();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => manager.handle_supervisor_event(event).await,
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "event pump lagged; log packets dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        })
    }

    async fn handle_supervisor_event(&self, event: SupervisorEvent) {
        match event {
            SupervisorEvent::Log { name, line, .. } => {
                let Some(run_id) = run_id_of_process(&name).map(str::to_string) else {
                    return;
                };
                if !self.runs.read().await.contains_key(&run_id) {
                    return;
                }
                self.events.publish(OrchestratorEvent::RunLog {
                    run_id: run_id.clone(),
                    process: name.clone(),
                    line: line.clone(),
                });
                if name == compute_process_name(&run_id) {
                    self.extract_progress(&run_id, &line).await;
                }
            }
            SupervisorEvent::Exit { name, code } => {
                if let Some(run_id) = name
                    .strip_prefix(COMPUTE_NAME_PREFIX)
                    .and_then(|rest| rest.strip_prefix('-'))
                {
                    self.handle_compute_exit(run_id.to_string(), code).await;
                }
            }
            SupervisorEvent::Message { .. }
            | SupervisorEvent::Start { .. }
            | SupervisorEvent::Restart { .. } => {}
        }
    }

    async fn extract_progress(&self, run_id: &str, line: &str) {
        let Some(delta) = progress::parse(line) else {
            return;
        };
        let (changed, snapshot) = {
            let mut runs = self.runs.write().await;
            let Some(run) = runs.get_mut(run_id) else {
                return;
            };
            if run.status != RunStatus::Running {
                return;
            }
            let changed = progress::apply(&mut run.progress, &delta);
            (changed, run.progress.clone())
        };
        if !changed {
            return;
        }
        self.events.publish(OrchestratorEvent::RunProgress {
            run_id: run_id.to_string(),
            progress: snapshot,
        });

        // Throttled persistence: at most one progress write per interval.
        let should_persist = {
            let mut persisted = self.progress_persisted_at.lock().await;
            match persisted.get(run_id) {
                Some(last) if last.elapsed() < PROGRESS_PERSIST_INTERVAL => false,
                _ => {
                    persisted.insert(run_id.to_string(), Instant::now());
                    true
                }
            }
        };
        if should_persist {
            if let Err(e) = self.persist().await {
                warn!(run_id, error = %e, "progress persist failed");
            }
        }
    }

    /// Classify the compute process exit. Exit code 0 terminates the run,
    /// anything else fails it; exits of runs no longer `running` (paused by
    /// the scheduler, or already stopped) are ignored.
    async fn handle_compute_exit(&self, run_id: String, code: Option<i32>) {
        let lock = self.lock_for(&run_id).await;
        let _guard = lock.lock().await;

        {
            let runs = self.runs.read().await;
            match runs.get(&run_id) {
                Some(run) if run.status == RunStatus::Running => {}
                _ => return,
            }
        }

        let (next, reason) = if code == Some(0) {
            (RunStatus::Terminated, "terminated")
        } else {
            (RunStatus::Failed, "failed")
        };
        info!(run_id, reason, ?code, "compute process exited");

        if let Err(e) = self.services.stop_services_for_run(&run_id).await {
            warn!(run_id, error = %e, "service teardown after exit failed");
        }
        let _ = self.supervisor.delete(&compute_process_name(&run_id)).await;

        {
            let mut runs = self.runs.write().await;
            if let Some(run) = runs.get_mut(&run_id) {
                let now = Utc::now();
                if let Some(slice_start) = run.time_slice_started_at.take() {
                    run.total_active_millis += (now - slice_start).num_milliseconds();
                }
                run.status = next;
                run.ended_at = Some(now);
                run.exit_code = code;
                run.service_info = None;
                run.process_stats = Default::default();
            }
        }
        if let Err(e) = self.persist().await {
            warn!(run_id, error = %e, "persist after exit failed");
        }

        // The final sync attempt completes before run-ended goes out.
        if let Err(e) = self.sync.trigger(&run_id).await {
            debug!(run_id, error = %e, "final sync after exit failed");
        }
        self.sync.unregister_run(&run_id).await;

        self.events.publish(OrchestratorEvent::RunEnded {
            run_id,
            reason: reason.to_string(),
            exit_code: code,
        });
    }

    /// Start a fresh run of a template. Returns the new run id once services
    /// are online and the compute process is spawned.
    pub async fn start_run(&self, template_name: &str, request: &RunOptions) -> Result<String> {
        let options = RunOptions::layered(&self.config.global_defaults_path(), request);
        let template = self
            .templates
            .read()
            .await
            .get(template_name)
            .cloned()
            .ok_or_else(|| OrchestratorError::TemplateNotFound(template_name.to_string()))?;

        let run_id = Ulid::new().to_string();
        let lock = self.lock_for(&run_id).await;
        let _guard = lock.lock().await;

        let working_dir = self.config.run_working_dir(&run_id);
        let mut run = Run::new(
            run_id.clone(),
            template_name.to_string(),
            options.ecosystem_variant.clone(),
            working_dir,
        );
        run.auto_scheduled = options.auto_scheduled.unwrap_or(false);
        self.runs.write().await.insert(run_id.clone(), run);

        if let Err(e) = self.bring_up(&run_id, &template, &options, true).await {
            // Starting unwinds to absent: the record disappears.
            self.runs.write().await.remove(&run_id);
            return Err(e);
        }

        if let Err(e) = self.persist().await {
            warn!(run_id, error = %e, "persist after start failed");
        }
        self.events.publish(OrchestratorEvent::RunStarted {
            run_id: run_id.clone(),
            template_name: template_name.to_string(),
        });

        let variant = options.ecosystem_variant.clone();
        let sync = Arc::clone(&self.sync);
        let template_name = template_name.to_string();
        let sync_dir = self.config.run_working_dir(&run_id);
        let sync_run_id = run_id.clone();
        // Sync registration never blocks the start path.
        tokio::spawn(async move {
            sync.register_run(&sync_run_id, &template_name, variant.as_deref(), &sync_dir)
                .await;
        });

        Ok(run_id)
    }

    /// Services up, working configs written, compute spawned. Shared by
    /// start and resume; the caller holds the run lock.
    async fn bring_up(
        &self,
        run_id: &str,
        template: &Template,
        options: &RunOptions,
        fresh_start: bool,
    ) -> Result<()> {
        let variant_name = options
            .ecosystem_variant
            .as_deref()
            .unwrap_or(DEFAULT_VARIANT);
        let variant = template.variant(variant_name);

        let started = self
            .services
            .start_services_for_run(run_id, &template.run_config, variant)
            .await?;

        let working_dir = self.config.run_working_dir(run_id);
        let paths = match workdir::write_working_configs(
            &working_dir,
            run_id,
            &template.name,
            &started.injected_config,
            &template.hyperparameters,
        )
        .await
        {
            Ok(paths) => paths,
            Err(e) => {
                let _ = self.services.stop_services_for_run(run_id).await;
                return Err(e);
            }
        };

        // A paused run may still be tracked from its previous life.
        let compute_name = compute_process_name(run_id);
        let _ = self.supervisor.delete(&compute_name).await;

        let mut spec = ProcessSpec::new(
            compute_name,
            self.config.cli_script_path.clone(),
            working_dir,
        );
        spec.interpreter = Some(self.config.node_interpreter.clone());
        spec.args = vec![
            "evolution-runs".into(),
            "--evolution-runs-config-json-file".into(),
            paths.wrapper.to_string_lossy().into_owned(),
        ];
        spec.autorestart = false;
        spec.max_memory_restart_mb = options.compute_max_memory_mb;
        spec.out_log = Some(self.config.logs_root.join(format!("{run_id}.out.log")));
        spec.err_log = Some(self.config.logs_root.join(format!("{run_id}.err.log")));
        spec.combined_log = Some(self.config.logs_root.join(format!("{run_id}.combined.log")));

        if let Err(e) = self.supervisor.start(spec).await {
            let _ = self.services.stop_services_for_run(run_id).await;
            return Err(e);
        }

        let total_generations = workdir::total_generations_from_disk(&paths.run_config).await;

        let mut runs = self.runs.write().await;
        let run = runs
            .get_mut(run_id)
            .ok_or_else(|| OrchestratorError::RunNotFound(run_id.to_string()))?;
        let now = Utc::now();
        run.status = RunStatus::Running;
        if fresh_start {
            run.started_at = Some(now);
        } else {
            run.resumed_at = Some(now);
        }
        run.time_slice_started_at = Some(now);
        run.paused_by_scheduler = false;
        run.service_info = Some(started.info);
        run.run_config_path = Some(paths.run_config);
        run.hyperparameters_path = Some(paths.hyperparameters);
        run.wrapper_config_path = Some(paths.wrapper);
        run.progress.total_generations = total_generations;
        Ok(())
    }

    /// Stop a run for good: compute and services down, final sync, record
    /// kept with status `stopped`.
    pub async fn stop_run(&self, run_id: &str) -> Result<()> {
        let lock = self.lock_for(run_id).await;
        let _guard = lock.lock().await;

        {
            let runs = self.runs.read().await;
            let run = runs
                .get(run_id)
                .ok_or_else(|| OrchestratorError::RunNotFound(run_id.to_string()))?;
            if !run.status.can_transition_to(RunStatus::Stopped) {
                return Err(OrchestratorError::IllegalTransition(
                    run_id.to_string(),
                    run.status.to_string(),
                    RunStatus::Stopped.to_string(),
                ));
            }
        }

        {
            let mut runs = self.runs.write().await;
            if let Some(run) = runs.get_mut(run_id) {
                let now = Utc::now();
                if let Some(slice_start) = run.time_slice_started_at.take() {
                    run.total_active_millis += (now - slice_start).num_milliseconds();
                }
                run.status = RunStatus::Stopped;
                run.stopped_at = Some(now);
                // A user stop must never leave the run eligible for
                // scheduler resumption.
                run.paused_by_scheduler = false;
                run.service_info = None;
                run.process_stats = Default::default();
            }
        }
        if let Err(e) = self.persist().await {
            warn!(run_id, error = %e, "persist after stop failed");
        }

        let compute_name = compute_process_name(run_id);
        if let Err(e) = self.supervisor.stop(&compute_name).await {
            debug!(run_id, error = %e, "compute stop failed (may not be running)");
        }
        let _ = self.supervisor.delete(&compute_name).await;
        if let Err(e) = self.services.stop_services_for_run(run_id).await {
            warn!(run_id, error = %e, "service teardown failed");
        }

        if self.config.sync.sync_on_stop {
            if let Err(e) = self.sync.trigger(run_id).await {
                debug!(run_id, error = %e, "final sync on stop failed");
            }
        }
        self.sync.unregister_run(run_id).await;

        self.events.publish(OrchestratorEvent::RunStopped {
            run_id: run_id.to_string(),
        });
        Ok(())
    }

    /// Pause a running run, releasing its processes and port interval. The
    /// compute process resumes from its on-disk checkpoint later.
    pub async fn pause_run(&self, run_id: &str) -> Result<()> {
        self.pause_run_inner(run_id, false).await
    }

    /// Scheduler pause path: identical, but marks the run as paused by the
    /// scheduler so slot filling may resume it.
    pub async fn pause_run_by_scheduler(&self, run_id: &str) -> Result<()> {
        self.pause_run_inner(run_id, true).await
    }

    async fn pause_run_inner(&self, run_id: &str, by_scheduler: bool) -> Result<()> {
        let lock = self.lock_for(run_id).await;
        let _guard = lock.lock().await;

        {
            let runs = self.runs.read().await;
            let run = runs
                .get(run_id)
                .ok_or_else(|| OrchestratorError::RunNotFound(run_id.to_string()))?;
            if run.status != RunStatus::Running {
                return Err(OrchestratorError::IllegalTransition(
                    run_id.to_string(),
                    run.status.to_string(),
                    RunStatus::Paused.to_string(),
                ));
            }
        }

        {
            let mut runs = self.runs.write().await;
            if let Some(run) = runs.get_mut(run_id) {
                let now = Utc::now();
                if let Some(slice_start) = run.time_slice_started_at.take() {
                    run.total_active_millis += (now - slice_start).num_milliseconds();
                }
                run.status = RunStatus::Paused;
                run.paused_at = Some(now);
                run.pause_count += 1;
                run.paused_by_scheduler = by_scheduler;
                run.service_info = None;
                run.process_stats = Default::default();
            }
        }
        // run-paused is emitted and state persisted before returning.
        if let Err(e) = self.persist().await {
            warn!(run_id, error = %e, "persist after pause failed");
        }

        let compute_name = compute_process_name(run_id);
        if let Err(e) = self.supervisor.stop(&compute_name).await {
            debug!(run_id, error = %e, "compute stop failed (may not be running)");
        }
        let _ = self.supervisor.delete(&compute_name).await;
        if let Err(e) = self.services.stop_services_for_run(run_id).await {
            warn!(run_id, error = %e, "service teardown failed");
        }

        self.events.publish(OrchestratorEvent::RunPaused {
            run_id: run_id.to_string(),
        });

        if self.config.sync.sync_on_pause {
            let sync = Arc::clone(&self.sync);
            let run_id = run_id.to_string();
            tokio::spawn(async move {
                let _ = sync.trigger(&run_id).await;
            });
        }
        Ok(())
    }

    /// Bring a paused (or stopped/failed) run back: fresh allocation, fresh
    /// endpoints written into the working config, compute re-spawned against
    /// the same working directory so it finds its checkpoint.
    pub async fn resume_run(&self, run_id: &str) -> Result<()> {
        let lock = self.lock_for(run_id).await;
        let _guard = lock.lock().await;

        let (template_name, variant) = {
            let runs = self.runs.read().await;
            let run = runs
                .get(run_id)
                .ok_or_else(|| OrchestratorError::RunNotFound(run_id.to_string()))?;
            if !matches!(
                run.status,
                RunStatus::Paused | RunStatus::Stopped | RunStatus::Failed
            ) {
                return Err(OrchestratorError::IllegalTransition(
                    run_id.to_string(),
                    run.status.to_string(),
                    RunStatus::Running.to_string(),
                ));
            }
            (run.template_name.clone(), run.ecosystem_variant.clone())
        };

        let template = self
            .templates
            .read()
            .await
            .get(&template_name)
            .cloned()
            .ok_or_else(|| OrchestratorError::TemplateNotFound(template_name.clone()))?;

        let options = RunOptions::layered(
            &self.config.global_defaults_path(),
            &RunOptions {
                ecosystem_variant: variant.clone(),
                ..Default::default()
            },
        );
        self.bring_up(run_id, &template, &options, false).await?;

        if let Err(e) = self.persist().await {
            warn!(run_id, error = %e, "persist after resume failed");
        }
        self.events.publish(OrchestratorEvent::RunResumed {
            run_id: run_id.to_string(),
        });

        let sync = Arc::clone(&self.sync);
        let sync_dir = self.config.run_working_dir(run_id);
        let sync_run_id = run_id.to_string();
        tokio::spawn(async move {
            sync.register_run(&sync_run_id, &template_name, variant.as_deref(), &sync_dir)
                .await;
        });
        Ok(())
    }

    /// Stored record merged with a live supervisor snapshot of the compute
    /// process (pid, cpu, rss, and its mapped status).
    pub async fn get_run(&self, run_id: &str) -> Result<Run> {
        let mut run = self
            .runs
            .read()
            .await
            .get(run_id)
            .cloned()
            .ok_or_else(|| OrchestratorError::RunNotFound(run_id.to_string()))?;
        self.merge_live(&mut run).await;
        Ok(run)
    }

    pub async fn get_all_runs(&self) -> Vec<Run> {
        let mut runs: Vec<Run> = self.runs.read().await.values().cloned().collect();
        runs.sort_by(|a, b| a.id.cmp(&b.id));
        for run in &mut runs {
            self.merge_live(run).await;
        }
        runs
    }

    async fn merge_live(&self, run: &mut Run) {
        let snapshots = self
            .supervisor
            .describe(&run.compute_process_name())
            .await
            .unwrap_or_default();
        let Some(snapshot) = snapshots.first() else {
            return;
        };
        run.process_stats.pid = snapshot.pid;
        run.process_stats.cpu_percent = snapshot.cpu_percent;
        run.process_stats.rss_kb = snapshot.rss_kb;
        if run.status == RunStatus::Running {
            run.status = match snapshot.state {
                ProcessState::Online | ProcessState::Launching => RunStatus::Running,
                ProcessState::Stopped | ProcessState::Stopping => RunStatus::Stopped,
                ProcessState::Errored => RunStatus::Failed,
            };
        }
    }

    pub async fn run_status(&self, run_id: &str) -> Option<RunStatus> {
        self.runs.read().await.get(run_id).map(|r| r.status)
    }

    pub async fn active_auto_run_count(&self) -> usize {
        self.runs
            .read()
            .await
            .values()
            .filter(|r| r.auto_scheduled && r.status == RunStatus::Running)
            .count()
    }

    /// A scheduler-paused auto run of the given template slot, if any.
    pub async fn find_paused_auto_run(
        &self,
        template_name: &str,
        variant: Option<&str>,
    ) -> Option<String> {
        self.runs
            .read()
            .await
            .values()
            .filter(|r| {
                r.auto_scheduled
                    && r.status == RunStatus::Paused
                    && r.paused_by_scheduler
                    && r.template_name == template_name
                    && r.ecosystem_variant.as_deref() == variant
            })
            .map(|r| r.id.clone())
            .max()
    }

    async fn persist(&self) -> Result<()> {
        let runs = self.runs.read().await;
        self.store.save(&runs).await
    }

    /// Reconcile persisted records against the live process table. The only
    /// mechanism by which the orchestrator tolerates its own restarts.
    pub async fn load_state(self: &Arc<Self>) -> Result<usize> {
        let mut stored = self.store.load().await?;
        let snapshots = self.supervisor.list().await.unwrap_or_default();

        for run in stored.values_mut() {
            let compute_name = run.compute_process_name();
            let live = snapshots.iter().find(|s| {
                s.name == compute_name
                    && matches!(s.state, ProcessState::Online | ProcessState::Launching)
            });

            match live {
                Some(snapshot) => {
                    run.status = if run.paused_by_scheduler && run.status == RunStatus::Paused {
                        RunStatus::Paused
                    } else {
                        RunStatus::Running
                    };
                    run.process_stats.pid = snapshot.pid;
                    run.process_stats.cpu_percent = snapshot.cpu_percent;
                    run.process_stats.rss_kb = snapshot.rss_kb;
                }
                None => {
                    if run.status == RunStatus::Running {
                        run.status = RunStatus::Stopped;
                        run.stopped_at = Some(Utc::now());
                        run.time_slice_started_at = None;
                    }
                }
            }

            // Stale persisted totals self-heal from the on-disk config.
            if let Some(ref path) = run.run_config_path {
                if let Some(total) = workdir::total_generations_from_disk(path).await {
                    run.progress.total_generations = Some(total);
                }
            }
        }

        let count = stored.len();
        {
            let mut runs = self.runs.write().await;
            *runs = stored;
        }
        self.persist().await?;

        // Live runs resume their periodic sync.
        let live_ids: Vec<(String, String, Option<String>)> = {
            let runs = self.runs.read().await;
            runs.values()
                .filter(|r| r.status == RunStatus::Running)
                .map(|r| {
                    (
                        r.id.clone(),
                        r.template_name.clone(),
                        r.ecosystem_variant.clone(),
                    )
                })
                .collect()
        };
        for (run_id, template_name, variant) in live_ids {
            let dir = self.config.run_working_dir(&run_id);
            self.sync
                .register_run(&run_id, &template_name, variant.as_deref(), &dir)
                .await;
        }

        Ok(count)
    }

    /// Stop every running run; part of the shutdown sequence (final syncs
    /// are implied by the stops).
    pub async fn shutdown(&self) {
        let running: Vec<String> = {
            let runs = self.runs.read().await;
            runs.values()
                .filter(|r| r.status == RunStatus::Running)
                .map(|r| r.id.clone())
                .collect()
        };
        for run_id in running {
            if let Err(e) = self.stop_run(&run_id).await {
                warn!(run_id, error = %e, "stop during shutdown failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{PortAllocation, RunConfig, ServiceInfo, SyncSettings};
    use crate::services::fake_supervisor::FakeSupervisor;
    use crate::services::ports::PortAllocator;
    use std::collections::HashMap as StdHashMap;
    use tokio::time::Duration;

    struct Fixture {
        manager: Arc<RunManager>,
        fake: Arc<FakeSupervisor>,
        _pump: tokio::task::JoinHandle<()>,
        _dir: tempfile::TempDir,
    }

    fn template(name: &str) -> Template {
        Template {
            name: name.to_string(),
            run_config: RunConfig {
                number_of_evals: Some(640),
                batch_size: Some(32),
                ..Default::default()
            },
            hyperparameters: serde_json::json!({"mutationRate": 0.05}),
            ecosystem_variants: StdHashMap::from([(
                "default".to_string(),
                crate::models::EcosystemVariant::default(),
            )]),
        }
    }

    async fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let config = OrchestratorConfig {
            working_root: dir.path().join("working"),
            logs_root: dir.path().join("logs"),
            readiness_timeout_secs: 2,
            readiness_poll_secs: 1,
            sync: SyncSettings::default(),
            ..Default::default()
        };
        let fake = Arc::new(FakeSupervisor::new());
        let supervisor: Arc<dyn ProcessSupervisor> = fake.clone();
        let ports = Arc::new(PortAllocator::new());
        let services = Arc::new(ServiceDependencyManager::new(
            supervisor.clone(),
            ports,
            config.clone(),
        ));
        let store = Arc::new(RunStateStore::new(config.run_state_path()));
        let events = EventBus::default();
        let sync = SyncManager::new(config.sync.clone(), config.sync_state_path(), events.clone());
        let manager = RunManager::new(supervisor, services, store, sync, events, config);
        manager.register_template(template("template-a")).await;
        let pump = manager.spawn_event_pump();
        Fixture {
            manager,
            fake,
            _pump: pump,
            _dir: dir,
        }
    }

    async fn wait_for_status(manager: &RunManager, run_id: &str, status: RunStatus) {
        for _ in 0..100 {
            if manager.run_status(run_id).await == Some(status) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!(
            "run {run_id} never reached {status}, is {:?}",
            manager.run_status(run_id).await
        );
    }

    fn allocation_of(run: &Run) -> &PortAllocation {
        &run.service_info.as_ref().unwrap().allocation
    }

    #[tokio::test]
    async fn start_run_brings_up_services_and_compute() {
        let f = fixture().await;
        let run_id = f
            .manager
            .start_run("template-a", &RunOptions::default())
            .await
            .unwrap();

        let run = f.manager.get_run(&run_id).await.unwrap();
        assert_eq!(run.status, RunStatus::Running);
        let info: &ServiceInfo = run.service_info.as_ref().unwrap();
        assert_eq!(info.allocation.start, 50000);
        assert_eq!(info.allocation.size, 1000);

        let names = f.fake.tracked_names();
        assert!(names.contains(&format!("kromosynth-gRPC-variation_{run_id}")));
        assert!(names.contains(&format!("kromosynth-render_{run_id}")));
        assert!(names.contains(&format!("kromosynth-run-{run_id}")));
        assert_eq!(run.progress.total_generations, Some(20));
        assert!(run.working_dir.join("evolution-runs-config.jsonc").exists());
    }

    #[tokio::test]
    async fn unknown_template_is_rejected() {
        let f = fixture().await;
        assert!(matches!(
            f.manager.start_run("nope", &RunOptions::default()).await,
            Err(OrchestratorError::TemplateNotFound(_))
        ));
    }

    #[tokio::test]
    async fn clean_exit_terminates_run_and_tears_down() {
        let f = fixture().await;
        let mut bus = f.manager.events().subscribe();
        let run_id = f
            .manager
            .start_run("template-a", &RunOptions::default())
            .await
            .unwrap();

        f.fake.simulate_exit(&format!("kromosynth-run-{run_id}"), 0);
        wait_for_status(&f.manager, &run_id, RunStatus::Terminated).await;

        let run = f.manager.get_run(&run_id).await.unwrap();
        assert_eq!(run.exit_code, Some(0));
        assert!(run.service_info.is_none());
        assert!(f.fake.tracked_names().is_empty());

        let mut saw_ended = false;
        while let Ok(event) = bus.try_recv() {
            if let OrchestratorEvent::RunEnded {
                run_id: id,
                reason,
                exit_code,
            } = event
            {
                assert_eq!(id, run_id);
                assert_eq!(reason, "terminated");
                assert_eq!(exit_code, Some(0));
                saw_ended = true;
            }
        }
        assert!(saw_ended);
    }

    #[tokio::test]
    async fn nonzero_exit_fails_run() {
        let f = fixture().await;
        let run_id = f
            .manager
            .start_run("template-a", &RunOptions::default())
            .await
            .unwrap();
        f.fake.simulate_exit(&format!("kromosynth-run-{run_id}"), 137);
        wait_for_status(&f.manager, &run_id, RunStatus::Failed).await;
        let run = f.manager.get_run(&run_id).await.unwrap();
        assert_eq!(run.exit_code, Some(137));
    }

    #[tokio::test]
    async fn concurrent_runs_get_disjoint_intervals_and_reuse() {
        let f = fixture().await;
        let run1 = f
            .manager
            .start_run("template-a", &RunOptions::default())
            .await
            .unwrap();
        let run2 = f
            .manager
            .start_run("template-a", &RunOptions::default())
            .await
            .unwrap();

        let a1 = allocation_of(&f.manager.get_run(&run1).await.unwrap()).clone();
        let a2 = allocation_of(&f.manager.get_run(&run2).await.unwrap()).clone();
        assert_eq!(a1.start, 50000);
        assert_eq!(a2.start, 51000);

        f.manager.stop_run(&run1).await.unwrap();
        let run3 = f
            .manager
            .start_run("template-a", &RunOptions::default())
            .await
            .unwrap();
        let a3 = allocation_of(&f.manager.get_run(&run3).await.unwrap()).clone();
        assert_eq!(a3.start, 50000);
    }

    #[tokio::test]
    async fn pause_resume_round_trip() {
        let f = fixture().await;
        let run_id = f
            .manager
            .start_run("template-a", &RunOptions::default())
            .await
            .unwrap();

        f.manager.pause_run(&run_id).await.unwrap();
        let run = f.manager.get_run(&run_id).await.unwrap();
        assert_eq!(run.status, RunStatus::Paused);
        assert_eq!(run.pause_count, 1);
        assert!(run.service_info.is_none());
        // No live processes carry the run suffix while paused.
        assert!(f.fake.tracked_names().is_empty());

        f.manager.resume_run(&run_id).await.unwrap();
        let run = f.manager.get_run(&run_id).await.unwrap();
        assert_eq!(run.status, RunStatus::Running);
        assert_eq!(allocation_of(&run).start, 50000);
        assert!(run.resumed_at.is_some());
        assert!(!f.fake.tracked_names().is_empty());
    }

    #[tokio::test]
    async fn illegal_transitions_are_rejected() {
        let f = fixture().await;
        let run_id = f
            .manager
            .start_run("template-a", &RunOptions::default())
            .await
            .unwrap();

        f.manager.stop_run(&run_id).await.unwrap();
        assert!(matches!(
            f.manager.pause_run(&run_id).await,
            Err(OrchestratorError::IllegalTransition(_, _, _))
        ));
        assert!(matches!(
            f.manager.stop_run(&run_id).await,
            Err(OrchestratorError::IllegalTransition(_, _, _))
        ));
    }

    #[tokio::test]
    async fn exit_of_paused_run_is_ignored() {
        let f = fixture().await;
        let run_id = f
            .manager
            .start_run("template-a", &RunOptions::default())
            .await
            .unwrap();
        f.manager.pause_run_by_scheduler(&run_id).await.unwrap();

        // A late exit event for the already-paused run must not reclassify it.
        f.fake.simulate_exit(&format!("kromosynth-run-{run_id}"), 1);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(
            f.manager.run_status(&run_id).await,
            Some(RunStatus::Paused)
        );
    }

    #[tokio::test]
    async fn user_stop_of_scheduler_paused_run_clears_flag() {
        let f = fixture().await;
        let run_id = f
            .manager
            .start_run("template-a", &RunOptions::default())
            .await
            .unwrap();
        f.manager.pause_run_by_scheduler(&run_id).await.unwrap();
        assert!(f
            .manager
            .find_paused_auto_run("template-a", None)
            .await
            .is_none());

        f.manager.stop_run(&run_id).await.unwrap();
        let run = f.manager.get_run(&run_id).await.unwrap();
        assert!(!run.paused_by_scheduler);
    }

    #[tokio::test]
    async fn progress_extraction_is_monotonic_and_emits() {
        let f = fixture().await;
        let mut bus = f.manager.events().subscribe();
        let run_id = f
            .manager
            .start_run("template-a", &RunOptions::default())
            .await
            .unwrap();
        let compute = format!("kromosynth-run-{run_id}");

        f.fake.inject_log(&compute, "generation 3");
        f.fake.inject_log(&compute, "Coverage: 25%, QD Score: 10.5");
        f.fake.inject_log(&compute, "generation 2");

        for _ in 0..100 {
            let run = f.manager.get_run(&run_id).await.unwrap();
            if run.progress.qd_score.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;

        let run = f.manager.get_run(&run_id).await.unwrap();
        assert_eq!(run.progress.generation, Some(3));
        assert_eq!(run.progress.coverage, Some(0.25));
        assert_eq!(run.progress.qd_score, Some(10.5));

        let mut saw_progress = false;
        while let Ok(event) = bus.try_recv() {
            if matches!(event, OrchestratorEvent::RunProgress { .. }) {
                saw_progress = true;
            }
        }
        assert!(saw_progress);
    }

    #[tokio::test]
    async fn reconciliation_restores_live_runs_and_stops_dead_ones() {
        let dir = tempfile::tempdir().unwrap();
        let config = OrchestratorConfig {
            working_root: dir.path().join("working"),
            logs_root: dir.path().join("logs"),
            ..Default::default()
        };
        let store = Arc::new(RunStateStore::new(config.run_state_path()));

        // Persist two runs: one whose compute is still alive, one dead.
        let mut stored = StdHashMap::new();
        let mut alive = Run::new(
            "01ALIVE".into(),
            "template-a".into(),
            None,
            config.run_working_dir("01ALIVE"),
        );
        alive.status = RunStatus::Running;
        let mut dead = Run::new(
            "01DEAD".into(),
            "template-a".into(),
            None,
            config.run_working_dir("01DEAD"),
        );
        dead.status = RunStatus::Running;
        stored.insert(alive.id.clone(), alive);
        stored.insert(dead.id.clone(), dead);
        store.save(&stored).await.unwrap();

        let fake = Arc::new(FakeSupervisor::new());
        let supervisor: Arc<dyn ProcessSupervisor> = fake.clone();
        supervisor
            .start(ProcessSpec::new(
                compute_process_name("01ALIVE"),
                "cli.js",
                dir.path(),
            ))
            .await
            .unwrap();

        let events = EventBus::default();
        let sync = SyncManager::new(config.sync.clone(), config.sync_state_path(), events.clone());
        let services = Arc::new(ServiceDependencyManager::new(
            supervisor.clone(),
            Arc::new(PortAllocator::new()),
            config.clone(),
        ));
        let manager = RunManager::new(supervisor, services, store, sync, events, config);
        manager.register_template(template("template-a")).await;

        let count = manager.load_state().await.unwrap();
        assert_eq!(count, 2);

        let alive = manager.get_run("01ALIVE").await.unwrap();
        assert_eq!(alive.status, RunStatus::Running);
        assert!(alive.process_stats.pid.is_some());

        let dead = manager.get_run("01DEAD").await.unwrap();
        assert_eq!(dead.status, RunStatus::Stopped);
        assert!(dead.stopped_at.is_some());
    }
}
