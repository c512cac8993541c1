use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};
use tokio::time::Duration;
use tracing::{debug, info, warn};

use crate::error::{OrchestratorError, Result};
use crate::models::{SyncSettings, SyncState};

use super::events::{EventBus, OrchestratorEvent};
use super::run_store::{atomic_write_json, read_json_map};

/// Database files mirrored to the central replica, in order.
const DB_FILES: [&str; 2] = ["genomes.sqlite", "features.sqlite"];

/// Analysis subdirectories uploaded file-by-file.
const ANALYSIS_SUBDIRS: [&str; 2] = ["analysisResults", "generationFeatures"];

const API_KEY_HEADER: &str = "X-Sync-API-Key";

/// Outcome of one sync cycle.
#[derive(Debug, Default)]
pub struct SyncOutcome {
    pub db_files_synced: u64,
    pub files_uploaded: u64,
    pub files_skipped: u64,
    pub errors: Vec<String>,
    /// True when the guard was already held and the cycle did not run.
    pub skipped_overlapping: bool,
}

/// Mirrors each run's on-disk working set to the central replica: an
/// incremental database sync via an external tool, then differential
/// analysis-file uploads over HTTP. One cycle at a time per run; distinct
/// runs sync in parallel.
pub struct SyncManager {
    settings: SyncSettings,
    state_path: PathBuf,
    states: RwLock<HashMap<String, SyncState>>,
    client: reqwest::Client,
    events: EventBus,
    guards: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    timers: Mutex<HashMap<String, tokio::task::JoinHandle<()>>>,
}

impl SyncManager {
    pub fn new(settings: SyncSettings, state_path: PathBuf, events: EventBus) -> Arc<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.http_timeout_secs))
            .build()
            .unwrap_or_default();
        Arc::new(Self {
            settings,
            state_path,
            states: RwLock::new(HashMap::new()),
            client,
            events,
            guards: Mutex::new(HashMap::new()),
            timers: Mutex::new(HashMap::new()),
        })
    }

    pub async fn load_state(&self) -> Result<()> {
        let loaded: HashMap<String, SyncState> = read_json_map(&self.state_path).await?;
        *self.states.write().await = loaded;
        Ok(())
    }

    pub async fn state_of(&self, run_id: &str) -> Option<SyncState> {
        self.states.read().await.get(run_id).cloned()
    }

    async fn persist(&self) -> Result<()> {
        let states = self.states.read().await;
        atomic_write_json(&self.state_path, &*states).await
    }

    /// Register a run for syncing: create its state, advise the central
    /// service, and start the periodic timer. Registration is best-effort
    /// end to end.
    pub async fn register_run(
        self: &Arc<Self>,
        run_id: &str,
        template_name: &str,
        ecosystem_variant: Option<&str>,
        working_dir: &Path,
    ) {
        {
            let mut states = self.states.write().await;
            let state = states
                .entry(run_id.to_string())
                .or_insert_with(|| SyncState::new(run_id));
            state.working_dir = working_dir.to_path_buf();
            state.consecutive_errors = 0;
        }
        if let Err(e) = self.persist().await {
            warn!(run_id, error = %e, "failed to persist sync state");
        }

        if let Some(service_url) = self.settings.service_url.clone() {
            let body = serde_json::json!({
                "templateName": template_name,
                "ecosystemVariant": ecosystem_variant,
                "startedAt": chrono::Utc::now(),
            });
            let url = format!("{service_url}/api/sync/register/{run_id}");
            let mut request = self.client.post(&url).json(&body);
            if let Some(ref key) = self.settings.api_key {
                request = request.header(API_KEY_HEADER, key);
            }
            // Advisory only.
            if let Err(e) = request.send().await {
                warn!(run_id, error = %e, "central registration failed");
            }
        }

        if self.settings.enabled {
            self.start_periodic_timer(run_id).await;
        }
    }

    async fn start_periodic_timer(self: &Arc<Self>, run_id: &str) {
        let mut timers = self.timers.lock().await;
        if timers.contains_key(run_id) {
            return;
        }
        let manager = Arc::clone(self);
        let run_id_owned = run_id.to_string();
        let first_delay = Duration::from_millis(self.settings.first_tick_delay_ms);
        let interval = Duration::from_millis(self.settings.interval_ms.max(1));
        let handle = tokio::spawn(async move {
            tokio::time::sleep(first_delay).await;
            loop {
                let _ = manager.trigger(&run_id_owned).await;
                if manager.timer_cancelled(&run_id_owned).await {
                    return;
                }
                tokio::time::sleep(interval).await;
            }
        });
        timers.insert(run_id.to_string(), handle);
    }

    async fn timer_cancelled(&self, run_id: &str) -> bool {
        let states = self.states.read().await;
        states
            .get(run_id)
            .map(|s| s.consecutive_errors >= self.settings.retry_max_attempts)
            .unwrap_or(true)
    }

    /// Stop the periodic timer. The run's state stays, so manual triggers
    /// keep working.
    pub async fn unregister_run(&self, run_id: &str) {
        if let Some(handle) = self.timers.lock().await.remove(run_id) {
            handle.abort();
        }
    }

    /// Run one sync cycle for the run. Overlapping triggers are skipped:
    /// at most one cycle per run at any time.
    pub async fn trigger(&self, run_id: &str) -> Result<SyncOutcome> {
        let guard = {
            let mut guards = self.guards.lock().await;
            guards
                .entry(run_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        let Ok(_held) = guard.try_lock() else {
            debug!(run_id, "sync cycle already in flight; skipping");
            return Ok(SyncOutcome {
                skipped_overlapping: true,
                ..Default::default()
            });
        };

        let working_dir = {
            let states = self.states.read().await;
            match states.get(run_id) {
                Some(state) => state.working_dir.clone(),
                None => {
                    return Err(OrchestratorError::Sync {
                        run_id: run_id.to_string(),
                        reason: "run not registered for sync".into(),
                    })
                }
            }
        };

        self.events.publish(OrchestratorEvent::SyncStarted {
            run_id: run_id.to_string(),
        });

        let mut outcome = SyncOutcome::default();
        let (db_enabled, file_enabled) = {
            let states = self.states.read().await;
            let state = states.get(run_id);
            (
                state
                    .and_then(|s| s.db_sync_enabled)
                    .unwrap_or(self.settings.db_sync_enabled),
                state
                    .and_then(|s| s.file_sync_enabled)
                    .unwrap_or(self.settings.file_sync_enabled),
            )
        };

        // Databases first, so the central holds matching state by the time
        // the analysis files arrive.
        if db_enabled && self.settings.central_host.is_some() {
            self.sync_databases(run_id, &working_dir, &mut outcome).await;
        }
        if file_enabled && self.settings.service_url.is_some() {
            self.sync_analysis_files(run_id, &working_dir, &mut outcome)
                .await;
        }

        let cycle_failed = !outcome.errors.is_empty();
        {
            let mut states = self.states.write().await;
            if let Some(state) = states.get_mut(run_id) {
                state.cycles_completed += 1;
                state.db_files_synced += outcome.db_files_synced;
                state.files_uploaded += outcome.files_uploaded;
                if outcome.db_files_synced > 0 {
                    state.last_db_sync = Some(chrono::Utc::now());
                }
                if outcome.files_uploaded > 0 || (file_enabled && !cycle_failed) {
                    state.last_file_sync = Some(chrono::Utc::now());
                }
                if cycle_failed {
                    state.consecutive_errors += 1;
                    for error in &outcome.errors {
                        state.record_error(error.clone());
                    }
                } else {
                    state.consecutive_errors = 0;
                }
            }
        }
        if let Err(e) = self.persist().await {
            warn!(run_id, error = %e, "failed to persist sync state");
        }

        if cycle_failed {
            let message = outcome.errors.join("; ");
            self.events.publish(OrchestratorEvent::SyncError {
                run_id: run_id.to_string(),
                message: message.clone(),
            });
            if self.timer_cancelled(run_id).await {
                info!(run_id, "sync retries exhausted; periodic timer stops");
                self.unregister_run(run_id).await;
            }
        } else {
            self.events.publish(OrchestratorEvent::SyncCompleted {
                run_id: run_id.to_string(),
                files_uploaded: outcome.files_uploaded,
                db_files_synced: outcome.db_files_synced,
            });
        }

        Ok(outcome)
    }

    /// Mirror each known database file with the external binary-sync tool.
    /// Per-file failures are recorded and the cycle continues.
    async fn sync_databases(&self, run_id: &str, working_dir: &Path, outcome: &mut SyncOutcome) {
        let Some(ref host) = self.settings.central_host else {
            return;
        };
        let base = self
            .settings
            .central_base_path
            .clone()
            .unwrap_or_else(|| "evoruns".into());

        for file in DB_FILES {
            let local = working_dir.join(file);
            if !local.exists() {
                continue;
            }
            let remote = format!("{host}:{base}/{run_id}/{file}");
            match self.run_sync_tool(&local, &remote).await {
                Ok(()) => outcome.db_files_synced += 1,
                Err(e) => {
                    warn!(run_id, file, error = %e, "database sync failed");
                    outcome.errors.push(format!("db {file}: {e}"));
                }
            }
        }
    }

    async fn run_sync_tool(&self, local: &Path, remote: &str) -> std::result::Result<(), String> {
        let mut child = tokio::process::Command::new(&self.settings.sync_tool)
            .arg(local)
            .arg(remote)
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| format!("failed to spawn {}: {e}", self.settings.sync_tool))?;

        let timeout = Duration::from_secs(self.settings.db_file_timeout_secs);
        match tokio::time::timeout(timeout, child.wait()).await {
            Ok(Ok(status)) if status.success() => Ok(()),
            Ok(Ok(status)) => Err(format!("sync tool exited with {status}")),
            Ok(Err(e)) => Err(format!("sync tool wait failed: {e}")),
            Err(_) => {
                // Hard kill on timeout; the next cycle retries the file.
                let _ = child.start_kill();
                Err("sync tool timed out".into())
            }
        }
    }

    /// Upload analysis files the central replica does not have yet.
    async fn sync_analysis_files(
        &self,
        run_id: &str,
        working_dir: &Path,
        outcome: &mut SyncOutcome,
    ) {
        let Some(service_url) = self.settings.service_url.clone() else {
            return;
        };

        for subdir in ANALYSIS_SUBDIRS {
            let local_dir = working_dir.join(subdir);
            if !local_dir.is_dir() {
                continue;
            }

            let remote_files = match self.list_remote(&service_url, run_id, subdir).await {
                Ok(files) => files,
                Err(FatalCycle(message)) => {
                    outcome.errors.push(message);
                    return;
                }
            };

            let entries = match std::fs::read_dir(&local_dir) {
                Ok(entries) => entries,
                Err(e) => {
                    outcome.errors.push(format!("{subdir}: {e}"));
                    continue;
                }
            };
            for entry in entries.flatten() {
                let path = entry.path();
                if !path.is_file() {
                    continue;
                }
                let name = entry.file_name().to_string_lossy().to_string();
                if remote_files.contains(&name) {
                    outcome.files_skipped += 1;
                    continue;
                }
                match self.upload_file(&service_url, run_id, subdir, &path, &name).await {
                    Ok(()) => outcome.files_uploaded += 1,
                    Err(e) => {
                        warn!(run_id, file = %name, error = %e, "upload failed");
                        outcome.errors.push(format!("{subdir}/{name}: {e}"));
                    }
                }
            }
        }
    }

    async fn list_remote(
        &self,
        service_url: &str,
        run_id: &str,
        subdir: &str,
    ) -> std::result::Result<Vec<String>, FatalCycle> {
        let url = format!("{service_url}/api/sync/analysis/{run_id}/list?subdir={subdir}");
        let mut request = self.client.get(&url);
        if let Some(ref key) = self.settings.api_key {
            request = request.header(API_KEY_HEADER, key);
        }
        let response = request
            .send()
            .await
            .map_err(|e| FatalCycle(format!("list {subdir}: {e}")))?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            // Not-yet-registered runs list as empty.
            Ok(Vec::new())
        } else if status == reqwest::StatusCode::UNAUTHORIZED
            || status == reqwest::StatusCode::FORBIDDEN
        {
            Err(FatalCycle(format!("list {subdir}: auth rejected ({status})")))
        } else if status.is_success() {
            let listing: RemoteListing = response
                .json()
                .await
                .map_err(|e| FatalCycle(format!("list {subdir}: {e}")))?;
            Ok(listing.files.into_iter().map(|f| f.name).collect())
        } else {
            Err(FatalCycle(format!("list {subdir}: HTTP {status}")))
        }
    }

    async fn upload_file(
        &self,
        service_url: &str,
        run_id: &str,
        subdir: &str,
        path: &Path,
        name: &str,
    ) -> Result<()> {
        let bytes = tokio::fs::read(path).await?;
        let part = reqwest::multipart::Part::bytes(bytes)
            .file_name(name.to_string())
            .mime_str("application/gzip")
            .map_err(|e| OrchestratorError::Sync {
                run_id: run_id.to_string(),
                reason: e.to_string(),
            })?;
        let form = reqwest::multipart::Form::new()
            .part("file", part)
            .text("subdir", subdir.to_string());

        let url = format!("{service_url}/api/sync/analysis/{run_id}");
        let mut request = self.client.post(&url).multipart(form);
        if let Some(ref key) = self.settings.api_key {
            request = request.header(API_KEY_HEADER, key);
        }
        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(OrchestratorError::Sync {
                run_id: run_id.to_string(),
                reason: format!("upload returned HTTP {}", response.status()),
            });
        }
        Ok(())
    }

    /// Stop every periodic timer; used during shutdown.
    pub async fn shutdown(&self) {
        let mut timers = self.timers.lock().await;
        for (_, handle) in timers.drain() {
            handle.abort();
        }
    }
}

struct FatalCycle(String);

#[derive(Debug, serde::Deserialize)]
struct RemoteListing {
    #[serde(default)]
    files: Vec<RemoteFile>,
}

#[derive(Debug, serde::Deserialize)]
struct RemoteFile {
    name: String,
}
