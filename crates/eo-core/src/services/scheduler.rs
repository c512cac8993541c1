use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{broadcast, Mutex};
use tokio::time::Duration;
use tracing::{debug, info, warn};

use crate::error::{OrchestratorError, Result};
use crate::models::{AutoRunConfig, RunOptions, RunStatus, SchedulerMode, TemplateSlot};

use super::events::{EventBus, OrchestratorEvent};
use super::run_manager::RunManager;
use super::run_store::atomic_write_json;

/// Warning lead time before a slice expires, capped at half the slice.
const WARNING_LEAD: Duration = Duration::from_secs(5 * 60);

struct SliceTimers {
    warning: tokio::task::JoinHandle<()>,
    expiry: tokio::task::JoinHandle<()>,
}

impl SliceTimers {
    fn abort(&self) {
        self.warning.abort();
        self.expiry.abort();
    }
}

/// Maintains up to `maxConcurrent` auto-scheduled runs, rotating through the
/// enabled template slots. Each active run holds its slot for one time slice
/// and is then paused in favour of the next template; failed runs back the
/// scheduler off until it pauses itself.
pub struct AutoRunScheduler {
    run_manager: Arc<RunManager>,
    events: EventBus,
    config_path: PathBuf,
    /// Scheduler-wide mutex: slot filling and timer callbacks never run
    /// concurrently.
    state: Mutex<AutoRunConfig>,
    timers: Mutex<HashMap<String, SliceTimers>>,
}

impl AutoRunScheduler {
    pub fn new(run_manager: Arc<RunManager>, events: EventBus, config_path: PathBuf) -> Arc<Self> {
        Arc::new(Self {
            run_manager,
            events,
            config_path,
            state: Mutex::new(AutoRunConfig::default()),
            timers: Mutex::new(HashMap::new()),
        })
    }

    /// Load persisted configuration, purge entries whose template no longer
    /// exists, and begin filling slots if enabled.
    pub async fn load(self: &Arc<Self>) -> Result<()> {
        let loaded = match read_scheduler_config(&self.config_path).await {
            Ok(Some(config)) => config,
            Ok(None) => AutoRunConfig::default(),
            Err(e) => {
                warn!(error = %e, "auto-run config unreadable; starting fresh");
                AutoRunConfig::default()
            }
        };

        {
            let mut state = self.state.lock().await;
            *state = loaded;
            let mut kept = Vec::new();
            for entry in state.entries.drain(..) {
                if self.run_manager.has_template(&entry.template_name).await {
                    kept.push(entry);
                } else {
                    info!(template = %entry.template_name, "purging entry for missing template");
                }
            }
            state.entries = kept;
            self.persist(&state).await?;

            if state.enabled && !state.paused {
                self.fill_locked(&mut state, None).await;
            }
        }
        Ok(())
    }

    /// React to run lifecycle events: free slots, count failures, clear
    /// timers on any transition that is not a slice expiry.
    pub fn spawn_event_loop(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let scheduler = Arc::clone(self);
        let mut bus = self.events.subscribe();
        tokio::spawn(async move {
            loop {
                match bus.recv().await {
                    Ok(OrchestratorEvent::RunEnded { run_id, reason, .. }) => {
                        scheduler.handle_run_finished(&run_id, &reason).await;
                    }
                    Ok(OrchestratorEvent::RunStopped { run_id }) => {
                        scheduler.handle_run_finished(&run_id, "stopped").await;
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        })
    }

    async fn handle_run_finished(self: &Arc<Self>, run_id: &str, reason: &str) {
        self.clear_timers_for(run_id).await;

        let mut state = self.state.lock().await;
        let mut owned = false;
        for entry in &mut state.entries {
            if entry.current_run_id.as_deref() == Some(run_id) {
                entry.current_run_id = None;
                owned = true;
            }
        }
        if !owned {
            return;
        }

        if reason == "failed" {
            state.consecutive_failures += 1;
            if state.pause_on_failure
                && state.consecutive_failures >= state.max_failures_before_pause
            {
                let why = format!(
                    "{} consecutive run failures",
                    state.consecutive_failures
                );
                warn!(reason = %why, "scheduler pausing itself");
                state.paused = true;
                state.pause_reason = Some(why.clone());
                self.clear_all_timers().await;
                if let Err(e) = self.persist(&state).await {
                    warn!(error = %e, "failed to persist scheduler state");
                }
                self.events.publish(OrchestratorEvent::AutoRunStatusChange {
                    enabled: state.enabled,
                    paused: true,
                    reason: Some(why),
                });
                return;
            }
        } else {
            state.consecutive_failures = 0;
        }

        if let Err(e) = self.persist(&state).await {
            warn!(error = %e, "failed to persist scheduler state");
        }
        if state.enabled && !state.paused {
            self.fill_locked(&mut state, None).await;
        }
    }

    pub async fn enable(self: &Arc<Self>) -> Result<()> {
        let mut state = self.state.lock().await;
        state.enabled = true;
        self.persist(&state).await?;
        self.events.publish(OrchestratorEvent::AutoRunStatusChange {
            enabled: true,
            paused: state.paused,
            reason: state.pause_reason.clone(),
        });
        if !state.paused {
            self.fill_locked(&mut state, None).await;
        }
        Ok(())
    }

    /// Disable scheduling. All slice timers stop: no `time-slice-expired`
    /// fires after this returns.
    pub async fn disable(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        state.enabled = false;
        self.clear_all_timers().await;
        self.persist(&state).await?;
        self.events.publish(OrchestratorEvent::AutoRunStatusChange {
            enabled: false,
            paused: state.paused,
            reason: state.pause_reason.clone(),
        });
        Ok(())
    }

    /// Clear a failure pause and resume filling slots.
    pub async fn resume_scheduling(self: &Arc<Self>) -> Result<()> {
        let mut state = self.state.lock().await;
        state.paused = false;
        state.pause_reason = None;
        state.consecutive_failures = 0;
        self.persist(&state).await?;
        self.events.publish(OrchestratorEvent::AutoRunStatusChange {
            enabled: state.enabled,
            paused: false,
            reason: None,
        });
        if state.enabled {
            self.fill_locked(&mut state, None).await;
        }
        Ok(())
    }

    /// Add (or re-enable) a template slot. The template must exist.
    pub async fn enable_template(
        self: &Arc<Self>,
        slot: TemplateSlot,
    ) -> Result<()> {
        if !self.run_manager.has_template(&slot.template_name).await {
            return Err(OrchestratorError::TemplateNotFound(slot.template_name));
        }
        let mut state = self.state.lock().await;
        match state.entry_mut(&slot.template_name, slot.ecosystem_variant.as_deref()) {
            Some(existing) => {
                existing.enabled = true;
                existing.priority = slot.priority;
                existing.time_slice_minutes = slot.time_slice_minutes;
            }
            None => state.entries.push(slot),
        }
        self.persist(&state).await?;
        if state.enabled && !state.paused {
            self.fill_locked(&mut state, None).await;
        }
        Ok(())
    }

    pub async fn disable_template(
        &self,
        template_name: &str,
        variant: Option<&str>,
    ) -> Result<()> {
        let run_to_clear = {
            let mut state = self.state.lock().await;
            let entry = state
                .entry_mut(template_name, variant)
                .ok_or_else(|| OrchestratorError::TemplateNotFound(template_name.to_string()))?;
            entry.enabled = false;
            let cleared = entry.current_run_id.clone();
            self.persist(&state).await?;
            cleared
        };
        if let Some(run_id) = run_to_clear {
            self.clear_timers_for(&run_id).await;
        }
        Ok(())
    }

    /// Drop a template slot entirely, clearing any active timer.
    pub async fn remove_template(
        &self,
        template_name: &str,
        variant: Option<&str>,
    ) -> Result<()> {
        let run_to_clear = {
            let mut state = self.state.lock().await;
            let before = state.entries.len();
            let mut cleared = None;
            state.entries.retain(|e| {
                let matches = e.template_name == template_name
                    && e.ecosystem_variant.as_deref() == variant;
                if matches {
                    cleared = e.current_run_id.clone();
                }
                !matches
            });
            if state.entries.len() == before {
                return Err(OrchestratorError::TemplateNotFound(
                    template_name.to_string(),
                ));
            }
            self.persist(&state).await?;
            cleared
        };
        if let Some(run_id) = run_to_clear {
            self.clear_timers_for(&run_id).await;
        }
        Ok(())
    }

    pub async fn set_mode(&self, mode: SchedulerMode) -> Result<()> {
        let mut state = self.state.lock().await;
        state.mode = mode;
        self.persist(&state).await
    }

    pub async fn set_max_concurrent(self: &Arc<Self>, max: usize) -> Result<()> {
        let mut state = self.state.lock().await;
        state.max_concurrent = max.max(1);
        self.persist(&state).await?;
        if state.enabled && !state.paused {
            self.fill_locked(&mut state, None).await;
        }
        Ok(())
    }

    pub async fn status(&self) -> AutoRunConfig {
        self.state.lock().await.clone()
    }

    /// Fill free slots, up to one start per free slot, under the scheduler
    /// mutex held by the caller. A just-expired entry is excluded so its
    /// slot yields to the next template, unless it is the only candidate.
    async fn fill_locked(self: &Arc<Self>, state: &mut AutoRunConfig, exclude: Option<usize>) {
        loop {
            let active = self.run_manager.active_auto_run_count().await;
            if active >= state.max_concurrent {
                return;
            }

            // A slot is free when its entry has no run in `running` status.
            let mut candidates = Vec::new();
            for (index, entry) in state.entries.iter().enumerate() {
                if !entry.enabled {
                    continue;
                }
                let busy = match entry.current_run_id.as_deref() {
                    Some(run_id) => {
                        self.run_manager.run_status(run_id).await == Some(RunStatus::Running)
                    }
                    None => false,
                };
                if !busy {
                    candidates.push(index);
                }
            }
            if let Some(excluded) = exclude {
                if candidates.len() > 1 {
                    candidates.retain(|&i| i != excluded);
                }
            }

            let Some(index) = pick_candidate(state.mode, &state.entries, &candidates) else {
                return;
            };

            let (template_name, variant, _slice) = {
                let entry = &state.entries[index];
                (
                    entry.template_name.clone(),
                    entry.ecosystem_variant.clone(),
                    entry.time_slice_minutes,
                )
            };

            // Resume the template's scheduler-paused run when one exists,
            // otherwise start fresh.
            let paused = self
                .run_manager
                .find_paused_auto_run(&template_name, variant.as_deref())
                .await;
            let started = match paused {
                Some(run_id) => self
                    .run_manager
                    .resume_run(&run_id)
                    .await
                    .map(|_| run_id),
                None => {
                    let options = RunOptions {
                        ecosystem_variant: variant.clone(),
                        auto_scheduled: Some(true),
                        ..Default::default()
                    };
                    self.run_manager.start_run(&template_name, &options).await
                }
            };

            let run_id = match started {
                Ok(run_id) => run_id,
                Err(e) => {
                    warn!(template = %template_name, error = %e, "slot fill failed");
                    return;
                }
            };

            let entry = &mut state.entries[index];
            entry.current_run_id = Some(run_id.clone());
            entry.last_run_at = Some(Utc::now());
            if let Err(e) = self.persist(state).await {
                warn!(error = %e, "failed to persist scheduler state");
            }

            self.start_slice_timers(&run_id, &state.entries[index]).await;
            self.events.publish(OrchestratorEvent::TimeSliceStarted {
                run_id,
                template_name,
            });
        }
    }

    async fn start_slice_timers(self: &Arc<Self>, run_id: &str, entry: &TemplateSlot) {
        let duration = entry.slice_duration();
        let lead = WARNING_LEAD.min(duration / 2);

        let warning = {
            let events = self.events.clone();
            let run_id = run_id.to_string();
            let expires_at = Utc::now()
                + chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::zero());
            tokio::spawn(async move {
                tokio::time::sleep(duration - lead).await;
                events.publish(OrchestratorEvent::TimeSliceEnding { run_id, expires_at });
            })
        };

        let expiry = {
            let scheduler = Arc::clone(self);
            let run_id = run_id.to_string();
            tokio::spawn(async move {
                tokio::time::sleep(duration).await;
                scheduler.on_slice_expired(&run_id).await;
            })
        };

        let mut timers = self.timers.lock().await;
        if let Some(old) = timers.insert(run_id.to_string(), SliceTimers { warning, expiry }) {
            old.abort();
        }
    }

    /// The expiry callback: pause the run, free the slot, account the slice,
    /// and hand the slot to the next template.
    ///
    /// Boxed explicitly: this function is mutually recursive with
    /// `start_slice_timers` (via the spawned expiry task), and leaving it as
    /// a plain `async fn` makes the compiler's Send auto-trait solving for
    /// the spawned future cyclic.
    fn on_slice_expired<'a>(
        self: &'a Arc<Self>,
        run_id: &'a str,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        Box::pin(async move {
        let mut state = self.state.lock().await;
        if !state.enabled || state.paused {
            return;
        }

        let Some(index) = state
            .entries
            .iter()
            .position(|e| e.current_run_id.as_deref() == Some(run_id))
        else {
            return;
        };

        debug!(run_id, "time slice expired");
        if let Err(e) = self.run_manager.pause_run_by_scheduler(run_id).await {
            // The run may have ended on its own in the meantime.
            debug!(run_id, error = %e, "pause on expiry skipped");
        }

        let template_name = {
            let entry = &mut state.entries[index];
            entry.current_run_id = None;
            entry.total_run_time_minutes += entry.time_slice_minutes;
            entry.template_name.clone()
        };
        if let Err(e) = self.persist(&state).await {
            warn!(error = %e, "failed to persist scheduler state");
        }

        if let Some(timers) = self.timers.lock().await.remove(run_id) {
            // The expiry task is this one; only the warning needs aborting.
            timers.warning.abort();
        }
        self.events.publish(OrchestratorEvent::TimeSliceExpired {
            run_id: run_id.to_string(),
            template_name,
        });

        self.fill_locked(&mut state, Some(index)).await;
        })
    }

    async fn clear_timers_for(&self, run_id: &str) {
        if let Some(timers) = self.timers.lock().await.remove(run_id) {
            timers.abort();
        }
    }

    async fn clear_all_timers(&self) {
        let mut timers = self.timers.lock().await;
        for (_, t) in timers.drain() {
            t.abort();
        }
    }

    async fn persist(&self, state: &AutoRunConfig) -> Result<()> {
        atomic_write_json(&self.config_path, state).await
    }

    /// Stop timers without touching run state; shutdown path.
    pub async fn shutdown(&self) {
        self.clear_all_timers().await;
    }
}

async fn read_scheduler_config(path: &PathBuf) -> Result<Option<AutoRunConfig>> {
    if !path.exists() {
        return Ok(None);
    }
    let text = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| OrchestratorError::State(format!("failed to read scheduler config: {e}")))?;
    Ok(Some(serde_json::from_str(&text)?))
}

/// Pick the next slot among the free candidates: lowest priority value in
/// priority mode, oldest `lastRunAt` (never-run first) in round-robin.
fn pick_candidate(
    mode: SchedulerMode,
    entries: &[TemplateSlot],
    candidates: &[usize],
) -> Option<usize> {
    match mode {
        SchedulerMode::Priority => candidates
            .iter()
            .copied()
            .min_by_key(|&i| entries[i].priority),
        SchedulerMode::RoundRobin => candidates.iter().copied().min_by_key(|&i| {
            (
                entries[i].last_run_at.is_some(),
                entries[i].last_run_at,
            )
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slot(name: &str, priority: u32, last_run_minutes_ago: Option<i64>) -> TemplateSlot {
        let mut slot = TemplateSlot::new(name, None);
        slot.priority = priority;
        slot.last_run_at = last_run_minutes_ago.map(|m| Utc::now() - chrono::Duration::minutes(m));
        slot
    }

    #[test]
    fn priority_mode_picks_lowest_priority_value() {
        let entries = vec![slot("a", 5, None), slot("b", 1, None), slot("c", 3, None)];
        let picked = pick_candidate(SchedulerMode::Priority, &entries, &[0, 1, 2]);
        assert_eq!(picked, Some(1));
    }

    #[test]
    fn round_robin_prefers_never_run_then_oldest() {
        let entries = vec![
            slot("a", 0, Some(10)),
            slot("b", 0, None),
            slot("c", 0, Some(60)),
        ];
        // Never-run entry wins outright.
        assert_eq!(
            pick_candidate(SchedulerMode::RoundRobin, &entries, &[0, 1, 2]),
            Some(1)
        );
        // Among previously-run entries, the stalest wins.
        assert_eq!(
            pick_candidate(SchedulerMode::RoundRobin, &entries, &[0, 2]),
            Some(2)
        );
    }

    #[test]
    fn no_candidates_yields_none() {
        let entries = vec![slot("a", 0, None)];
        assert_eq!(pick_candidate(SchedulerMode::Priority, &entries, &[]), None);
    }
}
