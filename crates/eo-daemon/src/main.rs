use std::sync::Arc;

use tokio::sync::broadcast;

use eo_core::models::OrchestratorConfig;
use eo_core::services::{
    AutoRunScheduler, EventBus, LocalSupervisor, PortAllocator, ProcessSupervisor, RunManager,
    RunStateStore, ServiceDependencyManager, SyncManager,
};

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;

    let config = OrchestratorConfig::from_env();
    std::fs::create_dir_all(&config.working_root)?;
    std::fs::create_dir_all(&config.logs_root)?;

    let _guard = setup_logging(&config);

    // Load templates dropped into the working root by the template tooling.
    let templates = load_templates(&config);

    let supervisor: Arc<dyn ProcessSupervisor> = Arc::new(LocalSupervisor::new());
    let ports = Arc::new(PortAllocator::new());
    let services = Arc::new(ServiceDependencyManager::new(
        supervisor.clone(),
        ports,
        config.clone(),
    ));
    let store = Arc::new(RunStateStore::new(config.run_state_path()));
    let events = EventBus::default();
    let sync = SyncManager::new(config.sync.clone(), config.sync_state_path(), events.clone());
    sync.load_state().await?;

    let run_manager = RunManager::new(
        supervisor,
        services,
        store,
        sync.clone(),
        events.clone(),
        config.clone(),
    );
    for template in templates {
        run_manager.register_template(template).await;
    }
    let _pump = run_manager.spawn_event_pump();

    let restored = run_manager.load_state().await?;
    tracing::info!(restored, "run state reconciled against live processes");

    let scheduler = AutoRunScheduler::new(
        run_manager.clone(),
        events.clone(),
        config.auto_run_config_path(),
    );
    let _scheduler_loop = scheduler.spawn_event_loop();
    scheduler.load().await?;

    // Mirror the event bus into the daemon log for operators tailing it.
    let mut bus = events.subscribe();
    let _event_log = tokio::spawn(async move {
        loop {
            match bus.recv().await {
                Ok(event) => match serde_json::to_string(&event) {
                    Ok(json) => tracing::info!(target: "events", "{json}"),
                    Err(_) => tracing::info!(target: "events", ?event),
                },
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    tracing::warn!(missed, "event log lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return,
            }
        }
    });

    tracing::info!("orchestrator up; waiting for shutdown signal");
    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");

    // Stop timers first so nothing schedules into the teardown, then stop
    // active runs (final syncs included), then the sync timers.
    scheduler.shutdown().await;
    run_manager.shutdown().await;
    sync.shutdown().await;

    Ok(())
}

/// File-based tracing under the logs root; the guard must live for the
/// program's duration.
fn setup_logging(config: &OrchestratorConfig) -> tracing_appender::non_blocking::WorkerGuard {
    let file_appender =
        tracing_appender::rolling::daily(&config.logs_root, "eo-daemon.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::fmt()
        .with_writer(non_blocking)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_ansi(false)
        .init();

    guard
}

/// Parse every `*.template.json` under the working root. Template parsing
/// proper lives outside the core; this reads the already-distilled form.
fn load_templates(config: &OrchestratorConfig) -> Vec<eo_core::models::Template> {
    let mut templates = Vec::new();
    let Ok(entries) = std::fs::read_dir(&config.working_root) else {
        return templates;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
        if !name.ends_with(".template.json") {
            continue;
        }
        match std::fs::read_to_string(&path)
            .map_err(|e| e.to_string())
            .and_then(|text| serde_json::from_str(&text).map_err(|e| e.to_string()))
        {
            Ok(template) => templates.push(template),
            Err(e) => eprintln!("skipping template {}: {e}", path.display()),
        }
    }
    templates
}
