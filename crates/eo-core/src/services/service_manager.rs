use std::sync::Arc;

use tokio::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::error::{OrchestratorError, Result};
use crate::models::{
    EcosystemVariant, OrchestratorConfig, RunConfig, ServiceInfo, ServiceKind, ServiceStartStatus,
    ServiceStatusEntry, SERVICE_NAME_SEPARATOR,
};

use super::ports::PortAllocator;
use super::resolver::{self, ResolvedService};
use super::supervisor::{ProcessState, ProcessSupervisor};

/// The cluster brought up for a run, plus the compute config rewritten to
/// point at it.
#[derive(Debug)]
pub struct StartedServices {
    pub info: ServiceInfo,
    pub injected_config: RunConfig,
}

/// Brings a run's auxiliary service cluster up and down: allocates the port
/// interval, resolves the service graph, starts everything, gates on
/// readiness, and unwinds fully on any failure.
pub struct ServiceDependencyManager {
    supervisor: Arc<dyn ProcessSupervisor>,
    ports: Arc<PortAllocator>,
    config: OrchestratorConfig,
}

impl ServiceDependencyManager {
    pub fn new(
        supervisor: Arc<dyn ProcessSupervisor>,
        ports: Arc<PortAllocator>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            supervisor,
            ports,
            config,
        }
    }

    pub fn ports(&self) -> &Arc<PortAllocator> {
        &self.ports
    }

    /// Start every service the run needs and wait until all are online.
    ///
    /// A `None` variant means the template carries no ecosystem: the port
    /// interval is still taken (the run owns it while active) but no
    /// processes start and the config passes through unmodified.
    pub async fn start_services_for_run(
        &self,
        run_id: &str,
        run_config: &RunConfig,
        variant: Option<&EcosystemVariant>,
    ) -> Result<StartedServices> {
        let allocation = self.ports.allocate(run_id)?;

        let Some(variant) = variant else {
            debug!(run_id, "no ecosystem template; run proceeds without services");
            return Ok(StartedServices {
                info: ServiceInfo {
                    allocation,
                    services: Vec::new(),
                    service_urls: Default::default(),
                },
                injected_config: run_config.clone(),
            });
        };

        let resolved = resolver::resolve(run_id, run_config, variant, &allocation, &self.config);

        let mut entries = Vec::new();
        let mut started = Vec::new();
        let mut first_error: Option<OrchestratorError> = None;

        // Start all services in parallel and collect per-service outcomes.
        let mut join_set = tokio::task::JoinSet::new();
        for ResolvedService { kind, spec } in resolved.services {
            let supervisor = self.supervisor.clone();
            let name = spec.name.clone();
            join_set.spawn(async move { (kind, name, supervisor.start(spec).await) });
        }
        while let Some(joined) = join_set.join_next().await {
            let Ok((kind, name, outcome)) = joined else {
                continue;
            };
            match outcome {
                Ok(()) => {
                    started.push(name.clone());
                    entries.push(ServiceStatusEntry {
                        name,
                        kind,
                        status: ServiceStartStatus::Started,
                    });
                }
                Err(e) => {
                    entries.push(ServiceStatusEntry {
                        name,
                        kind,
                        status: ServiceStartStatus::Failed,
                    });
                    first_error.get_or_insert(e);
                }
            }
        }

        if let Some(error) = first_error {
            self.unwind(run_id, &started).await;
            return Err(error);
        }

        if let Err(error) = self.wait_for_readiness(run_id).await {
            self.unwind(run_id, &started).await;
            return Err(error);
        }

        Ok(StartedServices {
            info: ServiceInfo {
                allocation,
                services: entries,
                service_urls: resolved.service_urls,
            },
            injected_config: resolved.injected_config,
        })
    }

    /// Poll the supervisor until every process with the run's suffix is
    /// online. Bounded by the configured readiness timeout.
    async fn wait_for_readiness(&self, run_id: &str) -> Result<()> {
        let deadline =
            Instant::now() + Duration::from_secs(self.config.readiness_timeout_secs);
        let poll = Duration::from_secs(self.config.readiness_poll_secs.max(1));
        let suffix = format!("{SERVICE_NAME_SEPARATOR}{run_id}");

        loop {
            let snapshots = self.supervisor.list().await?;
            let mine: Vec<_> = snapshots
                .iter()
                .filter(|s| s.name.ends_with(&suffix))
                .collect();
            if !mine.is_empty() && mine.iter().all(|s| s.state == ProcessState::Online) {
                return Ok(());
            }
            if mine.iter().any(|s| s.state == ProcessState::Errored) {
                let errored = mine
                    .iter()
                    .find(|s| s.state == ProcessState::Errored)
                    .map(|s| s.name.clone())
                    .unwrap_or_default();
                return Err(OrchestratorError::Supervisor {
                    name: errored,
                    reason: "died during readiness wait".into(),
                });
            }
            if Instant::now() >= deadline {
                return Err(OrchestratorError::ReadinessTimeout(
                    run_id.to_string(),
                    self.config.readiness_timeout_secs,
                ));
            }
            tokio::time::sleep(poll).await;
        }
    }

    /// Best-effort teardown after a failed bring-up. The original error is
    /// surfaced by the caller; failures here only warn.
    async fn unwind(&self, run_id: &str, started: &[String]) {
        for name in started {
            if let Err(e) = self.supervisor.stop(name).await {
                warn!(name = %name, error = %e, "unwind stop failed");
            }
            if let Err(e) = self.supervisor.delete(name).await {
                warn!(name = %name, error = %e, "unwind delete failed");
            }
        }
        self.ports.release(run_id);
    }

    /// Stop and forget every service with the run's suffix, then release the
    /// run's port interval. Best effort throughout.
    pub async fn stop_services_for_run(&self, run_id: &str) -> Result<()> {
        let suffix = format!("{SERVICE_NAME_SEPARATOR}{run_id}");
        let snapshots = self.supervisor.list().await.unwrap_or_default();
        let mut names: Vec<String> = snapshots
            .into_iter()
            .filter(|s| s.name.ends_with(&suffix))
            .map(|s| s.name)
            .collect();
        names.sort();
        names.dedup();

        for name in names {
            if let Err(e) = self.supervisor.stop(&name).await {
                warn!(name = %name, error = %e, "service stop failed");
            }
            if let Err(e) = self.supervisor.delete(&name).await {
                warn!(name = %name, error = %e, "service delete failed");
            }
        }
        self.ports.release(run_id);
        Ok(())
    }

    /// The WebSocket endpoints of one kind inside a live allocation, for
    /// callers that need to re-derive them without a full resolution.
    pub fn urls_for(&self, run_id: &str, kind: ServiceKind, instances: u32) -> Vec<String> {
        match self.ports.allocation_for(run_id) {
            Some(allocation) => (0..instances)
                .map(|i| format!("ws://127.0.0.1:{}", allocation.port_for(kind, i)))
                .collect(),
            None => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::fake_supervisor::FakeSupervisor;

    fn manager(fake: Arc<FakeSupervisor>) -> ServiceDependencyManager {
        ServiceDependencyManager::new(
            fake,
            Arc::new(PortAllocator::new()),
            OrchestratorConfig {
                readiness_timeout_secs: 2,
                readiness_poll_secs: 1,
                ..Default::default()
            },
        )
    }

    #[tokio::test]
    async fn brings_up_cluster_and_reports_started() {
        let fake = Arc::new(FakeSupervisor::new());
        let manager = manager(fake.clone());

        let started = manager
            .start_services_for_run("01J0A", &RunConfig::default(), Some(&EcosystemVariant::default()))
            .await
            .unwrap();

        assert_eq!(started.info.allocation.start, 50000);
        assert_eq!(started.info.services.len(), 2);
        assert!(started
            .info
            .services
            .iter()
            .all(|s| s.status == ServiceStartStatus::Started));
        assert!(fake
            .tracked_names()
            .contains(&"kromosynth-gRPC-variation_01J0A".to_string()));
        assert_eq!(
            started.injected_config.gene_variation_servers,
            vec!["ws://127.0.0.1:50051", "ws://127.0.0.1:50052"]
        );
    }

    #[tokio::test]
    async fn no_variant_is_a_soft_success_with_allocation() {
        let fake = Arc::new(FakeSupervisor::new());
        let manager = manager(fake.clone());

        let started = manager
            .start_services_for_run("01J0A", &RunConfig::default(), None)
            .await
            .unwrap();
        assert!(started.info.services.is_empty());
        assert_eq!(started.info.allocation.start, 50000);
        assert!(fake.tracked_names().is_empty());
        assert!(manager.ports().allocation_for("01J0A").is_some());
    }

    #[tokio::test]
    async fn start_failure_unwinds_everything() {
        let fake = Arc::new(FakeSupervisor::new());
        fake.fail_next_start_of("kromosynth-render_01J0A");
        let manager = manager(fake.clone());

        let result = manager
            .start_services_for_run("01J0A", &RunConfig::default(), Some(&EcosystemVariant::default()))
            .await;
        assert!(result.is_err());
        assert!(fake.tracked_names().is_empty());
        assert!(manager.ports().allocation_for("01J0A").is_none());
    }

    #[tokio::test]
    async fn readiness_timeout_unwinds_and_surfaces() {
        let fake = Arc::new(FakeSupervisor::new());
        fake.hold_at_launching("kromosynth-render_01J0A");
        let manager = manager(fake.clone());

        let result = manager
            .start_services_for_run("01J0A", &RunConfig::default(), Some(&EcosystemVariant::default()))
            .await;
        assert!(matches!(
            result,
            Err(OrchestratorError::ReadinessTimeout(_, _))
        ));
        assert!(fake.tracked_names().is_empty());
        assert!(manager.ports().allocation_for("01J0A").is_none());
    }

    #[tokio::test]
    async fn stop_releases_ports_and_forgets_services() {
        let fake = Arc::new(FakeSupervisor::new());
        let manager = manager(fake.clone());

        manager
            .start_services_for_run("01J0A", &RunConfig::default(), Some(&EcosystemVariant::default()))
            .await
            .unwrap();
        manager.stop_services_for_run("01J0A").await.unwrap();

        assert!(fake.tracked_names().is_empty());
        assert!(manager.ports().allocation_for("01J0A").is_none());

        // Freed interval is reused by the next run.
        let next = manager
            .start_services_for_run("01J0B", &RunConfig::default(), Some(&EcosystemVariant::default()))
            .await
            .unwrap();
        assert_eq!(next.info.allocation.start, 50000);
    }
}
