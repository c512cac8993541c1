pub mod allocation;
pub mod config;
pub mod run;
pub mod scheduler;
pub mod sync;
pub mod template;

pub use allocation::{PortAllocation, PORT_RANGE_BASE, PORT_RANGE_CEILING, PORT_RANGE_SIZE};
pub use config::{OrchestratorConfig, RunOptions, SyncSettings};
pub use run::{
    compute_process_name, run_id_of_process, ProcessStats, Run, RunProgress, RunStatus,
    ServiceInfo, ServiceStartStatus, ServiceStatusEntry, COMPUTE_NAME_PREFIX,
    SERVICE_NAME_SEPARATOR,
};
pub use scheduler::{AutoRunConfig, SchedulerMode, TemplateSlot};
pub use sync::{SyncErrorRecord, SyncState, SYNC_ERROR_RING_CAPACITY};
pub use template::{
    ClassConfiguration, Classifier, CmaMaeConfig, EcosystemVariant, ExecMode, RunConfig,
    ServiceDefinition, ServiceKind, Template,
};
