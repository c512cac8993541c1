pub mod events;
pub mod fake_supervisor;
pub mod local_supervisor;
pub mod ports;
pub mod progress;
pub mod resolver;
pub mod run_manager;
pub mod run_store;
pub mod scheduler;
pub mod service_manager;
pub mod supervisor;
pub mod sync;
pub mod workdir;

pub use events::{EventBus, OrchestratorEvent};
pub use fake_supervisor::FakeSupervisor;
pub use local_supervisor::LocalSupervisor;
pub use ports::PortAllocator;
pub use run_manager::RunManager;
pub use run_store::RunStateStore;
pub use scheduler::AutoRunScheduler;
pub use service_manager::ServiceDependencyManager;
pub use supervisor::{
    ProcessSnapshot, ProcessSpec, ProcessState, ProcessSupervisor, StreamKind, SupervisorEvent,
};
pub use sync::SyncManager;
