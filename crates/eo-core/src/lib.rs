//! Orchestrator core for long-running evolutionary-search runs.
//!
//! Each run pairs one long-lived compute process with a heterogeneous
//! cluster of auxiliary services (variation, rendering, feature extraction,
//! projection, quality, archive). The core starts, monitors, pauses,
//! resumes, and terminates those processes; allocates collision-free port
//! intervals; time-slices auto-scheduled runs across configured templates;
//! and mirrors each run's working set to a central replica.
//!
//! The control surface is an external adapter over [`services::RunManager`],
//! [`services::AutoRunScheduler`], and the [`services::EventBus`].

pub mod error;
pub mod models;
pub mod services;

pub use error::{OrchestratorError, Result};
