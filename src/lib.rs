//! Unattended multi-stage CFD job orchestration.
//!
//! Jobs are queued with the [`orchestrator::JobOrchestrator`], run one at a
//! time on a dedicated worker thread against an external solver engine, and
//! report progress over an event channel.

pub mod config;
pub mod engine;
pub mod error;
pub mod executor;
pub mod logging;
pub mod orchestrator;
pub mod pipeline;
pub mod queue;
pub mod report;
pub mod state_machine;
pub mod worker;
