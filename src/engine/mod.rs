//! Boundary to the external CFD solver/mesher.
//!
//! The core only needs four capabilities from an engine session: issue a
//! command and block until it completes or faults, read telemetry, and
//! collect the files it produced. Everything engine-specific (command
//! syntax, journal language, process launch) lives behind [`SolverEngine`]
//! and [`EngineLauncher`].

mod command;
pub mod scripted;

pub use command::{CommandKind, ContourField, EngineCommand, SolverControls};

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::state_machine::Job;

/// Latest values reported by the engine's monitors.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Telemetry {
    /// Total iterations run in this session.
    pub iteration: u64,
    /// Most recent continuity residual, once the solver has iterated.
    pub continuity: Option<f64>,
    pub drag_coefficient: Option<f64>,
    pub lift_coefficient: Option<f64>,
    /// Result of the last projected-area report.
    pub projected_area: Option<f64>,
}

/// One live engine session. Owned by the execution worker for the duration
/// of a single job and never shared.
pub trait SolverEngine {
    /// Issue one command and block until it completes or faults.
    fn execute(&mut self, command: &EngineCommand) -> Result<(), EngineError>;

    /// Snapshot of the engine's monitors.
    fn telemetry(&self) -> Telemetry;

    /// Files written since the last call.
    fn take_artifacts(&mut self) -> Vec<PathBuf>;
}

/// Acquires engine sessions. Lives on the execution worker's thread.
pub trait EngineLauncher: Send + 'static {
    type Session: SolverEngine;

    fn launch(&mut self, job: &Job, config: &EngineConfig) -> Result<Self::Session, EngineError>;
}
