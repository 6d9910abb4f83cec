//! Deterministic in-process engine.
//!
//! [`ScriptedEngine`] answers every command from a fixed [`Script`]: constant
//! coefficients, a constant final residual, and optional injected faults.
//! It backs the `demo` and `simulate` commands and every test that needs an
//! engine. Real solver bindings implement [`SolverEngine`] in their own crate.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use super::{CommandKind, EngineCommand, EngineLauncher, SolverEngine, Telemetry};
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::state_machine::Job;

/// Callback invoked with the job name before each command runs.
#[derive(Clone)]
pub struct CommandHook(Arc<dyn Fn(&str, &EngineCommand) + Send + Sync>);

impl CommandHook {
    pub fn new(f: impl Fn(&str, &EngineCommand) + Send + Sync + 'static) -> Self {
        Self(Arc::new(f))
    }
}

impl fmt::Debug for CommandHook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("CommandHook(..)")
    }
}

/// Fixed answers and injected faults for one engine session.
#[derive(Debug, Clone)]
pub struct Script {
    pub drag_coefficient: f64,
    pub lift_coefficient: f64,
    /// Area reported by a projected-area query, whatever the zones.
    pub zone_area: f64,
    /// Continuity residual reported after every successful iterate.
    pub final_continuity: f64,
    /// Wall-clock time spent per 1000 iterations.
    pub pace: Option<Duration>,
    recoverable_failures: HashMap<CommandKind, u32>,
    hard_failures: HashSet<CommandKind>,
    diverge_on_iterate: HashSet<u32>,
    spike_on_iterate: HashSet<u32>,
    hook: Option<CommandHook>,
}

impl Default for Script {
    fn default() -> Self {
        Self {
            drag_coefficient: 0.92,
            lift_coefficient: -2.35,
            zone_area: 0.5625,
            final_continuity: 3.2e-5,
            pace: None,
            recoverable_failures: HashMap::new(),
            hard_failures: HashSet::new(),
            diverge_on_iterate: HashSet::new(),
            spike_on_iterate: HashSet::new(),
            hook: None,
        }
    }
}

impl Script {
    /// A session that converges on the first attempt.
    pub fn converging() -> Self {
        Self::default()
    }

    pub fn with_coefficients(mut self, drag: f64, lift: f64) -> Self {
        self.drag_coefficient = drag;
        self.lift_coefficient = lift;
        self
    }

    pub fn with_zone_area(mut self, area: f64) -> Self {
        self.zone_area = area;
        self
    }

    pub fn with_final_continuity(mut self, continuity: f64) -> Self {
        self.final_continuity = continuity;
        self
    }

    pub fn with_pace(mut self, per_thousand_iterations: Duration) -> Self {
        self.pace = Some(per_thousand_iterations);
        self
    }

    /// `kind` fails recoverably `times` times before succeeding.
    pub fn fail_recoverably(mut self, kind: CommandKind, times: u32) -> Self {
        self.recoverable_failures.insert(kind, times);
        self
    }

    /// `kind` always fails, non-recoverably.
    pub fn fail_hard(mut self, kind: CommandKind) -> Self {
        self.hard_failures.insert(kind);
        self
    }

    /// The `n`-th iterate call of the session (1-based) raises a divergence fault.
    pub fn diverge_on_iterate(mut self, n: u32) -> Self {
        self.diverge_on_iterate.insert(n);
        self
    }

    /// The `n`-th iterate call completes but leaves a blown-up residual.
    pub fn spike_on_iterate(mut self, n: u32) -> Self {
        self.spike_on_iterate.insert(n);
        self
    }

    pub fn with_hook(mut self, hook: CommandHook) -> Self {
        self.hook = Some(hook);
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct JournalEntry {
    pub job: String,
    pub command: EngineCommand,
}

/// Every command issued to scripted sessions, shared across launches.
#[derive(Debug, Clone, Default)]
pub struct Journal(Arc<Mutex<Vec<JournalEntry>>>);

impl Journal {
    fn record(&self, job: &str, command: &EngineCommand) {
        let mut entries = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        entries.push(JournalEntry {
            job: job.to_string(),
            command: command.clone(),
        });
    }

    pub fn entries(&self) -> Vec<JournalEntry> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn commands_for(&self, job: &str) -> Vec<EngineCommand> {
        self.entries()
            .into_iter()
            .filter(|e| e.job == job)
            .map(|e| e.command)
            .collect()
    }

    /// Job names in the order their first command was issued.
    pub fn job_order(&self) -> Vec<String> {
        let mut order: Vec<String> = Vec::new();
        for entry in self.entries() {
            if order.last() != Some(&entry.job) {
                order.push(entry.job);
            }
        }
        order
    }
}

pub struct ScriptedEngine {
    job: String,
    script: Script,
    journal: Journal,
    telemetry: Telemetry,
    iterate_calls: u32,
    failures_left: HashMap<CommandKind, u32>,
    artifacts: Vec<PathBuf>,
    processors: usize,
}

impl ScriptedEngine {
    pub fn new(job: impl Into<String>, script: Script, journal: Journal) -> Self {
        let failures_left = script.recoverable_failures.clone();
        Self {
            job: job.into(),
            script,
            journal,
            telemetry: Telemetry::default(),
            iterate_calls: 0,
            failures_left,
            artifacts: Vec::new(),
            processors: 1,
        }
    }

    /// Processor count the session was launched with.
    pub fn with_processors(mut self, processors: usize) -> Self {
        self.processors = processors.max(1);
        self
    }

    pub fn processors(&self) -> usize {
        self.processors
    }

    fn iterate(&mut self, count: u64) -> Result<(), EngineError> {
        self.iterate_calls += 1;
        if let Some(pace) = self.script.pace {
            std::thread::sleep(pace.mul_f64(count as f64 / 1000.0));
        }
        if self.script.diverge_on_iterate.contains(&self.iterate_calls) {
            self.telemetry.iteration += count / 2;
            self.telemetry.continuity = Some(f64::NAN);
            return Err(EngineError::Divergence {
                iteration: self.telemetry.iteration,
                message: "floating point exception".into(),
            });
        }
        self.telemetry.iteration += count;
        self.telemetry.continuity = if self.script.spike_on_iterate.contains(&self.iterate_calls) {
            Some(12.5)
        } else {
            Some(self.script.final_continuity)
        };
        Ok(())
    }
}

impl SolverEngine for ScriptedEngine {
    fn execute(&mut self, command: &EngineCommand) -> Result<(), EngineError> {
        self.journal.record(&self.job, command);
        if let Some(hook) = &self.script.hook {
            (hook.0)(&self.job, command);
        }

        let kind = command.kind();
        if self.script.hard_failures.contains(&kind) {
            return Err(EngineError::Command {
                command: kind.to_string(),
                message: "rejected by engine".into(),
                recoverable: false,
            });
        }
        if let Some(left) = self.failures_left.get_mut(&kind)
            && *left > 0
        {
            *left -= 1;
            return Err(EngineError::Command {
                command: kind.to_string(),
                message: "transient engine warning".into(),
                recoverable: true,
            });
        }

        match command {
            EngineCommand::Iterate { count } => self.iterate(*count)?,
            EngineCommand::InitializeSolution => self.telemetry.continuity = None,
            EngineCommand::ReadForceCoefficients => {
                self.telemetry.drag_coefficient = Some(self.script.drag_coefficient);
                self.telemetry.lift_coefficient = Some(self.script.lift_coefficient);
            }
            EngineCommand::ComputeProjectedArea { .. } => {
                self.telemetry.projected_area = Some(self.script.zone_area);
            }
            _ => {}
        }

        if let Some(path) = command.output_path() {
            self.artifacts.push(path.clone());
        }
        Ok(())
    }

    fn telemetry(&self) -> Telemetry {
        self.telemetry.clone()
    }

    fn take_artifacts(&mut self) -> Vec<PathBuf> {
        std::mem::take(&mut self.artifacts)
    }
}

/// Launches [`ScriptedEngine`] sessions, optionally with a per-job script.
#[derive(Debug, Clone, Default)]
pub struct ScriptedLauncher {
    default: Script,
    per_job: HashMap<String, Script>,
    unavailable: HashSet<String>,
    journal: Journal,
}

impl ScriptedLauncher {
    pub fn new(default: Script) -> Self {
        Self {
            default,
            ..Default::default()
        }
    }

    pub fn with_job_script(mut self, job: impl Into<String>, script: Script) -> Self {
        self.per_job.insert(job.into(), script);
        self
    }

    /// No session can be acquired for `job`.
    pub fn with_unavailable(mut self, job: impl Into<String>) -> Self {
        self.unavailable.insert(job.into());
        self
    }

    pub fn journal(&self) -> Journal {
        self.journal.clone()
    }
}

impl EngineLauncher for ScriptedLauncher {
    type Session = ScriptedEngine;

    fn launch(&mut self, job: &Job, config: &EngineConfig) -> Result<ScriptedEngine, EngineError> {
        if self.unavailable.contains(&job.name) {
            return Err(EngineError::Unavailable(format!(
                "no solver license free for {}",
                job.name
            )));
        }
        let script = self
            .per_job
            .get(&job.name)
            .cloned()
            .unwrap_or_else(|| self.default.clone());
        Ok(ScriptedEngine::new(job.name.clone(), script, self.journal.clone())
            .with_processors(config.processor_count))
    }
}
