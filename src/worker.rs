//! Execution worker: the thread that owns the engine session.
//!
//! The worker pulls one job at a time from the [`QueueManager`], launches an
//! engine session for it and walks the job's pipeline stage by stage. It
//! talks to the control surface only through [`WorkerEvent`]s sent on an
//! unbounded channel, so a slow or absent consumer never stalls a solve.

use std::fmt;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use chrono::Utc;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, error, info, warn};

use crate::config::AeroConfig;
use crate::engine::{EngineLauncher, SolverEngine};
use crate::error::{AeroError, FailureKind};
use crate::executor::{StageExecutor, StageOutcome};
use crate::pipeline::{PipelineCatalog, PipelineDefinition, StageKind, Variant};
use crate::queue::{CancelFlag, Dispatch, QueueManager};
use crate::report;
use crate::state_machine::{AuditRecord, Job, JobId, JobStatus, StageRecord};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogLevel::Info => write!(f, "INFO"),
            LogLevel::Warn => write!(f, "WARN"),
            LogLevel::Error => write!(f, "ERROR"),
        }
    }
}

/// Everything the worker reports to the control surface.
#[derive(Debug, Clone)]
pub enum WorkerEvent {
    Log {
        job: Option<JobId>,
        level: LogLevel,
        message: String,
    },
    JobStarted {
        job: JobId,
        name: String,
        variant: Variant,
        attempt: u32,
    },
    StageStarted {
        job: JobId,
        stage: String,
        kind: StageKind,
        /// 1-based position in the pipeline.
        index: usize,
        total: usize,
    },
    StageFinished {
        job: JobId,
        record: StageRecord,
    },
    RampSubStage {
        job: JobId,
        index: usize,
        target_iterations: u64,
        curvature_correction: bool,
    },
    RampRestart {
        job: JobId,
        restart: u32,
        reason: String,
    },
    JobFinished(AuditRecord),
}

impl WorkerEvent {
    pub fn job(&self) -> Option<JobId> {
        match self {
            WorkerEvent::Log { job, .. } => *job,
            WorkerEvent::JobStarted { job, .. }
            | WorkerEvent::StageStarted { job, .. }
            | WorkerEvent::StageFinished { job, .. }
            | WorkerEvent::RampSubStage { job, .. }
            | WorkerEvent::RampRestart { job, .. } => Some(*job),
            WorkerEvent::JobFinished(record) => Some(record.job_id),
        }
    }
}

/// Sending half of the event channel. Every log line also goes to `tracing`.
#[derive(Debug, Clone)]
pub struct EventSink(UnboundedSender<WorkerEvent>);

impl EventSink {
    pub fn channel() -> (Self, UnboundedReceiver<WorkerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self(tx), rx)
    }

    /// Never blocks. Events are dropped once the receiver is gone.
    pub fn emit(&self, event: WorkerEvent) {
        if self.0.send(event).is_err() {
            debug!("event receiver dropped");
        }
    }

    pub fn log(&self, job: Option<JobId>, level: LogLevel, message: impl Into<String>) {
        let message = message.into();
        let job_field = job.map(|j| j.to_string()).unwrap_or_default();
        match level {
            LogLevel::Info => info!(job = %job_field, "{message}"),
            LogLevel::Warn => warn!(job = %job_field, "{message}"),
            LogLevel::Error => error!(job = %job_field, "{message}"),
        }
        self.emit(WorkerEvent::Log {
            job,
            level,
            message,
        });
    }

    pub fn info(&self, job: Option<JobId>, message: impl Into<String>) {
        self.log(job, LogLevel::Info, message);
    }

    pub fn warn(&self, job: Option<JobId>, message: impl Into<String>) {
        self.log(job, LogLevel::Warn, message);
    }

    pub fn error(&self, job: Option<JobId>, message: impl Into<String>) {
        self.log(job, LogLevel::Error, message);
    }
}

/// Walks one job through its pipeline against an already launched session.
pub struct JobRunner<'a> {
    config: &'a AeroConfig,
    events: &'a EventSink,
    queue: Option<&'a QueueManager>,
}

impl<'a> JobRunner<'a> {
    pub fn new(config: &'a AeroConfig, events: &'a EventSink) -> Self {
        Self {
            config,
            events,
            queue: None,
        }
    }

    /// Mirror stage progress into `queue` as the job advances.
    pub fn with_queue(mut self, queue: &'a QueueManager) -> Self {
        self.queue = Some(queue);
        self
    }

    /// Runs every stage of `definition` in order and leaves `job` terminal.
    /// Cancellation is honoured between stages and inside the ramp.
    pub fn run<E: SolverEngine + ?Sized>(
        &self,
        job: &mut Job,
        definition: &PipelineDefinition,
        engine: &mut E,
        cancel: &CancelFlag,
    ) -> Result<(), AeroError> {
        let executor = StageExecutor::new(self.config, self.events, cancel);
        let total = definition.stages.len();

        for (i, stage) in definition.stages.iter().enumerate() {
            if cancel.is_cancelled() {
                return self.cancelled(job, &stage.name);
            }
            self.events.emit(WorkerEvent::StageStarted {
                job: job.id,
                stage: stage.name.clone(),
                kind: stage.kind,
                index: i + 1,
                total,
            });
            info!(job = %job.id, stage = %stage.name, kind = %stage.kind, "stage started");
            let started_at = Utc::now();

            match executor.execute(job, stage, engine) {
                StageOutcome::Completed(artifacts) => {
                    let record = executor.record(job, stage, artifacts, started_at);
                    if let Some(note) = &record.note {
                        self.events.info(Some(job.id), format!("{}: {note}", stage.name));
                    }
                    self.events.emit(WorkerEvent::StageFinished {
                        job: job.id,
                        record,
                    });
                    if let Some(queue) = self.queue {
                        queue.sync(job);
                    }
                }
                StageOutcome::Cancelled => return self.cancelled(job, &stage.name),
                StageOutcome::Failed(kind, reason) => {
                    if cancel.is_cancelled() {
                        self.events
                            .warn(Some(job.id), format!("{reason} (cancellation pending)"));
                        return self.cancelled(job, &stage.name);
                    }
                    self.events
                        .error(Some(job.id), format!("job failed: {kind}: {reason}"));
                    return job.fail(kind, reason);
                }
            }
        }

        if self.settle(job, cancel)? == JobStatus::Cancelled {
            self.events
                .warn(Some(job.id), "job cancelled at stage boundary (report)");
            return Ok(());
        }
        if !job.converged() {
            self.events.warn(
                Some(job.id),
                "job finished with a non-converged solution; results are flagged in the report",
            );
        }
        self.events.info(Some(job.id), "job succeeded");
        Ok(())
    }

    fn settle(&self, job: &mut Job, cancel: &CancelFlag) -> Result<JobStatus, AeroError> {
        if let Some(queue) = self.queue {
            return queue.settle(job, cancel);
        }
        let status = if cancel.is_cancelled() {
            JobStatus::Cancelled
        } else {
            JobStatus::Succeeded
        };
        job.transition(status)?;
        Ok(status)
    }

    fn cancelled(&self, job: &mut Job, at: &str) -> Result<(), AeroError> {
        job.transition(JobStatus::Cancelled)?;
        self.events
            .warn(Some(job.id), format!("job cancelled at stage boundary ({at})"));
        Ok(())
    }
}

/// Handle to the dedicated execution thread.
pub struct ExecutionWorker {
    handle: Option<JoinHandle<()>>,
}

impl ExecutionWorker {
    /// Starts the dispatch loop on its own thread. The loop ends once the
    /// queue is closed and drained.
    pub fn spawn<L: EngineLauncher>(
        queue: Arc<QueueManager>,
        catalog: Arc<PipelineCatalog>,
        config: Arc<AeroConfig>,
        launcher: L,
        events: EventSink,
    ) -> Result<Self, AeroError> {
        let handle = thread::Builder::new()
            .name("aero-worker".to_string())
            .spawn(move || Self::run_loop(&queue, &catalog, &config, launcher, &events))?;
        debug!("execution worker started");
        Ok(Self {
            handle: Some(handle),
        })
    }

    fn run_loop<L: EngineLauncher>(
        queue: &QueueManager,
        catalog: &PipelineCatalog,
        config: &AeroConfig,
        mut launcher: L,
        events: &EventSink,
    ) {
        while let Some(Dispatch { mut job, cancel }) = queue.next_job() {
            Self::process(catalog, config, &mut launcher, events, queue, &mut job, &cancel);
            queue.sync(&job);

            if let Err(e) = report::append_summary(&config.output_root, &job) {
                events.warn(Some(job.id), format!("could not update batch summary: {e}"));
            }
            let record = AuditRecord::from_job(&job);
            info!(job = %job.id, name = %job.name, status = %job.status, "job finished");
            queue.complete(job);
            events.emit(WorkerEvent::JobFinished(record));
        }
        debug!("execution worker stopped");
    }

    fn process<L: EngineLauncher>(
        catalog: &PipelineCatalog,
        config: &AeroConfig,
        launcher: &mut L,
        events: &EventSink,
        queue: &QueueManager,
        job: &mut Job,
        cancel: &CancelFlag,
    ) {
        events.emit(WorkerEvent::JobStarted {
            job: job.id,
            name: job.name.clone(),
            variant: job.variant,
            attempt: job.attempt,
        });
        events.info(
            Some(job.id),
            format!("running {} ({}, attempt {})", job.name, job.variant, job.attempt),
        );

        let result = match catalog.get(job.variant) {
            None => {
                let reason = format!("no pipeline definition for {}", job.variant);
                events.error(Some(job.id), reason.clone());
                job.fail(FailureKind::StageFailure, reason)
            }
            Some(_) if cancel.is_cancelled() => {
                events.warn(Some(job.id), "job cancelled before engine launch");
                job.transition(JobStatus::Cancelled)
            }
            Some(definition) => match launcher.launch(job, &config.engine) {
                Ok(mut session) => JobRunner::new(config, events)
                    .with_queue(queue)
                    .run(job, &definition, &mut session, cancel),
                Err(e) => {
                    let kind = FailureKind::of(&e).escalated();
                    events.error(Some(job.id), format!("job failed: {kind}: {e}"));
                    job.fail(kind, e.to_string())
                }
            },
        };

        if let Err(e) = result {
            events.error(Some(job.id), format!("lifecycle error: {e}"));
        }
    }

    /// Waits for the dispatch loop to end. Close the queue first.
    pub fn join(mut self) -> Result<(), AeroError> {
        match self.handle.take() {
            Some(handle) => handle.join().map_err(|_| AeroError::WorkerPanicked),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::scripted::{CommandHook, Journal, Script, ScriptedEngine};
    use crate::engine::{CommandKind, EngineCommand};
    use crate::pipeline::Dimensions;
    use crate::queue::CancelOutcome;
    use crate::state_machine::JobSpec;
    use std::path::PathBuf;

    fn job(name: &str, variant: Variant, root: &std::path::Path) -> Job {
        let mut job = Job::new(
            JobSpec {
                name: name.into(),
                geometry: PathBuf::from("geom.pmdb"),
                variant,
                dimensions: Dimensions::new(2.0, 1.4, 0.5),
                output_dir: None,
            },
            root,
        );
        job.transition(JobStatus::Running).unwrap();
        job
    }

    fn drain(rx: &mut UnboundedReceiver<WorkerEvent>) -> Vec<WorkerEvent> {
        let mut events = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            events.push(ev);
        }
        events
    }

    #[test]
    fn runner_completes_every_stage() {
        let dir = tempfile::tempdir().unwrap();
        let config = AeroConfig::default();
        let (sink, mut rx) = EventSink::channel();
        let definition = PipelineDefinition::for_variant(Variant::RearWing, &config).unwrap();
        let mut job = job("rw", Variant::RearWing, dir.path());
        let mut engine = ScriptedEngine::new("rw", Script::converging(), Journal::default());

        JobRunner::new(&config, &sink)
            .run(&mut job, &definition, &mut engine, &CancelFlag::default())
            .unwrap();

        assert_eq!(job.status, JobStatus::Succeeded);
        assert_eq!(job.stage_names(), definition.stage_names());
        assert!(job.converged());
        assert!(job.output_dir.join(report::REPORT_FILE).exists());

        let started = drain(&mut rx)
            .into_iter()
            .filter(|e| matches!(e, WorkerEvent::StageStarted { .. }))
            .count();
        assert_eq!(started, definition.stages.len());
    }

    #[test]
    fn runner_publishes_success_before_completion() {
        let dir = tempfile::tempdir().unwrap();
        let config = AeroConfig::default();
        let (sink, _rx) = EventSink::channel();
        let definition = PipelineDefinition::for_variant(Variant::RearWing, &config).unwrap();
        let queue = QueueManager::new();
        let spec = JobSpec {
            name: "rw".into(),
            geometry: PathBuf::from("geom.pmdb"),
            variant: Variant::RearWing,
            dimensions: Dimensions::new(2.0, 1.4, 0.5),
            output_dir: None,
        };
        let id = queue.enqueue(Job::new(spec, dir.path())).unwrap();
        let Dispatch { mut job, cancel } = queue.try_next_job().unwrap();
        let mut engine = ScriptedEngine::new("rw", Script::converging(), Journal::default());

        JobRunner::new(&config, &sink)
            .with_queue(&queue)
            .run(&mut job, &definition, &mut engine, &cancel)
            .unwrap();

        assert_eq!(job.status, JobStatus::Succeeded);
        assert_eq!(queue.get(id).unwrap().status, JobStatus::Succeeded);
        assert!(matches!(
            queue.cancel(id).unwrap(),
            CancelOutcome::AlreadyFinished(JobStatus::Succeeded)
        ));
        assert!(!cancel.is_cancelled());
    }

    #[test]
    fn cancel_during_stage_finishes_stage_then_stops() {
        let dir = tempfile::tempdir().unwrap();
        let config = AeroConfig::default();
        let (sink, _rx) = EventSink::channel();
        let definition = PipelineDefinition::for_variant(Variant::FrontWing, &config).unwrap();
        let mut job = job("fw", Variant::FrontWing, dir.path());

        let cancel = CancelFlag::default();
        let trigger = cancel.clone();
        let script = Script::converging().with_hook(CommandHook::new(move |_, command| {
            if matches!(command, EngineCommand::ReadMesh { .. }) {
                trigger.cancel();
            }
        }));
        let journal = Journal::default();
        let mut engine = ScriptedEngine::new("fw", script, journal.clone());

        JobRunner::new(&config, &sink)
            .run(&mut job, &definition, &mut engine, &cancel)
            .unwrap();

        assert_eq!(job.status, JobStatus::Cancelled);
        assert_eq!(
            job.stage_names(),
            vec!["import-geometry", "volume-mesh", "solver-setup"]
        );
        assert!(
            !journal
                .commands_for("fw")
                .iter()
                .any(|c| c.kind() == CommandKind::Iterate)
        );
    }

    #[test]
    fn failed_stage_marks_job_failed_with_reason() {
        let dir = tempfile::tempdir().unwrap();
        let config = AeroConfig::default();
        let (sink, mut rx) = EventSink::channel();
        let definition = PipelineDefinition::for_variant(Variant::Undertray, &config).unwrap();
        let mut job = job("ut", Variant::Undertray, dir.path());
        let mut engine = ScriptedEngine::new(
            "ut",
            Script::converging().fail_hard(CommandKind::AddWheelRefinement),
            Journal::default(),
        );

        JobRunner::new(&config, &sink)
            .run(&mut job, &definition, &mut engine, &CancelFlag::default())
            .unwrap();

        assert_eq!(job.status, JobStatus::Failed);
        let failure = job.error.clone().unwrap();
        assert_eq!(failure.kind, FailureKind::StageFailure);
        assert!(failure.reason.starts_with("wheel-refinement:"));
        assert_eq!(job.stage_names(), vec!["import-geometry"]);

        let errors = drain(&mut rx)
            .into_iter()
            .filter(|e| matches!(e, WorkerEvent::Log { level: LogLevel::Error, .. }))
            .count();
        assert_eq!(errors, 1);
    }

    #[test]
    fn stage_failure_while_cancelling_resolves_to_cancelled() {
        let dir = tempfile::tempdir().unwrap();
        let config = AeroConfig::default();
        let (sink, _rx) = EventSink::channel();
        let definition = PipelineDefinition::for_variant(Variant::RearWing, &config).unwrap();
        let mut job = job("rw", Variant::RearWing, dir.path());

        let cancel = CancelFlag::default();
        let trigger = cancel.clone();
        let script = Script::converging()
            .fail_hard(CommandKind::GenerateVolumeMesh)
            .with_hook(CommandHook::new(move |_, command| {
                if command.kind() == CommandKind::GenerateVolumeMesh {
                    trigger.cancel();
                }
            }));
        let mut engine = ScriptedEngine::new("rw", script, Journal::default());

        JobRunner::new(&config, &sink)
            .run(&mut job, &definition, &mut engine, &cancel)
            .unwrap();
        assert_eq!(job.status, JobStatus::Cancelled);
        assert!(job.error.is_none());
    }

    #[test]
    fn event_sink_survives_dropped_receiver() {
        let (sink, rx) = EventSink::channel();
        drop(rx);
        sink.warn(None, "nobody is listening");
    }
}
