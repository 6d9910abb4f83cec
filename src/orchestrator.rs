use std::sync::Arc;

use tokio::sync::mpsc::UnboundedReceiver;
use tracing::info;

use crate::config::AeroConfig;
use crate::engine::EngineLauncher;
use crate::error::AeroError;
use crate::pipeline::PipelineCatalog;
use crate::queue::{CancelOutcome, QueueManager};
use crate::state_machine::{Job, JobId, JobSpec, JobSummary};
use crate::worker::{EventSink, ExecutionWorker, WorkerEvent};

/// Control-surface facade: owns the queue and the execution worker.
///
/// Every method is safe to call while a job is running. Progress arrives
/// only through the event receiver returned by [`JobOrchestrator::start`].
pub struct JobOrchestrator {
    queue: Arc<QueueManager>,
    config: Arc<AeroConfig>,
    worker: Option<ExecutionWorker>,
}

impl JobOrchestrator {
    /// Validates the configuration, builds one pipeline definition per
    /// variant and starts the execution worker.
    pub fn start<L: EngineLauncher>(
        config: AeroConfig,
        launcher: L,
    ) -> Result<(Self, UnboundedReceiver<WorkerEvent>), AeroError> {
        config.validate()?;
        let catalog = Arc::new(PipelineCatalog::from_config(&config)?);
        let config = Arc::new(config);
        let queue = Arc::new(QueueManager::new());
        let (events, rx) = EventSink::channel();

        let worker = ExecutionWorker::spawn(
            Arc::clone(&queue),
            catalog,
            Arc::clone(&config),
            launcher,
            events,
        )?;
        info!(output_root = %config.output_root.display(), "orchestrator started");

        Ok((
            Self {
                queue,
                config,
                worker: Some(worker),
            },
            rx,
        ))
    }

    pub fn enqueue(&self, spec: JobSpec) -> Result<JobId, AeroError> {
        spec.validate()?;
        self.queue.enqueue(Job::new(spec, &self.config.output_root))
    }

    pub fn cancel(&self, id: JobId) -> Result<CancelOutcome, AeroError> {
        self.queue.cancel(id)
    }

    /// Drops all queued jobs and stops the running one at its next boundary.
    pub fn cancel_all(&self) -> usize {
        self.queue.cancel_all()
    }

    pub fn retry(&self, id: JobId) -> Result<JobId, AeroError> {
        self.queue.retry(id)
    }

    pub fn status(&self) -> Vec<JobSummary> {
        self.queue.current_status()
    }

    pub fn job(&self, id: JobId) -> Option<Job> {
        self.queue.get(id)
    }

    /// Stops accepting jobs; the worker exits once the queue drains.
    pub fn close(&self) {
        self.queue.close();
    }

    /// Closes the queue and waits for the worker to finish what is queued.
    pub fn join(mut self) -> Result<(), AeroError> {
        self.queue.close();
        match self.worker.take() {
            Some(worker) => worker.join(),
            None => Ok(()),
        }
    }
}

impl Drop for JobOrchestrator {
    fn drop(&mut self) {
        self.queue.close();
    }
}
