//! FIFO job queue shared between the control surface and the execution worker.
//!
//! All job state lives in one list behind one mutex. The control surface
//! enqueues, cancels and reads summaries; the worker blocks in
//! [`QueueManager::next_job`] until a job is queued and writes progress back
//! with [`QueueManager::sync`] and [`QueueManager::complete`]. Only one job is
//! dispatched at a time.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

use tracing::{debug, info};

use crate::error::AeroError;
use crate::state_machine::{Job, JobId, JobStatus, JobSummary};

/// Cooperative cancellation flag for the running job.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// A job handed to the worker, already marked `Running`.
#[derive(Debug)]
pub struct Dispatch {
    pub job: Job,
    pub cancel: CancelFlag,
}

#[derive(Debug, Clone)]
pub enum CancelOutcome {
    /// The job was still queued and has been dropped from the queue.
    Removed(Box<Job>),
    /// The job is running; it stops at the next stage boundary.
    Requested,
    AlreadyFinished(JobStatus),
}

#[derive(Debug, Default)]
struct QueueState {
    /// Every job in submission order, finished ones included.
    jobs: Vec<Job>,
    running: Option<(JobId, CancelFlag)>,
    closed: bool,
}

impl QueueState {
    fn position(&self, id: JobId) -> Option<usize> {
        self.jobs.iter().position(|j| j.id == id)
    }
}

#[derive(Debug, Default)]
pub struct QueueManager {
    state: Mutex<QueueState>,
    ready: Condvar,
}

impl QueueManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Appends a job at the tail.
    pub fn enqueue(&self, job: Job) -> Result<JobId, AeroError> {
        let mut state = self.lock();
        if state.closed {
            return Err(AeroError::QueueClosed);
        }
        let id = job.id;
        info!(job = %id, name = %job.name, variant = %job.variant, "job queued");
        state.jobs.push(job);
        self.ready.notify_all();
        Ok(id)
    }

    pub fn cancel(&self, id: JobId) -> Result<CancelOutcome, AeroError> {
        let mut state = self.lock();
        let pos = state.position(id).ok_or(AeroError::JobNotFound(id))?;
        match state.jobs[pos].status {
            JobStatus::Queued => {
                let job = state.jobs.remove(pos);
                info!(job = %id, name = %job.name, "queued job removed");
                Ok(CancelOutcome::Removed(Box::new(job)))
            }
            JobStatus::Running => {
                if let Some((running, flag)) = &state.running
                    && *running == id
                {
                    flag.cancel();
                }
                info!(job = %id, "cancellation requested for running job");
                Ok(CancelOutcome::Requested)
            }
            status => Ok(CancelOutcome::AlreadyFinished(status)),
        }
    }

    /// Drops every queued job and asks the running one to stop.
    pub fn cancel_all(&self) -> usize {
        let mut state = self.lock();
        let before = state.jobs.len();
        state.jobs.retain(|j| j.status != JobStatus::Queued);
        if let Some((_, flag)) = &state.running {
            flag.cancel();
        }
        before - state.jobs.len()
    }

    /// Queues a fresh attempt of a failed or cancelled job.
    pub fn retry(&self, id: JobId) -> Result<JobId, AeroError> {
        let mut state = self.lock();
        if state.closed {
            return Err(AeroError::QueueClosed);
        }
        let pos = state.position(id).ok_or(AeroError::JobNotFound(id))?;
        let previous = &state.jobs[pos];
        if !matches!(previous.status, JobStatus::Failed | JobStatus::Cancelled) {
            return Err(AeroError::NotRetryable {
                id,
                status: previous.status,
            });
        }
        let fresh = Job::retry_of(previous);
        let fresh_id = fresh.id;
        info!(job = %fresh_id, retry_of = %id, attempt = fresh.attempt, "job retry queued");
        state.jobs.push(fresh);
        self.ready.notify_all();
        Ok(fresh_id)
    }

    pub fn current_status(&self) -> Vec<JobSummary> {
        self.lock().jobs.iter().map(Job::summary).collect()
    }

    pub fn get(&self, id: JobId) -> Option<Job> {
        let state = self.lock();
        state.position(id).map(|pos| state.jobs[pos].clone())
    }

    pub fn running_count(&self) -> usize {
        self.lock()
            .jobs
            .iter()
            .filter(|j| j.status == JobStatus::Running)
            .count()
    }

    /// Blocks until the oldest queued job can be dispatched. Returns `None`
    /// once the queue is closed and nothing is left to run.
    pub fn next_job(&self) -> Option<Dispatch> {
        let mut state = self.lock();
        loop {
            if let Some(dispatch) = Self::dispatch(&mut state) {
                return Some(dispatch);
            }
            if state.closed && state.running.is_none() {
                return None;
            }
            state = self.ready.wait(state).unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Non-blocking variant of [`QueueManager::next_job`].
    pub fn try_next_job(&self) -> Option<Dispatch> {
        Self::dispatch(&mut self.lock())
    }

    fn dispatch(state: &mut QueueState) -> Option<Dispatch> {
        if state.running.is_some() {
            return None;
        }
        let pos = state
            .jobs
            .iter()
            .position(|j| j.status == JobStatus::Queued)?;
        let job = &mut state.jobs[pos];
        if let Err(e) = job.transition(JobStatus::Running) {
            debug!(job = %job.id, error = %e, "dispatch rejected");
            return None;
        }
        let cancel = CancelFlag::default();
        state.running = Some((job.id, cancel.clone()));
        Some(Dispatch {
            job: job.clone(),
            cancel,
        })
    }

    /// Mirrors the worker's copy of the running job back into the list.
    pub fn sync(&self, job: &Job) {
        let mut state = self.lock();
        if let Some(pos) = state.position(job.id) {
            state.jobs[pos] = job.clone();
        }
    }

    /// Decides how the running job ends once its last stage is done. The
    /// cancel flag is read under the queue lock, the same lock `cancel`
    /// takes, and the terminal status is published before returning, so a
    /// later `cancel` reports `AlreadyFinished`.
    pub fn settle(&self, job: &mut Job, cancel: &CancelFlag) -> Result<JobStatus, AeroError> {
        let mut state = self.lock();
        let status = if cancel.is_cancelled() {
            JobStatus::Cancelled
        } else {
            JobStatus::Succeeded
        };
        job.transition(status)?;
        if let Some(pos) = state.position(job.id) {
            state.jobs[pos] = job.clone();
        }
        Ok(status)
    }

    /// Stores the terminal job and frees the execution slot.
    pub fn complete(&self, job: Job) {
        let mut state = self.lock();
        if state.running.as_ref().is_some_and(|(id, _)| *id == job.id) {
            state.running = None;
        }
        match state.position(job.id) {
            Some(pos) => state.jobs[pos] = job,
            None => state.jobs.push(job),
        }
        self.ready.notify_all();
    }

    /// Stops accepting jobs. Already queued jobs still run.
    pub fn close(&self) {
        let mut state = self.lock();
        state.closed = true;
        self.ready.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FailureKind;
    use crate::pipeline::{Dimensions, Variant};
    use crate::state_machine::JobSpec;
    use std::path::{Path, PathBuf};
    use std::thread;
    use std::time::Duration;

    fn job(name: &str) -> Job {
        Job::new(
            JobSpec {
                name: name.into(),
                geometry: PathBuf::from("g.pmdb"),
                variant: Variant::RearWing,
                dimensions: Dimensions::new(1.0, 1.0, 1.0),
                output_dir: None,
            },
            Path::new("/r"),
        )
    }

    fn finish(queue: &QueueManager, mut dispatch: Dispatch, status: JobStatus) -> Job {
        dispatch.job.transition(status).unwrap();
        queue.complete(dispatch.job.clone());
        dispatch.job
    }

    #[test]
    fn dispatches_in_fifo_order() {
        let queue = QueueManager::new();
        let a = queue.enqueue(job("a")).unwrap();
        let b = queue.enqueue(job("b")).unwrap();

        let first = queue.try_next_job().unwrap();
        assert_eq!(first.job.id, a);
        assert_eq!(first.job.status, JobStatus::Running);
        finish(&queue, first, JobStatus::Succeeded);

        let second = queue.try_next_job().unwrap();
        assert_eq!(second.job.id, b);
    }

    #[test]
    fn never_dispatches_while_a_job_runs() {
        let queue = QueueManager::new();
        queue.enqueue(job("a")).unwrap();
        queue.enqueue(job("b")).unwrap();

        let running = queue.try_next_job().unwrap();
        assert!(queue.try_next_job().is_none());
        assert_eq!(queue.running_count(), 1);
        finish(&queue, running, JobStatus::Failed);
        assert_eq!(queue.running_count(), 0);
        assert!(queue.try_next_job().is_some());
        assert_eq!(queue.running_count(), 1);
    }

    #[test]
    fn cancel_queued_removes_before_running() {
        let queue = QueueManager::new();
        let a = queue.enqueue(job("a")).unwrap();
        let b = queue.enqueue(job("b")).unwrap();
        let outcome = queue.cancel(b).unwrap();
        assert!(matches!(outcome, CancelOutcome::Removed(ref j) if j.id == b));
        assert!(queue.get(b).is_none());

        let next = queue.try_next_job().unwrap();
        assert_eq!(next.job.id, a);
        finish(&queue, next, JobStatus::Succeeded);
        assert!(queue.try_next_job().is_none());
    }

    #[test]
    fn cancel_running_sets_flag() {
        let queue = QueueManager::new();
        let a = queue.enqueue(job("a")).unwrap();
        let dispatch = queue.try_next_job().unwrap();
        assert!(!dispatch.cancel.is_cancelled());
        assert!(matches!(queue.cancel(a).unwrap(), CancelOutcome::Requested));
        assert!(dispatch.cancel.is_cancelled());

        let done = finish(&queue, dispatch, JobStatus::Cancelled);
        assert!(matches!(
            queue.cancel(done.id).unwrap(),
            CancelOutcome::AlreadyFinished(JobStatus::Cancelled)
        ));
    }

    #[test]
    fn cancel_after_settle_reports_finished() {
        let queue = QueueManager::new();
        let a = queue.enqueue(job("a")).unwrap();
        let mut dispatch = queue.try_next_job().unwrap();

        let status = queue.settle(&mut dispatch.job, &dispatch.cancel).unwrap();
        assert_eq!(status, JobStatus::Succeeded);
        assert!(matches!(
            queue.cancel(a).unwrap(),
            CancelOutcome::AlreadyFinished(JobStatus::Succeeded)
        ));
        // the slot stays taken until the worker completes the job
        assert!(queue.try_next_job().is_none());

        queue.complete(dispatch.job);
        assert_eq!(queue.get(a).unwrap().status, JobStatus::Succeeded);
    }

    #[test]
    fn cancel_before_settle_never_succeeds() {
        let queue = QueueManager::new();
        let a = queue.enqueue(job("a")).unwrap();
        let mut dispatch = queue.try_next_job().unwrap();

        assert!(matches!(queue.cancel(a).unwrap(), CancelOutcome::Requested));
        let status = queue.settle(&mut dispatch.job, &dispatch.cancel).unwrap();
        assert_eq!(status, JobStatus::Cancelled);

        queue.complete(dispatch.job);
        assert_eq!(queue.get(a).unwrap().status, JobStatus::Cancelled);
    }

    #[test]
    fn cancel_unknown_job() {
        let queue = QueueManager::new();
        assert!(matches!(
            queue.cancel(JobId::new()),
            Err(AeroError::JobNotFound(_))
        ));
    }

    #[test]
    fn failed_job_stays_visible_and_can_be_retried() {
        let queue = QueueManager::new();
        let a = queue.enqueue(job("a")).unwrap();
        let mut dispatch = queue.try_next_job().unwrap();
        dispatch
            .job
            .fail(FailureKind::StageFailure, "volume-mesh: skewed cells")
            .unwrap();
        queue.complete(dispatch.job);

        let status = queue.current_status();
        assert_eq!(status.len(), 1);
        assert_eq!(status[0].status, JobStatus::Failed);

        let fresh = queue.retry(a).unwrap();
        assert_ne!(fresh, a);
        let status = queue.current_status();
        assert_eq!(status.len(), 2);
        assert_eq!(status[1].attempt, 2);
        assert_eq!(status[1].status, JobStatus::Queued);
    }

    #[test]
    fn retry_rejects_live_jobs() {
        let queue = QueueManager::new();
        let a = queue.enqueue(job("a")).unwrap();
        assert!(matches!(
            queue.retry(a),
            Err(AeroError::NotRetryable {
                status: JobStatus::Queued,
                ..
            })
        ));
    }

    #[test]
    fn closed_queue_rejects_new_jobs_but_drains() {
        let queue = QueueManager::new();
        queue.enqueue(job("a")).unwrap();
        queue.close();
        assert!(matches!(queue.enqueue(job("b")), Err(AeroError::QueueClosed)));

        let dispatch = queue.next_job().unwrap();
        finish(&queue, dispatch, JobStatus::Succeeded);
        assert!(queue.next_job().is_none());
    }

    #[test]
    fn next_job_blocks_until_enqueue() {
        let queue = Arc::new(QueueManager::new());
        let waiter = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.next_job().map(|d| d.job.name))
        };
        thread::sleep(Duration::from_millis(20));
        queue.enqueue(job("late")).unwrap();
        assert_eq!(waiter.join().unwrap().as_deref(), Some("late"));
    }

    #[test]
    fn cancel_all_clears_queue_and_flags_running() {
        let queue = QueueManager::new();
        queue.enqueue(job("a")).unwrap();
        queue.enqueue(job("b")).unwrap();
        queue.enqueue(job("c")).unwrap();
        let dispatch = queue.try_next_job().unwrap();
        assert_eq!(queue.cancel_all(), 2);
        assert!(dispatch.cancel.is_cancelled());
        assert_eq!(queue.current_status().len(), 1);
    }
}
