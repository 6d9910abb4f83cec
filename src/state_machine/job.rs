use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::ramp::ConvergenceResult;
use super::state::JobStatus;
use crate::error::{AeroError, FailureKind};
use crate::pipeline::{Dimensions, StageKind, Variant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// First eight hex digits, for terminal output.
    pub fn short(&self) -> String {
        self.0.simple().to_string()[..8].to_string()
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What the control surface submits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSpec {
    pub name: String,
    pub geometry: PathBuf,
    pub variant: Variant,
    #[serde(flatten)]
    pub dimensions: Dimensions,
    /// Defaults to `<output_root>/<name>`.
    #[serde(default)]
    pub output_dir: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
struct BatchFile {
    #[serde(default)]
    job: Vec<JobSpec>,
}

impl JobSpec {
    pub fn validate(&self) -> Result<(), AeroError> {
        if self.name.trim().is_empty() {
            return Err(AeroError::Config("job name must not be empty".into()));
        }
        if matches!(self.name.trim(), "." | "..") {
            return Err(AeroError::Config(format!(
                "job name `{}` is not a directory name",
                self.name
            )));
        }
        if self.name.contains(['/', '\\']) {
            return Err(AeroError::Config(format!(
                "job name `{}` must not contain path separators",
                self.name
            )));
        }
        if self.geometry.as_os_str().is_empty() {
            return Err(AeroError::Config(format!(
                "job `{}` has no geometry file",
                self.name
            )));
        }
        if !self.dimensions.is_valid() {
            return Err(AeroError::Config(format!(
                "job `{}` has non-positive dimensions",
                self.name
            )));
        }
        Ok(())
    }

    /// Loads a batch of job specs from a TOML (`[[job]]` tables) or JSON
    /// (array) file, chosen by extension.
    pub fn load_batch(path: &Path) -> Result<Vec<JobSpec>, AeroError> {
        let contents = std::fs::read_to_string(path)?;
        let specs = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => serde_json::from_str::<Vec<JobSpec>>(&contents)?,
            _ => toml::from_str::<BatchFile>(&contents)?.job,
        };
        for spec in &specs {
            spec.validate()?;
        }
        Ok(specs)
    }
}

/// One completed stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageRecord {
    pub name: String,
    pub kind: StageKind,
    pub artifacts: Vec<PathBuf>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub note: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobFailure {
    pub kind: FailureKind,
    pub reason: String,
}

impl fmt::Display for JobFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.reason)
    }
}

/// Force coefficients and their area-scaled forms.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AeroResult {
    pub drag_coefficient: f64,
    pub lift_coefficient: f64,
    pub projected_area: Option<f64>,
    /// Cd × area.
    pub scx: Option<f64>,
    /// Cl × area.
    pub scz: Option<f64>,
}

impl AeroResult {
    pub fn new(drag_coefficient: f64, lift_coefficient: f64, projected_area: Option<f64>) -> Self {
        Self {
            drag_coefficient,
            lift_coefficient,
            projected_area,
            scx: projected_area.map(|a| drag_coefficient * a),
            scz: projected_area.map(|a| lift_coefficient * a),
        }
    }
}

/// One simulation request and its runtime state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub name: String,
    pub geometry: PathBuf,
    pub output_dir: PathBuf,
    pub dimensions: Dimensions,
    pub variant: Variant,
    pub status: JobStatus,
    pub stages: Vec<StageRecord>,
    pub error: Option<JobFailure>,
    pub aero: Option<AeroResult>,
    pub convergence: Option<ConvergenceResult>,
    pub restarts: u32,
    /// 1 for the first submission, incremented by each retry.
    pub attempt: u32,
    pub retry_of: Option<JobId>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn new(spec: JobSpec, output_root: &Path) -> Self {
        let output_dir = spec
            .output_dir
            .unwrap_or_else(|| output_root.join(&spec.name));
        Self {
            id: JobId::new(),
            name: spec.name,
            geometry: spec.geometry,
            output_dir,
            dimensions: spec.dimensions,
            variant: spec.variant,
            status: JobStatus::Queued,
            stages: Vec::new(),
            error: None,
            aero: None,
            convergence: None,
            restarts: 0,
            attempt: 1,
            retry_of: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    /// A fresh attempt of `previous`, ready to queue.
    pub fn retry_of(previous: &Job) -> Self {
        Self {
            id: JobId::new(),
            name: previous.name.clone(),
            geometry: previous.geometry.clone(),
            output_dir: previous.output_dir.clone(),
            dimensions: previous.dimensions,
            variant: previous.variant,
            status: JobStatus::Queued,
            stages: Vec::new(),
            error: None,
            aero: None,
            convergence: None,
            restarts: 0,
            attempt: previous.attempt + 1,
            retry_of: Some(previous.id),
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    /// Moves the job along its lifecycle, stamping start/finish times.
    pub fn transition(&mut self, next: JobStatus) -> Result<(), AeroError> {
        if !self.status.can_transition_to(next) {
            return Err(AeroError::InvalidTransition {
                from: self.status,
                to: next,
            });
        }
        match next {
            JobStatus::Running => self.started_at = Some(Utc::now()),
            s if s.is_terminal() => self.finished_at = Some(Utc::now()),
            _ => {}
        }
        self.status = next;
        Ok(())
    }

    /// Marks a running job failed with a human-readable reason.
    pub fn fail(&mut self, kind: FailureKind, reason: impl Into<String>) -> Result<(), AeroError> {
        self.transition(JobStatus::Failed)?;
        self.error = Some(JobFailure {
            kind,
            reason: reason.into(),
        });
        Ok(())
    }

    /// `false` when the ramp ended without meeting the residual threshold.
    pub fn converged(&self) -> bool {
        self.convergence.as_ref().is_some_and(|c| c.is_converged())
    }

    pub fn stage_names(&self) -> Vec<String> {
        self.stages.iter().map(|s| s.name.clone()).collect()
    }

    pub fn summary(&self) -> JobSummary {
        JobSummary {
            id: self.id,
            name: self.name.clone(),
            variant: self.variant,
            status: self.status,
            attempt: self.attempt,
            stages_completed: self.stages.len(),
            current_stage: self.stages.last().map(|s| s.name.clone()),
            error: self.error.as_ref().map(|e| e.to_string()),
        }
    }
}

/// Queue row shown by the control surface.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSummary {
    pub id: JobId,
    pub name: String,
    pub variant: Variant,
    pub status: JobStatus,
    pub attempt: u32,
    pub stages_completed: usize,
    /// Last completed stage.
    pub current_stage: Option<String>,
    pub error: Option<String>,
}

/// Structured audit record produced when a job reaches a terminal state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub job_id: JobId,
    pub name: String,
    pub variant: Variant,
    pub status: JobStatus,
    pub attempt: u32,
    pub stages: Vec<String>,
    pub restarts: u32,
    pub aero: Option<AeroResult>,
    pub convergence: Option<ConvergenceResult>,
    pub error: Option<JobFailure>,
    pub output_dir: PathBuf,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
}

impl AuditRecord {
    pub fn from_job(job: &Job) -> Self {
        let duration_ms = match (job.started_at, job.finished_at) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds()),
            _ => None,
        };
        Self {
            job_id: job.id,
            name: job.name.clone(),
            variant: job.variant,
            status: job.status,
            attempt: job.attempt,
            stages: job.stage_names(),
            restarts: job.restarts,
            aero: job.aero,
            convergence: job.convergence.clone(),
            error: job.error.clone(),
            output_dir: job.output_dir.clone(),
            created_at: job.created_at,
            started_at: job.started_at,
            finished_at: job.finished_at,
            duration_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(name: &str) -> JobSpec {
        JobSpec {
            name: name.into(),
            geometry: PathBuf::from("geom/fw.pmdb"),
            variant: Variant::FrontWing,
            dimensions: Dimensions::new(1.2, 1.4, 0.4),
            output_dir: None,
        }
    }

    #[test]
    fn job_creation_defaults() {
        let job = Job::new(spec("fw-v3"), Path::new("/results"));
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.output_dir, PathBuf::from("/results/fw-v3"));
        assert_eq!(job.attempt, 1);
        assert!(job.stages.is_empty());
        assert!(job.retry_of.is_none());
    }

    #[test]
    fn explicit_output_dir_wins() {
        let mut s = spec("fw-v3");
        s.output_dir = Some(PathBuf::from("/elsewhere"));
        let job = Job::new(s, Path::new("/results"));
        assert_eq!(job.output_dir, PathBuf::from("/elsewhere"));
    }

    #[test]
    fn lifecycle_stamps_times_and_rejects_reentry() {
        let mut job = Job::new(spec("a"), Path::new("/r"));
        job.transition(JobStatus::Running).unwrap();
        assert!(job.started_at.is_some());
        job.transition(JobStatus::Succeeded).unwrap();
        assert!(job.finished_at.is_some());

        let err = job.transition(JobStatus::Running).unwrap_err();
        assert!(matches!(
            err,
            AeroError::InvalidTransition {
                from: JobStatus::Succeeded,
                to: JobStatus::Running
            }
        ));
    }

    #[test]
    fn fail_records_reason() {
        let mut job = Job::new(spec("a"), Path::new("/r"));
        job.transition(JobStatus::Running).unwrap();
        job.fail(FailureKind::StageFailure, "volume-mesh: skewed cells").unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(
            job.summary().error.unwrap(),
            "StageFailure: volume-mesh: skewed cells"
        );
    }

    #[test]
    fn retry_creates_fresh_attempt() {
        let mut old = Job::new(spec("a"), Path::new("/r"));
        old.transition(JobStatus::Running).unwrap();
        old.fail(FailureKind::DivergenceFault, "diverged twice").unwrap();

        let fresh = Job::retry_of(&old);
        assert_ne!(fresh.id, old.id);
        assert_eq!(fresh.retry_of, Some(old.id));
        assert_eq!(fresh.attempt, 2);
        assert_eq!(fresh.status, JobStatus::Queued);
        assert!(fresh.error.is_none());
        assert_eq!(fresh.output_dir, old.output_dir);
    }

    #[test]
    fn aero_result_scales_by_area() {
        let r = AeroResult::new(0.9, -2.0, Some(1.5));
        assert_eq!(r.scx, Some(0.9 * 1.5));
        assert_eq!(r.scz, Some(-3.0));

        let no_area = AeroResult::new(0.9, -2.0, None);
        assert!(no_area.scx.is_none());
        assert!(no_area.scz.is_none());
    }

    #[test]
    fn audit_record_from_finished_job() {
        let mut job = Job::new(spec("a"), Path::new("/r"));
        job.transition(JobStatus::Running).unwrap();
        job.transition(JobStatus::Cancelled).unwrap();
        let record = AuditRecord::from_job(&job);
        assert_eq!(record.job_id, job.id);
        assert_eq!(record.status, JobStatus::Cancelled);
        assert!(record.duration_ms.is_some());
    }

    #[test]
    fn spec_validation() {
        assert!(spec("ok").validate().is_ok());
        assert!(spec("  ").validate().is_err());
        assert!(spec("a/b").validate().is_err());
        assert!(spec("..").validate().is_err());
        assert!(spec(".").validate().is_err());
        assert!(spec("..hc").validate().is_ok());
        let mut bad = spec("dims");
        bad.dimensions.height = -1.0;
        assert!(bad.validate().is_err());
    }

    #[test]
    fn load_batch_from_toml_and_json() {
        let dir = tempfile::tempdir().unwrap();
        let toml_path = dir.path().join("jobs.toml");
        std::fs::write(
            &toml_path,
            r#"
                [[job]]
                name = "fw-v3"
                geometry = "geom/fw.pmdb"
                variant = "front-wing"
                length = 1.2
                width = 1.4
                height = 0.4

                [[job]]
                name = "hc-base"
                geometry = "geom/car.pmdb"
                variant = "half-car"
                length = 2.9
                width = 1.45
                height = 1.2
                output_dir = "/fast/hc"
            "#,
        )
        .unwrap();
        let specs = JobSpec::load_batch(&toml_path).unwrap();
        assert_eq!(specs.len(), 2);
        assert_eq!(specs[0].variant, Variant::FrontWing);
        assert_eq!(specs[1].dimensions.length, 2.9);
        assert_eq!(specs[1].output_dir, Some(PathBuf::from("/fast/hc")));

        let json_path = dir.path().join("jobs.json");
        std::fs::write(
            &json_path,
            r#"[{"name": "ut", "geometry": "ut.pmdb", "variant": "undertray",
                 "length": 2.0, "width": 1.0, "height": 0.3}]"#,
        )
        .unwrap();
        let specs = JobSpec::load_batch(&json_path).unwrap();
        assert_eq!(specs[0].variant, Variant::Undertray);
    }

    #[test]
    fn job_serialization_roundtrip() {
        let job = Job::new(spec("serialize-me"), Path::new("/r"));
        let json = serde_json::to_string(&job).unwrap();
        let back: Job = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id, job.id);
        assert_eq!(back.name, "serialize-me");
        assert_eq!(back.status, JobStatus::Queued);
    }
}
