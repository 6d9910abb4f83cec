mod job;
mod ramp;
mod state;

pub use job::{AeroResult, AuditRecord, Job, JobFailure, JobId, JobSpec, JobSummary, StageRecord};
pub use ramp::{
    CURVATURE_ONSET, Convergence, ConvergenceResult, RampController, RampEnd, RampPlan, RampPolicy,
    RampRun, RampState, RampSubStage,
};
pub use state::JobStatus;
