//! Staged solver ramp with convergence check and one-shot divergence recovery.
//!
//! The ramp runs three iteration blocks. The first two are stability ramps
//! and never gate on the residual; curvature correction is switched on when
//! the third block starts and at no other point. After the last block the
//! continuity residual decides between `Converged` and `Incomplete`; an
//! incomplete solution is still handed on to extraction.
//!
//! A divergence fault in any block restarts the ramp from block 1 with
//! reduced relaxation and CFL. Only `max_restarts` such restarts are allowed
//! per job; the next divergence is terminal.

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::RampConfig;
use crate::engine::{EngineCommand, SolverControls, SolverEngine};
use crate::error::{AeroError, EngineError};
use crate::executor::EngineCalls;
use crate::queue::CancelFlag;
use crate::worker::WorkerEvent;

/// 1-based index of the first sub-stage that runs with curvature correction.
pub const CURVATURE_ONSET: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RampSubStage {
    /// 1-based position in the ramp.
    pub index: usize,
    pub target_iterations: u64,
    pub curvature_correction: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RampPlan {
    sub_stages: [RampSubStage; 3],
}

impl RampPlan {
    pub fn new(targets: [u64; 3]) -> Result<Self, AeroError> {
        if let Some(pos) = targets.iter().position(|t| *t == 0) {
            return Err(AeroError::InvalidRampPlan(format!(
                "sub-stage {} has no iterations",
                pos + 1
            )));
        }
        let sub_stages = std::array::from_fn(|i| RampSubStage {
            index: i + 1,
            target_iterations: targets[i],
            curvature_correction: i + 1 >= CURVATURE_ONSET,
        });
        Ok(Self { sub_stages })
    }

    pub fn sub_stages(&self) -> &[RampSubStage] {
        &self.sub_stages
    }

    pub fn total_iterations(&self) -> u64 {
        self.sub_stages.iter().map(|s| s.target_iterations).sum()
    }
}

impl Default for RampPlan {
    fn default() -> Self {
        Self {
            sub_stages: [
                RampSubStage {
                    index: 1,
                    target_iterations: 1000,
                    curvature_correction: false,
                },
                RampSubStage {
                    index: 2,
                    target_iterations: 1000,
                    curvature_correction: false,
                },
                RampSubStage {
                    index: 3,
                    target_iterations: 5000,
                    curvature_correction: true,
                },
            ],
        }
    }
}

/// Everything the controller reads: plan, thresholds and recovery settings.
#[derive(Debug, Clone, PartialEq)]
pub struct RampPolicy {
    pub plan: RampPlan,
    pub convergence_threshold: f64,
    /// Residual above which a completed block counts as diverged.
    pub divergence_residual: f64,
    pub max_restarts: u32,
    pub restart_controls: SolverControls,
}

impl RampPolicy {
    pub fn from_config(config: &RampConfig) -> Result<Self, AeroError> {
        Ok(Self {
            plan: RampPlan::new(config.iterations)?,
            convergence_threshold: config.convergence_threshold,
            divergence_residual: config.divergence_residual,
            max_restarts: config.max_restarts,
            restart_controls: SolverControls {
                relaxation: config.restart_relaxation,
                courant: config.restart_courant,
            },
        })
    }
}

impl Default for RampPolicy {
    fn default() -> Self {
        let config = RampConfig::default();
        Self {
            plan: RampPlan::default(),
            convergence_threshold: config.convergence_threshold,
            divergence_residual: config.divergence_residual,
            max_restarts: config.max_restarts,
            restart_controls: SolverControls {
                relaxation: config.restart_relaxation,
                courant: config.restart_courant,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RampState {
    Stage1,
    Stage2,
    Stage3Curvature,
    ConvergedCheck,
    Done,
    DivergedRestart,
}

impl RampState {
    /// Position in the plan of the block an iterating state runs.
    fn block(self) -> usize {
        match self {
            RampState::Stage1 => 0,
            RampState::Stage2 => 1,
            _ => 2,
        }
    }

    /// Next state once the current sub-stage has reached its target.
    fn after_target(self) -> RampState {
        match self {
            RampState::Stage1 => RampState::Stage2,
            RampState::Stage2 => RampState::Stage3Curvature,
            RampState::Stage3Curvature => RampState::ConvergedCheck,
            other => other,
        }
    }
}

impl fmt::Display for RampState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RampState::Stage1 => write!(f, "STAGE_1"),
            RampState::Stage2 => write!(f, "STAGE_2"),
            RampState::Stage3Curvature => write!(f, "STAGE_3_CURVATURE"),
            RampState::ConvergedCheck => write!(f, "CONVERGED_CHECK"),
            RampState::Done => write!(f, "DONE"),
            RampState::DivergedRestart => write!(f, "DIVERGED_RESTART"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Convergence {
    Converged,
    Diverged,
    Incomplete,
}

/// Residual snapshot at the end of the ramp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConvergenceResult {
    pub continuity: Option<f64>,
    pub iteration: u64,
    pub classification: Convergence,
}

impl ConvergenceResult {
    pub fn is_converged(&self) -> bool {
        self.classification == Convergence::Converged
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RampEnd {
    /// Reached `Done`; the result is `Converged` or `Incomplete`.
    Done(ConvergenceResult),
    /// Cancellation observed at a sub-stage boundary.
    Cancelled,
    /// Divergence after the restart budget was spent.
    Diverged {
        result: ConvergenceResult,
        fault: String,
    },
    /// A non-divergence engine failure.
    Failed(EngineError),
}

#[derive(Debug, Clone, PartialEq)]
pub struct RampRun {
    pub end: RampEnd,
    pub restarts: u32,
    /// Every state entered, in order.
    pub history: Vec<RampState>,
}

pub struct RampController<'a> {
    policy: &'a RampPolicy,
}

impl<'a> RampController<'a> {
    pub fn new(policy: &'a RampPolicy) -> Self {
        Self { policy }
    }

    /// Drives the ramp state machine to completion against one engine session.
    pub fn run<E: SolverEngine + ?Sized>(
        &self,
        calls: &mut EngineCalls<'_, E>,
        cancel: &CancelFlag,
    ) -> RampRun {
        let mut state = RampState::Stage1;
        let mut history = Vec::new();
        let mut restarts = 0u32;
        let mut curvature_on = false;
        let mut last_fault = String::new();

        if let Err(e) = calls.issue(&EngineCommand::InitializeSolution) {
            return RampRun {
                end: RampEnd::Failed(e),
                restarts,
                history,
            };
        }

        loop {
            history.push(state);
            match state {
                RampState::Stage1 | RampState::Stage2 | RampState::Stage3Curvature => {
                    if cancel.is_cancelled() {
                        info!(job = %calls.job(), %state, "ramp cancelled at sub-stage boundary");
                        return RampRun {
                            end: RampEnd::Cancelled,
                            restarts,
                            history,
                        };
                    }
                    let sub = self.policy.plan.sub_stages[state.block()];

                    if sub.curvature_correction && !curvature_on {
                        if let Err(e) = calls.issue(&EngineCommand::SetCurvatureCorrection(true)) {
                            return RampRun {
                                end: RampEnd::Failed(e),
                                restarts,
                                history,
                            };
                        }
                        curvature_on = true;
                    }

                    calls.events().emit(WorkerEvent::RampSubStage {
                        job: calls.job(),
                        index: sub.index,
                        target_iterations: sub.target_iterations,
                        curvature_correction: curvature_on,
                    });

                    match calls.issue(&EngineCommand::Iterate {
                        count: sub.target_iterations,
                    }) {
                        Ok(()) => {
                            let telemetry = calls.telemetry();
                            match telemetry.continuity {
                                Some(c)
                                    if !c.is_finite() || c > self.policy.divergence_residual =>
                                {
                                    last_fault = format!(
                                        "continuity residual {c:e} after sub-stage {}",
                                        sub.index
                                    );
                                    state = RampState::DivergedRestart;
                                }
                                _ => state = state.after_target(),
                            }
                        }
                        Err(EngineError::Divergence { iteration, message }) => {
                            last_fault = format!(
                                "{message} at iteration {iteration} (sub-stage {})",
                                sub.index
                            );
                            state = RampState::DivergedRestart;
                        }
                        Err(e) => {
                            return RampRun {
                                end: RampEnd::Failed(e),
                                restarts,
                                history,
                            };
                        }
                    }
                }
                RampState::ConvergedCheck | RampState::Done => {
                    let telemetry = calls.telemetry();
                    let classification = match telemetry.continuity {
                        Some(c) if c < self.policy.convergence_threshold => Convergence::Converged,
                        _ => Convergence::Incomplete,
                    };
                    if classification == Convergence::Incomplete {
                        calls.events().warn(
                            Some(calls.job()),
                            format!(
                                "ramp finished without converging (continuity {:?}, threshold {:e}); continuing with last solution",
                                telemetry.continuity, self.policy.convergence_threshold
                            ),
                        );
                    }
                    history.push(RampState::Done);
                    return RampRun {
                        end: RampEnd::Done(ConvergenceResult {
                            continuity: telemetry.continuity,
                            iteration: telemetry.iteration,
                            classification,
                        }),
                        restarts,
                        history,
                    };
                }
                RampState::DivergedRestart => {
                    if restarts >= self.policy.max_restarts {
                        let telemetry = calls.telemetry();
                        warn!(
                            job = %calls.job(),
                            restarts,
                            fault = %last_fault,
                            "divergence after restart budget spent"
                        );
                        return RampRun {
                            end: RampEnd::Diverged {
                                result: ConvergenceResult {
                                    continuity: telemetry.continuity,
                                    iteration: telemetry.iteration,
                                    classification: Convergence::Diverged,
                                },
                                fault: last_fault,
                            },
                            restarts,
                            history,
                        };
                    }
                    restarts += 1;
                    let restart = self.policy.restart_controls;
                    calls.events().emit(WorkerEvent::RampRestart {
                        job: calls.job(),
                        restart: restarts,
                        reason: last_fault.clone(),
                    });
                    calls.events().warn(
                        Some(calls.job()),
                        format!(
                            "divergence: {last_fault}; restarting ramp with relaxation {} and CFL {}",
                            restart.relaxation, restart.courant
                        ),
                    );

                    let mut reset = Vec::with_capacity(3);
                    if curvature_on {
                        reset.push(EngineCommand::SetCurvatureCorrection(false));
                    }
                    reset.push(EngineCommand::SetSolverControls(restart));
                    reset.push(EngineCommand::InitializeSolution);
                    for command in &reset {
                        if let Err(e) = calls.issue(command) {
                            return RampRun {
                                end: RampEnd::Failed(e),
                                restarts,
                                history,
                            };
                        }
                    }
                    curvature_on = false;
                    state = RampState::Stage1;
                }
            }
        }
    }
}
