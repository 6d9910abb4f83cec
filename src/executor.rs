//! Runs one stage of one job against an engine session.
//!
//! The executor keeps no state between calls. Everything it needs arrives
//! through the job and the stage; the only job mutation it performs is
//! [`StageExecutor::record`], which the caller invokes after a stage
//! completes.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::config::AeroConfig;
use crate::engine::{ContourField, EngineCommand, SolverEngine, Telemetry};
use crate::error::{EngineError, FailureKind};
use crate::pipeline::{
    BoundaryConditions, CurvatureSizing, ProjectedAreaSpec, RefinementBox, Stage, StageParams,
};
use crate::queue::CancelFlag;
use crate::report;
use crate::state_machine::{
    AeroResult, ConvergenceResult, Job, JobId, RampController, RampEnd, RampPolicy, StageRecord,
};
use crate::worker::EventSink;

pub const RESIDUAL_PLOT_FILE: &str = "residuals.png";

/// Engine session wrapper that applies the local retry policy and reports
/// every failed call on the event channel.
pub struct EngineCalls<'a, E: SolverEngine + ?Sized> {
    engine: &'a mut E,
    retries: u32,
    events: &'a EventSink,
    job: JobId,
}

impl<'a, E: SolverEngine + ?Sized> EngineCalls<'a, E> {
    pub fn new(engine: &'a mut E, retries: u32, events: &'a EventSink, job: JobId) -> Self {
        Self {
            engine,
            retries,
            events,
            job,
        }
    }

    /// Issues `command`, repeating it up to `retries` times while the engine
    /// flags the failure as recoverable.
    pub fn issue(&mut self, command: &EngineCommand) -> Result<(), EngineError> {
        let mut attempt = 0;
        loop {
            debug!(job = %self.job, %command, attempt, "engine command");
            match self.engine.execute(command) {
                Ok(()) => return Ok(()),
                Err(e) if e.is_recoverable() && attempt < self.retries => {
                    attempt += 1;
                    self.events.warn(
                        Some(self.job),
                        format!(
                            "{}: {e}; retrying ({attempt}/{})",
                            FailureKind::of(&e),
                            self.retries
                        ),
                    );
                }
                Err(e) => {
                    self.events
                        .warn(Some(self.job), format!("{}: {e}", FailureKind::of(&e)));
                    return Err(e);
                }
            }
        }
    }

    pub fn telemetry(&self) -> Telemetry {
        self.engine.telemetry()
    }

    pub fn take_artifacts(&mut self) -> Vec<PathBuf> {
        self.engine.take_artifacts()
    }

    pub fn events(&self) -> &EventSink {
        self.events
    }

    pub fn job(&self) -> JobId {
        self.job
    }
}

/// What a completed stage hands back to the caller.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StageArtifacts {
    pub files: Vec<PathBuf>,
    pub convergence: Option<ConvergenceResult>,
    pub aero: Option<AeroResult>,
    pub restarts: u32,
    pub note: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StageOutcome {
    Completed(StageArtifacts),
    Failed(FailureKind, String),
    /// Cancellation observed inside the stage (ramp sub-stage boundary).
    Cancelled,
}

pub struct StageExecutor<'a> {
    config: &'a AeroConfig,
    events: &'a EventSink,
    cancel: &'a CancelFlag,
}

impl<'a> StageExecutor<'a> {
    pub fn new(config: &'a AeroConfig, events: &'a EventSink, cancel: &'a CancelFlag) -> Self {
        Self {
            config,
            events,
            cancel,
        }
    }

    pub fn execute<E: SolverEngine + ?Sized>(
        &self,
        job: &Job,
        stage: &Stage,
        engine: &mut E,
    ) -> StageOutcome {
        let mut calls = EngineCalls::new(
            engine,
            self.config.engine.command_retries,
            self.events,
            job.id,
        );

        let result = match &stage.params {
            StageParams::Geometry {
                refinement,
                curvature,
            } => self.import_geometry(&mut calls, job, refinement, curvature),
            StageParams::WheelRefinement { wheels } => wheels
                .iter()
                .try_for_each(|w| calls.issue(&EngineCommand::AddWheelRefinement(w.clone()))),
            StageParams::VolumeMesh {
                surface,
                boundary_layer,
                min_cell_length,
                max_cell_length,
                mesh_file,
            } => [
                EngineCommand::GenerateSurfaceMesh(*surface),
                EngineCommand::AddBoundaryLayers(boundary_layer.clone()),
                EngineCommand::GenerateVolumeMesh {
                    min_cell_length: *min_cell_length,
                    max_cell_length: *max_cell_length,
                },
                EngineCommand::SaveMesh {
                    path: job.output_dir.join(mesh_file),
                },
            ]
            .iter()
            .try_for_each(|c| calls.issue(c)),
            StageParams::SolverSetup {
                mesh_file,
                boundary,
                controls,
            } => {
                let mut commands = vec![
                    EngineCommand::ReadMesh {
                        path: job.output_dir.join(mesh_file),
                    },
                    EngineCommand::ConfigureTurbulence {
                        curvature_correction: false,
                    },
                    EngineCommand::SetSolverControls(*controls),
                ];
                commands.extend(self.boundary_commands(boundary));
                commands.iter().try_for_each(|c| calls.issue(c))
            }
            StageParams::WheelRotation { zones, omega_rad_s } => zones.iter().try_for_each(|zone| {
                calls.issue(&EngineCommand::SetWheelRotation {
                    zone: zone.clone(),
                    omega_rad_s: *omega_rad_s,
                })
            }),
            StageParams::Ramp(policy) => return self.ramp(&mut calls, stage, policy),
            StageParams::Extraction {
                case_file,
                projected_area,
            } => return self.extract(&mut calls, job, stage, case_file, projected_area.as_ref()),
            StageParams::PostProcess {
                contours,
                residual_plot,
            } => self.post_process(&mut calls, job, contours, *residual_plot),
            StageParams::Report => return self.report(job, stage),
        };

        match result {
            Ok(()) => StageOutcome::Completed(StageArtifacts {
                files: calls.take_artifacts(),
                ..StageArtifacts::default()
            }),
            Err(e) => failed(stage, &e),
        }
    }

    /// Appends the completed-stage record and attaches whatever results the
    /// stage produced.
    pub fn record(
        &self,
        job: &mut Job,
        stage: &Stage,
        artifacts: StageArtifacts,
        started_at: DateTime<Utc>,
    ) -> StageRecord {
        if let Some(convergence) = artifacts.convergence {
            job.convergence = Some(convergence);
        }
        if let Some(aero) = artifacts.aero {
            job.aero = Some(aero);
        }
        job.restarts += artifacts.restarts;

        let record = StageRecord {
            name: stage.name.clone(),
            kind: stage.kind,
            artifacts: artifacts.files,
            started_at,
            finished_at: Utc::now(),
            note: artifacts.note,
        };
        job.stages.push(record.clone());
        record
    }

    fn import_geometry<E: SolverEngine + ?Sized>(
        &self,
        calls: &mut EngineCalls<'_, E>,
        job: &Job,
        refinement: &[RefinementBox],
        curvature: &[CurvatureSizing],
    ) -> Result<(), EngineError> {
        calls.issue(&EngineCommand::ImportGeometry {
            path: job.geometry.clone(),
        })?;
        for b in refinement {
            calls.issue(&EngineCommand::AddRefinementRegion(b.resolve(&job.dimensions)))?;
        }
        for sizing in curvature {
            calls.issue(&EngineCommand::AddCurvatureSizing(sizing.clone()))?;
        }
        Ok(())
    }

    fn boundary_commands(&self, boundary: &BoundaryConditions) -> Vec<EngineCommand> {
        let mut commands = Vec::new();
        if let Some(speed_mph) = boundary.inlet_speed_mph {
            commands.push(EngineCommand::SetInletVelocity { speed_mph });
        }
        if boundary.moving_ground {
            commands.push(EngineCommand::SetMovingGround {
                speed_mph: boundary
                    .inlet_speed_mph
                    .unwrap_or(self.config.physics.inlet_speed_mph),
            });
        }
        if boundary.symmetry_plane {
            commands.push(EngineCommand::SetSymmetryPlane);
        }
        commands
    }

    fn ramp<E: SolverEngine + ?Sized>(
        &self,
        calls: &mut EngineCalls<'_, E>,
        stage: &Stage,
        policy: &RampPolicy,
    ) -> StageOutcome {
        let run = RampController::new(policy).run(calls, self.cancel);
        match run.end {
            RampEnd::Done(result) => {
                let note = if result.is_converged() {
                    format!("converged at iteration {}", result.iteration)
                } else {
                    format!(
                        "not converged after {} iterations (continuity {})",
                        result.iteration,
                        result
                            .continuity
                            .map(|c| format!("{c:e}"))
                            .unwrap_or_else(|| "n/a".into())
                    )
                };
                StageOutcome::Completed(StageArtifacts {
                    files: calls.take_artifacts(),
                    convergence: Some(result),
                    restarts: run.restarts,
                    note: Some(note),
                    ..StageArtifacts::default()
                })
            }
            RampEnd::Cancelled => StageOutcome::Cancelled,
            RampEnd::Diverged { fault, .. } => StageOutcome::Failed(
                FailureKind::DivergenceFault,
                format!(
                    "{}: diverged after {} restart(s): {fault}",
                    stage.name, run.restarts
                ),
            ),
            RampEnd::Failed(e) => failed(stage, &e),
        }
    }

    fn extract<E: SolverEngine + ?Sized>(
        &self,
        calls: &mut EngineCalls<'_, E>,
        job: &Job,
        stage: &Stage,
        case_file: &str,
        area: Option<&ProjectedAreaSpec>,
    ) -> StageOutcome {
        let issued = calls
            .issue(&EngineCommand::WriteCaseData {
                path: job.output_dir.join(case_file),
            })
            .and_then(|()| calls.issue(&EngineCommand::ReadForceCoefficients));
        if let Err(e) = issued {
            return failed(stage, &e);
        }

        let telemetry = calls.telemetry();
        let (Some(cd), Some(cl)) = (telemetry.drag_coefficient, telemetry.lift_coefficient) else {
            return StageOutcome::Failed(
                FailureKind::StageFailure,
                format!("{}: engine reported no force coefficients", stage.name),
            );
        };

        let projected_area = match area {
            Some(spec) => {
                if let Err(e) = calls.issue(&EngineCommand::ComputeProjectedArea {
                    zones: spec.zones.clone(),
                }) {
                    return failed(stage, &e);
                }
                match calls.telemetry().projected_area {
                    Some(half) if spec.mirror => Some(half * 2.0),
                    Some(full) => Some(full),
                    None => {
                        return StageOutcome::Failed(
                            FailureKind::StageFailure,
                            format!("{}: engine reported no projected area", stage.name),
                        );
                    }
                }
            }
            None => None,
        };

        StageOutcome::Completed(StageArtifacts {
            files: calls.take_artifacts(),
            aero: Some(AeroResult::new(cd, cl, projected_area)),
            ..StageArtifacts::default()
        })
    }

    fn post_process<E: SolverEngine + ?Sized>(
        &self,
        calls: &mut EngineCalls<'_, E>,
        job: &Job,
        contours: &[ContourField],
        residual_plot: bool,
    ) -> Result<(), EngineError> {
        for field in contours {
            calls.issue(&EngineCommand::SaveContour {
                field: *field,
                path: job.output_dir.join(field.file_name()),
            })?;
        }
        if residual_plot {
            calls.issue(&EngineCommand::SaveResidualPlot {
                path: job.output_dir.join(RESIDUAL_PLOT_FILE),
            })?;
        }
        Ok(())
    }

    fn report(&self, job: &Job, stage: &Stage) -> StageOutcome {
        match report::write_job_outputs(job) {
            Ok(files) => StageOutcome::Completed(StageArtifacts {
                files,
                ..StageArtifacts::default()
            }),
            Err(e) => StageOutcome::Failed(
                FailureKind::StageFailure,
                format!("{}: {e}", stage.name),
            ),
        }
    }
}

fn failed(stage: &Stage, err: &EngineError) -> StageOutcome {
    StageOutcome::Failed(
        FailureKind::of(err).escalated(),
        format!("{}: {err}", stage.name),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::scripted::{Journal, Script, ScriptedEngine};
    use crate::engine::CommandKind;
    use crate::pipeline::{Dimensions, PipelineDefinition, Variant};
    use crate::state_machine::{Convergence, JobSpec};
    use std::path::Path;

    struct Fixture {
        config: AeroConfig,
        sink: EventSink,
        cancel: CancelFlag,
        journal: Journal,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                config: AeroConfig::default(),
                sink: EventSink::channel().0,
                cancel: CancelFlag::default(),
                journal: Journal::default(),
            }
        }

        fn executor(&self) -> StageExecutor<'_> {
            StageExecutor::new(&self.config, &self.sink, &self.cancel)
        }

        fn engine(&self, script: Script) -> ScriptedEngine {
            ScriptedEngine::new("job", script, self.journal.clone())
        }
    }

    fn job(variant: Variant, root: &Path) -> Job {
        Job::new(
            JobSpec {
                name: "job".into(),
                geometry: PathBuf::from("geom/car.pmdb"),
                variant,
                dimensions: Dimensions::new(2.0, 1.4, 0.5),
                output_dir: None,
            },
            root,
        )
    }

    fn stage(variant: Variant, name: &str) -> Stage {
        let def = PipelineDefinition::for_variant(variant, &AeroConfig::default()).unwrap();
        def.stages.into_iter().find(|s| s.name == name).unwrap()
    }

    #[test]
    fn geometry_stage_resolves_refinement_against_dimensions() {
        let fx = Fixture::new();
        let job = job(Variant::FrontWing, Path::new("/r"));
        let mut engine = fx.engine(Script::converging());
        let outcome = fx
            .executor()
            .execute(&job, &stage(Variant::FrontWing, "import-geometry"), &mut engine);
        assert!(matches!(outcome, StageOutcome::Completed(_)));

        let commands = fx.journal.commands_for("job");
        assert_eq!(
            commands[0],
            EngineCommand::ImportGeometry {
                path: PathBuf::from("geom/car.pmdb")
            }
        );
        match &commands[1] {
            EngineCommand::AddRefinementRegion(region) => {
                assert_eq!(region.name, "fw-near");
                assert_eq!(region.min, [-1.2, 0.0, 0.0]);
                assert_eq!(region.max, [3.0, 0.6, 0.7]);
            }
            other => panic!("unexpected command {other}"),
        }
    }

    #[test]
    fn volume_mesh_retries_one_transient_failure() {
        let fx = Fixture::new();
        let job = job(Variant::Undertray, Path::new("/r"));
        let mut engine =
            fx.engine(Script::converging().fail_recoverably(CommandKind::GenerateVolumeMesh, 1));
        match fx
            .executor()
            .execute(&job, &stage(Variant::Undertray, "volume-mesh"), &mut engine)
        {
            StageOutcome::Completed(artifacts) => {
                assert_eq!(artifacts.files, vec![PathBuf::from("/r/job/mesh_ut.msh.h5")]);
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[test]
    fn volume_mesh_fails_past_retry_bound() {
        let fx = Fixture::new();
        let job = job(Variant::Undertray, Path::new("/r"));
        let mut engine =
            fx.engine(Script::converging().fail_recoverably(CommandKind::GenerateVolumeMesh, 2));
        match fx
            .executor()
            .execute(&job, &stage(Variant::Undertray, "volume-mesh"), &mut engine)
        {
            StageOutcome::Failed(kind, reason) => {
                assert_eq!(kind, FailureKind::StageFailure);
                assert!(reason.starts_with("volume-mesh:"), "{reason}");
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        let generated = fx
            .journal
            .commands_for("job")
            .iter()
            .filter(|c| c.kind() == CommandKind::GenerateVolumeMesh)
            .count();
        assert_eq!(generated, 2);
    }

    #[test]
    fn half_car_setup_fixes_speed_and_symmetry_with_curvature_off() {
        let fx = Fixture::new();
        let job = job(Variant::HalfCar, Path::new("/r"));
        let mut engine = fx.engine(Script::converging());
        fx.executor()
            .execute(&job, &stage(Variant::HalfCar, "solver-setup"), &mut engine);
        let commands = fx.journal.commands_for("job");
        assert!(commands.contains(&EngineCommand::ConfigureTurbulence {
            curvature_correction: false
        }));
        assert!(commands.contains(&EngineCommand::SetInletVelocity { speed_mph: 40.0 }));
        assert!(commands.contains(&EngineCommand::SetMovingGround { speed_mph: 40.0 }));
        assert!(commands.contains(&EngineCommand::SetSymmetryPlane));
    }

    #[test]
    fn wing_setup_keeps_case_boundaries() {
        let fx = Fixture::new();
        let job = job(Variant::RearWing, Path::new("/r"));
        let mut engine = fx.engine(Script::converging());
        fx.executor()
            .execute(&job, &stage(Variant::RearWing, "solver-setup"), &mut engine);
        let kinds: Vec<CommandKind> = fx
            .journal
            .commands_for("job")
            .iter()
            .map(EngineCommand::kind)
            .collect();
        assert_eq!(
            kinds,
            vec![
                CommandKind::ReadMesh,
                CommandKind::ConfigureTurbulence,
                CommandKind::SetSolverControls
            ]
        );
    }

    #[test]
    fn extraction_doubles_half_car_area() {
        let fx = Fixture::new();
        let job = job(Variant::HalfCar, Path::new("/r"));
        let mut engine = fx.engine(
            Script::converging()
                .with_coefficients(0.8, -2.0)
                .with_zone_area(0.5),
        );
        match fx
            .executor()
            .execute(&job, &stage(Variant::HalfCar, "extraction"), &mut engine)
        {
            StageOutcome::Completed(artifacts) => {
                let aero = artifacts.aero.unwrap();
                assert_eq!(aero.projected_area, Some(1.0));
                assert_eq!(aero.scx, Some(0.8));
                assert_eq!(aero.scz, Some(-2.0));
                assert_eq!(artifacts.files, vec![PathBuf::from("/r/job/final.cas.h5")]);
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[test]
    fn extraction_without_area_for_wings() {
        let fx = Fixture::new();
        let job = job(Variant::FrontWing, Path::new("/r"));
        let mut engine = fx.engine(Script::converging());
        match fx
            .executor()
            .execute(&job, &stage(Variant::FrontWing, "extraction"), &mut engine)
        {
            StageOutcome::Completed(artifacts) => {
                let aero = artifacts.aero.unwrap();
                assert_eq!(aero.drag_coefficient, 0.92);
                assert!(aero.projected_area.is_none());
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        assert!(
            !fx.journal
                .commands_for("job")
                .iter()
                .any(|c| c.kind() == CommandKind::ComputeProjectedArea)
        );
    }

    #[test]
    fn ramp_stage_reports_incomplete_convergence_as_completed() {
        let fx = Fixture::new();
        let job = job(Variant::FrontWing, Path::new("/r"));
        let mut engine = fx.engine(Script::converging().with_final_continuity(5e-4));
        match fx
            .executor()
            .execute(&job, &stage(Variant::FrontWing, "ramp"), &mut engine)
        {
            StageOutcome::Completed(artifacts) => {
                let c = artifacts.convergence.unwrap();
                assert_eq!(c.classification, Convergence::Incomplete);
                assert!(artifacts.note.unwrap().starts_with("not converged"));
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[test]
    fn ramp_stage_repeated_divergence_is_divergence_fault() {
        let fx = Fixture::new();
        let job = job(Variant::Undertray, Path::new("/r"));
        let script = Script::converging().diverge_on_iterate(2).diverge_on_iterate(4);
        let mut engine = fx.engine(script);
        match fx
            .executor()
            .execute(&job, &stage(Variant::Undertray, "ramp"), &mut engine)
        {
            StageOutcome::Failed(kind, reason) => {
                assert_eq!(kind, FailureKind::DivergenceFault);
                assert!(reason.contains("1 restart"), "{reason}");
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[test]
    fn ramp_stage_observes_cancellation() {
        let fx = Fixture::new();
        fx.cancel.cancel();
        let job = job(Variant::FrontWing, Path::new("/r"));
        let mut engine = fx.engine(Script::converging());
        let outcome = fx
            .executor()
            .execute(&job, &stage(Variant::FrontWing, "ramp"), &mut engine);
        assert_eq!(outcome, StageOutcome::Cancelled);
    }

    #[test]
    fn post_process_writes_contours_and_residual_plot() {
        let fx = Fixture::new();
        let job = job(Variant::RearWing, Path::new("/r"));
        let mut engine = fx.engine(Script::converging());
        match fx
            .executor()
            .execute(&job, &stage(Variant::RearWing, "post-process"), &mut engine)
        {
            StageOutcome::Completed(artifacts) => assert_eq!(
                artifacts.files,
                vec![
                    PathBuf::from("/r/job/pressure.png"),
                    PathBuf::from("/r/job/velocity.png"),
                    PathBuf::from("/r/job/residuals.png"),
                ]
            ),
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[test]
    fn report_without_aero_result_fails_stage() {
        let fx = Fixture::new();
        let dir = tempfile::tempdir().unwrap();
        let job = job(Variant::FrontWing, dir.path());
        let mut engine = fx.engine(Script::converging());
        let outcome = fx
            .executor()
            .execute(&job, &stage(Variant::FrontWing, "report"), &mut engine);
        assert!(matches!(outcome, StageOutcome::Failed(FailureKind::StageFailure, _)));
    }

    #[test]
    fn record_attaches_results_to_job() {
        let fx = Fixture::new();
        let mut job = job(Variant::FrontWing, Path::new("/r"));
        let stage = stage(Variant::FrontWing, "extraction");
        let artifacts = StageArtifacts {
            files: vec![PathBuf::from("/r/job/final.cas.h5")],
            aero: Some(AeroResult::new(0.9, -2.1, None)),
            restarts: 1,
            ..StageArtifacts::default()
        };
        let record = fx.executor().record(&mut job, &stage, artifacts, Utc::now());
        assert_eq!(record.name, "extraction");
        assert_eq!(job.stages.len(), 1);
        assert_eq!(job.restarts, 1);
        assert_eq!(job.aero.unwrap().lift_coefficient, -2.1);
    }
}
