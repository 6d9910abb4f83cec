//! Interface de terminal do aerorun — spinners e saída colorida.
//!
//! Usa as crates `indicatif` para o spinner de progresso e `console` para
//! estilização com cores. O [`BatchProgress`] é alimentado apenas pelos
//! eventos do worker; nunca consulta o estado dos jobs diretamente.

use std::collections::HashMap;
use std::time::Duration;

use console::Style;
use indicatif::{ProgressBar, ProgressStyle};

use aerorun::pipeline::{PipelineDefinition, StageParams};
use aerorun::report::SummaryRow;
use aerorun::state_machine::{AuditRecord, JobId, JobStatus};
use aerorun::worker::{LogLevel, WorkerEvent};

/// Indicador visual de progresso para um lote de jobs.
///
/// O spinner mostra o job e a etapa atuais; avisos, erros e resultados
/// finais são impressos acima dele.
pub struct BatchProgress {
    // Spinner do indicatif.
    pb: ProgressBar,
    // Nome de cada job visto até agora, para mensagens curtas.
    names: HashMap<JobId, String>,
    verbose: bool,
    total: usize,
    finished: usize,
    green: Style,
    red: Style,
    yellow: Style,
    dim: Style,
}

impl BatchProgress {
    /// Inicia o spinner para um lote de `total` jobs.
    pub fn start(total: usize, verbose: bool) -> Self {
        let pb = ProgressBar::new_spinner();
        let style = ProgressStyle::default_spinner()
            .template("{spinner:.cyan} [{elapsed_precise}] {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner());
        pb.set_style(style);
        pb.set_message(format!("{total} job(s) queued"));
        pb.enable_steady_tick(Duration::from_millis(100));

        Self {
            pb,
            names: HashMap::new(),
            verbose,
            total,
            finished: 0,
            green: Style::new().green().bold(),
            red: Style::new().red().bold(),
            yellow: Style::new().yellow(),
            dim: Style::new().dim(),
        }
    }

    fn name(&self, id: JobId) -> String {
        self.names.get(&id).cloned().unwrap_or_else(|| id.short())
    }

    /// Atualiza o spinner a partir de um evento do worker.
    pub fn handle(&mut self, event: &WorkerEvent) {
        match event {
            WorkerEvent::JobStarted {
                job,
                name,
                variant,
                attempt,
            } => {
                self.names.insert(*job, name.clone());
                let retry = if *attempt > 1 {
                    format!(" (attempt {attempt})")
                } else {
                    String::new()
                };
                self.pb.set_message(format!(
                    "[{}/{}] {name} · {variant}{retry}",
                    self.finished + 1,
                    self.total
                ));
            }
            WorkerEvent::StageStarted {
                job,
                stage,
                kind,
                index,
                total,
            } => {
                self.pb.set_message(format!(
                    "{} · {kind} {stage} ({index}/{total})",
                    self.name(*job)
                ));
            }
            WorkerEvent::RampSubStage {
                job,
                index,
                target_iterations,
                curvature_correction,
            } => {
                let curvature = if *curvature_correction {
                    " + curvature correction"
                } else {
                    ""
                };
                self.pb.set_message(format!(
                    "{} · RAMP sub-stage {index}: {target_iterations} iterations{curvature}",
                    self.name(*job)
                ));
            }
            WorkerEvent::RampRestart {
                job,
                restart,
                reason,
            } => {
                self.pb.println(format!(
                    "  {} {}: ramp restart {restart}: {reason}",
                    self.yellow.apply_to("↻"),
                    self.name(*job)
                ));
            }
            WorkerEvent::StageFinished { job, record } => {
                if self.verbose {
                    self.pb.println(format!(
                        "  {} {} · {}",
                        self.dim.apply_to("·"),
                        self.name(*job),
                        record.name
                    ));
                }
            }
            WorkerEvent::Log {
                job,
                level,
                message,
            } => {
                let who = job.map(|id| format!("{}: ", self.name(id))).unwrap_or_default();
                match level {
                    LogLevel::Error => self.pb.println(format!(
                        "  {} {who}{message}",
                        self.red.apply_to("✗")
                    )),
                    LogLevel::Warn => self.pb.println(format!(
                        "  {} {who}{message}",
                        self.yellow.apply_to("!")
                    )),
                    LogLevel::Info if self.verbose => {
                        self.pb
                            .println(format!("  {}", self.dim.apply_to(format!("{who}{message}"))));
                    }
                    LogLevel::Info => {}
                }
            }
            WorkerEvent::JobFinished(record) => {
                self.finished += 1;
                self.pb.println(self.result_line(record));
            }
        }
    }

    fn result_line(&self, record: &AuditRecord) -> String {
        match record.status {
            JobStatus::Succeeded => {
                let coefficients = record
                    .aero
                    .map(|a| {
                        let (cd, cl) = (a.drag_coefficient, a.lift_coefficient);
                        let mut line = format!("Cd={cd:.4}, Cl={cl:.4}");
                        if let (Some(area), Some(scx), Some(scz)) =
                            (a.projected_area, a.scx, a.scz)
                        {
                            line += &format!(", A={area:.4} m², SCx={scx:.4}, SCz={scz:.4}");
                        }
                        line
                    })
                    .unwrap_or_default();
                let converged = record.convergence.as_ref().is_some_and(|c| c.is_converged());
                let flag = if converged {
                    String::new()
                } else {
                    format!(" {}", self.yellow.apply_to("(not converged)"))
                };
                format!(
                    "{} {} succeeded: {coefficients}{flag}",
                    self.green.apply_to("✓"),
                    record.name
                )
            }
            JobStatus::Cancelled => format!(
                "{} {} cancelled",
                self.yellow.apply_to("⊘"),
                record.name
            ),
            _ => format!(
                "{} {} failed: {}",
                self.red.apply_to("✗"),
                record.name,
                record
                    .error
                    .as_ref()
                    .map(|e| e.to_string())
                    .unwrap_or_else(|| record.status.to_string())
            ),
        }
    }

    /// Informa que o usuário interrompeu o lote.
    pub fn interrupted(&self, dropped: usize) {
        self.pb.println(format!(
            "  {} interrupted: {dropped} queued job(s) dropped, stopping the running job at its next stage",
            self.yellow.apply_to("⊘")
        ));
    }

    /// Finaliza o spinner e imprime a contagem final.
    pub fn finish(&self, records: &[AuditRecord]) {
        self.pb.finish_and_clear();
        let count = |s: JobStatus| records.iter().filter(|r| r.status == s).count();
        println!();
        println!(
            "{} succeeded, {} failed, {} cancelled",
            self.green.apply_to(count(JobStatus::Succeeded)),
            self.red.apply_to(count(JobStatus::Failed)),
            self.yellow.apply_to(count(JobStatus::Cancelled))
        );
    }
}

/// Imprime a sequência de etapas de uma variante e seus parâmetros.
pub fn print_plan(definition: &PipelineDefinition) {
    let bold = Style::new().bold();
    let dim = Style::new().dim();
    println!("{}", bold.apply_to(format!("{} pipeline", definition.variant)));
    for (i, stage) in definition.stages.iter().enumerate() {
        let detail = match &stage.params {
            StageParams::Geometry {
                refinement,
                curvature,
            } => format!(
                "{} refinement box(es), {} curvature sizing(s)",
                refinement.len(),
                curvature.len()
            ),
            StageParams::WheelRefinement { wheels } => {
                format!("{} wheel cylinder(s)", wheels.len())
            }
            StageParams::VolumeMesh {
                boundary_layer,
                mesh_file,
                ..
            } => format!(
                "{} layers x {} growth on {} zone(s) -> {mesh_file}",
                boundary_layer.layers,
                boundary_layer.growth_ratio,
                boundary_layer.zones.len()
            ),
            StageParams::SolverSetup {
                boundary, controls, ..
            } => {
                let inlet = boundary
                    .inlet_speed_mph
                    .map(|v| format!("inlet {v} mph"))
                    .unwrap_or_else(|| "case inlet".into());
                let symmetry = if boundary.symmetry_plane { ", symmetry plane" } else { "" };
                format!(
                    "{inlet}{symmetry}, relaxation {}, CFL {}",
                    controls.relaxation, controls.courant
                )
            }
            StageParams::WheelRotation { zones, omega_rad_s } => {
                format!("{omega_rad_s} rad/s on {}", zones.join(", "))
            }
            StageParams::Ramp(policy) => {
                let blocks: Vec<String> = policy
                    .plan
                    .sub_stages()
                    .iter()
                    .map(|s| {
                        if s.curvature_correction {
                            format!("{}+curv", s.target_iterations)
                        } else {
                            s.target_iterations.to_string()
                        }
                    })
                    .collect();
                format!(
                    "{} iterations, continuity < {:e}, {} restart(s)",
                    blocks.join("/"),
                    policy.convergence_threshold,
                    policy.max_restarts
                )
            }
            StageParams::Extraction { projected_area, .. } => match projected_area {
                Some(spec) if spec.mirror => "Cd, Cl, full-vehicle projected area".to_string(),
                Some(_) => "Cd, Cl, projected area".to_string(),
                None => "Cd, Cl".to_string(),
            },
            StageParams::PostProcess { contours, .. } => {
                format!("{} contour(s), residual plot", contours.len())
            }
            StageParams::Report => "coefficients.json, report.md".to_string(),
        };
        println!(
            "  {:>2}. {:<13} {:<17} {}",
            i + 1,
            stage.kind.to_string(),
            stage.name,
            dim.apply_to(detail)
        );
    }
}

/// Imprime o resumo do lote lido de `summary.csv`.
pub fn print_summary(rows: &[SummaryRow]) {
    if rows.is_empty() {
        println!("No finished jobs recorded yet.");
        return;
    }
    let green = Style::new().green();
    let red = Style::new().red();
    let yellow = Style::new().yellow();
    let num = |v: Option<f64>| v.map(|x| format!("{x:.4}")).unwrap_or_else(|| "-".into());

    println!(
        "{:<20} {:<11} {:<10} {:>8} {:>8} {:>8} {:>8}",
        "JOB", "VARIANT", "STATUS", "CD", "CL", "SCX", "SCZ"
    );
    for row in rows {
        let style = match row.status.as_str() {
            "SUCCEEDED" if row.converged => &green,
            "SUCCEEDED" | "CANCELLED" => &yellow,
            _ => &red,
        };
        println!(
            "{:<20} {:<11} {:<10} {:>8} {:>8} {:>8} {:>8}",
            row.name,
            row.variant,
            style.apply_to(&row.status),
            num(row.drag_coefficient),
            num(row.lift_coefficient),
            num(row.scx),
            num(row.scz)
        );
        if let Some(error) = &row.error {
            println!("    {}", red.apply_to(error));
        }
    }
}
