//! Persisted per-job outputs and the batch summary.
//!
//! The report stage writes three files into the job's output directory:
//! `coefficients.json`, `projected_area.txt` (only when an area was
//! measured) and `report.md`. Every job that reaches a terminal state adds
//! one row to `<output_root>/summary.csv`.

use std::fmt::Write as _;
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::AeroError;
use crate::pipeline::Variant;
use crate::state_machine::{Convergence, Job};

pub const COEFFICIENTS_FILE: &str = "coefficients.json";
pub const PROJECTED_AREA_FILE: &str = "projected_area.txt";
pub const REPORT_FILE: &str = "report.md";
pub const SUMMARY_FILE: &str = "summary.csv";

/// Contents of `coefficients.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoefficientRecord {
    pub job: String,
    pub variant: Variant,
    pub drag_coefficient: f64,
    pub lift_coefficient: f64,
    pub projected_area: Option<f64>,
    pub scx: Option<f64>,
    pub scz: Option<f64>,
    pub converged: bool,
    pub continuity: Option<f64>,
    pub restarts: u32,
}

/// Writes the coefficient record, projected area and report document.
/// Returns the paths written.
pub fn write_job_outputs(job: &Job) -> Result<Vec<PathBuf>, AeroError> {
    let aero = job
        .aero
        .ok_or_else(|| AeroError::MissingResult(job.name.clone()))?;
    fs::create_dir_all(&job.output_dir)?;
    let mut written = Vec::new();

    let record = CoefficientRecord {
        job: job.name.clone(),
        variant: job.variant,
        drag_coefficient: aero.drag_coefficient,
        lift_coefficient: aero.lift_coefficient,
        projected_area: aero.projected_area,
        scx: aero.scx,
        scz: aero.scz,
        converged: job.converged(),
        continuity: job.convergence.as_ref().and_then(|c| c.continuity),
        restarts: job.restarts,
    };
    let path = job.output_dir.join(COEFFICIENTS_FILE);
    fs::write(&path, serde_json::to_string_pretty(&record)?)?;
    written.push(path);

    if let Some(area) = aero.projected_area {
        let path = job.output_dir.join(PROJECTED_AREA_FILE);
        fs::write(&path, format!("{area:.6}\n"))?;
        written.push(path);
    }

    let path = job.output_dir.join(REPORT_FILE);
    fs::write(&path, render_report(job, &record))?;
    written.push(path);

    Ok(written)
}

fn fmt_opt(value: Option<f64>) -> String {
    value.map(|v| format!("{v:.4}")).unwrap_or_else(|| "n/a".into())
}

fn render_report(job: &Job, record: &CoefficientRecord) -> String {
    let mut out = String::new();
    let d = &job.dimensions;
    let _ = writeln!(out, "# {} ({})", job.name, job.variant);
    let _ = writeln!(out);
    let _ = writeln!(out, "| Field | Value |");
    let _ = writeln!(out, "|---|---|");
    let _ = writeln!(out, "| Geometry | `{}` |", job.geometry.display());
    let _ = writeln!(
        out,
        "| Dimensions (L x W x H) | {:.3} x {:.3} x {:.3} m |",
        d.length, d.width, d.height
    );
    let _ = writeln!(out, "| Attempt | {} |", job.attempt);
    let _ = writeln!(out, "| Ramp restarts | {} |", job.restarts);
    let _ = writeln!(out);

    let _ = writeln!(out, "## Coefficients");
    let _ = writeln!(out);
    let _ = writeln!(out, "| Cd | Cl | Area (m²) | SCx | SCz |");
    let _ = writeln!(out, "|---|---|---|---|---|");
    let _ = writeln!(
        out,
        "| {:.4} | {:.4} | {} | {} | {} |",
        record.drag_coefficient,
        record.lift_coefficient,
        fmt_opt(record.projected_area),
        fmt_opt(record.scx),
        fmt_opt(record.scz)
    );
    let _ = writeln!(out);

    let _ = writeln!(out, "## Convergence");
    let _ = writeln!(out);
    match &job.convergence {
        Some(c) if c.classification == Convergence::Converged => {
            let _ = writeln!(out, "Converged at iteration {}.", c.iteration);
        }
        Some(c) => {
            let _ = writeln!(
                out,
                "**Not converged** after {} iterations; results use the last available solution.",
                c.iteration
            );
        }
        None => {
            let _ = writeln!(out, "No convergence data.");
        }
    }
    if let Some(continuity) = record.continuity {
        let _ = writeln!(out);
        let _ = writeln!(out, "Final continuity residual: {continuity:e}");
    }
    let _ = writeln!(out);

    let _ = writeln!(out, "## Artifacts");
    let _ = writeln!(out);
    for stage in &job.stages {
        for file in &stage.artifacts {
            let _ = writeln!(out, "- {}: `{}`", stage.name, file.display());
        }
    }
    out
}

/// One line of `summary.csv`. Field names double as the header row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SummaryRow {
    pub name: String,
    pub variant: String,
    pub status: String,
    pub attempt: u32,
    pub drag_coefficient: Option<f64>,
    pub lift_coefficient: Option<f64>,
    pub projected_area: Option<f64>,
    pub scx: Option<f64>,
    pub scz: Option<f64>,
    pub converged: bool,
    pub error: Option<String>,
}

impl SummaryRow {
    pub fn from_job(job: &Job) -> Self {
        let aero = job.aero;
        Self {
            name: job.name.clone(),
            variant: job.variant.to_string(),
            status: job.status.to_string(),
            attempt: job.attempt,
            drag_coefficient: aero.map(|a| a.drag_coefficient),
            lift_coefficient: aero.map(|a| a.lift_coefficient),
            projected_area: aero.and_then(|a| a.projected_area),
            scx: aero.and_then(|a| a.scx),
            scz: aero.and_then(|a| a.scz),
            converged: job.converged(),
            error: job.error.as_ref().map(|e| e.to_string()),
        }
    }
}

/// Appends the job's row to `<output_root>/summary.csv`, writing the header
/// first if the file is new.
pub fn append_summary(output_root: &Path, job: &Job) -> Result<PathBuf, AeroError> {
    fs::create_dir_all(output_root)?;
    let path = output_root.join(SUMMARY_FILE);
    let fresh = fs::metadata(&path).map(|m| m.len() == 0).unwrap_or(true);
    let file = OpenOptions::new().create(true).append(true).open(&path)?;
    let mut writer = csv::WriterBuilder::new()
        .has_headers(fresh)
        .from_writer(file);
    writer.serialize(SummaryRow::from_job(job))?;
    writer.flush()?;
    Ok(path)
}

/// Reads `<output_root>/summary.csv`; a missing file is an empty summary.
pub fn read_summary(output_root: &Path) -> Result<Vec<SummaryRow>, AeroError> {
    let path = output_root.join(SUMMARY_FILE);
    if !path.exists() {
        return Ok(Vec::new());
    }
    let mut reader = csv::Reader::from_path(path)?;
    let rows = reader.deserialize().collect::<Result<Vec<SummaryRow>, _>>()?;
    Ok(rows)
}
