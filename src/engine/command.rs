use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::pipeline::{
    BoundaryLayerSpec, CurvatureSizing, RefinementRegion, SurfaceMeshSpec, WheelRefinement,
};

/// Under-relaxation factor and pseudo-transient Courant number applied together.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SolverControls {
    pub relaxation: f64,
    pub courant: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ContourField {
    Pressure,
    Velocity,
}

impl ContourField {
    pub fn file_name(&self) -> &'static str {
        match self {
            ContourField::Pressure => "pressure.png",
            ContourField::Velocity => "velocity.png",
        }
    }
}

/// Stage intent expressed as engine operations. Adapters translate these into
/// the engine's own scripting vocabulary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EngineCommand {
    ImportGeometry { path: PathBuf },
    AddRefinementRegion(RefinementRegion),
    AddCurvatureSizing(CurvatureSizing),
    AddWheelRefinement(WheelRefinement),
    GenerateSurfaceMesh(SurfaceMeshSpec),
    AddBoundaryLayers(BoundaryLayerSpec),
    GenerateVolumeMesh { min_cell_length: f64, max_cell_length: f64 },
    SaveMesh { path: PathBuf },
    ReadMesh { path: PathBuf },
    /// Enables the GEKO k-omega model.
    ConfigureTurbulence { curvature_correction: bool },
    SetCurvatureCorrection(bool),
    SetSolverControls(SolverControls),
    SetInletVelocity { speed_mph: f64 },
    SetMovingGround { speed_mph: f64 },
    SetSymmetryPlane,
    SetWheelRotation { zone: String, omega_rad_s: f64 },
    InitializeSolution,
    Iterate { count: u64 },
    WriteCaseData { path: PathBuf },
    ReadForceCoefficients,
    ComputeProjectedArea { zones: Vec<String> },
    SaveContour { field: ContourField, path: PathBuf },
    SaveResidualPlot { path: PathBuf },
}

/// Field-less tag of an [`EngineCommand`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CommandKind {
    ImportGeometry,
    AddRefinementRegion,
    AddCurvatureSizing,
    AddWheelRefinement,
    GenerateSurfaceMesh,
    AddBoundaryLayers,
    GenerateVolumeMesh,
    SaveMesh,
    ReadMesh,
    ConfigureTurbulence,
    SetCurvatureCorrection,
    SetSolverControls,
    SetInletVelocity,
    SetMovingGround,
    SetSymmetryPlane,
    SetWheelRotation,
    InitializeSolution,
    Iterate,
    WriteCaseData,
    ReadForceCoefficients,
    ComputeProjectedArea,
    SaveContour,
    SaveResidualPlot,
}

impl EngineCommand {
    pub fn kind(&self) -> CommandKind {
        match self {
            EngineCommand::ImportGeometry { .. } => CommandKind::ImportGeometry,
            EngineCommand::AddRefinementRegion(_) => CommandKind::AddRefinementRegion,
            EngineCommand::AddCurvatureSizing(_) => CommandKind::AddCurvatureSizing,
            EngineCommand::AddWheelRefinement(_) => CommandKind::AddWheelRefinement,
            EngineCommand::GenerateSurfaceMesh(_) => CommandKind::GenerateSurfaceMesh,
            EngineCommand::AddBoundaryLayers(_) => CommandKind::AddBoundaryLayers,
            EngineCommand::GenerateVolumeMesh { .. } => CommandKind::GenerateVolumeMesh,
            EngineCommand::SaveMesh { .. } => CommandKind::SaveMesh,
            EngineCommand::ReadMesh { .. } => CommandKind::ReadMesh,
            EngineCommand::ConfigureTurbulence { .. } => CommandKind::ConfigureTurbulence,
            EngineCommand::SetCurvatureCorrection(_) => CommandKind::SetCurvatureCorrection,
            EngineCommand::SetSolverControls(_) => CommandKind::SetSolverControls,
            EngineCommand::SetInletVelocity { .. } => CommandKind::SetInletVelocity,
            EngineCommand::SetMovingGround { .. } => CommandKind::SetMovingGround,
            EngineCommand::SetSymmetryPlane => CommandKind::SetSymmetryPlane,
            EngineCommand::SetWheelRotation { .. } => CommandKind::SetWheelRotation,
            EngineCommand::InitializeSolution => CommandKind::InitializeSolution,
            EngineCommand::Iterate { .. } => CommandKind::Iterate,
            EngineCommand::WriteCaseData { .. } => CommandKind::WriteCaseData,
            EngineCommand::ReadForceCoefficients => CommandKind::ReadForceCoefficients,
            EngineCommand::ComputeProjectedArea { .. } => CommandKind::ComputeProjectedArea,
            EngineCommand::SaveContour { .. } => CommandKind::SaveContour,
            EngineCommand::SaveResidualPlot { .. } => CommandKind::SaveResidualPlot,
        }
    }

    /// Path of the file this command writes, if any.
    pub fn output_path(&self) -> Option<&PathBuf> {
        match self {
            EngineCommand::SaveMesh { path }
            | EngineCommand::WriteCaseData { path }
            | EngineCommand::SaveContour { path, .. }
            | EngineCommand::SaveResidualPlot { path } => Some(path),
            _ => None,
        }
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CommandKind::ImportGeometry => "import-geometry",
            CommandKind::AddRefinementRegion => "add-refinement-region",
            CommandKind::AddCurvatureSizing => "add-curvature-sizing",
            CommandKind::AddWheelRefinement => "add-wheel-refinement",
            CommandKind::GenerateSurfaceMesh => "generate-surface-mesh",
            CommandKind::AddBoundaryLayers => "add-boundary-layers",
            CommandKind::GenerateVolumeMesh => "generate-volume-mesh",
            CommandKind::SaveMesh => "save-mesh",
            CommandKind::ReadMesh => "read-mesh",
            CommandKind::ConfigureTurbulence => "configure-turbulence",
            CommandKind::SetCurvatureCorrection => "set-curvature-correction",
            CommandKind::SetSolverControls => "set-solver-controls",
            CommandKind::SetInletVelocity => "set-inlet-velocity",
            CommandKind::SetMovingGround => "set-moving-ground",
            CommandKind::SetSymmetryPlane => "set-symmetry-plane",
            CommandKind::SetWheelRotation => "set-wheel-rotation",
            CommandKind::InitializeSolution => "initialize-solution",
            CommandKind::Iterate => "iterate",
            CommandKind::WriteCaseData => "write-case-data",
            CommandKind::ReadForceCoefficients => "read-force-coefficients",
            CommandKind::ComputeProjectedArea => "compute-projected-area",
            CommandKind::SaveContour => "save-contour",
            CommandKind::SaveResidualPlot => "save-residual-plot",
        };
        f.write_str(name)
    }
}

impl fmt::Display for EngineCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineCommand::Iterate { count } => write!(f, "iterate {count}"),
            EngineCommand::SetCurvatureCorrection(on) => {
                write!(f, "set-curvature-correction {}", if *on { "on" } else { "off" })
            }
            other => match other.output_path() {
                Some(path) => write!(f, "{} {}", other.kind(), path.display()),
                None => write!(f, "{}", other.kind()),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_display_includes_arguments_that_matter() {
        assert_eq!(EngineCommand::Iterate { count: 5000 }.to_string(), "iterate 5000");
        assert_eq!(
            EngineCommand::SetCurvatureCorrection(true).to_string(),
            "set-curvature-correction on"
        );
        assert_eq!(
            EngineCommand::SaveMesh {
                path: PathBuf::from("out/mesh_fw.msh.h5")
            }
            .to_string(),
            "save-mesh out/mesh_fw.msh.h5"
        );
        assert_eq!(EngineCommand::SetSymmetryPlane.to_string(), "set-symmetry-plane");
    }

    #[test]
    fn output_path_only_for_writing_commands() {
        let write = EngineCommand::WriteCaseData {
            path: PathBuf::from("final.cas.h5"),
        };
        assert_eq!(write.output_path(), Some(&PathBuf::from("final.cas.h5")));
        let read = EngineCommand::ReadMesh {
            path: PathBuf::from("mesh.msh.h5"),
        };
        assert!(read.output_path().is_none());
    }
}
