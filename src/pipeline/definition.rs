use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::geometry::{
    BoundaryConditions, BoundaryLayerSpec, CurvatureSizing, ProjectedAreaSpec, RefinementBox,
    SurfaceMeshSpec, WheelRefinement,
};
use crate::config::AeroConfig;
use crate::engine::{ContourField, SolverControls};
use crate::error::AeroError;
use crate::state_machine::RampPolicy;

/// The four simulated assemblies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Variant {
    FrontWing,
    RearWing,
    Undertray,
    HalfCar,
}

impl Variant {
    pub const ALL: [Variant; 4] = [
        Variant::FrontWing,
        Variant::RearWing,
        Variant::Undertray,
        Variant::HalfCar,
    ];

    /// Short tag used in file names.
    pub fn slug(&self) -> &'static str {
        match self {
            Variant::FrontWing => "fw",
            Variant::RearWing => "rw",
            Variant::Undertray => "ut",
            Variant::HalfCar => "hc",
        }
    }
}

impl fmt::Display for Variant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Variant::FrontWing => write!(f, "Front Wing"),
            Variant::RearWing => write!(f, "Rear Wing"),
            Variant::Undertray => write!(f, "Undertray"),
            Variant::HalfCar => write!(f, "Half-Car"),
        }
    }
}

impl FromStr for Variant {
    type Err = AeroError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized: String = s
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .collect::<String>()
            .to_ascii_lowercase();
        match normalized.as_str() {
            "frontwing" | "fw" => Ok(Variant::FrontWing),
            "rearwing" | "rw" => Ok(Variant::RearWing),
            "undertray" | "ut" => Ok(Variant::Undertray),
            "halfcar" | "hc" => Ok(Variant::HalfCar),
            _ => Err(AeroError::Config(format!("unknown pipeline variant: {s}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StageKind {
    Mesh,
    SolverSetup,
    Ramp,
    Extraction,
    PostProcess,
    Report,
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StageKind::Mesh => write!(f, "MESH"),
            StageKind::SolverSetup => write!(f, "SOLVER_SETUP"),
            StageKind::Ramp => write!(f, "RAMP"),
            StageKind::Extraction => write!(f, "EXTRACTION"),
            StageKind::PostProcess => write!(f, "POST_PROCESS"),
            StageKind::Report => write!(f, "REPORT"),
        }
    }
}

/// What the stage executor needs to run one stage.
#[derive(Debug, Clone, PartialEq)]
pub enum StageParams {
    Geometry {
        refinement: Vec<RefinementBox>,
        curvature: Vec<CurvatureSizing>,
    },
    WheelRefinement {
        wheels: Vec<WheelRefinement>,
    },
    VolumeMesh {
        surface: SurfaceMeshSpec,
        boundary_layer: BoundaryLayerSpec,
        min_cell_length: f64,
        max_cell_length: f64,
        mesh_file: String,
    },
    SolverSetup {
        mesh_file: String,
        boundary: BoundaryConditions,
        controls: SolverControls,
    },
    WheelRotation {
        zones: Vec<String>,
        omega_rad_s: f64,
    },
    Ramp(RampPolicy),
    Extraction {
        case_file: String,
        projected_area: Option<ProjectedAreaSpec>,
    },
    PostProcess {
        contours: Vec<ContourField>,
        residual_plot: bool,
    },
    Report,
}

impl StageParams {
    pub fn kind(&self) -> StageKind {
        match self {
            StageParams::Geometry { .. }
            | StageParams::WheelRefinement { .. }
            | StageParams::VolumeMesh { .. } => StageKind::Mesh,
            StageParams::SolverSetup { .. } | StageParams::WheelRotation { .. } => {
                StageKind::SolverSetup
            }
            StageParams::Ramp(_) => StageKind::Ramp,
            StageParams::Extraction { .. } => StageKind::Extraction,
            StageParams::PostProcess { .. } => StageKind::PostProcess,
            StageParams::Report => StageKind::Report,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Stage {
    pub name: String,
    pub kind: StageKind,
    pub params: StageParams,
}

impl Stage {
    pub fn new(name: &str, params: StageParams) -> Self {
        Self {
            name: name.to_string(),
            kind: params.kind(),
            params,
        }
    }
}

/// Per-variant parameter table.
#[derive(Debug, Clone, PartialEq)]
pub struct VariantParams {
    /// Rotating-wall speed for wheel zones; `None` for variants without wheels.
    pub wheel_rotation_rad_s: Option<f64>,
    pub wheel_zones: Vec<String>,
    pub wheels: Vec<WheelRefinement>,
    pub boundary_layer: BoundaryLayerSpec,
    pub refinement_boxes: Vec<RefinementBox>,
    pub curvature: Vec<CurvatureSizing>,
    pub boundary: BoundaryConditions,
    pub projected_area: Option<ProjectedAreaSpec>,
}

const FRONT_WHEEL_CENTER: [f64; 3] = [-0.7874, 0.2032, 0.6096];
const REAR_WHEEL_CENTER: [f64; 3] = [0.7874, 0.2032, 0.5842];
const WHEEL_REFINEMENT_RADIUS: f64 = 0.254;
const WHEEL_REFINEMENT_HEIGHT: f64 = 0.25;
const WHEEL_REFINEMENT_SIZE: f64 = 0.016;

fn zones(names: &[&str]) -> Vec<String> {
    names.iter().map(|z| z.to_string()).collect()
}

fn wheel_refinements() -> Vec<WheelRefinement> {
    [("fw", FRONT_WHEEL_CENTER), ("rw", REAR_WHEEL_CENTER)]
        .into_iter()
        .map(|(zone, center)| WheelRefinement {
            zone: zone.to_string(),
            center,
            radius: WHEEL_REFINEMENT_RADIUS,
            height: WHEEL_REFINEMENT_HEIGHT,
            mesh_size: WHEEL_REFINEMENT_SIZE,
        })
        .collect()
}

impl VariantParams {
    pub fn for_variant(variant: Variant, config: &AeroConfig) -> Self {
        let bl = |names: &[&str]| BoundaryLayerSpec {
            zones: zones(names),
            layers: config.meshing.bl_layers,
            growth_ratio: config.meshing.bl_growth,
            first_layer_height: config.meshing.first_layer_height,
        };
        let wheel_zones = zones(&["fw", "rw", "fwb", "rwb"]);

        match variant {
            Variant::FrontWing => Self {
                wheel_rotation_rad_s: None,
                wheel_zones: Vec::new(),
                wheels: Vec::new(),
                boundary_layer: bl(&["frontwing"]),
                refinement_boxes: vec![
                    RefinementBox::new("fw-near", 0.016, -0.6, 1.5, 1.2),
                    RefinementBox::new("fw-mid", 0.032, -0.7, 3.0, 2.0),
                    RefinementBox::new("fw-far", 0.064, -0.8, 5.0, 3.0),
                ],
                curvature: vec![CurvatureSizing::new(
                    "curvature-fw",
                    &["frontwing"],
                    0.0005,
                    0.008,
                    9.0,
                )],
                boundary: BoundaryConditions::case_default(),
                projected_area: None,
            },
            Variant::RearWing => Self {
                wheel_rotation_rad_s: None,
                wheel_zones: Vec::new(),
                wheels: Vec::new(),
                boundary_layer: bl(&["rearwing"]),
                refinement_boxes: Vec::new(),
                curvature: vec![CurvatureSizing::new(
                    "curvature-rw",
                    &["rearwing"],
                    0.0005,
                    0.008,
                    9.0,
                )],
                boundary: BoundaryConditions::case_default(),
                projected_area: None,
            },
            Variant::Undertray => Self {
                wheel_rotation_rad_s: Some(config.physics.wheel_omega_rad_s),
                wheel_zones,
                wheels: wheel_refinements(),
                boundary_layer: bl(&["undertray", "fw", "rw", "fwb", "rwb"]),
                refinement_boxes: vec![
                    RefinementBox::new("refine-near", 0.016, -0.65, 2.2, 1.5),
                    RefinementBox::new("refine-mid", 0.032, -0.72, 4.1, 2.2),
                    RefinementBox::new("refine-far", 0.064, -0.78, 6.0, 3.0),
                ],
                curvature: vec![
                    CurvatureSizing::new("curv-ut", &["undertray"], 0.0005, 0.008, 9.0),
                    CurvatureSizing::new("curv-w", &["fw", "rw"], 0.0005, 0.032, 18.0),
                    CurvatureSizing::new("curv-b", &["fwb", "rwb"], 0.0005, 0.032, 18.0),
                ],
                boundary: BoundaryConditions::case_default(),
                projected_area: None,
            },
            Variant::HalfCar => Self {
                wheel_rotation_rad_s: Some(config.physics.wheel_omega_rad_s),
                wheel_zones,
                wheels: wheel_refinements(),
                boundary_layer: bl(&[
                    "chassis", "frontwing", "rearwing", "undertray", "fw", "fwb", "rw", "rwb",
                ]),
                refinement_boxes: vec![
                    RefinementBox::new("near", 0.032, -0.65, 2.2, 1.5),
                    RefinementBox::new("mid", 0.064, -0.72, 4.1, 2.2),
                    RefinementBox::new("far", 0.128, -0.78, 6.0, 3.0),
                ],
                curvature: vec![
                    CurvatureSizing::new(
                        "curv-aero",
                        &["frontwing", "rearwing", "undertray"],
                        0.0005,
                        0.008,
                        9.0,
                    ),
                    CurvatureSizing::new(
                        "curv-wheels",
                        &["fw", "rw", "fwb", "rwb"],
                        0.0005,
                        0.032,
                        18.0,
                    ),
                    CurvatureSizing::new("curv-chassis", &["chassis"], 0.0005, 0.032, 18.0),
                ],
                boundary: BoundaryConditions {
                    inlet_speed_mph: Some(config.physics.inlet_speed_mph),
                    moving_ground: true,
                    symmetry_plane: true,
                },
                projected_area: Some(ProjectedAreaSpec {
                    zones: zones(&[
                        "frontwing", "rearwing", "undertray", "chassis", "fw", "fwb", "rw", "rwb",
                    ]),
                    mirror: true,
                }),
            },
        }
    }
}

/// Ordered stage sequence plus parameters for one variant. Built once and
/// shared read-only by every job of that variant.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineDefinition {
    pub variant: Variant,
    pub stages: Vec<Stage>,
    pub params: VariantParams,
}

impl PipelineDefinition {
    pub fn for_variant(variant: Variant, config: &AeroConfig) -> Result<Self, AeroError> {
        let params = VariantParams::for_variant(variant, config);
        let ramp = RampPolicy::from_config(&config.ramp)?;
        let mesh_file = format!("mesh_{}.msh.h5", variant.slug());

        let mut stages = vec![Stage::new(
            "import-geometry",
            StageParams::Geometry {
                refinement: params.refinement_boxes.clone(),
                curvature: params.curvature.clone(),
            },
        )];
        if !params.wheels.is_empty() {
            stages.push(Stage::new(
                "wheel-refinement",
                StageParams::WheelRefinement {
                    wheels: params.wheels.clone(),
                },
            ));
        }
        stages.push(Stage::new(
            "volume-mesh",
            StageParams::VolumeMesh {
                surface: SurfaceMeshSpec {
                    min_size: 0.002,
                    max_size: 0.256,
                    growth_rate: 1.2,
                },
                boundary_layer: params.boundary_layer.clone(),
                min_cell_length: config.meshing.min_cell_length,
                max_cell_length: config.meshing.max_cell_length,
                mesh_file: mesh_file.clone(),
            },
        ));
        stages.push(Stage::new(
            "solver-setup",
            StageParams::SolverSetup {
                mesh_file,
                boundary: params.boundary,
                controls: SolverControls {
                    relaxation: config.ramp.relaxation,
                    courant: config.ramp.courant,
                },
            },
        ));
        if let Some(omega_rad_s) = params.wheel_rotation_rad_s {
            stages.push(Stage::new(
                "wheel-rotation",
                StageParams::WheelRotation {
                    zones: params.wheel_zones.clone(),
                    omega_rad_s,
                },
            ));
        }
        stages.push(Stage::new("ramp", StageParams::Ramp(ramp)));
        stages.push(Stage::new(
            "extraction",
            StageParams::Extraction {
                case_file: "final.cas.h5".to_string(),
                projected_area: params.projected_area.clone(),
            },
        ));
        stages.push(Stage::new(
            "post-process",
            StageParams::PostProcess {
                contours: vec![ContourField::Pressure, ContourField::Velocity],
                residual_plot: true,
            },
        ));
        stages.push(Stage::new("report", StageParams::Report));

        Ok(Self {
            variant,
            stages,
            params,
        })
    }

    pub fn stage_names(&self) -> Vec<&str> {
        self.stages.iter().map(|s| s.name.as_str()).collect()
    }

    pub fn has_stage(&self, name: &str) -> bool {
        self.stages.iter().any(|s| s.name == name)
    }

    pub fn reports_full_vehicle_area(&self) -> bool {
        self.params
            .projected_area
            .as_ref()
            .is_some_and(|spec| spec.mirror)
    }
}

/// One shared definition per variant.
#[derive(Debug, Clone)]
pub struct PipelineCatalog {
    definitions: BTreeMap<Variant, Arc<PipelineDefinition>>,
}

impl PipelineCatalog {
    pub fn from_config(config: &AeroConfig) -> Result<Self, AeroError> {
        let definitions = Variant::ALL
            .into_iter()
            .map(|v| Ok((v, Arc::new(PipelineDefinition::for_variant(v, config)?))))
            .collect::<Result<_, AeroError>>()?;
        Ok(Self { definitions })
    }

    pub fn get(&self, variant: Variant) -> Option<Arc<PipelineDefinition>> {
        self.definitions.get(&variant).cloned()
    }
}
