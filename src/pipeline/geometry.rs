use serde::{Deserialize, Serialize};

/// Chassis bounding dimensions in metres.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Dimensions {
    pub length: f64,
    pub width: f64,
    pub height: f64,
}

impl Dimensions {
    pub fn new(length: f64, width: f64, height: f64) -> Self {
        Self {
            length,
            width,
            height,
        }
    }

    pub fn is_valid(&self) -> bool {
        [self.length, self.width, self.height]
            .iter()
            .all(|v| v.is_finite() && *v > 0.0)
    }
}

/// Refinement box stored as multiples of the chassis size, so one definition
/// serves every job of a variant.
///
/// `x_min`/`x_max` scale the length, `y_max` the height. The box always
/// starts at the ground (`y = 0`) and the symmetry plane (`z = 0`) and extends
/// to half the chassis width.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefinementBox {
    pub name: String,
    pub mesh_size: f64,
    pub x_min: f64,
    pub x_max: f64,
    pub y_max: f64,
}

impl RefinementBox {
    pub fn new(name: &str, mesh_size: f64, x_min: f64, x_max: f64, y_max: f64) -> Self {
        Self {
            name: name.to_string(),
            mesh_size,
            x_min,
            x_max,
            y_max,
        }
    }

    pub fn resolve(&self, dims: &Dimensions) -> RefinementRegion {
        RefinementRegion {
            name: self.name.clone(),
            mesh_size: self.mesh_size,
            min: [self.x_min * dims.length, 0.0, 0.0],
            max: [
                self.x_max * dims.length,
                self.y_max * dims.height,
                dims.width * 0.5,
            ],
        }
    }
}

/// A refinement box in absolute coordinates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefinementRegion {
    pub name: String,
    pub mesh_size: f64,
    pub min: [f64; 3],
    pub max: [f64; 3],
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CurvatureSizing {
    pub label: String,
    pub zones: Vec<String>,
    pub min_size: f64,
    pub max_size: f64,
    pub normal_angle_deg: f64,
}

impl CurvatureSizing {
    pub fn new(
        label: &str,
        zones: &[&str],
        min_size: f64,
        max_size: f64,
        normal_angle_deg: f64,
    ) -> Self {
        Self {
            label: label.to_string(),
            zones: zones.iter().map(|z| z.to_string()).collect(),
            min_size,
            max_size,
            normal_angle_deg,
        }
    }
}

/// Cylindrical refinement around one wheel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WheelRefinement {
    pub zone: String,
    pub center: [f64; 3],
    pub radius: f64,
    pub height: f64,
    pub mesh_size: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SurfaceMeshSpec {
    pub min_size: f64,
    pub max_size: f64,
    pub growth_rate: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundaryLayerSpec {
    pub zones: Vec<String>,
    pub layers: u32,
    pub growth_ratio: f64,
    pub first_layer_height: f64,
}

/// Inlet, ground and symmetry settings applied during solver setup.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundaryConditions {
    /// Fixed inlet speed; `None` keeps the case default.
    pub inlet_speed_mph: Option<f64>,
    /// Ground translates with the inlet speed.
    pub moving_ground: bool,
    pub symmetry_plane: bool,
}

impl BoundaryConditions {
    pub fn case_default() -> Self {
        Self {
            inlet_speed_mph: None,
            moving_ground: false,
            symmetry_plane: false,
        }
    }
}

/// Projected frontal area query. `mirror` doubles the result for a
/// half-domain model cut at the symmetry plane.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectedAreaSpec {
    pub zones: Vec<String>,
    pub mirror: bool,
}
