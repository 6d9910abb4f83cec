mod definition;
mod geometry;

pub use definition::{
    PipelineCatalog, PipelineDefinition, Stage, StageKind, StageParams, Variant, VariantParams,
};
pub use geometry::{
    BoundaryConditions, BoundaryLayerSpec, CurvatureSizing, Dimensions, ProjectedAreaSpec,
    RefinementBox, RefinementRegion, SurfaceMeshSpec, WheelRefinement,
};
