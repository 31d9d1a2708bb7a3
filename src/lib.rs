// Core modules for part-graph shape correspondence
pub mod geometry;
pub mod morton;
pub mod mesh;
pub mod voxel_grid;
pub mod particles;
pub mod segment_graph;
pub mod convex_hull;
pub mod obb;
pub mod munkres;
pub mod segmentation;
pub mod correspond;
pub mod evaluation;

// Re-export commonly used types
pub use geometry::{Aabb, Plane, Point3D, Triangle, Vector3D};
pub use mesh::{Mesh, MeshError};
pub use particles::{Particle, ParticleMesh};
pub use segmentation::{segment, SegmentationConfig};
pub use correspond::{Landmark, Search, SearchConfig, StructureGraph};

/// Main result type for the crate
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for the correspondence pipeline
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Mesh error: {0}")]
    Mesh(#[from] MeshError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Graph error: {0}")]
    Graph(#[from] correspond::GraphError),

    #[error("Evaluation error: {0}")]
    Eval(#[from] evaluation::EvalError),

    #[error("Search produced no leaves for pair {0} -> {1}")]
    NoSolution(String, String),
}
