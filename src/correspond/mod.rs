// Correspondence module
// Guided deformation search over structure graphs
//
// PIPELINE:
// 1. Load / build structure graphs for both shapes
// 2. Analyze symmetry and proximity relations on each
// 3. Seed the search with landmark assignments (optional)
// 4. Explore: assign relation pairings, deform, propagate, evaluate
// 5. The cheapest leaf's mapping is the correspondence

pub mod analysis;
pub mod compress;
pub mod deform_to_fit;
pub mod evaluate;
pub mod part;
pub mod propagation;
pub mod search;
pub mod structure_graph;
pub mod topology;

pub use compress::{CompressionTables, PartIndexTable, NULL_PART};
pub use deform_to_fit::{register_and_deform, FitError};
pub use part::{Coord4, Part, PartGeometry, PartKind, Spoke};
pub use propagation::{
    apply_deformation, prepare_for_proximity, propagate_proximity, propagate_symmetry,
    spokes_from_link,
};
pub use search::{CancelToken, Landmark, MatcherKind, Search, SearchConfig, SearchPath};
pub use structure_graph::{GraphError, Link, MemberOp, Relation, RelationKind, StructureGraph};
