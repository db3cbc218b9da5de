//! Adaptive terrain rendering.

pub mod octree;
pub mod renderer;

pub use octree::{Octree, OctreeNodeId};
pub use renderer::{ContourMesh, MeshFlags, Mesher, TerrainRenderer, TerrainSettings};
