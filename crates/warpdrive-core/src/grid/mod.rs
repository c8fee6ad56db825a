//! Discrete volume grids.
//!
//! This module provides the grid geometry shared by deformation fields and
//! reference volumes, the resolver that derives a correction grid from a
//! reference grid, and index-grid generation for batched evaluation.

pub mod geometry;
pub mod resolve;
pub mod sampling;

pub use geometry::GridGeometry;
pub use resolve::resolve_grid;
pub use sampling::generate_slab_indices;
