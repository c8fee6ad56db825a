//! Transform types and operations.
//!
//! This module provides the transform trait and the parametric transforms
//! the correction pipeline produces before they are sampled onto a grid.

pub mod trait_;
pub mod thin_plate;
pub mod chained;

pub use trait_::Transform;
pub use thin_plate::{RadialBasis, ThinPlateSplineTransform};
pub use chained::ChainedTransform;
