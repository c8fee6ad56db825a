//! Core types for interactive warp correction.
//!
//! Grid geometry, dense deformation fields, point transforms and the
//! conversions between them. All world coordinates are RAS millimetres.

pub mod convert;
pub mod error;
pub mod field;
pub mod grid;
pub mod interpolation;
pub mod spatial;
pub mod tensor;
pub mod transform;

pub use convert::{to_grid_transform, InversionOptions};
pub use error::{Result, WarpDriveError};
pub use field::DeformationField;
pub use grid::{resolve_grid, GridGeometry};
pub use spatial::{flip_ras_lps, Point3, Vector3};
pub use transform::{ChainedTransform, RadialBasis, ThinPlateSplineTransform, Transform};
