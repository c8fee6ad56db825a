use nalgebra::{Matrix3, Point3 as NaPoint3, Vector3 as NaVector3};

pub type Point3 = NaPoint3<f64>;
pub type Vector3 = NaVector3<f64>;
pub type Spacing3 = NaVector3<f64>;
pub type Direction3 = Matrix3<f64>;

/// Flip between RAS (internal world frame) and LPS (ITK/ANTs and markups files).
///
/// The operation is its own inverse.
pub fn flip_ras_lps(v: [f64; 3]) -> [f64; 3] {
    [-v[0], -v[1], v[2]]
}
