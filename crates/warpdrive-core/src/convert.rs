//! Conversions between transforms and dense deformation fields.
//!
//! Every routine walks the target grid in z-slabs so that memory stays
//! bounded for whole-brain grids.

use burn::tensor::backend::Backend;
use burn::tensor::{ElementConversion, Tensor};

use crate::error::{Result, WarpDriveError};
use crate::field::DeformationField;
use crate::grid::sampling::slab_depth;
use crate::grid::{generate_slab_indices, GridGeometry};
use crate::transform::{ChainedTransform, Transform};

/// Voxels evaluated per slab.
pub const DEFAULT_SLAB_POINTS: usize = 65_536;

/// Fixed-point inversion settings.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InversionOptions {
    /// Maximum number of fixed-point iterations.
    pub iterations: usize,
    /// Stop once no displacement changes by more than this many mm.
    pub tolerance: f64,
}

impl Default for InversionOptions {
    fn default() -> Self {
        Self {
            iterations: 20,
            tolerance: 0.01,
        }
    }
}

/// Sample a transform on `grid` as a displacement field.
///
/// The result holds `T(x) - x` for every voxel center `x` of `grid`.
pub fn to_grid_transform<B, T>(
    transform: &T,
    grid: &GridGeometry,
    device: &B::Device,
) -> Result<DeformationField<B>>
where
    B: Backend,
    T: Transform<B> + ?Sized,
{
    grid.validate()?;
    let [nx, ny, nz] = grid.size();
    let depth = slab_depth(grid, DEFAULT_SLAB_POINTS);

    let mut slabs = Vec::with_capacity(nz.div_ceil(depth));
    let mut z = 0;
    while z < nz {
        let z_end = (z + depth).min(nz);
        let indices = generate_slab_indices::<B>(grid, z, z_end, device);
        let points = grid.index_to_world_tensor(indices);
        let mapped = transform.transform_points(points.clone());
        let displacement = mapped - points;
        slabs.push(displacement.swap_dims(0, 1).reshape([3, z_end - z, ny, nx]));
        z = z_end;
    }

    tracing::debug!(size = ?grid.size(), slabs = slabs.len(), "sampled transform onto grid");
    DeformationField::new(Tensor::cat(slabs, 1), grid.clone())
}

/// Invert a displacement field on its own grid.
pub fn invert<B: Backend>(
    field: &DeformationField<B>,
    options: &InversionOptions,
) -> Result<DeformationField<B>> {
    invert_onto(field, field.grid(), options)
}

/// Invert a displacement field, sampling the inverse on `grid`.
///
/// Solves `v(y) = -u(y + v(y))` by fixed-point iteration starting from
/// `v = -u(y)`. Converges for fields whose Jacobian stays positive, which
/// holds for the smooth corrections produced interactively.
pub fn invert_onto<B: Backend>(
    field: &DeformationField<B>,
    grid: &GridGeometry,
    options: &InversionOptions,
) -> Result<DeformationField<B>> {
    grid.validate()?;
    if options.iterations == 0 || options.tolerance.is_nan() || options.tolerance <= 0.0 {
        return Err(WarpDriveError::invalid_parameter(format!(
            "invalid inversion options: {options:?}"
        )));
    }

    let device = field.device();
    let [nx, ny, nz] = grid.size();
    let depth = slab_depth(grid, DEFAULT_SLAB_POINTS);

    let mut slabs = Vec::new();
    let mut worst_residual = 0.0f64;
    let mut z = 0;
    while z < nz {
        let z_end = (z + depth).min(nz);
        let indices = generate_slab_indices::<B>(grid, z, z_end, &device);
        let points = grid.index_to_world_tensor(indices);

        let mut inverse = field.sample(points.clone()).neg();
        let mut residual = f64::INFINITY;
        for _ in 0..options.iterations {
            let next = field.sample(points.clone() + inverse.clone()).neg();
            residual = max_norm(next.clone() - inverse);
            inverse = next;
            if residual < options.tolerance {
                break;
            }
        }
        worst_residual = worst_residual.max(residual);

        slabs.push(inverse.swap_dims(0, 1).reshape([3, z_end - z, ny, nx]));
        z = z_end;
    }

    if worst_residual >= options.tolerance {
        tracing::warn!(
            residual = worst_residual,
            tolerance = options.tolerance,
            "field inversion did not converge"
        );
    } else {
        tracing::debug!(residual = worst_residual, "field inversion converged");
    }

    DeformationField::new(Tensor::cat(slabs, 1), grid.clone())
}

/// Field of `outer(inner(x))` sampled on `grid`.
pub fn compose<B, T1, T2>(
    outer: &T1,
    inner: &T2,
    grid: &GridGeometry,
    device: &B::Device,
) -> Result<DeformationField<B>>
where
    B: Backend,
    T1: Transform<B> + ?Sized,
    T2: Transform<B> + ?Sized,
{
    to_grid_transform(&ChainedTransform::new(inner, outer), grid, device)
}

/// Resample a field onto another grid.
pub fn resample<B: Backend>(
    field: &DeformationField<B>,
    grid: &GridGeometry,
) -> Result<DeformationField<B>> {
    to_grid_transform(field, grid, &field.device())
}

/// Largest `|inverse(forward(x)) - x|` over the voxel centers of the
/// forward field's grid, in mm.
pub fn inverse_consistency_error<B: Backend>(
    forward: &DeformationField<B>,
    inverse: &DeformationField<B>,
) -> Result<f64> {
    let chain = ChainedTransform::new(forward, inverse);
    let roundtrip = to_grid_transform(&chain, forward.grid(), &forward.device())?;
    Ok(roundtrip.max_displacement())
}

/// Fail if the forward and inverse fields drifted apart by more than
/// `tolerance` mm.
pub fn check_consistency<B: Backend>(
    forward: &DeformationField<B>,
    inverse: &DeformationField<B>,
    tolerance: f64,
) -> Result<f64> {
    let error = inverse_consistency_error(forward, inverse)?;
    if error > tolerance {
        tracing::warn!(error, tolerance, "forward and inverse warps are inconsistent");
        return Err(WarpDriveError::inconsistent_state(format!(
            "inverse consistency error {error:.3} mm exceeds {tolerance:.3} mm"
        )));
    }
    Ok(error)
}

fn max_norm<B: Backend>(vectors: Tensor<B, 2>) -> f64 {
    let max: f64 = vectors.powf_scalar(2.0).sum_dim(1).max().into_scalar().elem();
    max.max(0.0).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spatial::{Point3, Spacing3, Vector3};
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    fn grid() -> GridGeometry {
        GridGeometry::new([6, 5, 4], Point3::new(-3.0, -2.0, -1.0), Spacing3::repeat(1.0))
    }

    fn constant(grid: &GridGeometry, d: [f32; 3]) -> DeformationField<TestBackend> {
        let n = grid.num_voxels();
        let values: Vec<f32> = d.iter().flat_map(|&c| std::iter::repeat(c).take(n)).collect();
        DeformationField::from_vec(grid, values, &Default::default()).unwrap()
    }

    #[test]
    fn test_to_grid_of_field_is_field() {
        let grid = grid();
        let field = constant(&grid, [1.0, -0.5, 0.25]);
        let sampled = to_grid_transform(&field, &grid, &Default::default()).unwrap();
        let a = field.to_vec().unwrap();
        let b = sampled.to_vec().unwrap();
        for (x, y) in a.iter().zip(b.iter()) {
            assert!((x - y).abs() < 1e-5);
        }
    }

    #[test]
    fn test_invert_constant_field() {
        let grid = grid();
        let field = constant(&grid, [0.5, 0.0, -0.25]);
        let inverse = invert(&field, &InversionOptions::default()).unwrap();
        let d = inverse.displacement_at(&Point3::new(0.0, 0.0, 0.0)).unwrap();
        assert!((d - Vector3::new(-0.5, 0.0, 0.25)).norm() < 1e-4);
    }

    #[test]
    fn test_compose_adds_constant_fields() {
        let grid = grid();
        let a = constant(&grid, [1.0, 0.0, 0.0]);
        let b = constant(&grid, [0.0, 0.5, 0.0]);
        let composed = compose(&a, &b, &grid, &Default::default()).unwrap();
        let d = composed.displacement_at(&Point3::new(0.0, 0.0, 0.0)).unwrap();
        assert!((d - Vector3::new(1.0, 0.5, 0.0)).norm() < 1e-4);
    }

    #[test]
    fn test_consistency_check() {
        let grid = grid();
        let fwd = constant(&grid, [0.5, 0.0, 0.0]);
        let good = constant(&grid, [-0.5, 0.0, 0.0]);
        let bad = constant(&grid, [0.5, 0.0, 0.0]);

        assert!(check_consistency(&fwd, &good, 0.1).unwrap() < 1e-4);
        assert!(matches!(
            check_consistency(&fwd, &bad, 0.1),
            Err(WarpDriveError::InconsistentState(_))
        ));
    }

    #[test]
    fn test_invalid_inversion_options() {
        let grid = grid();
        let field = constant(&grid, [0.0; 3]);
        let opts = InversionOptions {
            iterations: 0,
            tolerance: 0.01,
        };
        assert!(invert(&field, &opts).is_err());
    }
}
