use burn::tensor::backend::Backend;
use burn::tensor::{Shape, Tensor, TensorData};

use crate::grid::GridGeometry;

/// Generate continuous indices for the z-slices `z_start..z_end` of a grid.
///
/// Returns a tensor of shape `[N, 3]` holding `(x, y, z)` rows in `[Z, Y, X]`
/// flat order, so row `i` is voxel `z_start * ny * nx + i`.
pub fn generate_slab_indices<B: Backend>(
    grid: &GridGeometry,
    z_start: usize,
    z_end: usize,
    device: &B::Device,
) -> Tensor<B, 2> {
    let [w, h, _] = grid.size();
    let total = (z_end - z_start) * h * w;

    let mut indices = Vec::with_capacity(total * 3);
    for z in z_start..z_end {
        for y in 0..h {
            for x in 0..w {
                indices.push(x as f32);
                indices.push(y as f32);
                indices.push(z as f32);
            }
        }
    }

    Tensor::<B, 1>::from_data(TensorData::new(indices, Shape::new([total * 3])), device)
        .reshape([total, 3])
}

/// Number of z-slices per evaluation slab so that a slab holds roughly
/// `max_points` voxels.
pub(crate) fn slab_depth(grid: &GridGeometry, max_points: usize) -> usize {
    let [w, h, _] = grid.size();
    (max_points / (w * h).max(1)).max(1)
}
