//! Trilinear sampling of scalar and vector volumes at continuous indices.
//!
//! Indices outside the grid are clamped to the border voxels, so a field is
//! extended by its edge values.

use burn::tensor::backend::Backend;
use burn::tensor::{Int, Tensor};

/// Flat voxel offset and weight of each of the eight corners around a batch
/// of continuous indices.
type Stencil<B> = Vec<(Tensor<B, 1, Int>, Tensor<B, 1>)>;

/// Build the trilinear stencil for indices `[N, 3]` (x, y, z) into a volume
/// of shape `[Z, Y, X]`.
fn stencil<B: Backend>(shape: [usize; 3], indices: Tensor<B, 2>) -> Stencil<B> {
    let [nz, ny, nx] = shape;

    // Lower and upper neighbour along one axis, clamped, plus the upper weight
    let axis = |column: usize, size: usize| {
        let v = indices.clone().narrow(1, column, 1).squeeze::<1>(1);
        let lower = v.clone().floor();
        let weight = v - lower.clone();
        let max = (size - 1) as f64;
        let upper = (lower.clone() + 1.0).clamp(0.0, max).int();
        let lower = lower.clamp(0.0, max).int();
        [(lower, weight.clone().neg() + 1.0), (upper, weight)]
    };
    let xs = axis(0, nx);
    let ys = axis(1, ny);
    let zs = axis(2, nz);

    let mut corners = Vec::with_capacity(8);
    for (zi, wz) in &zs {
        let z_offset = zi.clone() * (nx * ny) as i32;
        for (yi, wy) in &ys {
            let zy_offset = z_offset.clone() + yi.clone() * nx as i32;
            let zy_weight = wz.clone() * wy.clone();
            for (xi, wx) in &xs {
                corners.push((zy_offset.clone() + xi.clone(), zy_weight.clone() * wx.clone()));
            }
        }
    }
    corners
}

fn apply_stencil<B: Backend>(flat: &Tensor<B, 1>, stencil: &Stencil<B>) -> Tensor<B, 1> {
    let corner = |(offset, weight): &(Tensor<B, 1, Int>, Tensor<B, 1>)| {
        flat.clone().gather(0, offset.clone()) * weight.clone()
    };
    stencil[1..]
        .iter()
        .fold(corner(&stencil[0]), |acc, c| acc + corner(c))
}

/// Sample a scalar volume `[Z, Y, X]` at continuous indices `[N, 3]` (x, y, z).
pub fn sample_trilinear<B: Backend>(data: &Tensor<B, 3>, indices: Tensor<B, 2>) -> Tensor<B, 1> {
    let [nz, ny, nx] = data.dims();
    let stencil = stencil([nz, ny, nx], indices);
    apply_stencil(&data.clone().reshape([nz * ny * nx]), &stencil)
}

/// Sample a vector volume `[3, Z, Y, X]` at continuous indices `[N, 3]`.
///
/// The stencil is shared by all components. Returns `[N, 3]`.
pub fn sample_vector_field<B: Backend>(field: &Tensor<B, 4>, indices: Tensor<B, 2>) -> Tensor<B, 2> {
    let [c, nz, ny, nx] = field.dims();
    let n = indices.dims()[0];
    let stencil = stencil([nz, ny, nx], indices);

    let components: Vec<Tensor<B, 2>> = (0..c)
        .map(|i| {
            let flat = field.clone().narrow(0, i, 1).reshape([nz * ny * nx]);
            apply_stencil(&flat, &stencil).reshape([n, 1])
        })
        .collect();

    Tensor::cat(components, 1)
}
