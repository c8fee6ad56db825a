//! Conversions between nalgebra points and burn tensors.

use burn::tensor::backend::Backend;
use burn::tensor::{Shape, Tensor, TensorData};

use crate::error::{Result, WarpDriveError};
use crate::spatial::Point3;

/// Pack points into a `[N, 3]` tensor.
pub fn points_to_tensor<B: Backend>(points: &[Point3], device: &B::Device) -> Tensor<B, 2> {
    let data: Vec<f32> = points
        .iter()
        .flat_map(|p| [p[0] as f32, p[1] as f32, p[2] as f32])
        .collect();
    Tensor::<B, 1>::from_data(TensorData::new(data, Shape::new([points.len() * 3])), device)
        .reshape([points.len(), 3])
}

/// Unpack a `[N, 3]` tensor into points.
pub fn tensor_to_points<B: Backend>(tensor: Tensor<B, 2>) -> Result<Vec<Point3>> {
    let values = tensor_to_vec(tensor)?;
    Ok(values
        .chunks_exact(3)
        .map(|c| Point3::new(c[0] as f64, c[1] as f64, c[2] as f64))
        .collect())
}

/// Read any tensor back as a flat `f32` vector in row-major order.
pub fn tensor_to_vec<B: Backend, const D: usize>(tensor: Tensor<B, D>) -> Result<Vec<f32>> {
    tensor
        .into_data()
        .convert::<f32>()
        .to_vec::<f32>()
        .map_err(|e| WarpDriveError::inconsistent_state(format!("tensor readback failed: {e:?}")))
}
