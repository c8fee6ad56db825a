//! Dense deformation fields.
//!
//! A deformation field stores one displacement vector per voxel of a regular
//! grid. Displacements are in world millimetres (RAS) and map a grid point
//! `x` to `x + u(x)`.

use burn::tensor::backend::Backend;
use burn::tensor::{ElementConversion, Shape, Tensor, TensorData};

use crate::error::{Result, WarpDriveError};
use crate::grid::GridGeometry;
use crate::interpolation::sample_vector_field;
use crate::spatial::{Direction3, Point3, Vector3};
use crate::tensor::{points_to_tensor, tensor_to_vec};
use crate::transform::Transform;

/// Dense 3D displacement field over a regular grid.
///
/// The displacement tensor has shape `[3, Z, Y, X]`; component 0 is the
/// x displacement.
#[derive(Debug, Clone)]
pub struct DeformationField<B: Backend> {
    displacement: Tensor<B, 4>,
    grid: GridGeometry,
    inverse_direction: Direction3,
}

impl<B: Backend> DeformationField<B> {
    /// Create a field from a displacement tensor laid out on `grid`.
    ///
    /// # Errors
    /// `InvalidParameter` if the grid is degenerate or the tensor shape is not
    /// `[3, Z, Y, X]` for that grid.
    pub fn new(displacement: Tensor<B, 4>, grid: GridGeometry) -> Result<Self> {
        grid.validate()?;
        let inverse_direction = grid.inverse_direction()?;
        let [z, y, x] = grid.tensor_shape();
        let dims = displacement.dims();
        if dims != [3, z, y, x] {
            return Err(WarpDriveError::invalid_parameter(format!(
                "displacement shape {:?} does not match grid {:?}",
                dims,
                [3, z, y, x]
            )));
        }
        Ok(Self {
            displacement,
            grid,
            inverse_direction,
        })
    }

    /// Zero displacement everywhere on `grid`.
    pub fn identity(grid: &GridGeometry, device: &B::Device) -> Result<Self> {
        grid.validate()?;
        let [z, y, x] = grid.tensor_shape();
        Self::new(Tensor::zeros([3, z, y, x], device), grid.clone())
    }

    /// Build a field from flat `[3, Z, Y, X]` row-major values.
    pub fn from_vec(grid: &GridGeometry, values: Vec<f32>, device: &B::Device) -> Result<Self> {
        let [z, y, x] = grid.tensor_shape();
        if values.len() != 3 * z * y * x {
            return Err(WarpDriveError::invalid_parameter(format!(
                "expected {} displacement values, got {}",
                3 * z * y * x,
                values.len()
            )));
        }
        let tensor = Tensor::<B, 4>::from_data(
            TensorData::new(values, Shape::new([3, z, y, x])),
            device,
        );
        Self::new(tensor, grid.clone())
    }

    pub fn displacement(&self) -> &Tensor<B, 4> {
        &self.displacement
    }

    pub fn into_displacement(self) -> Tensor<B, 4> {
        self.displacement
    }

    pub fn grid(&self) -> &GridGeometry {
        &self.grid
    }

    pub fn device(&self) -> B::Device {
        self.displacement.device()
    }

    /// Displacement vectors `[N, 3]` at world points `[N, 3]`.
    pub fn sample(&self, points: Tensor<B, 2>) -> Tensor<B, 2> {
        let indices = self.grid.world_to_index_with(points, &self.inverse_direction);
        sample_vector_field(&self.displacement, indices)
    }

    /// Displacement at a single world point.
    pub fn displacement_at(&self, point: &Point3) -> Result<Vector3> {
        let device = self.device();
        let sampled = self.sample(points_to_tensor::<B>(&[*point], &device));
        let v = tensor_to_vec(sampled)?;
        Ok(Vector3::new(v[0] as f64, v[1] as f64, v[2] as f64))
    }

    /// Largest displacement magnitude in mm.
    pub fn max_displacement(&self) -> f64 {
        let squared = self.displacement.clone().powf_scalar(2.0).sum_dim(0);
        let max: f64 = squared.max().into_scalar().elem();
        max.max(0.0).sqrt()
    }

    /// Flat `[3, Z, Y, X]` values.
    pub fn to_vec(&self) -> Result<Vec<f32>> {
        tensor_to_vec(self.displacement.clone())
    }
}

impl<B: Backend> Transform<B> for DeformationField<B> {
    fn transform_points(&self, points: Tensor<B, 2>) -> Tensor<B, 2> {
        let displacement = self.sample(points.clone());
        points + displacement
    }
}
