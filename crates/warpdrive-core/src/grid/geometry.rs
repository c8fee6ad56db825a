//! Grid geometry with physical metadata and coordinate mappings.

use burn::tensor::backend::Backend;
use burn::tensor::{Shape, Tensor, TensorData};
use serde::{Deserialize, Serialize};

use crate::error::{Result, WarpDriveError};
use crate::spatial::{Direction3, Point3, Spacing3, Vector3};

/// Regular 3D sampling grid.
///
/// `size` is stored in index order `(x, y, z)` as found in NIfTI headers.
/// Tensors laid out on the grid use the `[Z, Y, X]` convention, so the flat
/// voxel index is `z * ny * nx + y * nx + x`.
///
/// # Coordinate Systems
/// * **Index Space**: continuous voxel indices
/// * **Physical Space**: RAS world coordinates in mm
///
/// `point = origin + direction * (index * spacing)`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridGeometry {
    size: [usize; 3],
    origin: Point3,
    spacing: Spacing3,
    direction: Direction3,
}

impl GridGeometry {
    /// Create a grid with an identity direction matrix.
    pub fn new(size: [usize; 3], origin: Point3, spacing: Spacing3) -> Self {
        Self {
            size,
            origin,
            spacing,
            direction: Direction3::identity(),
        }
    }

    /// Set the direction cosine matrix.
    pub fn with_direction(mut self, direction: Direction3) -> Self {
        self.direction = direction;
        self
    }

    pub fn size(&self) -> [usize; 3] {
        self.size
    }

    pub fn origin(&self) -> &Point3 {
        &self.origin
    }

    pub fn spacing(&self) -> &Spacing3 {
        &self.spacing
    }

    pub fn direction(&self) -> &Direction3 {
        &self.direction
    }

    /// Total number of voxels.
    pub fn num_voxels(&self) -> usize {
        self.size.iter().product()
    }

    /// Shape of a scalar tensor laid out on this grid, `[Z, Y, X]`.
    pub fn tensor_shape(&self) -> [usize; 3] {
        [self.size[2], self.size[1], self.size[0]]
    }

    /// Physical field of view along each axis (`size * spacing`).
    pub fn field_of_view(&self) -> Vector3 {
        Vector3::new(
            self.size[0] as f64 * self.spacing[0],
            self.size[1] as f64 * self.spacing[1],
            self.size[2] as f64 * self.spacing[2],
        )
    }

    /// Check that the grid can be sampled.
    ///
    /// Fails with `InvalidParameter` on empty axes, non-positive or
    /// non-finite spacing, or a singular direction matrix.
    pub fn validate(&self) -> Result<()> {
        if self.size.iter().any(|&s| s == 0) {
            return Err(WarpDriveError::invalid_parameter(format!(
                "grid size must be non-zero on every axis, got {:?}",
                self.size
            )));
        }
        if self.spacing.iter().any(|s| !s.is_finite() || *s <= 0.0) {
            return Err(WarpDriveError::invalid_parameter(format!(
                "grid spacing must be positive, got [{}, {}, {}]",
                self.spacing[0], self.spacing[1], self.spacing[2]
            )));
        }
        self.inverse_direction()?;
        Ok(())
    }

    /// Convert a continuous index to a physical point.
    pub fn index_to_physical(&self, index: [f64; 3]) -> Point3 {
        let scaled = Vector3::new(
            index[0] * self.spacing[0],
            index[1] * self.spacing[1],
            index[2] * self.spacing[2],
        );
        self.origin + self.direction * scaled
    }

    /// Convert a physical point to a continuous index.
    ///
    /// # Errors
    /// `InvalidParameter` if the direction matrix is singular.
    pub fn physical_to_index(&self, point: &Point3) -> Result<[f64; 3]> {
        let rotated = self.inverse_direction()? * (*point - self.origin);
        Ok([
            rotated[0] / self.spacing[0],
            rotated[1] / self.spacing[1],
            rotated[2] / self.spacing[2],
        ])
    }

    /// Whether a continuous index lies inside the sampled extent.
    pub fn contains_index(&self, index: [f64; 3]) -> bool {
        (0..3).all(|i| index[i] >= 0.0 && index[i] <= (self.size[i] - 1) as f64)
    }

    /// Inverse of the direction matrix.
    ///
    /// # Errors
    /// `InvalidParameter` if the direction matrix is singular.
    pub fn inverse_direction(&self) -> Result<Direction3> {
        self.direction.try_inverse().ok_or_else(|| {
            WarpDriveError::invalid_parameter(format!(
                "grid direction matrix is singular: {:?}",
                self.direction
            ))
        })
    }

    /// Batch transform continuous indices `[N, 3]` to physical points `[N, 3]`.
    ///
    /// `P = O + I @ M` with `M_rc = S_r * D_cr`.
    pub fn index_to_world_tensor<B: Backend>(&self, indices: Tensor<B, 2>) -> Tensor<B, 2> {
        let device = indices.device();
        let origin = self.origin_tensor::<B>(&device);

        let mut m_data = Vec::with_capacity(9);
        for r in 0..3 {
            for c in 0..3 {
                m_data.push((self.spacing[r] * self.direction[(c, r)]) as f32);
            }
        }
        let m_tensor =
            Tensor::<B, 2>::from_data(TensorData::new(m_data, Shape::new([3, 3])), &device);

        indices.matmul(m_tensor) + origin
    }

    /// Batch transform physical points `[N, 3]` to continuous indices `[N, 3]`.
    ///
    /// `I = (P - O) @ T` with `T_rc = (D^-1)_cr / S_c`.
    ///
    /// # Errors
    /// `InvalidParameter` if the direction matrix is singular.
    pub fn world_to_index_tensor<B: Backend>(&self, points: Tensor<B, 2>) -> Result<Tensor<B, 2>> {
        Ok(self.world_to_index_with(points, &self.inverse_direction()?))
    }

    /// Same as [`world_to_index_tensor`](Self::world_to_index_tensor) with a
    /// precomputed inverse direction.
    pub(crate) fn world_to_index_with<B: Backend>(
        &self,
        points: Tensor<B, 2>,
        inv_dir: &Direction3,
    ) -> Tensor<B, 2> {
        let device = points.device();
        let origin = self.origin_tensor::<B>(&device);

        let mut t_data = Vec::with_capacity(9);
        for r in 0..3 {
            for c in 0..3 {
                t_data.push((inv_dir[(c, r)] / self.spacing[c]) as f32);
            }
        }
        let t_tensor =
            Tensor::<B, 2>::from_data(TensorData::new(t_data, Shape::new([3, 3])), &device);

        (points - origin).matmul(t_tensor)
    }

    fn origin_tensor<B: Backend>(&self, device: &B::Device) -> Tensor<B, 2> {
        let origin_vec: Vec<f32> = (0..3).map(|i| self.origin[i] as f32).collect();
        Tensor::<B, 1>::from_data(TensorData::new(origin_vec, Shape::new([3])), device)
            .reshape([1, 3])
    }
}
