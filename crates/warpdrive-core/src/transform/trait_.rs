//! Transform trait for spatial coordinate transformations.

use burn::tensor::backend::Backend;
use burn::tensor::Tensor;

/// Maps world points from one space to another.
///
/// Both parametric transforms and dense deformation fields implement this
/// trait, which is what lets a parametric transform be resampled onto a grid.
pub trait Transform<B: Backend> {
    /// Apply transform to a batch of points.
    ///
    /// # Arguments
    /// * `points` - Tensor of shape `[Batch, 3]` containing world points
    ///
    /// # Returns
    /// Tensor of shape `[Batch, 3]` containing the transformed points
    fn transform_points(&self, points: Tensor<B, 2>) -> Tensor<B, 2>;

    /// Get the inverse transform (if available).
    ///
    /// Dense fields are not analytically invertible and return `None`; use the
    /// resampling inversion in `convert` for those.
    fn inverse(&self) -> Option<Box<dyn Transform<B>>> {
        None
    }
}

impl<B: Backend, T: Transform<B> + ?Sized> Transform<B> for &T {
    fn transform_points(&self, points: Tensor<B, 2>) -> Tensor<B, 2> {
        (**self).transform_points(points)
    }

    fn inverse(&self) -> Option<Box<dyn Transform<B>>> {
        (**self).inverse()
    }
}

impl<B: Backend> Transform<B> for Box<dyn Transform<B>> {
    fn transform_points(&self, points: Tensor<B, 2>) -> Tensor<B, 2> {
        (**self).transform_points(points)
    }

    fn inverse(&self) -> Option<Box<dyn Transform<B>>> {
        (**self).inverse()
    }
}
