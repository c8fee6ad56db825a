//! Chained transform implementation.
//!
//! T(x) = T2(T1(x))

use burn::tensor::backend::Backend;
use burn::tensor::Tensor;

use super::trait_::Transform;

/// Chained Transform (second after first).
///
/// Applies two transforms in sequence: `y = second(first(x))`. Composing a
/// correction with a subject warp and resampling the chain onto a grid is how
/// corrections are hardened.
#[derive(Debug, Clone)]
pub struct ChainedTransform<T1, T2> {
    pub first: T1,
    pub second: T2,
}

impl<T1, T2> ChainedTransform<T1, T2> {
    /// Create a new chained transform.
    ///
    /// # Arguments
    /// * `first` - The first transform to apply
    /// * `second` - The second transform to apply
    pub fn new(first: T1, second: T2) -> Self {
        Self { first, second }
    }
}

impl<B, T1, T2> Transform<B> for ChainedTransform<T1, T2>
where
    B: Backend,
    T1: Transform<B>,
    T2: Transform<B>,
{
    fn transform_points(&self, points: Tensor<B, 2>) -> Tensor<B, 2> {
        let intermediate = self.first.transform_points(points);
        self.second.transform_points(intermediate)
    }

    fn inverse(&self) -> Option<Box<dyn Transform<B>>> {
        let first_inv = self.first.inverse()?;
        let second_inv = self.second.inverse()?;
        Some(Box::new(ChainedTransform::new(second_inv, first_inv)))
    }
}
