//! Thin-plate spline transform.
//!
//! Closed-form interpolating transform through a set of landmark pairs,
//! used to preview a correction without running the external solver.
//!
//! The displacement at `x` is
//! `d(x) = a0 + A x + sum_k w_k * phi(|x - c_k|)`
//! where `c_k` are the source landmarks. With fewer than four landmarks the
//! affine part is reduced to a translation so the system stays well posed.

use burn::tensor::backend::Backend;
use burn::tensor::{Shape, Tensor, TensorData};
use nalgebra::DMatrix;

use super::trait_::Transform;
use crate::error::{Result, WarpDriveError};
use crate::spatial::{Point3, Vector3};
use crate::tensor::points_to_tensor;

/// Radial basis kernel of the spline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RadialBasis {
    /// `phi(r) = r`, the biharmonic kernel for 3D.
    R,
    /// `phi(r) = r^2 log r`, the classic 2D thin-plate kernel.
    R2LogR,
}

impl RadialBasis {
    fn eval(self, r: f64) -> f64 {
        match self {
            RadialBasis::R => r,
            RadialBasis::R2LogR => {
                if r > 0.0 {
                    r * r * r.ln()
                } else {
                    0.0
                }
            }
        }
    }
}

#[derive(Debug, Clone)]
struct SplineKernel<B: Backend> {
    /// Source landmarks relative to `shift`, `[K, 3]`.
    centers: Tensor<B, 2>,
    /// Radial weights, `[K, 3]`.
    weights: Tensor<B, 2>,
    /// Affine rows `[1 | x | y | z]`, `[4, 3]` (or `[1, 3]` translation only).
    affine: Tensor<B, 2>,
    shift: Tensor<B, 2>,
    num_centers: usize,
}

/// Thin-plate spline mapping source landmarks onto target landmarks.
#[derive(Debug, Clone)]
pub struct ThinPlateSplineTransform<B: Backend> {
    source: Vec<Point3>,
    target: Vec<Point3>,
    basis: RadialBasis,
    regularization: f64,
    kernel: Option<SplineKernel<B>>,
    device: B::Device,
}

impl<B: Backend> ThinPlateSplineTransform<B> {
    /// Fit an interpolating spline mapping `source[i]` to `target[i]`.
    ///
    /// An empty landmark set yields the identity transform.
    ///
    /// # Errors
    /// `InvalidParameter` if the landmark lists differ in length or the
    /// landmarks are degenerate (e.g. duplicated source points).
    pub fn fit(
        source: &[Point3],
        target: &[Point3],
        basis: RadialBasis,
        device: &B::Device,
    ) -> Result<Self> {
        Self::fit_regularized(source, target, basis, 0.0, device)
    }

    /// Fit an approximating spline; `regularization` is added to the kernel
    /// diagonal and trades landmark accuracy for smoothness.
    pub fn fit_regularized(
        source: &[Point3],
        target: &[Point3],
        basis: RadialBasis,
        regularization: f64,
        device: &B::Device,
    ) -> Result<Self> {
        if source.len() != target.len() {
            return Err(WarpDriveError::invalid_parameter(format!(
                "landmark count mismatch: {} source vs {} target",
                source.len(),
                target.len()
            )));
        }
        if !regularization.is_finite() || regularization < 0.0 {
            return Err(WarpDriveError::invalid_parameter(format!(
                "regularization must be non-negative, got {regularization}"
            )));
        }

        let kernel = if source.is_empty() {
            None
        } else {
            Some(solve_kernel::<B>(source, target, basis, regularization, device)?)
        };

        Ok(Self {
            source: source.to_vec(),
            target: target.to_vec(),
            basis,
            regularization,
            kernel,
            device: device.clone(),
        })
    }

    /// The spline with source and target landmarks swapped.
    ///
    /// Exact at the landmarks and a close approximation of the true inverse
    /// between them.
    pub fn inverted(&self) -> Result<Self> {
        Self::fit_regularized(
            &self.target,
            &self.source,
            self.basis,
            self.regularization,
            &self.device,
        )
    }

    pub fn source_landmarks(&self) -> &[Point3] {
        &self.source
    }

    pub fn target_landmarks(&self) -> &[Point3] {
        &self.target
    }

    pub fn basis(&self) -> RadialBasis {
        self.basis
    }

    pub fn is_identity(&self) -> bool {
        self.kernel.is_none()
    }

    /// Displacements `[N, 3]` at world points `[N, 3]`.
    pub fn displacement(&self, points: Tensor<B, 2>) -> Tensor<B, 2> {
        let Some(kernel) = &self.kernel else {
            return points.zeros_like();
        };
        let [n, _] = points.dims();
        let k = kernel.num_centers;
        let local = points - kernel.shift.clone();

        let diff = local.clone().reshape([n, 1, 3]).repeat_dim(1, k)
            - kernel.centers.clone().reshape([1, k, 3]);
        let r2: Tensor<B, 2> = diff.powf_scalar(2.0).sum_dim(2).reshape([n, k]);

        let phi = match self.basis {
            RadialBasis::R => r2.sqrt(),
            RadialBasis::R2LogR => r2.clone().clamp_min(1e-12).log() * r2 * 0.5,
        };
        let radial = phi.matmul(kernel.weights.clone());

        let affine = if kernel.affine.dims()[0] == 4 {
            let ones = Tensor::<B, 2>::ones([n, 1], &local.device());
            Tensor::cat(vec![ones, local], 1).matmul(kernel.affine.clone())
        } else {
            kernel.affine.clone()
        };

        radial + affine
    }
}

impl<B: Backend> Transform<B> for ThinPlateSplineTransform<B> {
    fn transform_points(&self, points: Tensor<B, 2>) -> Tensor<B, 2> {
        let displacement = self.displacement(points.clone());
        points + displacement
    }

    fn inverse(&self) -> Option<Box<dyn Transform<B>>> {
        self.inverted()
            .ok()
            .map(|t| Box::new(t) as Box<dyn Transform<B>>)
    }
}

fn solve_kernel<B: Backend>(
    source: &[Point3],
    target: &[Point3],
    basis: RadialBasis,
    regularization: f64,
    device: &B::Device,
) -> Result<SplineKernel<B>> {
    let k = source.len();
    let centroid = source
        .iter()
        .fold(Vector3::zeros(), |acc, p| acc + p.coords)
        / k as f64;
    let local: Vec<Point3> = source.iter().map(|p| p - centroid).collect();

    let solution = if k >= 4 {
        solve_system(&local, source, target, basis, regularization, true)
            .or_else(|| solve_system(&local, source, target, basis, regularization, false))
    } else {
        solve_system(&local, source, target, basis, regularization, false)
    }
    .ok_or_else(|| WarpDriveError::invalid_parameter("thin-plate spline landmarks are degenerate"))?;

    let affine_rows = solution.nrows() - k;
    let weights: Vec<f32> = (0..k)
        .flat_map(|i| (0..3).map(move |c| (i, c)))
        .map(|(i, c)| solution[(i, c)] as f32)
        .collect();
    let affine: Vec<f32> = (0..affine_rows)
        .flat_map(|i| (0..3).map(move |c| (i, c)))
        .map(|(i, c)| solution[(k + i, c)] as f32)
        .collect();
    let shift = Point3::from(centroid);

    Ok(SplineKernel {
        centers: points_to_tensor::<B>(&local, device),
        weights: Tensor::<B, 1>::from_data(TensorData::new(weights, Shape::new([k * 3])), device)
            .reshape([k, 3]),
        affine: Tensor::<B, 1>::from_data(
            TensorData::new(affine, Shape::new([affine_rows * 3])),
            device,
        )
        .reshape([affine_rows, 3]),
        shift: points_to_tensor::<B>(&[shift], device),
        num_centers: k,
    })
}

/// Solve `[[Phi + lambda I, P], [P^T, 0]] [w; a] = [t - s; 0]`.
fn solve_system(
    local: &[Point3],
    source: &[Point3],
    target: &[Point3],
    basis: RadialBasis,
    regularization: f64,
    full_affine: bool,
) -> Option<DMatrix<f64>> {
    let k = local.len();
    let a = if full_affine { 4 } else { 1 };
    let m = k + a;

    let mut lhs = DMatrix::<f64>::zeros(m, m);
    for i in 0..k {
        for j in 0..k {
            lhs[(i, j)] = basis.eval((local[i] - local[j]).norm());
        }
        lhs[(i, i)] += regularization;

        lhs[(i, k)] = 1.0;
        lhs[(k, i)] = 1.0;
        if full_affine {
            for c in 0..3 {
                lhs[(i, k + 1 + c)] = local[i][c];
                lhs[(k + 1 + c, i)] = local[i][c];
            }
        }
    }

    let mut rhs = DMatrix::<f64>::zeros(m, 3);
    for i in 0..k {
        let d = target[i] - source[i];
        for c in 0..3 {
            rhs[(i, c)] = d[c];
        }
    }

    let solution = lhs.lu().solve(&rhs)?;
    if solution.iter().all(|v| v.is_finite()) {
        Some(solution)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::tensor_to_points;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    fn landmarks() -> (Vec<Point3>, Vec<Point3>) {
        let source = vec![
            Point3::new(0.0, 0.0, 0.0),
            Point3::new(10.0, 0.0, 0.0),
            Point3::new(0.0, 10.0, 0.0),
            Point3::new(0.0, 0.0, 10.0),
            Point3::new(5.0, 5.0, 5.0),
        ];
        let mut target = source.clone();
        target[4] = Point3::new(7.0, 5.0, 4.0);
        (source, target)
    }

    #[test]
    fn test_interpolates_landmarks() {
        let device = Default::default();
        let (source, target) = landmarks();
        let tps = ThinPlateSplineTransform::<TestBackend>::fit(&source, &target, RadialBasis::R, &device)
            .unwrap();

        let mapped = tensor_to_points(tps.transform_points(points_to_tensor(&source, &device))).unwrap();
        for (m, t) in mapped.iter().zip(target.iter()) {
            assert!((m - t).norm() < 1e-2, "landmark mapped to {m}, expected {t}");
        }
    }

    #[test]
    fn test_inverted_maps_target_back() {
        let device = Default::default();
        let (source, target) = landmarks();
        let tps = ThinPlateSplineTransform::<TestBackend>::fit(&source, &target, RadialBasis::R, &device)
            .unwrap();
        let inverse = tps.inverted().unwrap();

        let mapped = tensor_to_points(inverse.transform_points(points_to_tensor(&target, &device))).unwrap();
        for (m, s) in mapped.iter().zip(source.iter()) {
            assert!((m - s).norm() < 1e-2);
        }
    }

    #[test]
    fn test_single_landmark_is_translation() {
        let device = Default::default();
        let source = [Point3::new(1.0, 2.0, 3.0)];
        let target = [Point3::new(2.0, 2.0, 1.0)];
        let tps = ThinPlateSplineTransform::<TestBackend>::fit(&source, &target, RadialBasis::R, &device)
            .unwrap();

        let far = [Point3::new(-40.0, 25.0, 60.0)];
        let mapped = tensor_to_points(tps.transform_points(points_to_tensor(&far, &device))).unwrap();
        assert!((mapped[0] - Point3::new(-39.0, 25.0, 58.0)).norm() < 1e-3);
    }

    #[test]
    fn test_empty_is_identity() {
        let device = Default::default();
        let tps = ThinPlateSplineTransform::<TestBackend>::fit(&[], &[], RadialBasis::R, &device).unwrap();
        assert!(tps.is_identity());

        let p = [Point3::new(3.0, 4.0, 5.0)];
        let mapped = tensor_to_points(tps.transform_points(points_to_tensor(&p, &device))).unwrap();
        assert_eq!(mapped[0], p[0]);
    }

    #[test]
    fn test_duplicate_landmarks_rejected() {
        let device = Default::default();
        let source = [Point3::new(1.0, 1.0, 1.0), Point3::new(1.0, 1.0, 1.0)];
        let target = [Point3::new(2.0, 1.0, 1.0), Point3::new(0.0, 1.0, 1.0)];
        let result = ThinPlateSplineTransform::<TestBackend>::fit(&source, &target, RadialBasis::R, &device);
        assert!(matches!(result, Err(WarpDriveError::InvalidParameter(_))));
    }

    #[test]
    fn test_length_mismatch_rejected() {
        let device = Default::default();
        let result = ThinPlateSplineTransform::<TestBackend>::fit(
            &[Point3::origin()],
            &[],
            RadialBasis::R,
            &device,
        );
        assert!(result.is_err());
    }
}
