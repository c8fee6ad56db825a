//! Closed-form correction preview.
//!
//! A thin-plate spline through the selected correspondences gives
//! immediate feedback while points are edited. The spline is fitted from
//! targets back to sources, the direction used to resample the moving image
//! for display. Nothing here starts a process.

use burn::tensor::backend::Backend;
use warpdrive_core::convert::to_grid_transform;
use warpdrive_core::error::Result;
use warpdrive_core::spatial::Point3;
use warpdrive_core::{DeformationField, GridGeometry, RadialBasis, ThinPlateSplineTransform};

use crate::points::CorrespondenceSet;

/// Artifacts shown while previewing.
#[derive(Debug, Clone)]
pub struct PreviewArtifacts<B: Backend> {
    transform: ThinPlateSplineTransform<B>,
    glyphs: Vec<Point3>,
}

impl<B: Backend> PreviewArtifacts<B> {
    /// Fit the preview spline for the selected pairs of `points`.
    pub fn build(points: &CorrespondenceSet, device: &B::Device) -> Result<Self> {
        let sources = points.sources();
        let targets = points.targets();
        let transform =
            ThinPlateSplineTransform::fit(&targets, &sources, RadialBasis::R, device)?;
        Ok(Self {
            transform,
            glyphs: sources,
        })
    }

    /// Spline mapping targets onto sources.
    pub fn transform(&self) -> &ThinPlateSplineTransform<B> {
        &self.transform
    }

    /// Points at which displacement glyphs are drawn.
    pub fn glyphs(&self) -> &[Point3] {
        &self.glyphs
    }

    pub fn is_identity(&self) -> bool {
        self.transform.is_identity()
    }

    /// Sample the preview on a display grid.
    pub fn to_field(&self, grid: &GridGeometry, device: &B::Device) -> Result<DeformationField<B>> {
        to_grid_transform(&self.transform, grid, device)
    }
}
