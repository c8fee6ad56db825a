//! Correction grid resolution.

use crate::error::{Result, WarpDriveError};
use crate::grid::GridGeometry;
use crate::spatial::Spacing3;

/// Resolve the grid a correction field is computed on.
///
/// Without an override the reference grid is returned unchanged. With an
/// isotropic spacing override the field of view is preserved:
/// `size' = round(size * spacing / override)`, origin and direction are kept.
///
/// # Errors
/// `InvalidParameter` if the reference grid is degenerate or the override is
/// zero, negative or not finite.
pub fn resolve_grid(reference: &GridGeometry, spacing_override: Option<f64>) -> Result<GridGeometry> {
    reference.validate()?;

    let Some(target) = spacing_override else {
        return Ok(reference.clone());
    };
    if !target.is_finite() || target <= 0.0 {
        return Err(WarpDriveError::invalid_parameter(format!(
            "spacing override must be positive, got {target}"
        )));
    }

    let fov = reference.field_of_view();
    let size = [
        ((fov[0] / target).round() as usize).max(1),
        ((fov[1] / target).round() as usize).max(1),
        ((fov[2] / target).round() as usize).max(1),
    ];

    tracing::debug!(
        "Resolved grid {:?} -> {:?} at {} mm spacing",
        reference.size(),
        size,
        target
    );

    Ok(GridGeometry::new(size, *reference.origin(), Spacing3::repeat(target))
        .with_direction(*reference.direction()))
}
