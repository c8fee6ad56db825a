//! One-time upgrade of legacy composite warps to displacement fields.
//!
//! Older subjects store each warp direction as an ITK composite transform
//! (`.h5`). The resampling tool flattens it onto a reference image; the
//! composite is removed afterwards so the upgrade runs at most once.

use std::path::{Path, PathBuf};
use std::process::Command;

use warpdrive_core::error::{Result, WarpDriveError};

use crate::layout::{composite_sibling, SubjectPaths};

/// Whether the subject still carries a composite forward warp.
pub fn needs_migration(paths: &SubjectPaths) -> bool {
    composite_sibling(&paths.forward_warp()).is_file()
}

/// Flatten composite warps into displacement fields.
///
/// The forward warp is resampled against the normalized image and the
/// inverse warp against the coregistered anchor image. Only the reference
/// grid matters, so when several images qualify the first in sorted order
/// is used. An explicit `anchor_modality` must still match exactly one
/// image. Directions without an `.h5` sibling are skipped.
///
/// Returns `true` if at least one direction was migrated.
///
/// # Errors
/// `NotFound` if a needed reference image is missing, `AmbiguousMatch` if
/// the requested anchor modality matches several images,
/// `ExternalToolFailure` if the tool exits abnormally. The composite is
/// kept on failure.
pub fn update_legacy_transform_format(
    paths: &SubjectPaths,
    tool: &Path,
    anchor_modality: Option<&str>,
) -> Result<bool> {
    let directions = [
        (paths.forward_warp(), Reference::Normalized),
        (paths.inverse_warp(), Reference::Anchor),
    ];

    let mut migrated = false;
    for (warp, reference) in directions {
        let composite = composite_sibling(&warp);
        if !composite.is_file() {
            continue;
        }
        let reference = match (reference, anchor_modality) {
            (Reference::Normalized, _) => {
                first_candidate(paths.normalized_images()?, &paths.normalized_image_pattern())?
            }
            (Reference::Anchor, Some(modality)) => paths.anchor_image(Some(modality))?,
            (Reference::Anchor, None) => {
                first_candidate(paths.coreg_images(None)?, &paths.coreg_image_pattern(None))?
            }
        };

        run_apply_transforms(tool, &reference, &composite, &warp)?;
        std::fs::remove_file(&composite)?;
        tracing::info!(
            subject = paths.subject_id(),
            warp = %warp.display(),
            "migrated composite transform to displacement field"
        );
        migrated = true;
    }
    Ok(migrated)
}

enum Reference {
    Normalized,
    Anchor,
}

fn first_candidate(candidates: Vec<PathBuf>, pattern: &Path) -> Result<PathBuf> {
    let count = candidates.len();
    let first = candidates.into_iter().next().ok_or_else(|| {
        WarpDriveError::not_found(format!("no file matches {}", pattern.display()))
    })?;
    if count > 1 {
        tracing::info!(
            pattern = %pattern.display(),
            candidates = count,
            reference = %first.display(),
            "several reference images, using the first"
        );
    }
    Ok(first)
}

fn run_apply_transforms(tool: &Path, reference: &Path, composite: &Path, output: &Path) -> Result<()> {
    let output_spec = format!("[{},1]", output.display());
    tracing::debug!(
        "{} -r {} -t {} -o {} -v 1",
        tool.display(),
        reference.display(),
        composite.display(),
        output_spec
    );

    let status = Command::new(tool)
        .arg("-r")
        .arg(reference)
        .arg("-t")
        .arg(composite)
        .arg("-o")
        .arg(&output_spec)
        .args(["-v", "1"])
        .status()
        .map_err(|e| {
            WarpDriveError::external_tool(format!("failed to start {}: {}", tool.display(), e))
        })?;

    if !status.success() {
        return Err(WarpDriveError::external_tool(format!(
            "{} exited with {}",
            tool.display(),
            status
        )));
    }
    Ok(())
}

/// Resampling tool shipped with the host installation for this platform.
pub fn default_apply_transforms_path(host_root: &Path) -> PathBuf {
    let ext = if cfg!(target_os = "macos") {
        "maci64"
    } else if cfg!(windows) {
        "exe"
    } else {
        "glnxa64"
    };
    host_root
        .join("ext_libs")
        .join("ANTs")
        .join(format!("antsApplyTransforms.{ext}"))
}
