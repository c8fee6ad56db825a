//! Hardening corrections into the subject's warps.

use std::path::{Path, PathBuf};

use burn::tensor::backend::Backend;
use warpdrive_core::convert::{invert_onto, to_grid_transform};
use warpdrive_core::error::{Result, WarpDriveError};
use warpdrive_core::{ChainedTransform, DeformationField};
use warpdrive_io::approval::set_approved;
use warpdrive_io::layout::SubjectPaths;
use warpdrive_io::migrate::{needs_migration, update_legacy_transform_format};
use warpdrive_io::nifti_io::{read_displacement_field, read_grid_geometry, write_displacement_field};
use warpdrive_io::session::{discard_session, save_session};

use crate::context::SessionContext;

/// Read the subject's forward warp, migrating a composite first.
///
/// # Errors
/// `NotFound` if the warp is missing, or if a composite needs migrating and
/// no resampling tool was given. `InconsistentState` if the warp cannot be
/// decoded.
pub fn load_subject_transform<B: Backend>(
    paths: &SubjectPaths,
    resample_tool: Option<&Path>,
    anchor_modality: Option<&str>,
    device: &B::Device,
) -> Result<DeformationField<B>> {
    if needs_migration(paths) {
        let tool = resample_tool.ok_or_else(|| {
            WarpDriveError::not_found(format!(
                "resampling tool needed to migrate composite warp of {}",
                paths.subject_id()
            ))
        })?;
        update_legacy_transform_format(paths, tool, anchor_modality)?;
    }

    let warp = paths.forward_warp();
    if !warp.is_file() {
        return Err(WarpDriveError::not_found(warp.display().to_string()));
    }
    read_displacement_field(&warp, device).map_err(|e| WarpDriveError::inconsistent_state(format!("{e:#}")))
}

/// Compose the active correction with the base warp and write both
/// directions.
///
/// The forward warp is resampled on the base grid, the inverse on the anchor
/// image grid. The composed field becomes the new base and the slot is
/// reset to identity.
///
/// # Errors
/// `CommitInFlight` while a commit holds the slot.
pub fn apply_changes<B: Backend>(ctx: &mut SessionContext<B>) -> Result<()> {
    if ctx.slot.is_locked() {
        return Err(WarpDriveError::CommitInFlight);
    }

    let device = ctx.base.device();
    let grid = ctx.base.grid().clone();
    let forward = match ctx.slot.current() {
        Some(correction) => {
            let chained = ChainedTransform::new(correction, &ctx.base);
            to_grid_transform::<B, _>(&chained, &grid, &device)?
        }
        None => ctx.base.clone(),
    };

    let anchor = ctx.paths.anchor_image(ctx.config.anchor_modality.as_deref())?;
    let anchor_grid = read_grid_geometry(&anchor)
        .map_err(|e| WarpDriveError::inconsistent_state(format!("{e:#}")))?;
    let inverse = invert_onto(&forward, &anchor_grid, &ctx.config.inversion_options())?;

    write_field(&ctx.paths.forward_warp(), &forward)?;
    write_field(&ctx.paths.inverse_warp(), &inverse)?;

    tracing::info!(
        subject = ctx.paths.subject_id(),
        max_displacement = forward.max_displacement(),
        "applied corrections to subject warps"
    );
    ctx.base = forward;
    ctx.slot.clear()
}

fn write_field<B: Backend>(path: &Path, field: &DeformationField<B>) -> Result<()> {
    write_displacement_field(path, field).map_err(|e| match e.downcast::<std::io::Error>() {
        Ok(io) => WarpDriveError::Io(io),
        Err(e) => WarpDriveError::inconsistent_state(format!("{e:#}")),
    })
}

/// Decision taken when leaving a subject.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishChoice {
    Save,
    Discard,
    Cancel,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinishOutcome {
    /// The subject stays open.
    Stayed,
    /// The subject is done; `next` is the following queued subject.
    Finished { next: Option<PathBuf> },
}

/// Leave the current subject.
///
/// With pending corrections, `Save` applies them, writes the session and
/// marks the subject approved while `Discard` drops them. Without
/// corrections, `Save` only marks the subject approved.
pub fn finish_subject<B: Backend>(ctx: &mut SessionContext<B>, choice: FinishChoice) -> Result<FinishOutcome> {
    if choice == FinishChoice::Cancel {
        return Ok(FinishOutcome::Stayed);
    }
    if ctx.slot.is_locked() {
        return Err(WarpDriveError::CommitInFlight);
    }

    let has_corrections = ctx.session.has_corrections() || ctx.slot.current().is_some();
    match (choice, has_corrections) {
        (FinishChoice::Save, true) => {
            apply_changes(ctx)?;
            save_session(&ctx.paths, &ctx.session)?;
            set_approved(&ctx.paths)?;
            ctx.approved = true;
        }
        (FinishChoice::Save, false) => {
            set_approved(&ctx.paths)?;
            ctx.approved = true;
        }
        (FinishChoice::Discard, true) => {
            let removed = discard_session(&mut ctx.session);
            ctx.slot.clear()?;
            tracing::info!(subject = ctx.paths.subject_id(), removed, "discarded corrections");
        }
        _ => {}
    }

    let next = ctx.next_subject();
    tracing::info!(
        subject = ctx.paths.subject_id(),
        ?choice,
        next = ?next.as_ref().map(|p| p.display().to_string()),
        "finished subject"
    );
    Ok(FinishOutcome::Finished { next })
}
