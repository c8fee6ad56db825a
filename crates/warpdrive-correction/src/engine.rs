//! Correction warp engine.
//!
//! One correction cycle runs `Idle -> Previewing -> Committing -> Applying
//! -> Idle`. Previews are synchronous and cheap. A commit hands the selected
//! correspondences to the external solver and returns at once; the result
//! is attached when [`CorrectionEngine::poll`] or [`CorrectionEngine::wait`]
//! observes completion. Only one commit may be outstanding.

use std::path::PathBuf;

use burn::tensor::backend::Backend;
use uuid::Uuid;
use warpdrive_core::error::{Result, WarpDriveError};
use warpdrive_core::grid::resolve_grid;
use warpdrive_core::{DeformationField, GridGeometry};
use warpdrive_io::nifti_io::read_displacement_field;
use warpdrive_io::session::save_session;

use crate::context::SessionContext;
use crate::points::CorrespondenceSet;
use crate::preview::PreviewArtifacts;
use crate::solver::{RegistrationSolver, SolverEvent, SolverHandle, SolverRequest, SolverStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Idle,
    Previewing,
    Committing,
    Applying,
}

/// Result of a commit request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    /// The solver is running; poll or wait for the result.
    Launched,
    /// Finished synchronously (empty correspondence set).
    Applied,
}

#[derive(Debug)]
struct PendingCommit<B: Backend> {
    handle: SolverHandle,
    previous: Option<DeformationField<B>>,
    work_dir: PathBuf,
}

/// Drives preview and commit for one subject.
#[derive(Debug)]
pub struct CorrectionEngine<B: Backend, S: RegistrationSolver> {
    solver: S,
    device: B::Device,
    state: EngineState,
    preview: Option<PreviewArtifacts<B>>,
    pending: Option<PendingCommit<B>>,
}

impl<B: Backend, S: RegistrationSolver> CorrectionEngine<B, S> {
    pub fn new(solver: S, device: B::Device) -> Self {
        Self {
            solver,
            device,
            state: EngineState::Idle,
            preview: None,
            pending: None,
        }
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    pub fn solver(&self) -> &S {
        &self.solver
    }

    pub fn preview_artifacts(&self) -> Option<&PreviewArtifacts<B>> {
        self.preview.as_ref()
    }

    /// Whether a commit would be accepted now.
    pub fn can_commit(&self) -> bool {
        matches!(self.state, EngineState::Idle | EngineState::Previewing)
    }

    /// Recompute the preview from the selected correspondences.
    ///
    /// # Errors
    /// `CommitInFlight` while a commit is outstanding.
    pub fn preview(&mut self, points: &CorrespondenceSet) -> Result<&PreviewArtifacts<B>> {
        if !self.can_commit() {
            return Err(WarpDriveError::CommitInFlight);
        }
        let artifacts = PreviewArtifacts::build(points, &self.device)?;
        self.state = EngineState::Previewing;
        Ok(&*self.preview.insert(artifacts))
    }

    /// Start computing a correction field from the selected correspondences.
    ///
    /// With no selected pairs an identity field over the resolved grid is
    /// attached immediately and no solver runs. On a launch failure the
    /// previous transform stays attached.
    ///
    /// # Errors
    /// `CommitInFlight` if a commit is outstanding; grid, snapshot and launch
    /// errors otherwise.
    pub fn commit(&mut self, ctx: &mut SessionContext<B>, points: &CorrespondenceSet) -> Result<CommitOutcome> {
        if !self.can_commit() {
            tracing::warn!(subject = ctx.paths.subject_id(), "commit rejected, another is in flight");
            return Err(WarpDriveError::CommitInFlight);
        }

        let grid = resolve_grid(ctx.base.grid(), ctx.config.spacing_override)?;

        if ctx.mode.is_single_subject() {
            save_session(&ctx.paths, &ctx.session)?;
        }

        let previous = ctx.slot.detach_for_commit();

        if points.is_empty() {
            return match DeformationField::identity(&grid, &self.device) {
                Ok(identity) => {
                    ctx.slot.release(Some(identity));
                    self.finish_cycle();
                    tracing::info!(subject = ctx.paths.subject_id(), "committed identity correction");
                    Ok(CommitOutcome::Applied)
                }
                Err(e) => {
                    ctx.slot.release(previous);
                    Err(e)
                }
            };
        }

        let work_dir = std::env::temp_dir().join(format!("warpdrive-{}", Uuid::new_v4().simple()));
        let request = SolverRequest {
            reference_grid: grid,
            fixed: points.targets(),
            moving: points.sources(),
            output: work_dir.join("correction.nii.gz"),
            rbf_radius: points.radius_string(),
            stiffness: ctx.config.stiffness,
            work_dir: work_dir.clone(),
        };

        match self.solver.launch(request) {
            Ok(handle) => {
                self.pending = Some(PendingCommit {
                    handle,
                    previous,
                    work_dir,
                });
                self.state = EngineState::Committing;
                tracing::info!(subject = ctx.paths.subject_id(), "correction commit launched");
                Ok(CommitOutcome::Launched)
            }
            Err(e) => {
                ctx.slot.release(previous);
                remove_work_dir(&work_dir);
                tracing::error!(subject = ctx.paths.subject_id(), error = %e, "solver launch failed");
                Err(e)
            }
        }
    }

    /// Check on an outstanding commit without blocking.
    ///
    /// Returns the state after the check: `Committing` while the solver
    /// runs, `Idle` once its field is attached.
    ///
    /// # Errors
    /// `ExternalToolFailure` if the solver failed or was cancelled; the
    /// previous transform is attached again.
    pub fn poll(&mut self, ctx: &mut SessionContext<B>) -> Result<EngineState> {
        let Some(pending) = self.pending.as_mut() else {
            return Ok(self.state);
        };
        let event = pending.handle.try_status();
        if event.status == SolverStatus::Running {
            return Ok(self.state);
        }
        self.complete(ctx, event)?;
        Ok(self.state)
    }

    /// Block until an outstanding commit finishes and apply its result.
    pub fn wait(&mut self, ctx: &mut SessionContext<B>) -> Result<()> {
        let Some(pending) = self.pending.as_mut() else {
            return Ok(());
        };
        let event = pending.handle.wait();
        self.complete(ctx, event)
    }

    /// Stop observing an outstanding commit.
    ///
    /// The solver is cancelled and its result never attached. The previous
    /// transform is put back and preview artifacts are dropped.
    pub fn teardown(&mut self, ctx: &mut SessionContext<B>) {
        if let Some(pending) = self.pending.take() {
            pending.handle.cancel();
            ctx.slot.release(pending.previous);
            remove_work_dir(&pending.work_dir);
            tracing::info!(subject = ctx.paths.subject_id(), "abandoned outstanding commit");
        }
        self.finish_cycle();
    }

    fn complete(&mut self, ctx: &mut SessionContext<B>, event: SolverEvent) -> Result<()> {
        let Some(pending) = self.pending.take() else {
            return Ok(());
        };

        let result = match event.status {
            SolverStatus::Completed => {
                self.state = EngineState::Applying;
                let expected = resolve_grid(ctx.base.grid(), ctx.config.spacing_override).ok();
                self.load_result(&pending, expected)
            }
            SolverStatus::Cancelled => Err(WarpDriveError::external_tool("solver run was cancelled")),
            _ => Err(WarpDriveError::external_tool(
                event.message.unwrap_or_else(|| "solver failed".to_string()),
            )),
        };
        remove_work_dir(&pending.work_dir);

        match result {
            Ok(field) => {
                ctx.slot.release(Some(field));
                self.finish_cycle();
                tracing::info!(subject = ctx.paths.subject_id(), "correction applied");
                Ok(())
            }
            Err(e) => {
                ctx.slot.release(pending.previous);
                self.finish_cycle();
                tracing::error!(subject = ctx.paths.subject_id(), error = %e, "correction commit failed");
                Err(e)
            }
        }
    }

    fn load_result(&self, pending: &PendingCommit<B>, expected: Option<GridGeometry>) -> Result<DeformationField<B>> {
        let field = read_displacement_field::<B, _>(pending.handle.output(), &self.device).map_err(|e| {
            WarpDriveError::external_tool(format!("solver output unreadable: {e:#}"))
        })?;
        if let Some(expected) = expected {
            if field.grid().size() != expected.size() {
                tracing::warn!(
                    expected = ?expected.size(),
                    actual = ?field.grid().size(),
                    "solver output grid differs from the requested grid"
                );
            }
        }
        Ok(field)
    }

    fn finish_cycle(&mut self) {
        self.preview = None;
        self.state = EngineState::Idle;
    }
}

fn remove_work_dir(dir: &std::path::Path) {
    if dir.exists() {
        if let Err(e) = std::fs::remove_dir_all(dir) {
            tracing::warn!(dir = %dir.display(), error = %e, "failed to remove solver work directory");
        }
    }
}
