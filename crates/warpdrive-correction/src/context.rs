//! Per-subject session context.
//!
//! Owns everything a correction cycle touches: the subject's paths, its
//! base warp, the active correction transform and the correction session.
//! Components receive the context explicitly; nothing is global.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};

use burn::tensor::backend::Backend;
use warpdrive_core::error::{Result, WarpDriveError};
use warpdrive_core::DeformationField;
use warpdrive_io::layout::SubjectPaths;
use warpdrive_io::session::{load_session, CorrectionSession};
use warpdrive_io::load_approval_state;

use crate::apply::load_subject_transform;
use crate::config::WarpDriveConfig;

/// How the subject was opened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionMode {
    /// Started from the command line; further subjects wait in `queue`.
    SingleSubject { queue: VecDeque<PathBuf> },
    Interactive,
}

impl SessionMode {
    pub fn is_single_subject(&self) -> bool {
        matches!(self, SessionMode::SingleSubject { .. })
    }
}

/// Exclusive holder of the active correction transform.
///
/// Empty means identity. While locked, only the commit that locked it may
/// put a field back.
#[derive(Debug)]
pub struct ActiveTransformSlot<B: Backend> {
    current: Option<DeformationField<B>>,
    generation: u64,
    locked: bool,
}

impl<B: Backend> Default for ActiveTransformSlot<B> {
    fn default() -> Self {
        Self {
            current: None,
            generation: 0,
            locked: false,
        }
    }
}

impl<B: Backend> ActiveTransformSlot<B> {
    pub fn current(&self) -> Option<&DeformationField<B>> {
        self.current.as_ref()
    }

    /// Incremented on every attach or detach.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    /// Replace the active transform, releasing the previous one.
    ///
    /// # Errors
    /// `CommitInFlight` while a commit holds the slot.
    pub fn attach(&mut self, field: DeformationField<B>) -> Result<()> {
        if self.locked {
            return Err(WarpDriveError::CommitInFlight);
        }
        self.current = Some(field);
        self.generation += 1;
        Ok(())
    }

    /// Reset to identity.
    pub fn clear(&mut self) -> Result<()> {
        if self.locked {
            return Err(WarpDriveError::CommitInFlight);
        }
        self.current = None;
        self.generation += 1;
        Ok(())
    }

    /// Take the field out and lock the slot for a commit.
    pub(crate) fn detach_for_commit(&mut self) -> Option<DeformationField<B>> {
        self.locked = true;
        self.generation += 1;
        self.current.take()
    }

    /// Unlock and put `field` in place.
    pub(crate) fn release(&mut self, field: Option<DeformationField<B>>) {
        self.locked = false;
        self.current = field;
        self.generation += 1;
    }
}

/// Everything open for one subject.
#[derive(Debug)]
pub struct SessionContext<B: Backend> {
    pub(crate) paths: SubjectPaths,
    pub(crate) base: DeformationField<B>,
    pub(crate) slot: ActiveTransformSlot<B>,
    pub(crate) session: CorrectionSession,
    pub(crate) mode: SessionMode,
    pub(crate) config: WarpDriveConfig,
    pub(crate) approved: bool,
}

impl<B: Backend> SessionContext<B> {
    /// Open a subject from disk.
    ///
    /// Migrates a composite forward warp first when `resample_tool` is
    /// given, then loads the warp, any saved session and the approval flag.
    pub fn open<P: AsRef<Path>>(
        root: P,
        mode: SessionMode,
        config: WarpDriveConfig,
        resample_tool: Option<&Path>,
        device: &B::Device,
    ) -> Result<Self> {
        config.validate()?;
        let paths = SubjectPaths::resolve(root)?;
        let base = load_subject_transform(&paths, resample_tool, config.anchor_modality.as_deref(), device)?;
        let session = load_session(&paths)?.unwrap_or_default();
        let approved = load_approval_state(&paths)?;

        tracing::info!(
            subject = paths.subject_id(),
            layout = ?paths.kind(),
            approved,
            restored_nodes = session.nodes().len(),
            "opened subject"
        );
        Ok(Self::new(paths, base, mode, config).with_session(session, approved))
    }

    /// Assemble a context from parts already in memory.
    pub fn new(paths: SubjectPaths, base: DeformationField<B>, mode: SessionMode, config: WarpDriveConfig) -> Self {
        Self {
            paths,
            base,
            slot: ActiveTransformSlot::default(),
            session: CorrectionSession::new(),
            mode,
            config,
            approved: false,
        }
    }

    pub fn with_session(mut self, session: CorrectionSession, approved: bool) -> Self {
        self.session = session;
        self.approved = approved;
        self
    }

    pub fn paths(&self) -> &SubjectPaths {
        &self.paths
    }

    /// Subject's forward warp.
    pub fn base(&self) -> &DeformationField<B> {
        &self.base
    }

    pub fn slot(&self) -> &ActiveTransformSlot<B> {
        &self.slot
    }

    pub fn slot_mut(&mut self) -> &mut ActiveTransformSlot<B> {
        &mut self.slot
    }

    pub fn session(&self) -> &CorrectionSession {
        &self.session
    }

    pub fn session_mut(&mut self) -> &mut CorrectionSession {
        &mut self.session
    }

    pub fn mode(&self) -> &SessionMode {
        &self.mode
    }

    pub fn config(&self) -> &WarpDriveConfig {
        &self.config
    }

    pub fn is_approved(&self) -> bool {
        self.approved
    }

    /// Next queued subject, if any.
    pub(crate) fn next_subject(&mut self) -> Option<PathBuf> {
        match &mut self.mode {
            SessionMode::SingleSubject { queue } => queue.pop_front(),
            SessionMode::Interactive => None,
        }
    }

    /// Close the subject, handing back the queued subjects.
    pub fn close(self) -> VecDeque<PathBuf> {
        tracing::debug!(subject = self.paths.subject_id(), "closed subject");
        match self.mode {
            SessionMode::SingleSubject { queue } => queue,
            SessionMode::Interactive => VecDeque::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;
    use warpdrive_core::spatial::{Point3, Spacing3};
    use warpdrive_core::GridGeometry;

    type B = NdArray<f32>;

    fn field() -> DeformationField<B> {
        let grid = GridGeometry::new([2, 2, 2], Point3::origin(), Spacing3::repeat(1.0));
        DeformationField::identity(&grid, &Default::default()).unwrap()
    }

    #[test]
    fn test_locked_slot_rejects_attach() {
        let mut slot = ActiveTransformSlot::<B>::default();
        slot.attach(field()).unwrap();
        let previous = slot.detach_for_commit();
        assert!(previous.is_some());
        assert!(slot.current().is_none());
        assert!(matches!(slot.attach(field()), Err(WarpDriveError::CommitInFlight)));
        assert!(matches!(slot.clear(), Err(WarpDriveError::CommitInFlight)));

        slot.release(previous);
        assert!(!slot.is_locked());
        assert!(slot.current().is_some());
    }

    #[test]
    fn test_generation_advances() {
        let mut slot = ActiveTransformSlot::<B>::default();
        let g0 = slot.generation();
        slot.attach(field()).unwrap();
        slot.clear().unwrap();
        assert_eq!(slot.generation(), g0 + 2);
    }

    #[test]
    fn test_close_returns_queue() {
        let paths = SubjectPaths::with_kind("/data/sub-01", warpdrive_io::LayoutKind::Bids).unwrap();
        let queue: VecDeque<PathBuf> = [PathBuf::from("/data/sub-02")].into_iter().collect();
        let mut ctx = SessionContext::new(
            paths,
            field(),
            SessionMode::SingleSubject { queue },
            WarpDriveConfig::default(),
        );
        assert!(ctx.mode().is_single_subject());
        assert_eq!(ctx.next_subject(), Some(PathBuf::from("/data/sub-02")));
        assert!(ctx.close().is_empty());
    }
}
