//! Interactive correction of subject-to-template warps.
//!
//! Correspondence points are previewed with a thin-plate spline, committed
//! to an external registration solver, and finally hardened into the
//! subject's forward and inverse warps.

pub mod apply;
pub mod config;
pub mod context;
pub mod engine;
pub mod launch;
pub mod points;
pub mod preview;
pub mod solver;

pub use apply::{apply_changes, finish_subject, load_subject_transform, FinishChoice, FinishOutcome};
pub use config::WarpDriveConfig;
pub use context::{ActiveTransformSlot, SessionContext, SessionMode};
pub use engine::{CommitOutcome, CorrectionEngine, EngineState};
pub use launch::LaunchArgs;
pub use points::{Correspondence, CorrespondenceSet};
pub use preview::PreviewArtifacts;
pub use solver::{ProcessSolver, RegistrationSolver, SolverEvent, SolverHandle, SolverRequest, SolverStatus};
