use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

use burn_ndarray::NdArray;
use tempfile::tempdir;
use warpdrive_core::error::{Result, WarpDriveError};
use warpdrive_core::spatial::{Point3, Spacing3, Vector3};
use warpdrive_core::{DeformationField, GridGeometry};
use warpdrive_correction::{
    finish_subject, CommitOutcome, Correspondence, CorrespondenceSet, CorrectionEngine, FinishChoice,
    FinishOutcome, RegistrationSolver, SessionContext, SessionMode, SolverHandle, SolverRequest,
    SolverStatus, WarpDriveConfig,
};
use warpdrive_io::nifti_io::write_reference_volume;
use warpdrive_io::{load_approval_state, read_displacement_field, write_displacement_field, SubjectPaths};

type B = NdArray<f32>;

/// Answers every request with a constant field on the requested grid.
struct ConstantSolver {
    offset: [f32; 3],
    launches: AtomicUsize,
}

impl RegistrationSolver for ConstantSolver {
    fn launch(&self, request: SolverRequest) -> Result<SolverHandle> {
        self.launches.fetch_add(1, Ordering::SeqCst);
        let (reporter, handle) = SolverHandle::channel(&request.output);
        let field = constant_field(&request.reference_grid, self.offset);
        write_displacement_field(&request.output, &field)
            .map_err(|e| WarpDriveError::external_tool(e.to_string()))?;
        reporter.report(SolverStatus::Completed, None);
        Ok(handle)
    }
}

fn grid() -> GridGeometry {
    GridGeometry::new([8, 8, 8], Point3::new(-7.0, -7.0, -7.0), Spacing3::repeat(2.0))
}

fn constant_field(grid: &GridGeometry, offset: [f32; 3]) -> DeformationField<B> {
    let n = grid.num_voxels();
    let values = (0..3 * n).map(|i| offset[i / n]).collect();
    DeformationField::from_vec(grid, values, &Default::default()).unwrap()
}

/// BIDS subject with a forward warp shifting 1 mm along x and an anchor image.
fn bids_subject(dir: &Path) -> PathBuf {
    let root = dir.join("sub-07");
    fs::create_dir_all(root.join("preprocessing")).unwrap();
    let paths = SubjectPaths::resolve(&root).unwrap();

    write_displacement_field(paths.forward_warp(), &constant_field(&grid(), [1.0, 0.0, 0.0])).unwrap();
    let anchor = root
        .join("coregistration")
        .join("anat")
        .join("sub-07_ses-preop_T1w.nii");
    fs::create_dir_all(anchor.parent().unwrap()).unwrap();
    write_reference_volume(&anchor, &grid()).unwrap();
    root
}

fn correction_points() -> CorrespondenceSet {
    let mut points = CorrespondenceSet::new(30.0);
    points.push(Correspondence::new(Point3::new(0.0, 0.0, 0.0), Point3::new(0.0, 0.5, 0.0)));
    points.push(Correspondence::new(Point3::new(3.0, 0.0, 0.0), Point3::new(3.0, 0.5, 0.0)).with_radius(10.0));
    points
}

fn open(root: &Path, queue: VecDeque<PathBuf>) -> SessionContext<B> {
    let config = WarpDriveConfig::default();
    SessionContext::open(root, SessionMode::SingleSubject { queue }, config, None, &Default::default()).unwrap()
}

#[test]
fn test_save_hardens_correction_into_both_warps() {
    let dir = tempdir().unwrap();
    let root = bids_subject(dir.path());
    let mut ctx = open(&root, VecDeque::from([PathBuf::from("/data/sub-08")]));
    assert!(!ctx.is_approved());

    let points = correction_points();
    points.record_in_session(ctx.session_mut(), "Correction 1");

    let solver = ConstantSolver {
        offset: [0.0, 0.5, 0.0],
        launches: AtomicUsize::new(0),
    };
    let mut engine = CorrectionEngine::<B, _>::new(&solver, Default::default());
    assert_eq!(engine.commit(&mut ctx, &points).unwrap(), CommitOutcome::Launched);
    engine.wait(&mut ctx).unwrap();
    assert_eq!(solver.launches.load(Ordering::SeqCst), 1);
    assert!(ctx.slot().current().is_some());

    let outcome = finish_subject(&mut ctx, FinishChoice::Save).unwrap();
    assert_eq!(
        outcome,
        FinishOutcome::Finished {
            next: Some(PathBuf::from("/data/sub-08"))
        }
    );
    assert!(ctx.slot().current().is_none());
    assert!(ctx.is_approved());
    assert!(load_approval_state(ctx.paths()).unwrap());
    assert!(ctx.paths().warpdrive_dir().join("WarpDriveScene.json").is_file());

    let device = Default::default();
    let p = Point3::new(1.0, 1.0, 1.0);
    let forward = read_displacement_field::<B, _>(ctx.paths().forward_warp(), &device).unwrap();
    let inverse = read_displacement_field::<B, _>(ctx.paths().inverse_warp(), &device).unwrap();
    let expected = Vector3::new(1.0, 0.5, 0.0);
    assert!((forward.displacement_at(&p).unwrap() - expected).norm() < 1e-4);
    assert!((inverse.displacement_at(&p).unwrap() + expected).norm() < 1e-3);
    assert!((ctx.base().displacement_at(&p).unwrap() - expected).norm() < 1e-4);
}

#[test]
fn test_discard_leaves_warps_untouched() {
    let dir = tempdir().unwrap();
    let root = bids_subject(dir.path());
    let mut ctx = open(&root, VecDeque::new());

    let points = correction_points();
    points.record_in_session(ctx.session_mut(), "Correction 1");
    let solver = ConstantSolver {
        offset: [0.0, 2.0, 0.0],
        launches: AtomicUsize::new(0),
    };
    let mut engine = CorrectionEngine::<B, _>::new(&solver, Default::default());
    engine.commit(&mut ctx, &points).unwrap();
    engine.wait(&mut ctx).unwrap();

    let outcome = finish_subject(&mut ctx, FinishChoice::Discard).unwrap();
    assert_eq!(outcome, FinishOutcome::Finished { next: None });
    assert!(!ctx.session().has_corrections());
    assert!(!load_approval_state(ctx.paths()).unwrap());
    assert!(!ctx.paths().inverse_warp().exists());

    let forward = read_displacement_field::<B, _>(ctx.paths().forward_warp(), &Default::default()).unwrap();
    let d = forward.displacement_at(&Point3::new(1.0, 1.0, 1.0)).unwrap();
    assert!((d - Vector3::new(1.0, 0.0, 0.0)).norm() < 1e-5);
}

#[test]
fn test_reopen_restores_saved_session() {
    let dir = tempdir().unwrap();
    let root = bids_subject(dir.path());
    let mut ctx = open(&root, VecDeque::new());

    let points = correction_points();
    points.record_in_session(ctx.session_mut(), "Correction 1");
    let mut engine = CorrectionEngine::<B, _>::new(
        ConstantSolver {
            offset: [0.0, 0.0, 0.0],
            launches: AtomicUsize::new(0),
        },
        Default::default(),
    );
    // Single-subject commits snapshot the session before the solver runs
    engine.commit(&mut ctx, &points).unwrap();
    engine.wait(&mut ctx).unwrap();
    drop(ctx.close());

    let reopened = open(&root, VecDeque::new());
    assert!(reopened.session().has_corrections());
    let restored = CorrespondenceSet::from_session(reopened.session(), 30.0);
    assert_eq!(restored.pairs().len(), 2);
    assert_eq!(restored.radius_string(), "30,10");
}
