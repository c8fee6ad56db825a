use std::fs;

use burn_ndarray::NdArray;
use tempfile::tempdir;
use warpdrive_core::spatial::{Point3, Spacing3};
use warpdrive_core::{DeformationField, GridGeometry};
use warpdrive_io::{
    load_approval_state, read_displacement_field, set_approved, write_displacement_field,
    LayoutKind, SubjectPaths,
};

type B = NdArray<f32>;

#[test]
fn test_layout_detection_is_directory_driven() {
    let dir = tempdir().unwrap();
    for (name, bids) in [("sub-a", true), ("sub-b", false)] {
        let root = dir.path().join(name);
        fs::create_dir_all(&root).unwrap();
        if bids {
            fs::create_dir(root.join("preprocessing")).unwrap();
        }
        let first = SubjectPaths::resolve(&root).unwrap();
        let second = SubjectPaths::resolve(&root).unwrap();
        assert_eq!(first, second);
        let expected = if bids { LayoutKind::Bids } else { LayoutKind::Legacy };
        assert_eq!(first.kind(), expected);
    }
}

#[test]
fn test_bids_warps_written_to_canonical_paths() {
    let dir = tempdir().unwrap();
    let root = dir.path().join("sub-03");
    fs::create_dir_all(root.join("preprocessing")).unwrap();
    let paths = SubjectPaths::resolve(&root).unwrap();

    let grid = GridGeometry::new([5, 4, 3], Point3::new(-2.0, -1.5, 0.0), Spacing3::repeat(2.0));
    let device = Default::default();
    let n = grid.num_voxels();
    let values: Vec<f32> = (0..3 * n).map(|i| ((i % 7) as f32 - 3.0) * 0.25).collect();
    let forward = DeformationField::<B>::from_vec(&grid, values, &device).unwrap();

    write_displacement_field(paths.forward_warp(), &forward).unwrap();
    assert!(paths.forward_warp().is_file());

    let read = read_displacement_field::<B, _>(paths.forward_warp(), &device).unwrap();
    let p = Point3::new(2.0, 0.5, 2.0);
    let a = forward.displacement_at(&p).unwrap();
    let b = read.displacement_at(&p).unwrap();
    assert!((a - b).norm() < 1e-5);
}

#[test]
fn test_legacy_approval_scenario() {
    let dir = tempdir().unwrap();
    let root = dir.path().join("patient");
    fs::create_dir_all(&root).unwrap();
    let paths = SubjectPaths::resolve(&root).unwrap();
    assert!(!paths.normalization_method_file().exists());

    set_approved(&paths).unwrap();
    assert!(paths.normalization_method_file().is_file());
    assert!(load_approval_state(&paths).unwrap());
}
