use burn_ndarray::NdArray;
use warpdrive_core::convert::{
    check_consistency, inverse_consistency_error, invert, to_grid_transform, InversionOptions,
};
use warpdrive_core::grid::GridGeometry;
use warpdrive_core::spatial::{Point3, Spacing3, Vector3};
use warpdrive_core::transform::{RadialBasis, ThinPlateSplineTransform};

type B = NdArray<f32>;

fn grid() -> GridGeometry {
    GridGeometry::new([16, 16, 16], Point3::new(-15.0, -15.0, -15.0), Spacing3::repeat(2.0))
}

/// Eight pinned corners and a center landmark moved 2 mm along x.
fn landmarks() -> (Vec<Point3>, Vec<Point3>) {
    let mut source = Vec::new();
    for &x in &[-15.0, 15.0] {
        for &y in &[-15.0, 15.0] {
            for &z in &[-15.0, 15.0] {
                source.push(Point3::new(x, y, z));
            }
        }
    }
    let mut target = source.clone();
    source.push(Point3::new(0.0, 0.0, 0.0));
    target.push(Point3::new(2.0, 0.0, 0.0));
    (source, target)
}

#[test]
fn test_spline_sampled_on_grid() {
    let device = Default::default();
    let (source, target) = landmarks();
    let tps = ThinPlateSplineTransform::<B>::fit(&source, &target, RadialBasis::R, &device).unwrap();
    let field = to_grid_transform(&tps, &grid(), &device).unwrap();

    // Voxel (7.5, 7.5, 7.5) is the world origin; sample next to it
    let d = field.displacement_at(&Point3::new(1.0, 1.0, 1.0)).unwrap();
    assert!(d[0] > 1.0, "expected x displacement near the moved landmark, got {d}");
    assert!(field.max_displacement() < 2.5);

    let corner = field.displacement_at(&Point3::new(-15.0, -15.0, -15.0)).unwrap();
    assert!(corner.norm() < 0.05, "pinned corner moved by {corner}");
}

#[test]
fn test_inverse_roundtrip_below_voxel() {
    let device = Default::default();
    let (source, target) = landmarks();
    let tps = ThinPlateSplineTransform::<B>::fit(&source, &target, RadialBasis::R, &device).unwrap();
    let forward = to_grid_transform(&tps, &grid(), &device).unwrap();
    let inverse = invert(&forward, &InversionOptions::default()).unwrap();

    let error = inverse_consistency_error(&forward, &inverse).unwrap();
    assert!(error < 1.0, "round trip error {error} mm exceeds half a voxel");
    assert!(check_consistency(&forward, &inverse, 1.0).is_ok());

    let d = inverse.displacement_at(&Point3::new(2.0, 0.0, 0.0)).unwrap();
    assert!((d - Vector3::new(-2.0, 0.0, 0.0)).norm() < 0.5);
}

#[test]
fn test_double_inversion_recovers_forward() {
    let device = Default::default();
    let (source, target) = landmarks();
    let tps = ThinPlateSplineTransform::<B>::fit(&source, &target, RadialBasis::R, &device).unwrap();
    let forward = to_grid_transform(&tps, &grid(), &device).unwrap();
    let options = InversionOptions::default();
    let recovered = invert(&invert(&forward, &options).unwrap(), &options).unwrap();

    // Half a voxel at 2 mm spacing
    for p in [
        Point3::new(0.0, 0.0, 0.0),
        Point3::new(1.0, 1.0, 1.0),
        Point3::new(-4.0, 3.0, 2.0),
        Point3::new(5.0, -5.0, -3.0),
        Point3::new(-9.0, 7.0, 9.0),
    ] {
        let expected = forward.displacement_at(&p).unwrap();
        let actual = recovered.displacement_at(&p).unwrap();
        let error = (actual - expected).norm();
        assert!(error < 1.0, "double inversion moved {p} by {error} mm");
    }
}

#[test]
fn test_swapped_spline_undoes_preview() {
    let device = Default::default();
    let (source, target) = landmarks();
    let tps = ThinPlateSplineTransform::<B>::fit(&source, &target, RadialBasis::R, &device).unwrap();
    let swapped = tps.inverted().unwrap();
    assert_eq!(swapped.source_landmarks(), &target[..]);

    let field = to_grid_transform(&swapped, &grid(), &device).unwrap();
    let d = field.displacement_at(&Point3::new(2.0, 0.0, 0.0)).unwrap();
    assert!((d - Vector3::new(-2.0, 0.0, 0.0)).norm() < 0.3);
}
