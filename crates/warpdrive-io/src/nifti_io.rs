//! NIfTI volume and displacement field I/O.
//!
//! Displacement fields follow the ITK/ANTs convention: a 5D volume of shape
//! `[X, Y, Z, 1, 3]` with intent code 1006 whose vectors are expressed in
//! LPS. Geometry comes from the header affine, which NIfTI defines in RAS,
//! so only the vector components are flipped on the way in and out.

use std::path::Path;

use anyhow::{Context, Result};
use burn::tensor::backend::Backend;
use nalgebra::SMatrix;
use ndarray::{Array, Array3, IxDyn};
use nifti::writer::WriterOptions;
use nifti::{IntoNdArray, NiftiHeader, NiftiObject, ReaderOptions};
use warpdrive_core::spatial::{flip_ras_lps, Direction3, Point3, Spacing3, Vector3};
use warpdrive_core::{DeformationField, GridGeometry};

/// NIfTI intent code for displacement vectors.
pub const NIFTI_INTENT_DISPVECT: i16 = 1006;

const NIFTI_XFORM_SCANNER_ANAT: i16 = 1;
const NIFTI_UNITS_MM: u8 = 2;

/// Read only the grid geometry of a NIfTI file.
pub fn read_grid_geometry<P: AsRef<Path>>(path: P) -> Result<GridGeometry> {
    let path = path.as_ref();
    let obj = ReaderOptions::new()
        .read_file(path)
        .with_context(|| format!("Failed to read NIfTI file {}", path.display()))?;
    Ok(geometry_from_header(obj.header()))
}

/// Build the grid geometry described by a NIfTI header.
///
/// The sform is preferred, then the qform, then plain pixdim scaling.
pub fn geometry_from_header(header: &NiftiHeader) -> GridGeometry {
    let affine = if header.sform_code > 0 {
        [header.srow_x, header.srow_y, header.srow_z]
    } else if header.qform_code > 0 {
        let b = header.quatern_b;
        let c = header.quatern_c;
        let d = header.quatern_d;
        let a = (1.0 - (b * b + c * c + d * d).min(1.0)).sqrt();
        let qfac = if header.pixdim[0] < 0.0 { -1.0 } else { 1.0 };

        let dx = header.pixdim[1];
        let dy = header.pixdim[2];
        let dz = header.pixdim[3] * qfac;

        [
            [
                (a * a + b * b - c * c - d * d) * dx,
                (2.0 * b * c - 2.0 * a * d) * dy,
                (2.0 * b * d + 2.0 * a * c) * dz,
                header.quatern_x,
            ],
            [
                (2.0 * b * c + 2.0 * a * d) * dx,
                (a * a + c * c - b * b - d * d) * dy,
                (2.0 * c * d - 2.0 * a * b) * dz,
                header.quatern_y,
            ],
            [
                (2.0 * b * d - 2.0 * a * c) * dx,
                (2.0 * c * d + 2.0 * a * b) * dy,
                (a * a + d * d - c * c - b * b) * dz,
                header.quatern_z,
            ],
        ]
    } else {
        [
            [header.pixdim[1], 0.0, 0.0, 0.0],
            [0.0, header.pixdim[2], 0.0, 0.0],
            [0.0, 0.0, header.pixdim[3], 0.0],
        ]
    };

    let origin = Point3::new(affine[0][3] as f64, affine[1][3] as f64, affine[2][3] as f64);

    let mut spacing = Spacing3::zeros();
    let mut columns = [Vector3::x(), Vector3::y(), Vector3::z()];
    for (c, column) in columns.iter_mut().enumerate() {
        let v = Vector3::new(affine[0][c] as f64, affine[1][c] as f64, affine[2][c] as f64);
        let norm = v.norm();
        spacing[c] = if norm > 1e-9 { norm } else { 1.0 };
        if norm > 1e-9 {
            *column = v / norm;
        }
    }
    let direction: Direction3 = SMatrix::from_columns(&columns);

    let size = [
        header.dim[1].max(1) as usize,
        header.dim[2].max(1) as usize,
        header.dim[3].max(1) as usize,
    ];

    GridGeometry::new(size, origin, spacing).with_direction(direction)
}

/// Header describing `grid` in scanner RAS coordinates.
pub fn header_for_grid(grid: &GridGeometry) -> NiftiHeader {
    let spacing = grid.spacing();
    let direction = grid.direction();
    let origin = grid.origin();

    let mut rows = [[0.0f32; 4]; 3];
    for (r, row) in rows.iter_mut().enumerate() {
        for c in 0..3 {
            row[c] = (direction[(r, c)] * spacing[c]) as f32;
        }
        row[3] = origin[r] as f32;
    }

    let mut header = NiftiHeader::default();
    header.sform_code = NIFTI_XFORM_SCANNER_ANAT;
    header.qform_code = 0;
    header.srow_x = rows[0];
    header.srow_y = rows[1];
    header.srow_z = rows[2];
    header.pixdim = [
        1.0,
        spacing[0] as f32,
        spacing[1] as f32,
        spacing[2] as f32,
        1.0,
        1.0,
        1.0,
        1.0,
    ];
    header.xyzt_units = NIFTI_UNITS_MM;
    header
}

/// Read an ANTs displacement field.
///
/// Vectors are converted from LPS to RAS.
pub fn read_displacement_field<B: Backend, P: AsRef<Path>>(
    path: P,
    device: &B::Device,
) -> Result<DeformationField<B>> {
    let path = path.as_ref();
    let obj = ReaderOptions::new()
        .read_file(path)
        .with_context(|| format!("Failed to read displacement field {}", path.display()))?;
    let grid = geometry_from_header(obj.header());

    let volume = obj
        .into_volume()
        .into_ndarray::<f32>()
        .context("Failed to convert displacement field to ndarray")?;

    let shape = volume.shape().to_vec();
    let components = match shape.len() {
        5 if shape[3] == 1 => shape[4],
        4 => shape[3],
        n => anyhow::bail!("Expected a 5D vector volume, found {} dimensions", n),
    };
    if components != 3 {
        anyhow::bail!("Expected 3 displacement components, found {}", components);
    }

    let [nx, ny, nz] = grid.size();
    if shape[0] != nx || shape[1] != ny || shape[2] != nz {
        anyhow::bail!(
            "Displacement volume shape {:?} does not match header dims {:?}",
            shape,
            grid.size()
        );
    }

    let n = nx * ny * nz;
    let mut values = vec![0.0f32; 3 * n];
    let mut index = vec![0usize; shape.len()];
    for z in 0..nz {
        for y in 0..ny {
            for x in 0..nx {
                index[0] = x;
                index[1] = y;
                index[2] = z;
                let mut lps = [0.0f64; 3];
                for (c, value) in lps.iter_mut().enumerate() {
                    index[shape.len() - 1] = c;
                    *value = volume[IxDyn(&index)] as f64;
                }
                let ras = flip_ras_lps(lps);
                let flat = (z * ny + y) * nx + x;
                for c in 0..3 {
                    values[c * n + flat] = ras[c] as f32;
                }
            }
        }
    }

    tracing::debug!(path = %path.display(), size = ?grid.size(), "read displacement field");
    DeformationField::from_vec(&grid, values, device).map_err(anyhow::Error::from)
}

/// Write a displacement field in the ANTs layout.
///
/// Vectors are converted from RAS to LPS. A `.gz` extension produces a
/// compressed file.
pub fn write_displacement_field<B: Backend, P: AsRef<Path>>(
    path: P,
    field: &DeformationField<B>,
) -> Result<()> {
    let path = path.as_ref();
    let grid = field.grid();
    let [nx, ny, nz] = grid.size();
    let n = nx * ny * nz;
    let values = field.to_vec().map_err(anyhow::Error::from)?;

    let array = Array::from_shape_fn((nx, ny, nz, 1, 3), |(x, y, z, _, c)| {
        let flat = (z * ny + y) * nx + x;
        let ras = [
            values[flat] as f64,
            values[n + flat] as f64,
            values[2 * n + flat] as f64,
        ];
        flip_ras_lps(ras)[c] as f32
    });

    let mut header = header_for_grid(grid);
    header.intent_code = NIFTI_INTENT_DISPVECT;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    WriterOptions::new(path)
        .reference_header(&header)
        .write_nifti(&array)
        .map_err(|e| anyhow::anyhow!("Failed to write NIfTI file {}: {}", path.display(), e))?;

    tracing::debug!(path = %path.display(), size = ?grid.size(), "wrote displacement field");
    Ok(())
}

/// Read a `uint8` label volume as flat `[Z, Y, X]` values with its grid.
pub fn read_label_volume<P: AsRef<Path>>(path: P) -> Result<(GridGeometry, Vec<u8>)> {
    let path = path.as_ref();
    let obj = ReaderOptions::new()
        .read_file(path)
        .with_context(|| format!("Failed to read label volume {}", path.display()))?;
    let grid = geometry_from_header(obj.header());
    let volume = obj
        .into_volume()
        .into_ndarray::<u8>()
        .context("Failed to convert label volume to ndarray")?;
    if volume.ndim() != 3 {
        anyhow::bail!("Expected 3D label volume, found {} dimensions", volume.ndim());
    }

    let [nx, ny, nz] = grid.size();
    let mut data = Vec::with_capacity(nx * ny * nz);
    for z in 0..nz {
        for y in 0..ny {
            for x in 0..nx {
                data.push(volume[IxDyn(&[x, y, z])]);
            }
        }
    }
    Ok((grid, data))
}

/// Write a `uint8` label volume given as flat `[Z, Y, X]` values.
pub fn write_label_volume<P: AsRef<Path>>(path: P, grid: &GridGeometry, data: &[u8]) -> Result<()> {
    let path = path.as_ref();
    let [nx, ny, nz] = grid.size();
    if data.len() != nx * ny * nz {
        anyhow::bail!(
            "Label data holds {} voxels, grid {:?} needs {}",
            data.len(),
            grid.size(),
            nx * ny * nz
        );
    }

    let array: Array3<u8> = Array::from_shape_fn((nx, ny, nz), |(x, y, z)| data[(z * ny + y) * nx + x]);
    WriterOptions::new(path)
        .reference_header(&header_for_grid(grid))
        .write_nifti(&array)
        .map_err(|e| anyhow::anyhow!("Failed to write NIfTI file {}: {}", path.display(), e))?;
    Ok(())
}

/// Write an all-zero `float32` volume on `grid`.
///
/// Serves as the reference volume handed to the registration solver.
pub fn write_reference_volume<P: AsRef<Path>>(path: P, grid: &GridGeometry) -> Result<()> {
    let path = path.as_ref();
    let [nx, ny, nz] = grid.size();
    let array = Array3::<f32>::zeros((nx, ny, nz));
    WriterOptions::new(path)
        .reference_header(&header_for_grid(grid))
        .write_nifti(&array)
        .map_err(|e| anyhow::anyhow!("Failed to write NIfTI file {}: {}", path.display(), e))?;
    Ok(())
}
