//! HDF5-based (v7.3) MAT-files.
//!
//! MATLAB stores every variable as a dataset at the file root. A 512-byte
//! user block in front of the HDF5 superblock carries the usual 128-byte
//! MAT-file header, which is how the format is recognised.

use std::io::{Seek, SeekFrom, Write};
use std::path::Path;

use byteorder::{ByteOrder, LittleEndian};
use hdf5::types::FixedAscii;
use warpdrive_core::error::{Result, WarpDriveError};

use crate::mat5::{HDF5_OFFSET, HEADER_LEN, HEADER_TEXT_LEN};

const VERSION: u16 = 0x0200;
const MATLAB_CLASS: &str = "MATLAB_class";

/// Numeric scalar `name`, or `None` if the variable is absent or empty.
///
/// # Errors
/// `InconsistentState` if the file is not readable HDF5 or the variable is
/// not numeric.
pub fn read_scalar<P: AsRef<Path>>(path: P, name: &str) -> Result<Option<f64>> {
    let path = path.as_ref();
    let file = hdf5::File::open(path).map_err(|e| hdf5_error(path, e))?;
    if !file.link_exists(name) {
        return Ok(None);
    }
    let values = file
        .dataset(name)
        .and_then(|dataset| dataset.read_raw::<f64>())
        .map_err(|e| hdf5_error(path, e))?;
    Ok(values.first().copied())
}

/// Names of the variables stored at the file root.
pub fn variable_names<P: AsRef<Path>>(path: P) -> Result<Vec<String>> {
    let path = path.as_ref();
    let file = hdf5::File::open(path).map_err(|e| hdf5_error(path, e))?;
    file.member_names().map_err(|e| hdf5_error(path, e))
}

/// Replace `name` with a 1x1 `uint8` array, or add it.
///
/// Every other dataset and the user block are left untouched. A missing
/// file is created with a MAT-file header in its user block.
pub fn write_uint8_scalar<P: AsRef<Path>>(path: P, name: &str, value: u8) -> Result<()> {
    let path = path.as_ref();
    if path.is_file() {
        let file = hdf5::File::open_rw(path).map_err(|e| hdf5_error(path, e))?;
        if file.link_exists(name) {
            file.unlink(name).map_err(|e| hdf5_error(path, e))?;
        }
        write_uint8_dataset(&file, name, value).map_err(|e| hdf5_error(path, e))?;
        file.close().map_err(|e| hdf5_error(path, e))?;
        return Ok(());
    }

    let file = hdf5::File::with_options()
        .with_fcpl(|fcpl| fcpl.userblock(HDF5_OFFSET as u64))
        .create(path)
        .map_err(|e| hdf5_error(path, e))?;
    write_uint8_dataset(&file, name, value).map_err(|e| hdf5_error(path, e))?;
    file.close().map_err(|e| hdf5_error(path, e))?;
    write_header(path)
}

fn write_uint8_dataset(group: &hdf5::Group, name: &str, value: u8) -> hdf5::Result<()> {
    let dataset = group.new_dataset::<u8>().shape([1, 1]).create(name)?;
    dataset.write_raw(&[value])?;
    let class = FixedAscii::<5>::from_ascii(b"uint8").map_err(|e| hdf5::Error::from(e.to_string()))?;
    dataset
        .new_attr::<FixedAscii<5>>()
        .shape(())
        .create(MATLAB_CLASS)?
        .write_scalar(&class)
}

/// Fill the start of the user block with a little-endian v7.3 header.
fn write_header(path: &Path) -> Result<()> {
    let mut header = b"MATLAB 7.3 MAT-file, written by warpdrive HDF5 schema 1.00 .".to_vec();
    header.resize(HEADER_TEXT_LEN, b' ');
    header.extend_from_slice(&[0u8; 8]);
    let mut version = [0u8; 2];
    LittleEndian::write_u16(&mut version, VERSION);
    header.extend_from_slice(&version);
    header.extend_from_slice(b"IM");
    debug_assert_eq!(header.len(), HEADER_LEN);

    let mut file = std::fs::OpenOptions::new().write(true).open(path)?;
    file.seek(SeekFrom::Start(0))?;
    file.write_all(&header)?;
    Ok(())
}

fn hdf5_error(path: &Path, e: hdf5::Error) -> WarpDriveError {
    WarpDriveError::inconsistent_state(format!("{}: {}", path.display(), e))
}
