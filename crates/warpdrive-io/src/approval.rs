//! Approval flag stored with the normalization metadata.

use std::path::Path;

use serde_json::{Map, Value};
use warpdrive_core::error::{Result, WarpDriveError};

use crate::layout::{MetadataFormat, SubjectPaths};
use crate::mat5::{is_hdf5_file, MatFile};

/// Key of the approval flag in the JSON metadata.
pub const JSON_APPROVAL_KEY: &str = "approval";
/// Variable holding the approval sentinel in the legacy MAT-file.
pub const LEGACY_APPROVAL_KEY: &str = "glanat";
/// Value of the legacy variable once the warp was approved manually.
pub const LEGACY_APPROVED: u8 = 2;

/// Whether the subject's registration has been approved.
///
/// A missing metadata file means not approved.
///
/// # Errors
/// `InconsistentState` if the file exists but cannot be understood.
pub fn load_approval_state(paths: &SubjectPaths) -> Result<bool> {
    let file = paths.normalization_method_file();
    if !file.is_file() {
        return Ok(false);
    }
    match paths.metadata_format() {
        MetadataFormat::Json => {
            let object = read_json_object(&file)?;
            Ok(object
                .get(JSON_APPROVAL_KEY)
                .and_then(Value::as_f64)
                .is_some_and(|v| v >= 1.0))
        }
        MetadataFormat::LegacyBinary => {
            Ok(read_legacy_approval(&file)?.is_some_and(|v| v != 0.0))
        }
    }
}

/// Mark the subject as approved, keeping every other metadata entry.
///
/// Creates a minimal metadata file when none exists. Legacy MAT-files keep
/// their encoding; new ones are written as v7.3 when HDF5 support is built.
pub fn set_approved(paths: &SubjectPaths) -> Result<()> {
    let file = paths.normalization_method_file();
    if let Some(parent) = file.parent() {
        std::fs::create_dir_all(parent)?;
    }

    match paths.metadata_format() {
        MetadataFormat::Json => {
            let mut object = if file.is_file() {
                read_json_object(&file)?
            } else {
                Map::new()
            };
            object.insert(JSON_APPROVAL_KEY.to_string(), Value::from(1));
            let text = serde_json::to_string(&Value::Object(object)).map_err(|e| {
                WarpDriveError::inconsistent_state(format!("failed to encode metadata: {e}"))
            })?;
            std::fs::write(&file, text)?;
        }
        MetadataFormat::LegacyBinary => write_legacy_approval(&file)?,
    }

    tracing::info!(subject = paths.subject_id(), file = %file.display(), "subject approved");
    Ok(())
}

fn read_legacy_approval(file: &Path) -> Result<Option<f64>> {
    if is_hdf5_file(file)? {
        return read_hdf5_approval(file);
    }
    let mat = MatFile::read_file(file)?;
    Ok(mat.get(LEGACY_APPROVAL_KEY).and_then(|v| v.scalar()))
}

fn write_legacy_approval(file: &Path) -> Result<()> {
    if file.is_file() && !is_hdf5_file(file)? {
        let mut mat = MatFile::read_file(file)?;
        mat.set_uint8_scalar(LEGACY_APPROVAL_KEY, LEGACY_APPROVED);
        return mat.write_file(file);
    }
    write_hdf5_approval(file)
}

#[cfg(feature = "mat73")]
fn read_hdf5_approval(file: &Path) -> Result<Option<f64>> {
    crate::mat73::read_scalar(file, LEGACY_APPROVAL_KEY)
}

#[cfg(feature = "mat73")]
fn write_hdf5_approval(file: &Path) -> Result<()> {
    crate::mat73::write_uint8_scalar(file, LEGACY_APPROVAL_KEY, LEGACY_APPROVED)
}

#[cfg(not(feature = "mat73"))]
fn read_hdf5_approval(file: &Path) -> Result<Option<f64>> {
    Err(without_hdf5(file))
}

#[cfg(not(feature = "mat73"))]
fn write_hdf5_approval(file: &Path) -> Result<()> {
    if file.is_file() {
        return Err(without_hdf5(file));
    }
    let mut mat = MatFile::new();
    mat.set_uint8_scalar(LEGACY_APPROVAL_KEY, LEGACY_APPROVED);
    mat.write_file(file)
}

#[cfg(not(feature = "mat73"))]
fn without_hdf5(file: &Path) -> WarpDriveError {
    WarpDriveError::inconsistent_state(format!(
        "{} is an HDF5-based MAT-file and HDF5 support was not built",
        file.display()
    ))
}

fn read_json_object(file: &Path) -> Result<Map<String, Value>> {
    let text = std::fs::read_to_string(file)?;
    match serde_json::from_str::<Value>(&text) {
        Ok(Value::Object(object)) => Ok(object),
        Ok(_) => Err(WarpDriveError::inconsistent_state(format!(
            "{} is not a JSON object",
            file.display()
        ))),
        Err(e) => Err(WarpDriveError::inconsistent_state(format!(
            "{} is not valid JSON: {}",
            file.display(),
            e
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::LayoutKind;
    use std::fs;
    use tempfile::tempdir;

    fn bids(dir: &Path) -> SubjectPaths {
        let root = dir.join("sub-01");
        fs::create_dir_all(root.join("preprocessing")).unwrap();
        SubjectPaths::resolve(&root).unwrap()
    }

    #[test]
    fn test_json_preserves_other_keys() {
        let dir = tempdir().unwrap();
        let paths = bids(dir.path());
        let file = paths.normalization_method_file();
        fs::create_dir_all(file.parent().unwrap()).unwrap();
        fs::write(&file, r#"{"method":"ANTs (Avants 2008)","approval":0,"extra":[1,2]}"#).unwrap();

        assert!(!load_approval_state(&paths).unwrap());
        set_approved(&paths).unwrap();
        assert!(load_approval_state(&paths).unwrap());

        let value: Value = serde_json::from_str(&fs::read_to_string(&file).unwrap()).unwrap();
        assert_eq!(value["method"], "ANTs (Avants 2008)");
        assert_eq!(value["extra"], serde_json::json!([1, 2]));
        assert_eq!(value["approval"], 1);
        let keys: Vec<&String> = value.as_object().unwrap().keys().collect();
        assert_eq!(keys, ["method", "approval", "extra"]);
    }

    #[test]
    fn test_json_array_is_inconsistent() {
        let dir = tempdir().unwrap();
        let paths = bids(dir.path());
        let file = paths.normalization_method_file();
        fs::create_dir_all(file.parent().unwrap()).unwrap();
        fs::write(&file, "[1, 2]").unwrap();
        assert!(matches!(
            load_approval_state(&paths),
            Err(WarpDriveError::InconsistentState(_))
        ));
    }

    #[test]
    fn test_missing_json_is_created() {
        let dir = tempdir().unwrap();
        let paths = bids(dir.path());
        assert!(!load_approval_state(&paths).unwrap());
        set_approved(&paths).unwrap();
        assert!(load_approval_state(&paths).unwrap());
    }

    #[test]
    fn test_missing_legacy_file_is_synthesized() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("pat");
        fs::create_dir_all(&root).unwrap();
        let paths = SubjectPaths::resolve(&root).unwrap();
        assert_eq!(paths.kind(), LayoutKind::Legacy);

        assert!(!load_approval_state(&paths).unwrap());
        set_approved(&paths).unwrap();
        assert!(load_approval_state(&paths).unwrap());

        let file = paths.normalization_method_file();
        if cfg!(feature = "mat73") {
            assert!(is_hdf5_file(&file).unwrap());
        } else {
            let mat = MatFile::read_file(&file).unwrap();
            assert_eq!(mat.variables().len(), 1);
            assert_eq!(mat.get(LEGACY_APPROVAL_KEY).unwrap().scalar(), Some(2.0));
        }
    }

    #[cfg(feature = "mat73")]
    #[test]
    fn test_legacy_hdf5_keeps_other_variables() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("pat");
        fs::create_dir_all(&root).unwrap();
        let paths = SubjectPaths::resolve(&root).unwrap();
        let file = paths.normalization_method_file();

        crate::mat73::write_uint8_scalar(&file, LEGACY_APPROVAL_KEY, 0).unwrap();
        crate::mat73::write_uint8_scalar(&file, "method", 7).unwrap();
        assert!(!load_approval_state(&paths).unwrap());

        set_approved(&paths).unwrap();
        assert!(load_approval_state(&paths).unwrap());
        assert!(is_hdf5_file(&file).unwrap());
        assert_eq!(crate::mat73::read_scalar(&file, "method").unwrap(), Some(7.0));
        assert_eq!(
            crate::mat73::read_scalar(&file, LEGACY_APPROVAL_KEY).unwrap(),
            Some(2.0)
        );
        let mut names = crate::mat73::variable_names(&file).unwrap();
        names.sort();
        assert_eq!(names, ["glanat", "method"]);
    }

    #[test]
    fn test_legacy_keeps_other_variables() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("pat");
        fs::create_dir_all(&root).unwrap();
        let paths = SubjectPaths::resolve(&root).unwrap();

        let mut mat = MatFile::new();
        mat.set_uint8_scalar("method", 7);
        mat.set_uint8_scalar(LEGACY_APPROVAL_KEY, 0);
        mat.write_file(paths.normalization_method_file()).unwrap();
        assert!(!load_approval_state(&paths).unwrap());

        set_approved(&paths).unwrap();
        assert!(!is_hdf5_file(paths.normalization_method_file()).unwrap());
        let mat = MatFile::read_file(paths.normalization_method_file()).unwrap();
        assert_eq!(mat.get("method").unwrap().scalar(), Some(7.0));
        assert_eq!(mat.get(LEGACY_APPROVAL_KEY).unwrap().scalar(), Some(2.0));
        assert!(load_approval_state(&paths).unwrap());
    }
}
