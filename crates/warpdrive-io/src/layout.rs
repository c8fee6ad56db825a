//! Subject directory layout resolution.
//!
//! A subject is either in the legacy flat layout (all files side by side in
//! the subject root) or in the BIDS-derivative layout (named subfolders).
//! The kind is detected once from the presence of a `preprocessing` folder.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use warpdrive_core::error::{Result, WarpDriveError};

const TEMPLATE_SPACE: &str = "MNI152NLin2009bAsym";

/// Directory layout of a subject.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LayoutKind {
    Legacy,
    Bids,
}

/// Encoding of the normalization metadata file holding the approval flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetadataFormat {
    /// `{..., "approval": 0|1}`
    Json,
    /// MAT-file with an approval sentinel under the `glanat` key.
    LegacyBinary,
}

/// Canonical file locations of one subject.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubjectPaths {
    root: PathBuf,
    subject_id: String,
    kind: LayoutKind,
}

impl SubjectPaths {
    /// Resolve the layout of the subject at `root`.
    ///
    /// # Errors
    /// `NotFound` if `root` is not a directory.
    pub fn resolve<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref();
        if !root.is_dir() {
            return Err(WarpDriveError::not_found(format!(
                "subject directory {}",
                root.display()
            )));
        }
        let kind = if root.join("preprocessing").is_dir() {
            LayoutKind::Bids
        } else {
            LayoutKind::Legacy
        };
        let paths = Self::with_kind(root, kind)?;
        tracing::debug!(subject = %paths.subject_id, ?kind, "resolved subject layout");
        Ok(paths)
    }

    /// Build paths for a known layout without touching the filesystem.
    pub fn with_kind<P: AsRef<Path>>(root: P, kind: LayoutKind) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        let subject_id = root
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .ok_or_else(|| {
                WarpDriveError::invalid_parameter(format!(
                    "subject path {} has no base name",
                    root.display()
                ))
            })?;
        Ok(Self {
            root,
            subject_id,
            kind,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn subject_id(&self) -> &str {
        &self.subject_id
    }

    pub fn kind(&self) -> LayoutKind {
        self.kind
    }

    pub fn metadata_format(&self) -> MetadataFormat {
        match self.kind {
            LayoutKind::Bids => MetadataFormat::Json,
            LayoutKind::Legacy => MetadataFormat::LegacyBinary,
        }
    }

    pub fn normalization_dir(&self) -> PathBuf {
        self.root.join("normalization")
    }

    /// Correction session output directory.
    pub fn warpdrive_dir(&self) -> PathBuf {
        self.root.join("warpdrive")
    }

    /// File holding the normalization method and the approval flag.
    pub fn normalization_method_file(&self) -> PathBuf {
        match self.kind {
            LayoutKind::Bids => self
                .normalization_dir()
                .join("log")
                .join(format!("{}_desc-normmethod.json", self.subject_id)),
            LayoutKind::Legacy => self.root.join("ea_coreg_approved.mat"),
        }
    }

    /// Glob pattern for coregistered native images. `None` matches any
    /// modality.
    pub fn coreg_image_pattern(&self, modality: Option<&str>) -> PathBuf {
        let modality = modality.unwrap_or("*");
        match self.kind {
            LayoutKind::Bids => self
                .root
                .join("coregistration")
                .join("anat")
                .join(format!("{}*ses-preop_{}.nii", self.subject_id, modality)),
            LayoutKind::Legacy => self.root.join(format!("anat_{modality}.nii")),
        }
    }

    /// Glob pattern for images normalized into template space.
    pub fn normalized_image_pattern(&self) -> PathBuf {
        match self.kind {
            LayoutKind::Bids => self
                .normalization_dir()
                .join("anat")
                .join(format!("{}*ses-preop*.nii", self.subject_id)),
            LayoutKind::Legacy => self.root.join("glanat*.nii"),
        }
    }

    /// Native to template displacement field.
    pub fn forward_warp(&self) -> PathBuf {
        match self.kind {
            LayoutKind::Bids => self.transformations_dir().join(format!(
                "{}_from-anchorNative_to-{}_desc-ants.nii.gz",
                self.subject_id, TEMPLATE_SPACE
            )),
            LayoutKind::Legacy => self.root.join("glanatComposite.nii.gz"),
        }
    }

    /// Template to native displacement field.
    pub fn inverse_warp(&self) -> PathBuf {
        match self.kind {
            LayoutKind::Bids => self.transformations_dir().join(format!(
                "{}_from-{}_to-anchorNative_desc-ants.nii.gz",
                self.subject_id, TEMPLATE_SPACE
            )),
            LayoutKind::Legacy => self.root.join("glanatInverseComposite.nii.gz"),
        }
    }

    pub fn coreg_images(&self, modality: Option<&str>) -> Result<Vec<PathBuf>> {
        find_matches(&self.coreg_image_pattern(modality))
    }

    pub fn normalized_images(&self) -> Result<Vec<PathBuf>> {
        find_matches(&self.normalized_image_pattern())
    }

    /// The one coregistered image of `modality`.
    ///
    /// # Errors
    /// `NotFound` on no match, `AmbiguousMatch` on several.
    pub fn anchor_image(&self, modality: Option<&str>) -> Result<PathBuf> {
        single_match(&self.coreg_image_pattern(modality))
    }

    /// The one normalized image.
    pub fn normalized_image(&self) -> Result<PathBuf> {
        single_match(&self.normalized_image_pattern())
    }

    fn transformations_dir(&self) -> PathBuf {
        self.normalization_dir().join("transformations")
    }
}

/// Composite-transform sibling of a displacement field path
/// (`x.nii.gz` -> `x.h5`).
pub fn composite_sibling(warp: &Path) -> PathBuf {
    let name = warp
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let stem = name
        .strip_suffix(".nii.gz")
        .or_else(|| name.strip_suffix(".nii"))
        .unwrap_or(&name);
    warp.with_file_name(format!("{stem}.h5"))
}

/// All files matching `pattern`, sorted.
///
/// Directories that cannot be read while searching are logged and skipped.
pub fn find_matches(pattern: &Path) -> Result<Vec<PathBuf>> {
    let pattern_str = pattern.to_string_lossy();
    let entries = glob::glob(&pattern_str).map_err(|e| {
        WarpDriveError::invalid_parameter(format!("bad search pattern {pattern_str}: {e}"))
    })?;
    let mut matches = Vec::new();
    for entry in entries {
        match entry {
            Ok(path) => matches.push(path),
            Err(e) => tracing::warn!(
                pattern = %pattern_str,
                path = %e.path().display(),
                error = %e.error(),
                "skipping unreadable search path"
            ),
        }
    }
    matches.sort();
    Ok(matches)
}

fn single_match(pattern: &Path) -> Result<PathBuf> {
    let mut matches = find_matches(pattern)?;
    match matches.len() {
        0 => Err(WarpDriveError::not_found(format!(
            "no file matches {}",
            pattern.display()
        ))),
        1 => Ok(matches.remove(0)),
        count => Err(WarpDriveError::ambiguous_match(
            pattern.display().to_string(),
            count,
        )),
    }
}
