//! Correction session model and its on-disk snapshot.
//!
//! A session holds point sets and label masks created while correcting a
//! subject, grouped in folders and tagged by role. Saving writes every
//! correction-tagged node under `<subject>/warpdrive/Data` with a JSON scene
//! manifest next to it; the directory is the only recovery artifact.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use uuid::Uuid;
use warpdrive_core::error::{Result, WarpDriveError};
use warpdrive_core::GridGeometry;

use crate::layout::SubjectPaths;
use crate::markups::{read_fcsv, write_fcsv, ControlPoint};
use crate::nifti_io::{read_label_volume, write_label_volume};

/// Scene manifest file name inside the session directory.
pub const MANIFEST_FILE: &str = "WarpDriveScene.json";
/// Node file directory inside the session directory.
pub const DATA_DIR: &str = "Data";

const MANIFEST_VERSION: u32 = 1;

/// Role attributes carried by nodes and folders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeTag {
    /// Created by the correction workflow.
    Correction,
    /// Target half of a correspondence.
    Target,
    /// Anchor excluded from recomputation.
    Fixed,
}

/// Payload of a session node.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeData {
    PointSet(Vec<ControlPoint>),
    /// Flat `[Z, Y, X]` `uint8` voxels on `grid`.
    LabelMask { grid: GridGeometry, data: Vec<u8> },
}

#[derive(Debug, Clone, PartialEq)]
pub struct SessionNode {
    pub name: String,
    pub data: NodeData,
    pub tags: BTreeSet<NodeTag>,
    pub folder: Option<String>,
}

impl SessionNode {
    pub fn point_set(name: impl Into<String>, points: Vec<ControlPoint>) -> Self {
        Self {
            name: name.into(),
            data: NodeData::PointSet(points),
            tags: BTreeSet::new(),
            folder: None,
        }
    }

    pub fn label_mask(name: impl Into<String>, grid: GridGeometry, data: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            data: NodeData::LabelMask { grid, data },
            tags: BTreeSet::new(),
            folder: None,
        }
    }

    pub fn with_tag(mut self, tag: NodeTag) -> Self {
        self.tags.insert(tag);
        self
    }

    pub fn in_folder(mut self, folder: impl Into<String>) -> Self {
        self.folder = Some(folder.into());
        self
    }

    pub fn has_tag(&self, tag: NodeTag) -> bool {
        self.tags.contains(&tag)
    }

    pub fn points(&self) -> Option<&[ControlPoint]> {
        match &self.data {
            NodeData::PointSet(points) => Some(points),
            NodeData::LabelMask { .. } => None,
        }
    }
}

/// Grouping folder, one per correction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Folder {
    pub name: String,
    pub tags: BTreeSet<NodeTag>,
}

/// All correction state of one subject.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CorrectionSession {
    nodes: Vec<SessionNode>,
    folders: Vec<Folder>,
}

impl CorrectionSession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn nodes(&self) -> &[SessionNode] {
        &self.nodes
    }

    pub fn folders(&self) -> &[Folder] {
        &self.folders
    }

    pub fn add_node(&mut self, node: SessionNode) {
        self.nodes.push(node);
    }

    /// Add a folder unless one with the same name exists.
    pub fn add_folder(&mut self, name: impl Into<String>, tags: impl IntoIterator<Item = NodeTag>) {
        let name = name.into();
        if !self.folders.iter().any(|f| f.name == name) {
            self.folders.push(Folder {
                name,
                tags: tags.into_iter().collect(),
            });
        }
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty() && self.folders.is_empty()
    }

    /// Whether any correction-tagged node exists.
    pub fn has_corrections(&self) -> bool {
        self.nodes.iter().any(|n| n.has_tag(NodeTag::Correction))
    }

    /// Remove a folder and every node in it.
    pub fn remove_folder(&mut self, name: &str) {
        self.folders.retain(|f| f.name != name);
        self.nodes.retain(|n| n.folder.as_deref() != Some(name));
    }

    /// Turn every target point set into a fixed anchor.
    ///
    /// The node loses its `Target` tag, gains `Fixed`, takes the name of its
    /// correction folder and leaves it. The folder and its remaining members
    /// are removed.
    pub fn set_target_points_as_fixed(&mut self) {
        let mut emptied = Vec::new();
        for node in self.nodes.iter_mut().filter(|n| n.has_tag(NodeTag::Target)) {
            node.tags.remove(&NodeTag::Target);
            node.tags.insert(NodeTag::Fixed);
            if let Some(folder) = node.folder.take() {
                node.name = folder.clone();
                emptied.push(folder);
            }
        }
        for folder in emptied {
            self.remove_folder(&folder);
        }
    }
}

/// Write the session snapshot, replacing any previous one.
///
/// Returns the manifest path.
pub fn save_session(paths: &SubjectPaths, session: &CorrectionSession) -> Result<PathBuf> {
    let dir = paths.warpdrive_dir();
    if dir.exists() {
        std::fs::remove_dir_all(&dir)?;
    }
    std::fs::create_dir_all(dir.join(DATA_DIR))?;

    let mut entries = Vec::new();
    for node in session.nodes.iter().filter(|n| n.has_tag(NodeTag::Correction)) {
        let id = Uuid::new_v4().simple().to_string();
        let (kind, file) = match &node.data {
            NodeData::PointSet(points) => {
                let file = format!("{DATA_DIR}/{id}.fcsv");
                write_fcsv(dir.join(&file), points)?;
                (NodeKind::Points, file)
            }
            NodeData::LabelMask { grid, data } => {
                let file = format!("{DATA_DIR}/{id}.nii.gz");
                write_label_volume(dir.join(&file), grid, data).map_err(|e| {
                    WarpDriveError::inconsistent_state(format!("failed to write mask {}: {e:#}", node.name))
                })?;
                (NodeKind::LabelMap, file)
            }
        };
        entries.push(ManifestNode {
            name: node.name.clone(),
            kind,
            file,
            tags: node.tags.clone(),
            folder: node.folder.clone(),
        });
    }

    let manifest = Manifest {
        version: MANIFEST_VERSION,
        subject: paths.subject_id().to_string(),
        folders: session.folders.clone(),
        nodes: entries,
    };
    let manifest_path = dir.join(MANIFEST_FILE);
    let text = serde_json::to_string_pretty(&manifest)
        .map_err(|e| WarpDriveError::inconsistent_state(format!("failed to encode manifest: {e}")))?;
    std::fs::write(&manifest_path, text)?;

    tracing::info!(
        subject = paths.subject_id(),
        nodes = manifest.nodes.len(),
        "saved correction session"
    );
    Ok(manifest_path)
}

/// Restore a saved session. `None` when no snapshot exists.
pub fn load_session(paths: &SubjectPaths) -> Result<Option<CorrectionSession>> {
    let dir = paths.warpdrive_dir();
    let manifest_path = dir.join(MANIFEST_FILE);
    if !manifest_path.is_file() {
        return Ok(None);
    }

    let text = std::fs::read_to_string(&manifest_path)?;
    let manifest: Manifest = serde_json::from_str(&text).map_err(|e| {
        WarpDriveError::inconsistent_state(format!("bad manifest {}: {e}", manifest_path.display()))
    })?;
    if manifest.version != MANIFEST_VERSION {
        return Err(WarpDriveError::inconsistent_state(format!(
            "unsupported manifest version {}",
            manifest.version
        )));
    }

    let mut session = CorrectionSession {
        nodes: Vec::with_capacity(manifest.nodes.len()),
        folders: manifest.folders,
    };
    for entry in manifest.nodes {
        let file = resolve_node_file(&dir, &entry.file)?;
        let data = match entry.kind {
            NodeKind::Points => NodeData::PointSet(read_fcsv(&file)?),
            NodeKind::LabelMap => {
                let (grid, data) = read_label_volume(&file).map_err(|e| {
                    WarpDriveError::inconsistent_state(format!("failed to read mask {}: {e:#}", file.display()))
                })?;
                NodeData::LabelMask { grid, data }
            }
        };
        session.nodes.push(SessionNode {
            name: entry.name,
            data,
            tags: entry.tags,
            folder: entry.folder,
        });
    }

    tracing::info!(subject = paths.subject_id(), nodes = session.nodes.len(), "restored correction session");
    Ok(Some(session))
}

/// Drop every correction node and correction folder from the session.
///
/// Approval metadata and files on disk are left alone. Returns the number
/// of nodes removed.
pub fn discard_session(session: &mut CorrectionSession) -> usize {
    let folders: Vec<String> = session
        .folders
        .iter()
        .filter(|f| f.tags.contains(&NodeTag::Correction))
        .map(|f| f.name.clone())
        .collect();

    let before = session.nodes.len();
    session.nodes.retain(|n| {
        !n.has_tag(NodeTag::Correction)
            && !n.folder.as_ref().is_some_and(|f| folders.contains(f))
    });
    session.folders.retain(|f| !folders.contains(&f.name));

    let removed = before - session.nodes.len();
    tracing::info!(removed, "discarded corrections");
    removed
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
enum NodeKind {
    Points,
    LabelMap,
}

#[derive(Debug, Serialize, Deserialize)]
struct ManifestNode {
    name: String,
    kind: NodeKind,
    file: String,
    tags: BTreeSet<NodeTag>,
    folder: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Manifest {
    version: u32,
    subject: String,
    folders: Vec<Folder>,
    nodes: Vec<ManifestNode>,
}

/// Node files must stay inside the session directory.
fn resolve_node_file(dir: &Path, relative: &str) -> Result<PathBuf> {
    let path = Path::new(relative);
    if path.is_absolute() || path.components().any(|c| matches!(c, std::path::Component::ParentDir)) {
        return Err(WarpDriveError::inconsistent_state(format!(
            "manifest references a file outside the session: {relative}"
        )));
    }
    Ok(dir.join(path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;
    use warpdrive_core::spatial::{Point3, Spacing3};

    fn subject(dir: &Path) -> SubjectPaths {
        let root = dir.join("sub-02");
        fs::create_dir_all(root.join("preprocessing")).unwrap();
        SubjectPaths::resolve(&root).unwrap()
    }

    fn correction(session: &mut CorrectionSession, folder: &str, source: Point3, target: Point3) {
        session.add_folder(folder, [NodeTag::Correction]);
        session.add_node(
            SessionNode::point_set("source", vec![ControlPoint::new(source).with_description("5")])
                .with_tag(NodeTag::Correction)
                .in_folder(folder),
        );
        session.add_node(
            SessionNode::point_set("target", vec![ControlPoint::new(target)])
                .with_tag(NodeTag::Correction)
                .with_tag(NodeTag::Target)
                .in_folder(folder),
        );
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempdir().unwrap();
        let paths = subject(dir.path());
        let mut session = CorrectionSession::new();
        correction(&mut session, "C1", Point3::new(1.0, 2.0, 3.0), Point3::new(2.0, 2.0, 3.0));
        let grid = GridGeometry::new([3, 2, 2], Point3::origin(), Spacing3::repeat(1.0));
        session.add_node(
            SessionNode::label_mask("stroke", grid, vec![0, 1, 0, 1, 1, 0, 0, 0, 1, 1, 1, 0])
                .with_tag(NodeTag::Correction),
        );
        // Not a correction, never saved
        session.add_node(SessionNode::point_set("atlas", vec![]));

        let manifest = save_session(&paths, &session).unwrap();
        assert_eq!(manifest, paths.warpdrive_dir().join(MANIFEST_FILE));
        let files = fs::read_dir(paths.warpdrive_dir().join(DATA_DIR)).unwrap().count();
        assert_eq!(files, 3);

        let restored = load_session(&paths).unwrap().unwrap();
        assert_eq!(restored.nodes().len(), 3);
        assert_eq!(restored.folders(), session.folders());
        assert_eq!(restored.nodes()[..2], session.nodes()[..2]);
        match &restored.nodes()[2].data {
            NodeData::LabelMask { data, .. } => assert_eq!(data.iter().filter(|&&v| v == 1).count(), 6),
            NodeData::PointSet(_) => panic!("expected a label mask"),
        }
    }

    #[test]
    fn test_save_replaces_previous_snapshot() {
        let dir = tempdir().unwrap();
        let paths = subject(dir.path());
        let stale = paths.warpdrive_dir().join(DATA_DIR).join("stale.fcsv");
        fs::create_dir_all(stale.parent().unwrap()).unwrap();
        fs::write(&stale, "").unwrap();

        save_session(&paths, &CorrectionSession::new()).unwrap();
        assert!(!stale.exists());
        assert!(load_session(&paths).unwrap().unwrap().is_empty());
    }

    #[test]
    fn test_no_snapshot() {
        let dir = tempdir().unwrap();
        assert!(load_session(&subject(dir.path())).unwrap().is_none());
    }

    #[test]
    fn test_discard_keeps_unrelated_nodes() {
        let mut session = CorrectionSession::new();
        correction(&mut session, "C1", Point3::origin(), Point3::new(1.0, 0.0, 0.0));
        session.add_node(SessionNode::point_set("atlas", vec![]));

        assert_eq!(discard_session(&mut session), 2);
        assert_eq!(session.nodes().len(), 1);
        assert_eq!(session.nodes()[0].name, "atlas");
        assert!(session.folders().is_empty());
    }

    #[test]
    fn test_targets_become_fixed() {
        let mut session = CorrectionSession::new();
        correction(&mut session, "C1", Point3::origin(), Point3::new(1.0, 0.0, 0.0));
        correction(&mut session, "C2", Point3::origin(), Point3::new(0.0, 1.0, 0.0));

        session.set_target_points_as_fixed();
        assert!(session.folders().is_empty());
        let names: Vec<&str> = session.nodes().iter().map(|n| n.name.as_str()).collect();
        assert_eq!(names, ["C1", "C2"]);
        assert!(session.nodes().iter().all(|n| n.has_tag(NodeTag::Fixed) && !n.has_tag(NodeTag::Target)));
        assert!(session.nodes().iter().all(|n| n.folder.is_none()));
    }

    #[test]
    fn test_manifest_rejects_escaping_paths() {
        assert!(resolve_node_file(Path::new("/s/warpdrive"), "../../etc/passwd").is_err());
        assert!(resolve_node_file(Path::new("/s/warpdrive"), "Data/a.fcsv").is_ok());
    }
}
