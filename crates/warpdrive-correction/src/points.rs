//! Correspondence points driving a correction.

use warpdrive_core::spatial::Point3;
use warpdrive_io::markups::ControlPoint;
use warpdrive_io::session::{CorrectionSession, NodeTag, SessionNode};

/// A source point and where it should move to.
#[derive(Debug, Clone, PartialEq)]
pub struct Correspondence {
    pub source: Point3,
    pub target: Point3,
    /// Unselected pairs stay in the set but do not drive the warp.
    pub selected: bool,
    /// Influence radius in mm, when annotated.
    pub radius: Option<f64>,
}

impl Correspondence {
    pub fn new(source: Point3, target: Point3) -> Self {
        Self {
            source,
            target,
            selected: true,
            radius: None,
        }
    }

    pub fn with_radius(mut self, radius: f64) -> Self {
        self.radius = Some(radius);
        self
    }

    pub fn with_selected(mut self, selected: bool) -> Self {
        self.selected = selected;
        self
    }
}

/// Ordered set of correspondences.
#[derive(Debug, Clone, PartialEq)]
pub struct CorrespondenceSet {
    pairs: Vec<Correspondence>,
    default_radius: f64,
}

impl CorrespondenceSet {
    pub fn new(default_radius: f64) -> Self {
        Self {
            pairs: Vec::new(),
            default_radius,
        }
    }

    pub fn push(&mut self, pair: Correspondence) {
        self.pairs.push(pair);
    }

    pub fn pairs(&self) -> &[Correspondence] {
        &self.pairs
    }

    pub fn clear(&mut self) {
        self.pairs.clear();
    }

    pub fn selected(&self) -> impl Iterator<Item = &Correspondence> {
        self.pairs.iter().filter(|p| p.selected)
    }

    /// Whether no selected pair exists.
    pub fn is_empty(&self) -> bool {
        self.selected().next().is_none()
    }

    pub fn sources(&self) -> Vec<Point3> {
        self.selected().map(|p| p.source).collect()
    }

    pub fn targets(&self) -> Vec<Point3> {
        self.selected().map(|p| p.target).collect()
    }

    pub fn radii(&self) -> Vec<f64> {
        self.selected()
            .map(|p| p.radius.unwrap_or(self.default_radius))
            .collect()
    }

    /// Comma-joined radii of the selected pairs, as the solver expects.
    pub fn radius_string(&self) -> String {
        self.radii()
            .iter()
            .map(|r| r.to_string())
            .collect::<Vec<_>>()
            .join(",")
    }

    /// Collect pairs from the correction folders of a session.
    ///
    /// In each folder the `Target` point set supplies targets and the other
    /// point set supplies sources, matched by index. A source description
    /// that parses as a number is the point's radius. Fixed anchors are not
    /// part of the set.
    pub fn from_session(session: &CorrectionSession, default_radius: f64) -> Self {
        let mut set = Self::new(default_radius);
        for folder in session.folders() {
            let members = || {
                session
                    .nodes()
                    .iter()
                    .filter(|n| n.folder.as_deref() == Some(folder.name.as_str()))
                    .filter(|n| !n.has_tag(NodeTag::Fixed))
            };
            let Some(targets) = members().find(|n| n.has_tag(NodeTag::Target)).and_then(|n| n.points())
            else {
                continue;
            };
            let Some(sources) = members().find(|n| !n.has_tag(NodeTag::Target)).and_then(|n| n.points())
            else {
                continue;
            };

            for (source, target) in sources.iter().zip(targets.iter()) {
                set.push(Correspondence {
                    source: source.position,
                    target: target.position,
                    selected: source.selected && target.selected,
                    radius: source.description.trim().parse::<f64>().ok().filter(|r| *r > 0.0),
                });
            }
        }
        set
    }

    /// Record the pairs as one correction folder in `session`.
    pub fn record_in_session(&self, session: &mut CorrectionSession, folder: &str) {
        let sources = self
            .pairs
            .iter()
            .map(|p| {
                let point = ControlPoint::new(p.source).with_selected(p.selected);
                match p.radius {
                    Some(r) => point.with_description(r.to_string()),
                    None => point,
                }
            })
            .collect();
        let targets = self
            .pairs
            .iter()
            .map(|p| ControlPoint::new(p.target).with_selected(p.selected))
            .collect();

        session.add_folder(folder, [NodeTag::Correction]);
        session.add_node(
            SessionNode::point_set(format!("{folder} source"), sources)
                .with_tag(NodeTag::Correction)
                .in_folder(folder),
        );
        session.add_node(
            SessionNode::point_set(format!("{folder} target"), targets)
                .with_tag(NodeTag::Correction)
                .with_tag(NodeTag::Target)
                .in_folder(folder),
        );
    }
}
