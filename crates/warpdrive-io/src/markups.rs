//! Markups fiducial CSV (`.fcsv`) point-set files.
//!
//! Files store positions in LPS; points are RAS in memory.

use std::fmt::Write as _;
use std::path::Path;

use serde::{Deserialize, Serialize};
use warpdrive_core::error::{Result, WarpDriveError};
use warpdrive_core::spatial::{flip_ras_lps, Point3};

const VERSION_LINE: &str = "# Markups fiducial file version = 4.11";
const COORDINATE_LINE: &str = "# CoordinateSystem = LPS";
const COLUMNS_LINE: &str = "# columns = id,x,y,z,ow,ox,oy,oz,vis,sel,lock,label,desc,associatedNodeID";

/// A single markup point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlPoint {
    /// RAS position in mm.
    pub position: Point3,
    pub label: String,
    pub description: String,
    pub selected: bool,
}

impl ControlPoint {
    pub fn new(position: Point3) -> Self {
        Self {
            position,
            label: String::new(),
            description: String::new(),
            selected: true,
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_selected(mut self, selected: bool) -> Self {
        self.selected = selected;
        self
    }
}

/// Serialize points to `.fcsv` text.
pub fn to_fcsv(points: &[ControlPoint]) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "{VERSION_LINE}");
    let _ = writeln!(out, "{COORDINATE_LINE}");
    let _ = writeln!(out, "{COLUMNS_LINE}");
    for (i, point) in points.iter().enumerate() {
        let p = point.position;
        let lps = flip_ras_lps([p.x, p.y, p.z]);
        let _ = writeln!(
            out,
            "vtkMRMLMarkupsFiducialNode_{},{},{},{},0,0,0,1,1,{},0,{},{},",
            i,
            lps[0],
            lps[1],
            lps[2],
            u8::from(point.selected),
            quote(&point.label),
            quote(&point.description)
        );
    }
    out
}

/// Parse `.fcsv` text. Files declaring RAS coordinates are read unflipped.
pub fn from_fcsv(text: &str) -> Result<Vec<ControlPoint>> {
    let mut lps = true;
    let mut points = Vec::new();
    for (line_no, line) in text.lines().enumerate() {
        let line = line.trim_end_matches('\r');
        if let Some(comment) = line.strip_prefix('#') {
            if let Some(system) = comment.trim().strip_prefix("CoordinateSystem =") {
                lps = matches!(system.trim(), "LPS" | "1");
            }
            continue;
        }
        if line.trim().is_empty() {
            continue;
        }

        let fields = split_csv(line);
        if fields.len() < 4 {
            return Err(WarpDriveError::inconsistent_state(format!(
                "markups line {} has {} columns",
                line_no + 1,
                fields.len()
            )));
        }
        let coord = |i: usize| -> Result<f64> {
            fields[i].trim().parse::<f64>().map_err(|e| {
                WarpDriveError::inconsistent_state(format!(
                    "markups line {}: bad coordinate {:?}: {}",
                    line_no + 1,
                    fields[i],
                    e
                ))
            })
        };
        let mut xyz = [coord(1)?, coord(2)?, coord(3)?];
        if lps {
            xyz = flip_ras_lps(xyz);
        }

        points.push(ControlPoint {
            position: Point3::new(xyz[0], xyz[1], xyz[2]),
            selected: fields.get(9).map_or(true, |s| s.trim() != "0"),
            label: fields.get(11).cloned().unwrap_or_default(),
            description: fields.get(12).cloned().unwrap_or_default(),
        });
    }
    Ok(points)
}

pub fn write_fcsv<P: AsRef<Path>>(path: P, points: &[ControlPoint]) -> Result<()> {
    std::fs::write(path.as_ref(), to_fcsv(points))?;
    Ok(())
}

pub fn read_fcsv<P: AsRef<Path>>(path: P) -> Result<Vec<ControlPoint>> {
    from_fcsv(&std::fs::read_to_string(path.as_ref())?)
}

fn quote(field: &str) -> String {
    if field.contains([',', '"', '\n']) {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

fn split_csv(line: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut chars = line.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '"' if in_quotes && chars.peek() == Some(&'"') => {
                current.push('"');
                chars.next();
            }
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => fields.push(std::mem::take(&mut current)),
            _ => current.push(c),
        }
    }
    fields.push(current);
    fields
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_is_lps() {
        let text = to_fcsv(&[ControlPoint::new(Point3::new(1.0, 2.0, 3.0)).with_label("F-1")]);
        assert!(text.contains("# CoordinateSystem = LPS"));
        assert!(text.contains(",-1,-2,3,"));
        assert!(text.contains(",F-1,"));
    }

    #[test]
    fn test_roundtrip_with_quoted_description() {
        let points = vec![
            ControlPoint::new(Point3::new(-10.5, 22.0, 7.25))
                .with_label("a")
                .with_description("radius, 5"),
            ControlPoint::new(Point3::new(0.0, 0.0, 0.0)).with_selected(false),
        ];
        let parsed = from_fcsv(&to_fcsv(&points)).unwrap();
        assert_eq!(parsed, points);
    }

    #[test]
    fn test_ras_file_is_not_flipped() {
        let text = "# Markups fiducial file version = 4.11\n# CoordinateSystem = RAS\nid0,1,2,3,0,0,0,1,1,1,0,p,,\n";
        let parsed = from_fcsv(text).unwrap();
        assert_eq!(parsed[0].position, Point3::new(1.0, 2.0, 3.0));
    }

    #[test]
    fn test_bad_coordinate() {
        let text = "id0,1,abc,3\n";
        assert!(matches!(
            from_fcsv(text),
            Err(WarpDriveError::InconsistentState(_))
        ));
    }
}
