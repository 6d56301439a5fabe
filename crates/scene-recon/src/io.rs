//! Comma-separated input tables and the result table.
//!
//! Tables have one header row; blank lines and lines starting with `#` are
//! ignored. A first row whose leading field is numeric is read as data.

use crate::diagnostics::ReconstructionResult;
use nalgebra::Point3;
use scene_recon_core::{AlignmentConstraint, DistanceConstraint, MarkerId, SeedPoint};
use std::fs;
use std::io::Write;
use std::path::Path;

#[derive(thiserror::Error, Debug)]
pub enum TableError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error("{source_name}:{line}: {reason}")]
    Parse {
        source_name: String,
        line: usize,
        reason: String,
    },
    #[error("{0}: table has no rows")]
    Empty(String),
}

struct Row<'a> {
    line: usize,
    fields: Vec<&'a str>,
}

fn rows<'a>(text: &'a str, source_name: &str, columns: usize) -> Result<Vec<Row<'a>>, TableError> {
    let mut out = Vec::new();
    let mut header_seen = false;
    for (idx, raw) in text.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let fields: Vec<&str> = line.split(',').map(str::trim).collect();
        if !header_seen {
            header_seen = true;
            if fields.first().is_some_and(|f| f.parse::<f64>().is_err()) {
                continue;
            }
        }
        if fields.len() < columns {
            return Err(TableError::Parse {
                source_name: source_name.to_string(),
                line: idx + 1,
                reason: format!("expected {columns} fields, found {}", fields.len()),
            });
        }
        out.push(Row {
            line: idx + 1,
            fields,
        });
    }
    if out.is_empty() {
        return Err(TableError::Empty(source_name.to_string()));
    }
    Ok(out)
}

impl Row<'_> {
    fn err(&self, source_name: &str, reason: String) -> TableError {
        TableError::Parse {
            source_name: source_name.to_string(),
            line: self.line,
            reason,
        }
    }

    fn number(&self, col: usize, source_name: &str) -> Result<f64, TableError> {
        let field = self.fields[col];
        match field.parse::<f64>() {
            Ok(v) if v.is_finite() => Ok(v),
            _ => Err(self.err(source_name, format!("`{field}` is not a number"))),
        }
    }

    /// Marker ids may be written as floats (`7.0`) by spreadsheet exports.
    fn marker_id(&self, col: usize, source_name: &str) -> Result<MarkerId, TableError> {
        let field = self.fields[col];
        if let Ok(id) = field.parse::<MarkerId>() {
            return Ok(id);
        }
        match field.parse::<f64>() {
            Ok(v) if v.fract() == 0.0 && v >= 0.0 && v <= MarkerId::MAX as f64 => Ok(v as MarkerId),
            _ => Err(self.err(source_name, format!("`{field}` is not a marker id"))),
        }
    }

    fn point(&self, first: usize, source_name: &str) -> Result<Point3<f64>, TableError> {
        Ok(Point3::new(
            self.number(first, source_name)?,
            self.number(first + 1, source_name)?,
            self.number(first + 2, source_name)?,
        ))
    }
}

/// Parse `marker_id, x, y, z` seed rows.
pub fn parse_seed_points(text: &str, source_name: &str) -> Result<Vec<SeedPoint>, TableError> {
    rows(text, source_name, 4)?
        .iter()
        .map(|r| {
            Ok(SeedPoint {
                marker_id: r.marker_id(0, source_name)?,
                position: r.point(1, source_name)?,
            })
        })
        .collect()
}

/// Parse `marker_id_a, marker_id_b, distance` rows.
pub fn parse_distance_constraints(
    text: &str,
    source_name: &str,
) -> Result<Vec<DistanceConstraint>, TableError> {
    rows(text, source_name, 3)?
        .iter()
        .map(|r| {
            Ok(DistanceConstraint {
                marker_a: r.marker_id(0, source_name)?,
                marker_b: r.marker_id(1, source_name)?,
                distance: r.number(2, source_name)?,
            })
        })
        .collect()
}

/// Parse `marker_id, x, y, z` alignment rows.
pub fn parse_alignment_constraints(
    text: &str,
    source_name: &str,
) -> Result<Vec<AlignmentConstraint>, TableError> {
    rows(text, source_name, 4)?
        .iter()
        .map(|r| {
            Ok(AlignmentConstraint {
                marker_id: r.marker_id(0, source_name)?,
                position: r.point(1, source_name)?,
            })
        })
        .collect()
}

fn read(path: &Path) -> Result<(String, String), TableError> {
    Ok((fs::read_to_string(path)?, path.display().to_string()))
}

pub fn read_seed_points(path: impl AsRef<Path>) -> Result<Vec<SeedPoint>, TableError> {
    let (text, name) = read(path.as_ref())?;
    parse_seed_points(&text, &name)
}

pub fn read_distance_constraints(
    path: impl AsRef<Path>,
) -> Result<Vec<DistanceConstraint>, TableError> {
    let (text, name) = read(path.as_ref())?;
    parse_distance_constraints(&text, &name)
}

pub fn read_alignment_constraints(
    path: impl AsRef<Path>,
) -> Result<Vec<AlignmentConstraint>, TableError> {
    let (text, name) = read(path.as_ref())?;
    parse_alignment_constraints(&text, &name)
}

/// Write `marker_id,x,y,z` rows in ascending id order.
pub fn write_positions<W: Write>(
    mut writer: W,
    result: &ReconstructionResult,
) -> std::io::Result<()> {
    writeln!(writer, "marker_id,x,y,z")?;
    let mut markers = result.markers.clone();
    markers.sort_by_key(|m| m.marker_id);
    for m in &markers {
        writeln!(
            writer,
            "{},{},{},{}",
            m.marker_id, m.position.x, m.position.y, m.position.z
        )?;
    }
    writer.flush()
}

pub fn write_positions_file(
    path: impl AsRef<Path>,
    result: &ReconstructionResult,
) -> Result<(), TableError> {
    let file = fs::File::create(path)?;
    write_positions(std::io::BufWriter::new(file), result)?;
    Ok(())
}
