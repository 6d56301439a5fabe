use super::{ImageRef, ObservationSource};
use crate::error::ExtractionError;
use crate::io::TableError;
use nalgebra::Point2;
use scene_recon_core::{CameraModel, ImageId, MarkerId, MarkerObservation};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::{fs, path::Path};

/// One externally located marker: image file name, id and four pixel
/// corners starting at the marker origin.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PseudoMarkerRow {
    pub image: String,
    pub marker_id: MarkerId,
    pub corners: [[f64; 2]; 4],
}

/// Observations supplied as a table instead of decoded from pixels.
///
/// Used for scenes without printed fiducials, where some other tool has
/// already located identifiable points. Images missing from the table yield
/// no observations; rows with a corner off the camera's sensor are dropped.
#[derive(Clone, Debug, Default)]
pub struct PseudoMarkerTable {
    by_image: BTreeMap<ImageId, Vec<MarkerObservation>>,
}

impl PseudoMarkerTable {
    /// Index `rows` by image. Rows with non-finite corners are rejected.
    pub fn from_rows(rows: Vec<PseudoMarkerRow>, source_name: &str) -> Result<Self, TableError> {
        let mut by_image: BTreeMap<ImageId, Vec<MarkerObservation>> = BTreeMap::new();
        for (idx, row) in rows.into_iter().enumerate() {
            if row.corners.iter().flatten().any(|v| !v.is_finite()) {
                return Err(TableError::Parse {
                    source_name: source_name.to_string(),
                    line: idx + 1,
                    reason: format!("marker {} has non-finite corners", row.marker_id),
                });
            }
            let image_id = ImageId::new(row.image);
            let entry = by_image.entry(image_id.clone()).or_default();
            if entry.iter().any(|o| o.marker_id == row.marker_id) {
                log::warn!(
                    "{source_name}: duplicate row for marker {} in {image_id} ignored",
                    row.marker_id
                );
                continue;
            }
            let corners = row.corners.map(|[x, y]| Point2::new(x, y));
            entry.push(MarkerObservation::new(image_id, row.marker_id, corners));
        }
        Ok(Self { by_image })
    }

    /// Load a JSON array of [`PseudoMarkerRow`].
    pub fn load_json(path: impl AsRef<Path>) -> Result<Self, TableError> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)?;
        let rows: Vec<PseudoMarkerRow> = serde_json::from_str(&raw)?;
        Self::from_rows(rows, &path.display().to_string())
    }

    /// Number of rows kept.
    pub fn len(&self) -> usize {
        self.by_image.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// One reference per image named in the table, resolved against `dir`.
    pub fn image_refs(&self, dir: impl AsRef<Path>) -> Vec<ImageRef> {
        let dir = dir.as_ref();
        self.by_image
            .keys()
            .map(|id| ImageRef {
                id: id.clone(),
                path: dir.join(id.as_str()),
            })
            .collect()
    }
}

impl ObservationSource for PseudoMarkerTable {
    fn name(&self) -> &str {
        "pseudo_markers"
    }

    fn extract(
        &self,
        image: &ImageRef,
        camera: &dyn CameraModel,
    ) -> Result<Vec<MarkerObservation>, ExtractionError> {
        let Some(rows) = self.by_image.get(&image.id) else {
            return Ok(Vec::new());
        };
        Ok(rows
            .iter()
            .filter(|obs| {
                let on_sensor = obs.corners.iter().all(|c| camera.contains(c));
                if !on_sensor {
                    log::warn!(
                        "marker {} in {} lies off the sensor; row ignored",
                        obs.marker_id,
                        image.id
                    );
                }
                on_sensor
            })
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extract::extract_all;
    use scene_recon_core::PinholeCamera;

    fn camera() -> PinholeCamera {
        PinholeCamera::new(400.0, 400.0, 320.0, 240.0).with_image_size(640, 480)
    }

    fn row(image: &str, marker_id: MarkerId, x: f64) -> PseudoMarkerRow {
        PseudoMarkerRow {
            image: image.into(),
            marker_id,
            corners: [[x, 0.0], [x + 10.0, 0.0], [x + 10.0, 10.0], [x, 10.0]],
        }
    }

    #[test]
    fn serves_rows_of_the_requested_image() {
        let table = PseudoMarkerTable::from_rows(
            vec![row("a.png", 4, 0.0), row("b.png", 1, 5.0), row("a.png", 2, 20.0)],
            "table",
        )
        .unwrap();
        assert_eq!(table.len(), 3);

        let obs = table
            .extract(&ImageRef::new("/data/a.png"), &camera())
            .unwrap();
        let ids: Vec<MarkerId> = obs.iter().map(|o| o.marker_id).collect();
        assert_eq!(ids, vec![4, 2]);
        assert_eq!(obs[1].origin(), Point2::new(20.0, 0.0));
        assert!(table
            .extract(&ImageRef::new("c.png"), &camera())
            .unwrap()
            .is_empty());
    }

    #[test]
    fn duplicate_rows_keep_the_first() {
        let table = PseudoMarkerTable::from_rows(
            vec![row("a.png", 4, 0.0), row("a.png", 4, 50.0)],
            "table",
        )
        .unwrap();
        let obs = table.extract(&ImageRef::new("a.png"), &camera()).unwrap();
        assert_eq!(obs.len(), 1);
        assert_eq!(obs[0].origin().x, 0.0);
    }

    #[test]
    fn rows_off_the_sensor_are_dropped() {
        let table = PseudoMarkerTable::from_rows(
            vec![row("a.png", 1, 0.0), row("a.png", 2, 635.0)],
            "table",
        )
        .unwrap();
        let obs = table.extract(&ImageRef::new("a.png"), &camera()).unwrap();
        let ids: Vec<MarkerId> = obs.iter().map(|o| o.marker_id).collect();
        assert_eq!(ids, vec![1]);

        let unsized_camera = PinholeCamera::new(400.0, 400.0, 320.0, 240.0);
        let all = table.extract(&ImageRef::new("a.png"), &unsized_camera).unwrap();
        assert_eq!(all.len(), 2);
    }

    #[test]
    fn non_finite_corners_are_rejected() {
        let mut bad = row("a.png", 1, 0.0);
        bad.corners[2][1] = f64::NAN;
        let err = PseudoMarkerTable::from_rows(vec![row("a.png", 0, 0.0), bad], "t.json")
            .unwrap_err();
        assert!(matches!(err, TableError::Parse { line: 2, .. }));
    }

    #[test]
    fn loads_json_and_lists_its_images() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("markers.json");
        let rows = vec![row("b.png", 3, 0.0), row("a.png", 3, 1.0)];
        fs::write(&path, serde_json::to_string_pretty(&rows).unwrap()).unwrap();

        let table = PseudoMarkerTable::load_json(&path).unwrap();
        let images = table.image_refs("/captures");
        let ids: Vec<&str> = images.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["a.png", "b.png"]);
        assert_eq!(images[1].path, Path::new("/captures/b.png"));

        let set = extract_all(&table, &camera(), &images, false).unwrap();
        assert_eq!(set.len(), 2);
    }
}
