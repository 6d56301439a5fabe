//! JSON run configuration.

use crate::align::AlignmentParams;
use crate::scale::ScaleParams;
use crate::triangulate::TriangulationParams;
use scene_recon_aruco::DetectorParams;
use serde::{Deserialize, Serialize};
use std::{fs, path::Path};

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Every tunable of a reconstruction run. Missing sections and fields fall
/// back to their defaults.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconConfig {
    pub triangulation: TriangulationParams,
    pub scale: ScaleParams,
    pub alignment: AlignmentParams,
    pub detector: DetectorParams,
    /// Extract observations from several images at once when the `rayon`
    /// feature is enabled.
    pub parallel: bool,
}

impl Default for ReconConfig {
    fn default() -> Self {
        Self {
            triangulation: TriangulationParams::default(),
            scale: ScaleParams::default(),
            alignment: AlignmentParams::default(),
            detector: DetectorParams::default(),
            parallel: true,
        }
    }
}

impl ReconConfig {
    /// Load a JSON config from disk.
    pub fn load_json(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Write this config to disk as pretty JSON.
    pub fn write_json(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_keeps_defaults() {
        let raw = r#"{ "triangulation": { "max_iterations": 7 }, "parallel": false }"#;
        let cfg: ReconConfig = serde_json::from_str(raw).unwrap();
        assert_eq!(cfg.triangulation.max_iterations, 7);
        assert_eq!(
            cfg.triangulation.min_markers_for_pose,
            TriangulationParams::default().min_markers_for_pose
        );
        assert!(!cfg.parallel);
        assert_eq!(cfg.alignment, AlignmentParams::default());
    }

    #[test]
    fn json_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let mut cfg = ReconConfig::default();
        cfg.alignment.outlier_ratio = 8.0;
        cfg.write_json(&path).unwrap();
        assert_eq!(ReconConfig::load_json(&path).unwrap(), cfg);
    }
}
