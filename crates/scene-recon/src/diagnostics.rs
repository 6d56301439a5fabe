//! Non-fatal findings and the final result record.

use crate::align::AlignmentReport;
use crate::pipeline::Stage;
use crate::scale::ScaleReport;
use nalgebra::Point3;
use scene_recon_core::{ImageId, MarkerCloud, MarkerId};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::{fs, path::Path};

/// Why a triangulated marker was excluded from the cloud.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnreliableReason {
    /// Viewing rays are nearly collinear.
    LowParallax,
    /// The triangulation system is ill-conditioned or has no solution.
    IllConditioned,
    /// Reprojection error above the configured limit.
    HighReprojectionError,
}

impl fmt::Display for UnreliableReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::LowParallax => "low parallax",
            Self::IllConditioned => "ill-conditioned triangulation",
            Self::HighReprojectionError => "high reprojection error",
        })
    }
}

/// A non-fatal condition recorded during the run. Every warning is also
/// logged when it is raised.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Warning {
    NotConverged {
        iterations: usize,
        reprojection_rms_px: f64,
    },
    UnderdeterminedMarker {
        marker_id: MarkerId,
        posed_views: usize,
    },
    UnreliableMarker {
        marker_id: MarkerId,
        reason: UnreliableReason,
    },
    UnposedImage {
        image_id: ImageId,
        located_markers: usize,
    },
    SkippedConstraint {
        stage: Stage,
        marker_ids: Vec<MarkerId>,
        reason: String,
    },
    LowConfidenceAlignment {
        reason: String,
    },
    AlignmentOutlier {
        marker_id: MarkerId,
        residual: f64,
        /// Left out of the final fit; otherwise kept for lack of points.
        excluded: bool,
    },
}

impl Warning {
    pub(crate) fn raise(self, sink: &mut Vec<Warning>) {
        log::warn!("{self}");
        sink.push(self);
    }
}

impl fmt::Display for Warning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotConverged {
                iterations,
                reprojection_rms_px,
            } => write!(
                f,
                "refinement did not converge after {iterations} iterations \
                 (rms {reprojection_rms_px:.4} px)"
            ),
            Self::UnderdeterminedMarker {
                marker_id,
                posed_views,
            } => write!(
                f,
                "marker {marker_id} seen in {posed_views} posed image(s); excluded"
            ),
            Self::UnreliableMarker { marker_id, reason } => {
                write!(f, "marker {marker_id} unreliable ({reason}); excluded")
            }
            Self::UnposedImage {
                image_id,
                located_markers,
            } => write!(
                f,
                "image {image_id} could not be posed ({located_markers} located marker(s))"
            ),
            Self::SkippedConstraint {
                stage,
                marker_ids,
                reason,
            } => write!(f, "{stage}: constraint on {marker_ids:?} skipped: {reason}"),
            Self::LowConfidenceAlignment { reason } => {
                write!(f, "alignment is low confidence: {reason}")
            }
            Self::AlignmentOutlier {
                marker_id,
                residual,
                excluded,
            } => write!(
                f,
                "alignment point {marker_id} is an outlier (residual {residual:.6}); {}",
                if *excluded { "excluded" } else { "kept" }
            ),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MarkerStatus {
    Reliable,
    Unreliable,
    Underdetermined,
}

/// Per-marker triangulation outcome.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MarkerDiagnostics {
    pub marker_id: MarkerId,
    pub status: MarkerStatus,
    #[serde(default)]
    pub reason: Option<UnreliableReason>,
    /// Number of posed images observing the marker.
    pub views: usize,
    #[serde(default)]
    pub reprojection_rms_px: Option<f64>,
    #[serde(default)]
    pub parallax_deg: Option<f64>,
    #[serde(default)]
    pub condition: Option<f64>,
    pub seed: bool,
}

/// Per-image pose outcome.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PoseDiagnostics {
    pub image_id: ImageId,
    /// Camera center in the working frame.
    pub center: Point3<f64>,
    pub markers: usize,
    pub reprojection_rms_px: f64,
    /// Supplied by the caller rather than estimated.
    pub fixed: bool,
}

/// Everything the run learned besides the positions themselves.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Diagnostics {
    pub converged: bool,
    pub iterations: usize,
    pub reprojection_rms_px: f64,
    pub markers: Vec<MarkerDiagnostics>,
    pub poses: Vec<PoseDiagnostics>,
    pub unposed_images: Vec<ImageId>,
    #[serde(default)]
    pub scale: Option<ScaleReport>,
    #[serde(default)]
    pub alignment: Option<AlignmentReport>,
    pub warnings: Vec<Warning>,
}

impl Diagnostics {
    pub fn marker(&self, marker_id: MarkerId) -> Option<&MarkerDiagnostics> {
        self.markers.iter().find(|m| m.marker_id == marker_id)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct MarkerPosition {
    pub marker_id: MarkerId,
    pub position: Point3<f64>,
}

/// Final output: aligned marker positions in ascending id order plus
/// diagnostics.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ReconstructionResult {
    pub markers: Vec<MarkerPosition>,
    pub diagnostics: Diagnostics,
}

impl ReconstructionResult {
    pub fn from_cloud(cloud: &MarkerCloud, diagnostics: Diagnostics) -> Self {
        Self {
            markers: cloud
                .iter()
                .map(|m| MarkerPosition {
                    marker_id: m.marker_id,
                    position: m.position,
                })
                .collect(),
            diagnostics,
        }
    }

    pub fn position(&self, marker_id: MarkerId) -> Option<Point3<f64>> {
        self.markers
            .iter()
            .find(|m| m.marker_id == marker_id)
            .map(|m| m.position)
    }

    /// Load a result report from JSON on disk.
    pub fn load_json(path: impl AsRef<Path>) -> Result<Self, crate::io::TableError> {
        let raw = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Write the result as pretty JSON.
    pub fn write_json(&self, path: impl AsRef<Path>) -> Result<(), crate::io::TableError> {
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }
}
