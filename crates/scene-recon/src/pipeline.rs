//! The staged reconstruction run.
//!
//! Stages advance strictly in order:
//! `Loaded → Observed → Triangulated → Scaled → Aligned → Exported`.
//! A failing stage halts the pipeline; later calls report [`ReconError::Halted`].

use crate::align::{align_cloud, AlignmentReport};
use crate::config::ReconConfig;
use crate::diagnostics::{Diagnostics, ReconstructionResult, Warning};
use crate::error::ReconError;
use crate::extract::{extract_all, ImageRef, ObservationSource};
use crate::io::write_positions;
use crate::scale::{scale_cloud, ScaleReport};
use crate::triangulate::{triangulate, TriangulationOutput};
use scene_recon_core::{
    AlignmentConstraint, CameraModel, CameraPose, DistanceConstraint, ImageId, MarkerCloud,
    ObservationSet, SeedPoint,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::io::Write;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Loaded,
    Observed,
    Triangulated,
    Scaled,
    Aligned,
    Exported,
}

impl Stage {
    pub fn next(self) -> Option<Stage> {
        match self {
            Self::Loaded => Some(Self::Observed),
            Self::Observed => Some(Self::Triangulated),
            Self::Triangulated => Some(Self::Scaled),
            Self::Scaled => Some(Self::Aligned),
            Self::Aligned => Some(Self::Exported),
            Self::Exported => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Loaded => "loaded",
            Self::Observed => "observed",
            Self::Triangulated => "triangulated",
            Self::Scaled => "scaled",
            Self::Aligned => "aligned",
            Self::Exported => "exported",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One reconstruction run over a fixed camera and configuration.
pub struct Pipeline<C: CameraModel> {
    camera: C,
    config: ReconConfig,
    stage: Stage,
    halted: Option<Stage>,
    observations: ObservationSet,
    triangulation: Option<TriangulationOutput>,
    cloud: MarkerCloud,
    scale: Option<ScaleReport>,
    alignment: Option<AlignmentReport>,
    warnings: Vec<Warning>,
}

impl<C: CameraModel> Pipeline<C> {
    pub fn new(camera: C, config: ReconConfig) -> Self {
        Self {
            camera,
            config,
            stage: Stage::Loaded,
            halted: None,
            observations: ObservationSet::new(),
            triangulation: None,
            cloud: MarkerCloud::new(),
            scale: None,
            alignment: None,
            warnings: Vec::new(),
        }
    }

    /// Last stage completed.
    pub fn stage(&self) -> Stage {
        self.stage
    }

    /// Stage whose failure stopped the run, if any.
    pub fn halted_at(&self) -> Option<Stage> {
        self.halted
    }

    pub fn config(&self) -> &ReconConfig {
        &self.config
    }

    pub fn observations(&self) -> &ObservationSet {
        &self.observations
    }

    /// Current marker cloud, in whatever frame the last completed stage left
    /// it.
    pub fn cloud(&self) -> &MarkerCloud {
        &self.cloud
    }

    pub fn poses(&self) -> Option<&BTreeMap<ImageId, CameraPose>> {
        self.triangulation.as_ref().map(|t| &t.poses)
    }

    fn enter(&self, requested: Stage) -> Result<(), ReconError> {
        if self.halted.is_some() {
            return Err(ReconError::Halted { requested });
        }
        if self.stage.next() != Some(requested) {
            return Err(ReconError::OutOfOrder {
                current: self.stage,
                requested,
            });
        }
        log::info!("entering {requested} stage");
        Ok(())
    }

    fn settle<T>(&mut self, stage: Stage, result: Result<T, ReconError>) -> Result<T, ReconError> {
        match result {
            Ok(value) => {
                self.stage = stage;
                Ok(value)
            }
            Err(err) => {
                log::error!("{err}");
                self.halted = Some(stage);
                Err(err)
            }
        }
    }

    /// Extract observations from `images` with `source`.
    pub fn observe(
        &mut self,
        source: &dyn ObservationSource,
        images: &[ImageRef],
    ) -> Result<&ObservationSet, ReconError> {
        let stage = Stage::Observed;
        self.enter(stage)?;
        let result = if images.is_empty() {
            Err(ReconError::Input {
                stage,
                reason: "no input images".into(),
            })
        } else {
            extract_all(source, &self.camera, images, self.config.parallel)
                .map_err(|source| ReconError::Extraction { stage, source })
        };
        self.observations = self.settle(stage, result)?;
        Ok(&self.observations)
    }

    /// Start from observations gathered elsewhere.
    pub fn with_observations(
        &mut self,
        observations: ObservationSet,
    ) -> Result<&ObservationSet, ReconError> {
        self.enter(Stage::Observed)?;
        self.observations = self.settle(Stage::Observed, Ok(observations))?;
        Ok(&self.observations)
    }

    /// Pose the images and triangulate every marker in the working frame
    /// fixed by `seeds` and `known_poses`.
    pub fn triangulate(
        &mut self,
        seeds: &[SeedPoint],
        known_poses: &BTreeMap<ImageId, CameraPose>,
    ) -> Result<&MarkerCloud, ReconError> {
        let stage = Stage::Triangulated;
        self.enter(stage)?;
        let result = triangulate(
            &self.camera,
            &self.observations,
            seeds,
            known_poses,
            &self.config.triangulation,
        )
        .map_err(|err| ReconError::from_solve(stage, err));
        let mut output = self.settle(stage, result)?;
        self.warnings.append(&mut output.warnings);
        self.cloud = output.cloud.clone();
        self.triangulation = Some(output);
        Ok(&self.cloud)
    }

    /// Rescale the cloud so that known distances hold.
    pub fn scale(
        &mut self,
        constraints: &[DistanceConstraint],
    ) -> Result<&ScaleReport, ReconError> {
        let stage = Stage::Scaled;
        self.enter(stage)?;
        let result = scale_cloud(&self.cloud, constraints, &self.config.scale)
            .map_err(|err| ReconError::from_solve(stage, err));
        let mut output = self.settle(stage, result)?;
        self.warnings.append(&mut output.warnings);
        self.cloud = output.cloud;
        Ok(&*self.scale.insert(output.report))
    }

    /// Move the cloud onto the known alignment positions.
    pub fn align(
        &mut self,
        constraints: &[AlignmentConstraint],
    ) -> Result<&AlignmentReport, ReconError> {
        let stage = Stage::Aligned;
        self.enter(stage)?;
        let result = align_cloud(&self.cloud, constraints, &self.config.alignment)
            .map_err(|err| ReconError::from_solve(stage, err));
        let mut output = self.settle(stage, result)?;
        self.warnings.append(&mut output.warnings);
        self.cloud = output.cloud;
        Ok(&*self.alignment.insert(output.report))
    }

    /// Write the result table to `writer` and return the full result.
    pub fn export<W: Write>(&mut self, writer: W) -> Result<ReconstructionResult, ReconError> {
        let stage = Stage::Exported;
        self.enter(stage)?;
        let result = self.result();
        let written =
            write_positions(writer, &result).map_err(|source| ReconError::Export { stage, source });
        self.settle(stage, written)?;
        log::info!("exported {} marker position(s)", result.markers.len());
        Ok(result)
    }

    /// Diagnostics gathered so far.
    pub fn diagnostics(&self) -> Diagnostics {
        let mut diag = Diagnostics {
            scale: self.scale.clone(),
            alignment: self.alignment.clone(),
            warnings: self.warnings.clone(),
            ..Diagnostics::default()
        };
        if let Some(t) = &self.triangulation {
            diag.converged = t.converged;
            diag.iterations = t.iterations;
            diag.reprojection_rms_px = t.reprojection_rms_px;
            diag.markers = t.markers.clone();
            diag.poses = t.pose_diagnostics.clone();
            diag.unposed_images = t.unposed_images.clone();
        }
        diag
    }

    /// Current cloud and diagnostics as a result record.
    pub fn result(&self) -> ReconstructionResult {
        ReconstructionResult::from_cloud(&self.cloud, self.diagnostics())
    }
}
