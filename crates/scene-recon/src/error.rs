use crate::pipeline::Stage;
use scene_recon_core::ImageId;

/// Failure of one solver stage, before the pipeline tags it with the stage.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum SolveError {
    /// Malformed or missing input.
    #[error("invalid input: {0}")]
    Input(String),
    /// Not a single usable constraint or observation to solve from.
    #[error("underdetermined: {0}")]
    Underdetermined(String),
}

/// Observation extraction failed for one image.
#[derive(thiserror::Error, Debug)]
pub enum ExtractionError {
    #[error("cannot read image {image}: {source}")]
    Io {
        image: ImageId,
        #[source]
        source: std::io::Error,
    },
    #[cfg(feature = "image")]
    #[error("cannot decode image {image}: {source}")]
    Decode {
        image: ImageId,
        #[source]
        source: image::ImageError,
    },
    #[error("image {image} is unusable: {reason}")]
    Malformed { image: ImageId, reason: String },
}

/// Errors surfaced by the reconstruction pipeline. Every variant names the
/// stage it halted at.
#[derive(thiserror::Error, Debug)]
pub enum ReconError {
    #[error("{stage} stage failed: invalid input: {reason}")]
    Input { stage: Stage, reason: String },
    #[error("{stage} stage failed: underdetermined: {reason}")]
    Underdetermined { stage: Stage, reason: String },
    #[error("{stage} stage failed: {source}")]
    Extraction {
        stage: Stage,
        #[source]
        source: ExtractionError,
    },
    #[error("{stage} stage failed: {source}")]
    Export {
        stage: Stage,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot enter {requested} from {current}")]
    OutOfOrder { current: Stage, requested: Stage },
    #[error("pipeline halted by an earlier failure; cannot enter {requested}")]
    Halted { requested: Stage },
}

impl ReconError {
    /// Stage the pipeline was trying to enter.
    pub fn stage(&self) -> Stage {
        match self {
            Self::Input { stage, .. }
            | Self::Underdetermined { stage, .. }
            | Self::Extraction { stage, .. }
            | Self::Export { stage, .. } => *stage,
            Self::OutOfOrder { requested, .. } | Self::Halted { requested } => *requested,
        }
    }

    pub(crate) fn from_solve(stage: Stage, err: SolveError) -> Self {
        match err {
            SolveError::Input(reason) => Self::Input { stage, reason },
            SolveError::Underdetermined(reason) => Self::Underdetermined { stage, reason },
        }
    }
}
