//! Per-image marker observation sources.

mod fiducial;
mod table;

pub use fiducial::FiducialExtractor;
pub use table::{PseudoMarkerRow, PseudoMarkerTable};

use crate::error::ExtractionError;
use scene_recon_core::{CameraModel, ImageId, MarkerObservation, ObservationSet};
use std::path::{Path, PathBuf};

#[cfg(feature = "rayon")]
use rayon::prelude::*;

const IMAGE_EXTENSIONS: [&str; 3] = ["jpg", "jpeg", "png"];

/// An input image: its id (the file name) and where to read it from.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct ImageRef {
    pub id: ImageId,
    pub path: PathBuf,
}

impl ImageRef {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let id = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        Self {
            id: ImageId::new(id),
            path,
        }
    }

    /// Images in `dir` with a `jpg`, `jpeg` or `png` extension (any case),
    /// sorted by id.
    pub fn list_dir(dir: impl AsRef<Path>) -> std::io::Result<Vec<ImageRef>> {
        let mut out = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            let is_image = path.is_file()
                && path.extension().is_some_and(|ext| {
                    let ext = ext.to_string_lossy().to_ascii_lowercase();
                    IMAGE_EXTENSIONS.contains(&ext.as_str())
                });
            if is_image {
                out.push(ImageRef::new(path));
            }
        }
        out.sort();
        Ok(out)
    }
}

/// A strategy that turns one image taken with `camera` into marker
/// observations.
///
/// A markerless image yields an empty list, never an error; errors are
/// reserved for images that cannot be read or do not match the camera.
pub trait ObservationSource: Send + Sync {
    fn name(&self) -> &str;

    fn extract(
        &self,
        image: &ImageRef,
        camera: &dyn CameraModel,
    ) -> Result<Vec<MarkerObservation>, ExtractionError>;
}

/// Run `source` over every image and merge the results by image id.
///
/// Images are processed concurrently when `parallel` is set and the `rayon`
/// feature is enabled. The first failing image, in input order, is
/// reported.
pub fn extract_all(
    source: &dyn ObservationSource,
    camera: &dyn CameraModel,
    images: &[ImageRef],
    parallel: bool,
) -> Result<ObservationSet, ExtractionError> {
    let run = |image: &ImageRef| {
        source
            .extract(image, camera)
            .map(|obs| (image.id.clone(), obs))
    };

    #[cfg(feature = "rayon")]
    let results: Vec<_> = if parallel {
        images.par_iter().map(run).collect()
    } else {
        images.iter().map(run).collect()
    };
    #[cfg(not(feature = "rayon"))]
    let results: Vec<_> = {
        let _ = parallel;
        images.iter().map(run).collect()
    };

    let mut set = ObservationSet::new();
    for result in results {
        let (image_id, observations) = result?;
        log::debug!(
            "{}: {} marker(s) in {}",
            source.name(),
            observations.len(),
            image_id
        );
        set.insert_image(image_id, observations);
    }
    log::info!(
        "{}: {} observation(s) in {} image(s)",
        source.name(),
        set.len(),
        set.image_count()
    );
    Ok(set)
}
