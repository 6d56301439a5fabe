use super::{ImageRef, ObservationSource};
use crate::error::ExtractionError;
use scene_recon_aruco::{DetectorParams, Dictionary, MarkerDetector};
use scene_recon_core::{CameraModel, GrayImageView, ImageId, MarkerObservation};

/// Observations from printed square fiducials decoded against a dictionary.
pub struct FiducialExtractor {
    detector: MarkerDetector,
}

impl FiducialExtractor {
    pub fn new(dictionary: Dictionary, params: DetectorParams) -> Self {
        Self {
            detector: MarkerDetector::new(dictionary, params),
        }
    }

    pub fn detector(&self) -> &MarkerDetector {
        &self.detector
    }

    /// Detect markers in an already decoded grayscale image.
    pub fn observe(&self, image_id: &ImageId, view: &GrayImageView<'_>) -> Vec<MarkerObservation> {
        self.detector
            .detect(view)
            .into_iter()
            .map(|d| MarkerObservation::new(image_id.clone(), d.id, d.corners))
            .collect()
    }
}

#[cfg(feature = "image")]
fn load_gray(image: &ImageRef) -> Result<::image::GrayImage, ExtractionError> {
    ::image::open(&image.path)
        .map(|img| img.to_luma8())
        .map_err(|err| match err {
            ::image::ImageError::IoError(source) => ExtractionError::Io {
                image: image.id.clone(),
                source,
            },
            source => ExtractionError::Decode {
                image: image.id.clone(),
                source,
            },
        })
}

impl ObservationSource for FiducialExtractor {
    fn name(&self) -> &str {
        "fiducial"
    }

    #[cfg(feature = "image")]
    fn extract(
        &self,
        image: &ImageRef,
        camera: &dyn CameraModel,
    ) -> Result<Vec<MarkerObservation>, ExtractionError> {
        let gray = load_gray(image)?;
        if let Some([w, h]) = camera.image_size() {
            if [gray.width(), gray.height()] != [w, h] {
                return Err(ExtractionError::Malformed {
                    image: image.id.clone(),
                    reason: format!(
                        "image is {}x{} px but the camera is calibrated for {w}x{h}",
                        gray.width(),
                        gray.height()
                    ),
                });
            }
        }
        let view = GrayImageView::try_new(
            gray.width() as usize,
            gray.height() as usize,
            gray.as_raw(),
        )
        .ok_or_else(|| ExtractionError::Malformed {
            image: image.id.clone(),
            reason: "pixel buffer does not match its dimensions".into(),
        })?;
        Ok(self.observe(&image.id, &view))
    }

    #[cfg(not(feature = "image"))]
    fn extract(
        &self,
        image: &ImageRef,
        _camera: &dyn CameraModel,
    ) -> Result<Vec<MarkerObservation>, ExtractionError> {
        Err(ExtractionError::Malformed {
            image: image.id.clone(),
            reason: "built without image decoding support".into(),
        })
    }
}
