//! Core types and geometry for marker-based scene reconstruction.
//!
//! This crate holds the data model shared by every stage of the pipeline
//! (observations, poses, marker points and constraints), the camera model
//! abstraction, and a handful of purely geometric helpers. It does *not*
//! detect markers or solve for the scene; see `scene-recon-aruco` and
//! `scene-recon` for that.

mod camera;
mod homography;
mod image;
mod logger;
pub mod math;
pub mod synthetic;
mod types;

pub use camera::{BrownConrady5, CameraError, CameraModel, PinholeCamera};
pub use homography::{estimate_homography, homography_from_4pt, Homography};
pub use image::{GrayImage, GrayImageView};
pub use types::{
    AlignmentConstraint, CameraPose, DistanceConstraint, ImageId, MarkerCloud, MarkerId,
    MarkerObservation, MarkerPoint3D, ObservationSet, SeedPoint,
};

#[cfg(feature = "tracing")]
pub use logger::init_tracing;

pub use logger::init_with_level;
