//! Marker-based scene reconstruction.
//!
//! Recovers 3D positions of identifiable markers from a set of overlapping
//! photographs taken with one calibrated camera, then brings them into a
//! user-defined metric frame.
//!
//! The run is a [`Pipeline`] of strictly ordered stages:
//! - observation extraction from images ([`FiducialExtractor`] for printed
//!   square markers, [`PseudoMarkerTable`] for externally located points),
//! - multi-view triangulation in a working frame fixed by seed points
//!   ([`triangulate`](triangulate::triangulate)),
//! - scale correction from known point distances ([`scale::scale_cloud`]),
//! - rigid alignment onto known positions ([`align::align_cloud`]),
//! - export of a `marker_id,x,y,z` table plus a JSON report.
//!
//! ## Quickstart
//!
//! ```no_run
//! use scene_recon::{io, ImageRef, Pipeline, PseudoMarkerTable, ReconConfig};
//! use scene_recon::core::PinholeCamera;
//! use std::collections::BTreeMap;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let camera = PinholeCamera::load_json("camera.json")?;
//! let table = PseudoMarkerTable::load_json("markers.json")?;
//! let images = table.image_refs("captures");
//!
//! let mut run = Pipeline::new(camera, ReconConfig::default());
//! run.observe(&table, &images)?;
//! run.triangulate(&io::read_seed_points("known.csv")?, &BTreeMap::new())?;
//! run.scale(&io::read_distance_constraints("distances.csv")?)?;
//! run.align(&io::read_alignment_constraints("align.csv")?)?;
//! let result = run.export(std::fs::File::create("points.csv")?)?;
//! println!("{} markers", result.markers.len());
//! # Ok(())
//! # }
//! ```
//!
//! ## API map
//! - `scene_recon::core`: data model, camera model, geometry helpers.
//! - `scene_recon::aruco`: dictionaries and square fiducial detection.
//! - [`extract`], [`triangulate`], [`scale`], [`align`]: the stage solvers,
//!   usable on their own.
//! - [`io`], [`config`]: tables and JSON configuration.

pub use scene_recon_aruco as aruco;
pub use scene_recon_core as core;

pub mod align;
pub mod config;
pub mod diagnostics;
pub mod error;
pub mod extract;
pub mod io;
pub mod pipeline;
pub mod scale;
pub mod triangulate;

pub use config::{ConfigError, ReconConfig};
pub use diagnostics::{
    Diagnostics, MarkerDiagnostics, MarkerPosition, MarkerStatus, ReconstructionResult,
    UnreliableReason, Warning,
};
pub use error::{ExtractionError, ReconError, SolveError};
pub use extract::{FiducialExtractor, ImageRef, ObservationSource, PseudoMarkerTable};
pub use pipeline::{Pipeline, Stage};
