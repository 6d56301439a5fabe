//! ArUco-style fiducial detection.
//!
//! The pipeline per image is:
//! - local-mean binarization and 4-connected dark regions,
//! - convex outline reduced to a quad, corners refined on sub-pixel edges,
//! - bit grid sampled through the quad homography and thresholded (Otsu),
//! - rotation-aware dictionary lookup, corners reordered so that corner 0 is
//!   the marker's canonical origin.
//!
//! Dictionaries are plain data loaded from JSON; no dictionary is compiled in.

mod decode;
mod detector;
mod dictionary;
mod matcher;
mod quad;
mod threshold;

pub use decode::DecodeParams;
pub use detector::{DetectorParams, MarkerDetection, MarkerDetector};
pub use dictionary::{Dictionary, DictionaryError};
pub use matcher::{rotate_code_u64, Match, Matcher};
pub use quad::{find_quads, Quad, QuadParams};
