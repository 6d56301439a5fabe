//! Camera model abstraction and the pinhole + Brown-Conrady implementation.

use crate::types::CameraPose;
use nalgebra::{Point2, Point3, Unit, Vector3};
use serde::{Deserialize, Serialize};
use std::{fs, path::Path};

#[derive(thiserror::Error, Debug)]
pub enum CameraError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error("invalid camera intrinsics: {0}")]
    Invalid(String),
}

/// Intrinsic camera model shared by every image of a capture.
///
/// Implementations map between camera-frame 3D points and raw pixels.
/// Pose estimation is built on top of these two capabilities.
pub trait CameraModel: Send + Sync {
    /// Project a point given in the camera frame. `None` if it lies behind
    /// the camera.
    fn project_camera_point(&self, point: &Point3<f64>) -> Option<Point2<f64>>;

    /// Map a raw pixel to undistorted normalized image coordinates
    /// (`x / z`, `y / z` of the viewing ray).
    fn unproject(&self, pixel: &Point2<f64>) -> Option<Point2<f64>>;

    /// Project a world point seen from `pose`.
    fn project(&self, world: &Point3<f64>, pose: &CameraPose) -> Option<Point2<f64>> {
        self.project_camera_point(&pose.to_camera(world))
    }

    /// Unit viewing ray of a pixel in the camera frame.
    fn bearing(&self, pixel: &Point2<f64>) -> Option<Unit<Vector3<f64>>> {
        let n = self.unproject(pixel)?;
        Some(Unit::new_normalize(Vector3::new(n.x, n.y, 1.0)))
    }

    /// Sensor size in pixels (`[width, height]`), if known.
    fn image_size(&self) -> Option<[u32; 2]> {
        None
    }

    /// Whether a pixel falls on the sensor. Always true when the size is unknown.
    fn contains(&self, pixel: &Point2<f64>) -> bool {
        match self.image_size() {
            Some([w, h]) => {
                pixel.x >= -0.5
                    && pixel.y >= -0.5
                    && pixel.x <= w as f64 - 0.5
                    && pixel.y <= h as f64 - 0.5
            }
            None => true,
        }
    }
}

/// Five-parameter Brown-Conrady lens distortion (k1, k2, k3 radial; p1, p2 tangential).
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct BrownConrady5 {
    #[serde(default)]
    pub k1: f64,
    #[serde(default)]
    pub k2: f64,
    #[serde(default)]
    pub k3: f64,
    #[serde(default)]
    pub p1: f64,
    #[serde(default)]
    pub p2: f64,
}

const UNDISTORT_ITERS: usize = 30;
const UNDISTORT_TOL: f64 = 1e-14;

impl BrownConrady5 {
    pub fn is_identity(&self) -> bool {
        self.k1 == 0.0 && self.k2 == 0.0 && self.k3 == 0.0 && self.p1 == 0.0 && self.p2 == 0.0
    }

    /// Apply distortion to normalized coordinates.
    pub fn distort(&self, n: Point2<f64>) -> Point2<f64> {
        let (x, y) = (n.x, n.y);
        let r2 = x * x + y * y;
        let radial = 1.0 + r2 * (self.k1 + r2 * (self.k2 + r2 * self.k3));
        let dx = 2.0 * self.p1 * x * y + self.p2 * (r2 + 2.0 * x * x);
        let dy = self.p1 * (r2 + 2.0 * y * y) + 2.0 * self.p2 * x * y;
        Point2::new(x * radial + dx, y * radial + dy)
    }

    /// Invert [`distort`](Self::distort) by fixed-point iteration.
    pub fn undistort(&self, d: Point2<f64>) -> Point2<f64> {
        if self.is_identity() {
            return d;
        }
        let mut n = d;
        for _ in 0..UNDISTORT_ITERS {
            let (x, y) = (n.x, n.y);
            let r2 = x * x + y * y;
            let radial = 1.0 + r2 * (self.k1 + r2 * (self.k2 + r2 * self.k3));
            let dx = 2.0 * self.p1 * x * y + self.p2 * (r2 + 2.0 * x * x);
            let dy = self.p1 * (r2 + 2.0 * y * y) + 2.0 * self.p2 * x * y;
            let next = Point2::new((d.x - dx) / radial, (d.y - dy) / radial);
            let step = (next - n).norm();
            n = next;
            if step < UNDISTORT_TOL {
                break;
            }
        }
        n
    }
}

/// Pinhole intrinsics with Brown-Conrady distortion.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct PinholeCamera {
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,
    #[serde(default)]
    pub skew: f64,
    #[serde(default)]
    pub distortion: BrownConrady5,
    /// Sensor size in pixels (`[width, height]`), if known.
    #[serde(default)]
    pub image_size: Option<[u32; 2]>,
}

impl PinholeCamera {
    pub fn new(fx: f64, fy: f64, cx: f64, cy: f64) -> Self {
        Self {
            fx,
            fy,
            cx,
            cy,
            skew: 0.0,
            distortion: BrownConrady5::default(),
            image_size: None,
        }
    }

    pub fn with_distortion(mut self, distortion: BrownConrady5) -> Self {
        self.distortion = distortion;
        self
    }

    pub fn with_image_size(mut self, width: u32, height: u32) -> Self {
        self.image_size = Some([width, height]);
        self
    }

    pub fn validate(&self) -> Result<(), CameraError> {
        let finite = [self.fx, self.fy, self.cx, self.cy, self.skew]
            .iter()
            .all(|v| v.is_finite());
        if !finite || self.fx <= 0.0 || self.fy <= 0.0 {
            return Err(CameraError::Invalid(format!(
                "focal lengths must be positive and finite (fx={}, fy={})",
                self.fx, self.fy
            )));
        }
        Ok(())
    }

    /// Load intrinsics from a JSON file.
    pub fn load_json(path: impl AsRef<Path>) -> Result<Self, CameraError> {
        let raw = fs::read_to_string(path)?;
        let camera: Self = serde_json::from_str(&raw)?;
        camera.validate()?;
        Ok(camera)
    }

    /// Write intrinsics to disk as pretty JSON.
    pub fn write_json(&self, path: impl AsRef<Path>) -> Result<(), CameraError> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        Ok(())
    }
}

impl CameraModel for PinholeCamera {
    fn project_camera_point(&self, point: &Point3<f64>) -> Option<Point2<f64>> {
        if point.z <= f64::EPSILON {
            return None;
        }
        let d = self
            .distortion
            .distort(Point2::new(point.x / point.z, point.y / point.z));
        Some(Point2::new(
            self.fx * d.x + self.skew * d.y + self.cx,
            self.fy * d.y + self.cy,
        ))
    }

    fn unproject(&self, pixel: &Point2<f64>) -> Option<Point2<f64>> {
        let y = (pixel.y - self.cy) / self.fy;
        let x = (pixel.x - self.cx - self.skew * y) / self.fx;
        let n = self.distortion.undistort(Point2::new(x, y));
        (n.x.is_finite() && n.y.is_finite()).then_some(n)
    }

    fn image_size(&self) -> Option<[u32; 2]> {
        self.image_size
    }
}
