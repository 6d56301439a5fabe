//! Deterministic synthetic scenes for tests and demos.
//!
//! A scene is a set of square markers, a camera model and a list of camera
//! poses; observations are produced by projecting every marker corner.

use crate::{
    CameraModel, CameraPose, ImageId, MarkerId, MarkerObservation, ObservationSet, PinholeCamera,
};
use nalgebra::{Isometry3, Matrix3, Point3, Rotation3, Translation3, UnitQuaternion, Vector3};

/// Corners of a square marker centred at `center`.
///
/// `right` and `up` span the marker plane as seen from its front; corner 0
/// is the top-left one and the order runs clockwise when viewed from the
/// front.
pub fn marker_corners(
    center: Point3<f64>,
    right: Vector3<f64>,
    up: Vector3<f64>,
    side: f64,
) -> [Point3<f64>; 4] {
    let r = right.normalize() * (0.5 * side);
    let u = up.normalize() * (0.5 * side);
    [
        center - r + u,
        center + r + u,
        center + r - u,
        center - r - u,
    ]
}

/// Camera at `eye` looking at `target`; image `y` points away from `up`.
pub fn look_at(eye: Point3<f64>, target: Point3<f64>, up: Vector3<f64>) -> CameraPose {
    let z = (target - eye).normalize();
    let x = z.cross(&up).normalize();
    let y = z.cross(&x);
    let rot = Rotation3::from_matrix_unchecked(Matrix3::from_columns(&[x, y, z]));
    CameraPose::new(Isometry3::from_parts(
        Translation3::from(eye.coords),
        UnitQuaternion::from_rotation_matrix(&rot),
    ))
}

#[derive(Clone, Debug)]
pub struct SyntheticScene {
    pub camera: PinholeCamera,
    pub markers: Vec<(MarkerId, [Point3<f64>; 4])>,
    pub poses: Vec<(ImageId, CameraPose)>,
}

impl SyntheticScene {
    /// A camera with mild barrel distortion and a 1280x960 sensor.
    pub fn default_camera() -> PinholeCamera {
        PinholeCamera::new(900.0, 900.0, 640.0, 480.0)
            .with_distortion(crate::BrownConrady5 {
                k1: -0.05,
                k2: 0.01,
                ..Default::default()
            })
            .with_image_size(1280, 960)
    }

    /// Flat markers on the `z = 0` plane at the given centres, facing `+z`.
    pub fn ground_markers(
        centers: &[(MarkerId, Point3<f64>)],
        side: f64,
    ) -> Vec<(MarkerId, [Point3<f64>; 4])> {
        centers
            .iter()
            .map(|&(id, c)| (id, marker_corners(c, Vector3::x(), Vector3::y(), side)))
            .collect()
    }

    /// Place `views` cameras on a horizontal circle of `radius` at `height`,
    /// all looking at `target`.
    pub fn ring(
        camera: PinholeCamera,
        markers: Vec<(MarkerId, [Point3<f64>; 4])>,
        views: usize,
        radius: f64,
        height: f64,
        target: Point3<f64>,
    ) -> Self {
        let poses = (0..views)
            .map(|i| {
                let a = std::f64::consts::TAU * i as f64 / views as f64 + 0.3;
                let eye = Point3::new(
                    target.x + radius * a.cos(),
                    target.y + radius * a.sin(),
                    target.z + height,
                );
                (
                    ImageId::new(format!("view_{i:02}.png")),
                    look_at(eye, target, Vector3::z()),
                )
            })
            .collect();
        Self {
            camera,
            markers,
            poses,
        }
    }

    pub fn marker(&self, marker_id: MarkerId) -> Option<&[Point3<f64>; 4]> {
        self.markers
            .iter()
            .find(|(id, _)| *id == marker_id)
            .map(|(_, c)| c)
    }

    /// Project one marker into one pose; `None` if any corner is hidden or
    /// off-sensor.
    pub fn project_marker(
        &self,
        image_id: &ImageId,
        pose: &CameraPose,
        marker_id: MarkerId,
        corners: &[Point3<f64>; 4],
    ) -> Option<MarkerObservation> {
        let mut px = [nalgebra::Point2::origin(); 4];
        for (dst, c) in px.iter_mut().zip(corners) {
            let p = self.camera.project(c, pose)?;
            if !self.camera.contains(&p) {
                return None;
            }
            *dst = p;
        }
        Some(MarkerObservation::new(image_id.clone(), marker_id, px))
    }

    /// Every visible marker in every view.
    pub fn observations(&self) -> ObservationSet {
        let mut set = ObservationSet::new();
        for (image_id, pose) in &self.poses {
            let obs = self
                .markers
                .iter()
                .filter_map(|(id, corners)| self.project_marker(image_id, pose, *id, corners))
                .collect();
            set.insert_image(image_id.clone(), obs);
        }
        set
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn look_at_points_optical_axis_at_target() {
        let pose = look_at(Point3::new(0.0, -2.0, 1.0), Point3::origin(), Vector3::z());
        let p = pose.to_camera(&Point3::origin());
        assert_relative_eq!(p.x, 0.0, epsilon = 1e-12);
        assert_relative_eq!(p.y, 0.0, epsilon = 1e-12);
        assert!(p.z > 0.0);
    }

    #[test]
    fn ground_markers_appear_clockwise() {
        let markers = SyntheticScene::ground_markers(&[(1, Point3::origin())], 0.2);
        let scene = SyntheticScene::ring(
            SyntheticScene::default_camera(),
            markers,
            4,
            2.0,
            1.5,
            Point3::origin(),
        );
        let set = scene.observations();
        assert_eq!(set.len(), 4);
        for obs in set.iter() {
            let c = &obs.corners;
            let area: f64 = (0..4)
                .map(|i| {
                    let (a, b) = (c[i], c[(i + 1) % 4]);
                    a.x * b.y - b.x * a.y
                })
                .sum();
            assert!(area > 0.0, "corners of {} not clockwise", obs.image_id);
        }
    }
}
