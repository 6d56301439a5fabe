use nalgebra::{Isometry3, Point2, Point3, Vector3};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Stable marker identifier, shared across all images.
pub type MarkerId = u32;

/// Identifier of one input image (usually its file name).
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ImageId(pub String);

impl ImageId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ImageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ImageId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl From<String> for ImageId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// One detected marker in one image.
///
/// Corners are raw (distorted) pixel coordinates with pixel centers at
/// integer positions. Corner 0 is the marker origin; the remaining corners
/// follow clockwise as seen by the camera.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MarkerObservation {
    pub image_id: ImageId,
    pub marker_id: MarkerId,
    pub corners: [Point2<f64>; 4],
}

impl MarkerObservation {
    pub fn new(image_id: ImageId, marker_id: MarkerId, corners: [Point2<f64>; 4]) -> Self {
        Self {
            image_id,
            marker_id,
            corners,
        }
    }

    #[inline]
    pub fn origin(&self) -> Point2<f64> {
        self.corners[0]
    }
}

/// All observations of a capture, grouped per image in sorted image order.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ObservationSet {
    by_image: BTreeMap<ImageId, Vec<MarkerObservation>>,
}

impl ObservationSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a set from loose observations; later duplicates of the same
    /// (image, marker) pair are dropped.
    pub fn from_observations(observations: impl IntoIterator<Item = MarkerObservation>) -> Self {
        let mut set = Self::new();
        for obs in observations {
            set.push(obs);
        }
        set
    }

    /// Record the extraction result of one image, replacing any previous one.
    ///
    /// Images without observations are kept so that they still count as
    /// processed inputs.
    pub fn insert_image(&mut self, image_id: ImageId, observations: Vec<MarkerObservation>) {
        let mut kept: Vec<MarkerObservation> = Vec::with_capacity(observations.len());
        for obs in observations {
            if obs.image_id != image_id {
                log::warn!(
                    "observation of marker {} tagged with image {} filed under {}",
                    obs.marker_id,
                    obs.image_id,
                    image_id
                );
            }
            if kept.iter().any(|k| k.marker_id == obs.marker_id) {
                continue;
            }
            kept.push(MarkerObservation { image_id: image_id.clone(), ..obs });
        }
        kept.sort_by_key(|o| o.marker_id);
        self.by_image.insert(image_id, kept);
    }

    fn push(&mut self, obs: MarkerObservation) {
        let entry = self.by_image.entry(obs.image_id.clone()).or_default();
        if entry.iter().any(|o| o.marker_id == obs.marker_id) {
            return;
        }
        let pos = entry.partition_point(|o| o.marker_id < obs.marker_id);
        entry.insert(pos, obs);
    }

    /// Number of observations over all images.
    pub fn len(&self) -> usize {
        self.by_image.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn image_count(&self) -> usize {
        self.by_image.len()
    }

    pub fn images(&self) -> impl Iterator<Item = &ImageId> {
        self.by_image.keys()
    }

    pub fn for_image(&self, image_id: &ImageId) -> &[MarkerObservation] {
        self.by_image
            .get(image_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn iter(&self) -> impl Iterator<Item = &MarkerObservation> {
        self.by_image.values().flatten()
    }

    /// Observations regrouped per marker id, each list in image order.
    pub fn by_marker(&self) -> BTreeMap<MarkerId, Vec<&MarkerObservation>> {
        let mut out: BTreeMap<MarkerId, Vec<&MarkerObservation>> = BTreeMap::new();
        for obs in self.iter() {
            out.entry(obs.marker_id).or_default().push(obs);
        }
        out
    }

    pub fn marker_ids(&self) -> BTreeSet<MarkerId> {
        self.iter().map(|o| o.marker_id).collect()
    }
}

/// Rigid pose of one image's camera.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct CameraPose {
    /// Maps camera-frame coordinates into the world frame.
    pub world_from_camera: Isometry3<f64>,
}

impl CameraPose {
    pub fn new(world_from_camera: Isometry3<f64>) -> Self {
        Self { world_from_camera }
    }

    pub fn from_camera_from_world(camera_from_world: Isometry3<f64>) -> Self {
        Self::new(camera_from_world.inverse())
    }

    #[inline]
    pub fn camera_from_world(&self) -> Isometry3<f64> {
        self.world_from_camera.inverse()
    }

    /// Camera center in world coordinates.
    #[inline]
    pub fn center(&self) -> Point3<f64> {
        Point3::from(self.world_from_camera.translation.vector)
    }

    #[inline]
    pub fn to_camera(&self, world: &Point3<f64>) -> Point3<f64> {
        self.world_from_camera.inverse_transform_point(world)
    }
}

/// A marker whose origin position is known up front in the working frame.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct SeedPoint {
    pub marker_id: MarkerId,
    pub position: Point3<f64>,
}

/// Reconstructed marker: origin position, all four corners and the images
/// that contributed to it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MarkerPoint3D {
    pub marker_id: MarkerId,
    pub position: Point3<f64>,
    pub corners: [Point3<f64>; 4],
    pub provenance: BTreeSet<ImageId>,
}

impl MarkerPoint3D {
    pub fn from_corners(
        marker_id: MarkerId,
        corners: [Point3<f64>; 4],
        provenance: BTreeSet<ImageId>,
    ) -> Self {
        Self {
            marker_id,
            position: corners[0],
            corners,
            provenance,
        }
    }

    /// Unit normal pointing towards the side the marker was photographed from.
    pub fn normal(&self) -> Option<Vector3<f64>> {
        let right = self.corners[1] - self.corners[0];
        let up = self.corners[0] - self.corners[3];
        right.cross(&up).try_normalize(1e-12)
    }

    /// Mean edge length of the marker square.
    pub fn side_length(&self) -> f64 {
        (0..4)
            .map(|i| (self.corners[(i + 1) % 4] - self.corners[i]).norm())
            .sum::<f64>()
            / 4.0
    }

    fn map_points(&self, f: impl Fn(&Point3<f64>) -> Point3<f64>) -> Self {
        let corners = self.corners.map(|c| f(&c));
        Self {
            marker_id: self.marker_id,
            position: f(&self.position),
            corners,
            provenance: self.provenance.clone(),
        }
    }
}

/// Ordered set of reconstructed markers.
///
/// Every transformation returns a new cloud.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MarkerCloud {
    markers: BTreeMap<MarkerId, MarkerPoint3D>,
}

impl MarkerCloud {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, marker: MarkerPoint3D) -> Option<MarkerPoint3D> {
        self.markers.insert(marker.marker_id, marker)
    }

    pub fn get(&self, marker_id: MarkerId) -> Option<&MarkerPoint3D> {
        self.markers.get(&marker_id)
    }

    pub fn position(&self, marker_id: MarkerId) -> Option<Point3<f64>> {
        self.get(marker_id).map(|m| m.position)
    }

    pub fn contains(&self, marker_id: MarkerId) -> bool {
        self.markers.contains_key(&marker_id)
    }

    pub fn len(&self) -> usize {
        self.markers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.markers.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &MarkerPoint3D> {
        self.markers.values()
    }

    pub fn ids(&self) -> impl Iterator<Item = MarkerId> + '_ {
        self.markers.keys().copied()
    }

    /// Uniformly scale every point about the working-frame origin.
    pub fn scaled(&self, factor: f64) -> Self {
        self.iter()
            .map(|m| m.map_points(|p| Point3::from(p.coords * factor)))
            .collect()
    }

    /// Apply a rigid transform to every point.
    pub fn transformed(&self, transform: &Isometry3<f64>) -> Self {
        self.iter()
            .map(|m| m.map_points(|p| transform.transform_point(p)))
            .collect()
    }
}

impl FromIterator<MarkerPoint3D> for MarkerCloud {
    fn from_iter<T: IntoIterator<Item = MarkerPoint3D>>(iter: T) -> Self {
        let mut cloud = Self::new();
        for marker in iter {
            cloud.insert(marker);
        }
        cloud
    }
}

/// Known physical distance between two marker origins.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct DistanceConstraint {
    pub marker_a: MarkerId,
    pub marker_b: MarkerId,
    pub distance: f64,
}

/// Known absolute position of a marker origin in the external frame.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct AlignmentConstraint {
    pub marker_id: MarkerId,
    pub position: Point3<f64>,
}
