use super::linear::{point_quality, refine_point, triangulate_dlt, PointQuality, View};
use super::pose::{estimate_pose, p3p, refine_pose, PoseOptions};
use super::TriangulationParams;
use crate::error::SolveError;
use nalgebra::{Isometry3, Point2, Point3};
use scene_recon_core::math::rms;
use scene_recon_core::{CameraModel, CameraPose, ImageId, MarkerId, ObservationSet, SeedPoint};
use std::collections::{BTreeMap, BTreeSet};

pub(crate) type Corners3 = [Point3<f64>; 4];

#[derive(Clone, Copy, Debug)]
pub(crate) struct ObservedCorners {
    pub pixel: [Point2<f64>; 4],
    pub normalized: [Point2<f64>; 4],
}

/// Current solution: `camera_from_world` per posed image and the four
/// corners of every located marker.
#[derive(Clone, Debug, Default)]
pub(crate) struct Estimate {
    pub poses: BTreeMap<ImageId, Isometry3<f64>>,
    pub markers: BTreeMap<MarkerId, Corners3>,
}

/// Three-point pose candidates of an image that sees exactly three seeds.
type SeedTriple = (ImageId, Vec<Isometry3<f64>>);

pub(crate) struct Correspondences {
    pub world: Vec<Point3<f64>>,
    pub image: Vec<Point2<f64>>,
    pub markers: usize,
}

/// Fixed inputs of one triangulation run.
pub(crate) struct Problem<'a> {
    pub camera: &'a dyn CameraModel,
    pub params: &'a TriangulationParams,
    pub observed: BTreeMap<ImageId, BTreeMap<MarkerId, ObservedCorners>>,
    pub by_marker: BTreeMap<MarkerId, Vec<ImageId>>,
    pub seeds: BTreeMap<MarkerId, Point3<f64>>,
    pub known_poses: BTreeMap<ImageId, Isometry3<f64>>,
}

impl<'a> Problem<'a> {
    pub fn new(
        camera: &'a dyn CameraModel,
        observations: &ObservationSet,
        seeds: &[SeedPoint],
        known_poses: &BTreeMap<ImageId, CameraPose>,
        params: &'a TriangulationParams,
    ) -> Result<Self, SolveError> {
        let mut seed_map = BTreeMap::new();
        for seed in seeds {
            if !seed.position.coords.iter().all(|v| v.is_finite()) {
                return Err(SolveError::Input(format!(
                    "seed for marker {} is not finite",
                    seed.marker_id
                )));
            }
            if seed_map.insert(seed.marker_id, seed.position).is_some() {
                return Err(SolveError::Input(format!(
                    "duplicate seed for marker {}",
                    seed.marker_id
                )));
            }
        }

        let mut observed: BTreeMap<ImageId, BTreeMap<MarkerId, ObservedCorners>> = BTreeMap::new();
        let mut by_marker: BTreeMap<MarkerId, Vec<ImageId>> = BTreeMap::new();
        for image_id in observations.images() {
            let entry = observed.entry(image_id.clone()).or_default();
            for obs in observations.for_image(image_id) {
                let mut normalized = [Point2::origin(); 4];
                let mut ok = true;
                for (dst, px) in normalized.iter_mut().zip(&obs.corners) {
                    match camera.unproject(px) {
                        Some(n) => *dst = n,
                        None => ok = false,
                    }
                }
                if !ok {
                    log::warn!(
                        "marker {} in {} cannot be undistorted; observation dropped",
                        obs.marker_id,
                        image_id
                    );
                    continue;
                }
                entry.insert(
                    obs.marker_id,
                    ObservedCorners {
                        pixel: obs.corners,
                        normalized,
                    },
                );
                by_marker
                    .entry(obs.marker_id)
                    .or_default()
                    .push(image_id.clone());
            }
        }

        let known_poses = known_poses
            .iter()
            .filter(|(id, _)| {
                let known = observed.contains_key(*id);
                if !known {
                    log::debug!("pose supplied for unknown image {id}; ignored");
                }
                known
            })
            .map(|(id, pose)| (id.clone(), pose.camera_from_world()))
            .collect();

        Ok(Self {
            camera,
            params,
            observed,
            by_marker,
            seeds: seed_map,
            known_poses,
        })
    }

    pub fn is_fixed(&self, image_id: &ImageId) -> bool {
        self.known_poses.contains_key(image_id)
    }

    pub fn images(&self) -> impl Iterator<Item = &ImageId> {
        self.observed.keys()
    }

    pub fn pose_options(&self) -> PoseOptions {
        PoseOptions {
            lm_iterations: self.params.pose_lm_iterations,
            planarity_tolerance: self.params.planarity_tolerance,
        }
    }

    /// Located 3D points visible in `image_id`: all four corners of
    /// triangulated markers, the origin of seeds not yet triangulated.
    pub fn correspondences(
        &self,
        image_id: &ImageId,
        markers: &BTreeMap<MarkerId, Corners3>,
    ) -> Correspondences {
        let mut out = Correspondences {
            world: Vec::new(),
            image: Vec::new(),
            markers: 0,
        };
        let Some(seen) = self.observed.get(image_id) else {
            return out;
        };
        for (marker_id, obs) in seen {
            if let Some(corners) = markers.get(marker_id) {
                out.world.extend_from_slice(corners);
                out.image.extend_from_slice(&obs.normalized);
                out.markers += 1;
            } else if let Some(seed) = self.seeds.get(marker_id) {
                out.world.push(*seed);
                out.image.push(obs.normalized[0]);
                out.markers += 1;
            }
        }
        out
    }

    /// Estimate a pose from scratch. Rejected when too few markers are
    /// located or the fit is worse than `max_pose_reprojection_px`.
    pub fn pose_image(
        &self,
        image_id: &ImageId,
        markers: &BTreeMap<MarkerId, Corners3>,
    ) -> Option<Isometry3<f64>> {
        let corr = self.correspondences(image_id, markers);
        if corr.markers < self.params.min_markers_for_pose || corr.world.len() < 4 {
            return None;
        }
        let pose = match estimate_pose(&corr.world, &corr.image, &self.pose_options()) {
            Ok(pose) => pose,
            Err(err) => {
                log::debug!("pose of {image_id} failed: {err}");
                return None;
            }
        };
        let err_px = self.pose_rms_px(image_id, &pose, markers);
        if err_px > self.params.max_pose_reprojection_px {
            log::debug!("pose of {image_id} rejected: rms {err_px:.3} px");
            return None;
        }
        Some(pose)
    }

    /// Start from two images that each see exactly three seeds, when no
    /// image sees four. Every pairing of their three-point candidates
    /// triangulates the markers both images share; the pairing scores the
    /// worst pixel RMS of those markers in the pair and in the other
    /// three-seed images. The best pairing within `max_pose_reprojection_px`
    /// is returned.
    pub fn pose_seed_pair(&self) -> Option<[(ImageId, Isometry3<f64>); 2]> {
        const MAX_IMAGES: usize = 8;
        if self.params.min_markers_for_pose > 3 {
            return None;
        }
        let triples: Vec<SeedTriple> = self
            .observed
            .iter()
            .filter_map(|(image_id, seen)| {
                let seen_seeds: Vec<(Point3<f64>, Point2<f64>)> = seen
                    .iter()
                    .filter_map(|(id, obs)| Some((*self.seeds.get(id)?, obs.normalized[0])))
                    .collect();
                let [a, b, c]: [(Point3<f64>, Point2<f64>); 3] = seen_seeds.try_into().ok()?;
                let candidates = p3p(&[a.0, b.0, c.0], &[a.1, b.1, c.1]);
                (!candidates.is_empty()).then(|| (image_id.clone(), candidates))
            })
            .take(MAX_IMAGES)
            .collect();

        let mut best: Option<(f64, [(usize, Isometry3<f64>); 2])> = None;
        for i in 0..triples.len() {
            for j in (i + 1)..triples.len() {
                for a in &triples[i].1 {
                    for b in &triples[j].1 {
                        let pair = [(i, *a), (j, *b)];
                        let Some(score) = self.seed_pair_score(&triples, pair) else {
                            continue;
                        };
                        if best.as_ref().is_none_or(|(s, _)| score < *s) {
                            best = Some((score, pair));
                        }
                    }
                }
            }
        }

        let (score, [(i, a), (j, b)]) = best?;
        if score > self.params.max_pose_reprojection_px {
            log::debug!("best three-seed start is off by {score:.3} px; rejected");
            return None;
        }
        log::debug!(
            "three-seed start from {} and {} ({score:.3} px)",
            triples[i].0,
            triples[j].0
        );
        Some([(triples[i].0.clone(), a), (triples[j].0.clone(), b)])
    }

    fn seed_pair_score(
        &self,
        triples: &[SeedTriple],
        pair: [(usize, Isometry3<f64>); 2],
    ) -> Option<f64> {
        let [(i, a), (j, b)] = pair;
        let poses = BTreeMap::from([(triples[i].0.clone(), a), (triples[j].0.clone(), b)]);
        let other = self.observed.get(&triples[j].0)?;
        let markers: BTreeMap<MarkerId, Corners3> = self
            .observed
            .get(&triples[i].0)?
            .keys()
            .filter(|id| other.contains_key(*id))
            .filter_map(|id| Some((*id, self.triangulate_marker(*id, &poses, None)?.0)))
            .collect();
        if markers.is_empty() {
            return None;
        }
        let estimate = Estimate { poses, markers };
        let mut score = self.total_rms_px(&estimate);
        for (k, (image_id, candidates)) in triples.iter().enumerate() {
            if k == i || k == j {
                continue;
            }
            let fit = candidates
                .iter()
                .map(|c| self.pose_rms_px(image_id, c, &estimate.markers))
                .fold(f64::INFINITY, f64::min);
            score = score.max(fit);
        }
        Some(score)
    }

    /// Polish an existing pose against the current markers; keeps `current`
    /// when too few markers remain.
    pub fn repose_image(
        &self,
        image_id: &ImageId,
        current: Isometry3<f64>,
        markers: &BTreeMap<MarkerId, Corners3>,
    ) -> Isometry3<f64> {
        let corr = self.correspondences(image_id, markers);
        if corr.world.len() < 4 {
            return current;
        }
        refine_pose(
            current,
            &corr.world,
            &corr.image,
            self.params.pose_lm_iterations,
        )
    }

    /// Posed images observing `marker_id`, in image order.
    pub fn posed_views<'p>(
        &'p self,
        marker_id: MarkerId,
        poses: &'p BTreeMap<ImageId, Isometry3<f64>>,
    ) -> Vec<(&'p ImageId, Isometry3<f64>, &'p ObservedCorners)> {
        let Some(images) = self.by_marker.get(&marker_id) else {
            return Vec::new();
        };
        images
            .iter()
            .filter_map(|id| {
                let pose = poses.get(id)?;
                let obs = self.observed.get(id)?.get(&marker_id)?;
                Some((id, *pose, obs))
            })
            .collect()
    }

    /// Triangulate all four corners of a marker. A seed keeps its origin;
    /// `initial` (if any) replaces the linear solve as the starting point.
    /// Quality aggregates the worst triangulated corner.
    pub fn triangulate_marker(
        &self,
        marker_id: MarkerId,
        poses: &BTreeMap<ImageId, Isometry3<f64>>,
        initial: Option<&Corners3>,
    ) -> Option<(Corners3, PointQuality)> {
        let views = self.posed_views(marker_id, poses);
        if views.len() < 2 {
            return None;
        }
        let seed = self.seeds.get(&marker_id);

        let mut corners = [Point3::origin(); 4];
        let mut quality = PointQuality {
            parallax_deg: f64::INFINITY,
            condition: 0.0,
        };
        for k in 0..4 {
            if let (0, Some(seed)) = (k, seed) {
                corners[0] = *seed;
                continue;
            }
            let corner_views = corner_views(&views, k);
            let start = match initial {
                Some(c) => c[k],
                None => triangulate_dlt(&corner_views)?,
            };
            let point = refine_point(&corner_views, start, self.params.point_iterations);
            let q = point_quality(&corner_views, &point);
            quality.parallax_deg = quality.parallax_deg.min(q.parallax_deg);
            quality.condition = quality.condition.max(q.condition);
            corners[k] = point;
        }
        Some((corners, quality))
    }

    /// Quality of existing corners; a seed's fixed origin is skipped.
    pub fn marker_quality(
        &self,
        marker_id: MarkerId,
        corners: &Corners3,
        poses: &BTreeMap<ImageId, Isometry3<f64>>,
    ) -> PointQuality {
        let views = self.posed_views(marker_id, poses);
        let first = usize::from(self.seeds.contains_key(&marker_id));
        let mut quality = PointQuality {
            parallax_deg: f64::INFINITY,
            condition: 0.0,
        };
        for (k, corner) in corners.iter().enumerate().skip(first) {
            let q = point_quality(&corner_views(&views, k), corner);
            quality.parallax_deg = quality.parallax_deg.min(q.parallax_deg);
            quality.condition = quality.condition.max(q.condition);
        }
        quality
    }

    fn residuals_px(
        &self,
        pose: &Isometry3<f64>,
        world: &Corners3,
        obs: &ObservedCorners,
        out: &mut Vec<f64>,
    ) {
        for (p, px) in world.iter().zip(&obs.pixel) {
            let r = self
                .camera
                .project_camera_point(&pose.transform_point(p))
                .map_or(f64::INFINITY, |proj| (proj - px).norm());
            out.push(r);
        }
    }

    /// Pixel RMS of one image against the located markers it sees.
    pub fn pose_rms_px(
        &self,
        image_id: &ImageId,
        pose: &Isometry3<f64>,
        markers: &BTreeMap<MarkerId, Corners3>,
    ) -> f64 {
        let mut res = Vec::new();
        if let Some(seen) = self.observed.get(image_id) {
            for (marker_id, obs) in seen {
                if let Some(corners) = markers.get(marker_id) {
                    self.residuals_px(pose, corners, obs, &mut res);
                } else if let Some(seed) = self.seeds.get(marker_id) {
                    let r = self
                        .camera
                        .project_camera_point(&pose.transform_point(seed))
                        .map_or(f64::INFINITY, |proj| (proj - obs.pixel[0]).norm());
                    res.push(r);
                }
            }
        }
        rms(&res)
    }

    /// Pixel RMS of one marker over its posed views; `None` without views.
    pub fn marker_rms_px(
        &self,
        marker_id: MarkerId,
        corners: &Corners3,
        poses: &BTreeMap<ImageId, Isometry3<f64>>,
    ) -> Option<f64> {
        let views = self.posed_views(marker_id, poses);
        if views.is_empty() {
            return None;
        }
        let mut res = Vec::new();
        for (_, pose, obs) in views {
            self.residuals_px(&pose, corners, obs, &mut res);
        }
        Some(rms(&res))
    }

    /// Pixel RMS over every marker/image pair of the estimate.
    pub fn total_rms_px(&self, estimate: &Estimate) -> f64 {
        let mut res = Vec::new();
        for (marker_id, corners) in &estimate.markers {
            for (_, pose, obs) in self.posed_views(*marker_id, &estimate.poses) {
                self.residuals_px(&pose, corners, obs, &mut res);
            }
        }
        rms(&res)
    }

    pub fn located_markers(
        &self,
        image_id: &ImageId,
        markers: &BTreeMap<MarkerId, Corners3>,
    ) -> usize {
        self.observed.get(image_id).map_or(0, |seen| {
            seen.keys()
                .filter(|id| markers.contains_key(id) || self.seeds.contains_key(id))
                .count()
        })
    }

    pub fn provenance(
        &self,
        marker_id: MarkerId,
        poses: &BTreeMap<ImageId, Isometry3<f64>>,
    ) -> BTreeSet<ImageId> {
        self.posed_views(marker_id, poses)
            .into_iter()
            .map(|(id, _, _)| id.clone())
            .collect()
    }
}

fn corner_views(views: &[(&ImageId, Isometry3<f64>, &ObservedCorners)], k: usize) -> Vec<View> {
    views
        .iter()
        .map(|(_, pose, obs)| View {
            camera_from_world: *pose,
            point: obs.normalized[k],
        })
        .collect()
}
