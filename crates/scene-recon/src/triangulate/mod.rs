//! Multi-view triangulation of marker corners with pose bootstrap and
//! alternating refinement.
//!
//! The working frame is fixed by the seeds (known marker origins) and any
//! supplied camera poses. Images are posed from located markers, markers
//! are triangulated from posed images, and both are refined in turn until
//! the reprojection error settles.

mod bootstrap;
mod linear;
mod pose;
mod problem;
mod refine;

pub use pose::PoseError;

use crate::diagnostics::{
    MarkerDiagnostics, MarkerStatus, PoseDiagnostics, UnreliableReason, Warning,
};
use crate::error::SolveError;
use nalgebra::{Point2, Point3};
use problem::Problem;
use scene_recon_core::{
    CameraModel, CameraPose, ImageId, MarkerCloud, MarkerPoint3D, ObservationSet, SeedPoint,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[cfg(feature = "tracing")]
use tracing::instrument;

/// Triangulation and refinement settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TriangulationParams {
    /// Located markers an image must see before its pose is estimated.
    pub min_markers_for_pose: usize,
    pub max_bootstrap_rounds: usize,
    /// Cap on refinement iterations.
    pub max_iterations: usize,
    pub convergence_threshold_px: f64,
    pub convergence_epsilon_px: f64,
    /// Markers whose widest pair of viewing rays is narrower than this are
    /// unreliable.
    pub min_parallax_deg: f64,
    pub max_condition: f64,
    pub max_marker_reprojection_px: f64,
    pub max_pose_reprojection_px: f64,
    pub pose_lm_iterations: usize,
    pub point_iterations: usize,
    pub planarity_tolerance: f64,
}

impl Default for TriangulationParams {
    fn default() -> Self {
        Self {
            min_markers_for_pose: 3,
            max_bootstrap_rounds: 20,
            max_iterations: 50,
            convergence_threshold_px: 0.01,
            convergence_epsilon_px: 1e-4,
            min_parallax_deg: 2.0,
            max_condition: 1e5,
            max_marker_reprojection_px: 2.0,
            max_pose_reprojection_px: 5.0,
            pose_lm_iterations: 50,
            point_iterations: 10,
            planarity_tolerance: 0.02,
        }
    }
}

/// Everything the triangulator produced; poses are reported for
/// diagnostics only.
#[derive(Clone, Debug)]
pub struct TriangulationOutput {
    pub cloud: MarkerCloud,
    pub poses: BTreeMap<ImageId, CameraPose>,
    pub converged: bool,
    pub iterations: usize,
    pub reprojection_rms_px: f64,
    pub markers: Vec<MarkerDiagnostics>,
    pub pose_diagnostics: Vec<PoseDiagnostics>,
    pub unposed_images: Vec<ImageId>,
    pub warnings: Vec<Warning>,
}

/// Locate every marker that at least two posed images observe.
///
/// Fails with [`SolveError::Input`] on an empty observation set and with
/// [`SolveError::Underdetermined`] when nothing anchors the working frame,
/// no image can be posed, or no marker is located reliably.
#[cfg_attr(
    feature = "tracing",
    instrument(
        level = "info",
        skip_all,
        fields(images = observations.image_count(), seeds = seeds.len())
    )
)]
pub fn triangulate(
    camera: &dyn CameraModel,
    observations: &ObservationSet,
    seeds: &[SeedPoint],
    known_poses: &BTreeMap<ImageId, CameraPose>,
    params: &TriangulationParams,
) -> Result<TriangulationOutput, SolveError> {
    if observations.is_empty() {
        return Err(SolveError::Input("no marker observations".into()));
    }
    if seeds.is_empty() && known_poses.is_empty() {
        return Err(SolveError::Underdetermined(
            "no seed points or camera poses to anchor the working frame".into(),
        ));
    }

    let problem = Problem::new(camera, observations, seeds, known_poses, params)?;
    let initial = bootstrap::bootstrap(&problem);
    if initial.poses.is_empty() {
        return Err(SolveError::Underdetermined(format!(
            "no image could be posed from the seeds ({} or more must be in view)",
            params.min_markers_for_pose.max(3)
        )));
    }
    log::info!(
        "bootstrap posed {}/{} images and located {} markers",
        initial.poses.len(),
        observations.image_count(),
        initial.markers.len()
    );

    let (estimate, summary) = refine::refine(&problem, initial);
    let mut warnings = Vec::new();
    if !summary.converged {
        Warning::NotConverged {
            iterations: summary.iterations,
            reprojection_rms_px: summary.error_px,
        }
        .raise(&mut warnings);
    }

    let mut cloud = MarkerCloud::new();
    let mut markers = Vec::new();
    for &marker_id in problem.by_marker.keys() {
        let views = problem.posed_views(marker_id, &estimate.poses).len();
        let seed = problem.seeds.contains_key(&marker_id);
        let mut diag = MarkerDiagnostics {
            marker_id,
            status: MarkerStatus::Underdetermined,
            reason: None,
            views,
            reprojection_rms_px: None,
            parallax_deg: None,
            condition: None,
            seed,
        };
        if views < 2 {
            Warning::UnderdeterminedMarker {
                marker_id,
                posed_views: views,
            }
            .raise(&mut warnings);
            markers.push(diag);
            continue;
        }

        let located = match estimate.markers.get(&marker_id) {
            Some(corners) => Some((
                *corners,
                problem.marker_quality(marker_id, corners, &estimate.poses),
            )),
            None => problem.triangulate_marker(marker_id, &estimate.poses, None),
        };
        let reason = match located {
            Some((corners, quality)) => {
                let rms = problem
                    .marker_rms_px(marker_id, &corners, &estimate.poses)
                    .unwrap_or(f64::INFINITY);
                diag.reprojection_rms_px = Some(rms);
                diag.parallax_deg = Some(quality.parallax_deg);
                diag.condition = Some(quality.condition);

                let reason = if quality.parallax_deg < params.min_parallax_deg {
                    Some(UnreliableReason::LowParallax)
                } else if quality.condition > params.max_condition {
                    Some(UnreliableReason::IllConditioned)
                } else if rms.is_nan() || rms > params.max_marker_reprojection_px {
                    Some(UnreliableReason::HighReprojectionError)
                } else {
                    None
                };
                if reason.is_none() {
                    cloud.insert(MarkerPoint3D::from_corners(
                        marker_id,
                        corners,
                        problem.provenance(marker_id, &estimate.poses),
                    ));
                }
                reason
            }
            None => Some(UnreliableReason::IllConditioned),
        };

        match reason {
            Some(reason) => {
                diag.status = MarkerStatus::Unreliable;
                diag.reason = Some(reason);
                Warning::UnreliableMarker { marker_id, reason }.raise(&mut warnings);
            }
            None => diag.status = MarkerStatus::Reliable,
        }
        markers.push(diag);
    }

    let mut pose_diagnostics = Vec::new();
    let mut unposed_images = Vec::new();
    for image_id in problem.images() {
        match estimate.poses.get(image_id) {
            Some(pose) => pose_diagnostics.push(PoseDiagnostics {
                image_id: image_id.clone(),
                center: pose.inverse_transform_point(&Point3::origin()),
                markers: problem.located_markers(image_id, &estimate.markers),
                reprojection_rms_px: problem.pose_rms_px(image_id, pose, &estimate.markers),
                fixed: problem.is_fixed(image_id),
            }),
            None => {
                Warning::UnposedImage {
                    image_id: image_id.clone(),
                    located_markers: problem.located_markers(image_id, &estimate.markers),
                }
                .raise(&mut warnings);
                unposed_images.push(image_id.clone());
            }
        }
    }

    if cloud.is_empty() {
        return Err(SolveError::Underdetermined(
            "no marker could be located reliably".into(),
        ));
    }
    log::info!(
        "triangulated {} markers from {} posed images (rms {:.4} px, {} iterations)",
        cloud.len(),
        estimate.poses.len(),
        summary.error_px,
        summary.iterations
    );

    Ok(TriangulationOutput {
        cloud,
        poses: estimate
            .poses
            .iter()
            .map(|(id, pose)| (id.clone(), CameraPose::from_camera_from_world(*pose)))
            .collect(),
        converged: summary.converged,
        iterations: summary.iterations,
        reprojection_rms_px: summary.error_px,
        markers,
        pose_diagnostics,
        unposed_images,
        warnings,
    })
}

/// Estimate a camera pose from world points and their raw pixel
/// observations, undistorting through `camera`.
pub fn estimate_pose(
    camera: &dyn CameraModel,
    world: &[Point3<f64>],
    pixels: &[Point2<f64>],
) -> Result<CameraPose, PoseError> {
    let normalized = pixels
        .iter()
        .map(|p| camera.unproject(p).ok_or(PoseError::Degenerate))
        .collect::<Result<Vec<_>, _>>()?;
    pose::estimate_pose(world, &normalized, &pose::PoseOptions::default())
        .map(CameraPose::from_camera_from_world)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::Vector3;
    use scene_recon_core::synthetic::{look_at, SyntheticScene};
    use scene_recon_core::MarkerObservation;

    fn scene() -> SyntheticScene {
        let markers = SyntheticScene::ground_markers(
            &[
                (0, Point3::new(-0.5, -0.4, 0.0)),
                (1, Point3::new(0.5, -0.4, 0.0)),
                (2, Point3::new(0.4, 0.5, 0.0)),
                (3, Point3::new(-0.5, 0.4, 0.0)),
                (4, Point3::new(0.0, 0.0, 0.0)),
            ],
            0.2,
        );
        SyntheticScene::ring(
            SyntheticScene::default_camera(),
            markers,
            6,
            2.5,
            2.0,
            Point3::origin(),
        )
    }

    fn seeds(scene: &SyntheticScene, ids: &[u32]) -> Vec<SeedPoint> {
        ids.iter()
            .map(|&id| SeedPoint {
                marker_id: id,
                position: scene.marker(id).unwrap()[0],
            })
            .collect()
    }

    #[test]
    fn reproduces_synthetic_markers() {
        let scene = scene();
        let out = triangulate(
            &scene.camera,
            &scene.observations(),
            &seeds(&scene, &[0, 1, 2, 3]),
            &BTreeMap::new(),
            &TriangulationParams::default(),
        )
        .unwrap();

        assert!(out.converged);
        assert!(out.warnings.is_empty(), "{:?}", out.warnings);
        assert!(out.reprojection_rms_px < 1e-6);
        assert_eq!(out.cloud.len(), 5);
        for m in out.cloud.iter() {
            let truth = scene.marker(m.marker_id).unwrap();
            for (c, t) in m.corners.iter().zip(truth) {
                assert_relative_eq!(c, t, epsilon = 1e-6);
            }
            assert_eq!(m.provenance.len(), 6);
        }
        for (id, pose) in &scene.poses {
            assert_relative_eq!(out.poses[id].center(), pose.center(), epsilon = 1e-6);
        }
    }

    #[test]
    fn three_seeds_in_view_are_enough_to_start() {
        let markers = SyntheticScene::ground_markers(
            &[
                (10, Point3::new(-0.5, -0.4, 0.0)),
                (11, Point3::new(0.5, -0.4, 0.0)),
                (12, Point3::new(0.4, 0.5, 0.0)),
                (13, Point3::new(-0.5, 0.4, 0.0)),
            ],
            0.2,
        );
        let scene = SyntheticScene::ring(
            SyntheticScene::default_camera(),
            markers,
            5,
            2.5,
            2.0,
            Point3::origin(),
        );
        let out = triangulate(
            &scene.camera,
            &scene.observations(),
            &seeds(&scene, &[10, 11, 12]),
            &BTreeMap::new(),
            &TriangulationParams::default(),
        )
        .unwrap();

        assert!(out.converged);
        assert_eq!(out.poses.len(), 5);
        assert_eq!(out.cloud.len(), 4);
        for m in out.cloud.iter() {
            let truth = scene.marker(m.marker_id).unwrap();
            for (c, t) in m.corners.iter().zip(truth) {
                assert_relative_eq!(c, t, epsilon = 1e-6);
            }
        }
    }

    #[test]
    fn too_few_seeds_in_any_view_are_underdetermined() {
        let scene = scene();
        let err = triangulate(
            &scene.camera,
            &scene.observations(),
            &seeds(&scene, &[0, 1]),
            &BTreeMap::new(),
            &TriangulationParams::default(),
        )
        .unwrap_err();
        assert!(matches!(err, SolveError::Underdetermined(msg) if msg.contains("3 or more")));
    }

    fn noisy_observations(scene: &SyntheticScene, amplitude_px: f64) -> ObservationSet {
        let clean = scene.observations();
        let mut out = ObservationSet::new();
        for (k, image_id) in clean.images().enumerate() {
            let observations = clean
                .for_image(image_id)
                .iter()
                .enumerate()
                .map(|(j, obs)| {
                    let mut obs = obs.clone();
                    for (c, corner) in obs.corners.iter_mut().enumerate() {
                        let phase = (31 * k + 7 * j + 3 * c) as f64;
                        corner.x += amplitude_px * phase.sin();
                        corner.y += amplitude_px * (1.3 * phase).cos();
                    }
                    obs
                })
                .collect();
            out.insert_image(image_id.clone(), observations);
        }
        out
    }

    #[test]
    fn iteration_cap_flags_non_convergence_but_returns_the_cloud() {
        let scene = scene();
        let params = TriangulationParams {
            max_iterations: 1,
            convergence_epsilon_px: 0.0,
            ..TriangulationParams::default()
        };
        let out = triangulate(
            &scene.camera,
            &noisy_observations(&scene, 0.3),
            &seeds(&scene, &[0, 1, 2, 3]),
            &BTreeMap::new(),
            &params,
        )
        .unwrap();

        assert!(!out.converged);
        assert_eq!(out.iterations, 1);
        assert!(out.reprojection_rms_px > params.convergence_threshold_px);
        assert!(out.warnings.iter().any(|w| matches!(
            w,
            Warning::NotConverged { iterations: 1, reprojection_rms_px }
                if *reprojection_rms_px == out.reprojection_rms_px
        )));
        assert_eq!(out.cloud.len(), 5);
        for m in out.cloud.iter() {
            let truth = scene.marker(m.marker_id).unwrap()[0];
            assert!((m.position - truth).norm() < 0.02);
        }
    }

    #[test]
    fn refinement_reports_its_best_estimate() {
        let scene = scene();
        let observations = noisy_observations(&scene, 0.5);
        let seeds = seeds(&scene, &[0, 1, 2, 3]);
        let params = TriangulationParams {
            max_iterations: 4,
            convergence_epsilon_px: 0.0,
            ..TriangulationParams::default()
        };
        let problem =
            Problem::new(&scene.camera, &observations, &seeds, &BTreeMap::new(), &params).unwrap();
        let initial = bootstrap::bootstrap(&problem);
        let start_px = problem.total_rms_px(&initial);

        let (best, summary) = refine::refine(&problem, initial);
        assert!(!summary.converged);
        assert_eq!(summary.iterations, 4);
        assert_eq!(summary.error_px, problem.total_rms_px(&best));
        assert!(summary.error_px <= start_px);
    }

    #[test]
    fn known_poses_anchor_without_seeds() {
        let scene = scene();
        let known: BTreeMap<ImageId, CameraPose> = scene.poses.iter().cloned().collect();
        let out = triangulate(
            &scene.camera,
            &scene.observations(),
            &[],
            &known,
            &TriangulationParams::default(),
        )
        .unwrap();
        assert_eq!(out.cloud.len(), 5);
        assert!(out.pose_diagnostics.iter().all(|p| p.fixed));
        assert_relative_eq!(
            out.cloud.position(4).unwrap(),
            scene.marker(4).unwrap()[0],
            epsilon = 1e-8
        );
    }

    #[test]
    fn single_view_marker_is_underdetermined() {
        let scene = scene();
        let mut observations = scene.observations();
        let (image_id, pose) = &scene.poses[0];
        let lone = scene_recon_core::synthetic::marker_corners(
            Point3::new(0.0, -0.2, 0.0),
            Vector3::x(),
            Vector3::y(),
            0.1,
        );
        let obs = scene.project_marker(image_id, pose, 9, &lone).unwrap();
        let mut first: Vec<MarkerObservation> = observations.for_image(image_id).to_vec();
        first.push(obs);
        observations.insert_image(image_id.clone(), first);

        let out = triangulate(
            &scene.camera,
            &observations,
            &seeds(&scene, &[0, 1, 2, 3]),
            &BTreeMap::new(),
            &TriangulationParams::default(),
        )
        .unwrap();
        assert!(!out.cloud.contains(9));
        let diag = out.markers.iter().find(|m| m.marker_id == 9).unwrap();
        assert_eq!(diag.status, MarkerStatus::Underdetermined);
        assert_eq!(diag.views, 1);
        assert!(out.warnings.contains(&Warning::UnderdeterminedMarker {
            marker_id: 9,
            posed_views: 1
        }));
    }

    #[test]
    fn near_duplicate_viewpoints_leave_nothing_reliable() {
        let camera = SyntheticScene::default_camera();
        let markers = SyntheticScene::ground_markers(
            &[
                (0, Point3::new(-0.5, -0.4, 0.0)),
                (1, Point3::new(0.5, -0.4, 0.0)),
                (2, Point3::new(0.4, 0.5, 0.0)),
                (3, Point3::new(-0.5, 0.4, 0.0)),
            ],
            0.2,
        );
        let eye = Point3::new(2.0, 0.3, 2.0);
        let poses = vec![
            (ImageId::new("a.png"), look_at(eye, Point3::origin(), Vector3::z())),
            (
                ImageId::new("b.png"),
                look_at(eye + Vector3::new(0.0, 0.01, 0.0), Point3::origin(), Vector3::z()),
            ),
        ];
        let scene = SyntheticScene {
            camera,
            markers,
            poses,
        };
        let known: BTreeMap<ImageId, CameraPose> = scene.poses.iter().cloned().collect();
        let err = triangulate(
            &scene.camera,
            &scene.observations(),
            &[],
            &known,
            &TriangulationParams::default(),
        )
        .unwrap_err();
        assert!(matches!(err, SolveError::Underdetermined(_)));
    }

    #[test]
    fn narrow_baseline_marker_is_unreliable() {
        let mut scene = scene();
        let (first, base) = scene.poses[0].clone();
        let near = ImageId::new("view_99.png");
        let eye = base.center() + Vector3::new(0.0, 0.0, 0.01);
        scene
            .poses
            .push((near.clone(), look_at(eye, Point3::origin(), Vector3::z())));

        let mut observations = scene.observations();
        let extra = scene_recon_core::synthetic::marker_corners(
            Point3::new(0.1, -0.65, 0.0),
            Vector3::x(),
            Vector3::y(),
            0.1,
        );
        for image_id in [&first, &near] {
            let pose = scene
                .poses
                .iter()
                .find(|(id, _)| id == image_id)
                .map(|(_, p)| *p)
                .unwrap();
            let mut obs = observations.for_image(image_id).to_vec();
            obs.push(scene.project_marker(image_id, &pose, 7, &extra).unwrap());
            observations.insert_image(image_id.clone(), obs);
        }

        let out = triangulate(
            &scene.camera,
            &observations,
            &seeds(&scene, &[0, 1, 2, 3]),
            &BTreeMap::new(),
            &TriangulationParams::default(),
        )
        .unwrap();
        assert_eq!(out.cloud.len(), 5);
        assert!(!out.cloud.contains(7));
        let diag = out.markers.iter().find(|m| m.marker_id == 7).unwrap();
        assert_eq!(diag.status, MarkerStatus::Unreliable);
        assert_eq!(diag.reason, Some(UnreliableReason::LowParallax));
        assert!(diag.parallax_deg.unwrap() < 1.0);
        assert_eq!(
            out.warnings,
            vec![Warning::UnreliableMarker {
                marker_id: 7,
                reason: UnreliableReason::LowParallax
            }]
        );
    }

    #[test]
    fn empty_observations_are_input_errors() {
        let camera = SyntheticScene::default_camera();
        let err = triangulate(
            &camera,
            &ObservationSet::new(),
            &[],
            &BTreeMap::new(),
            &TriangulationParams::default(),
        )
        .unwrap_err();
        assert!(matches!(err, SolveError::Input(_)));
    }

    #[test]
    fn missing_anchor_is_underdetermined() {
        let scene = scene();
        let err = triangulate(
            &scene.camera,
            &scene.observations(),
            &[],
            &BTreeMap::new(),
            &TriangulationParams::default(),
        )
        .unwrap_err();
        assert!(matches!(err, SolveError::Underdetermined(_)));
    }

    #[test]
    fn estimate_pose_undistorts_pixels() {
        let scene = scene();
        let (_, pose) = &scene.poses[2];
        let world: Vec<Point3<f64>> = scene.markers.iter().flat_map(|(_, c)| *c).collect();
        let pixels: Vec<Point2<f64>> = world
            .iter()
            .map(|p| scene.camera.project(p, pose).unwrap())
            .collect();
        let est = estimate_pose(&scene.camera, &world, &pixels).unwrap();
        assert_relative_eq!(est.center(), pose.center(), epsilon = 1e-8);
    }
}
