use nalgebra::{Point3, Similarity3, Vector3};
use scene_recon::core::synthetic::{marker_corners, SyntheticScene};
use scene_recon::core::{
    AlignmentConstraint, DistanceConstraint, MarkerId, ObservationSet, SeedPoint,
};
use scene_recon::{MarkerStatus, Pipeline, ReconConfig, ReconstructionResult, Stage, Warning};
use std::collections::BTreeMap;

fn scene() -> SyntheticScene {
    let markers = SyntheticScene::ground_markers(
        &[
            (10, Point3::new(-0.6, -0.45, 0.0)),
            (11, Point3::new(0.55, -0.4, 0.0)),
            (12, Point3::new(0.45, 0.5, 0.0)),
            (13, Point3::new(-0.5, 0.45, 0.0)),
        ],
        0.25,
    );
    SyntheticScene::ring(
        SyntheticScene::default_camera(),
        markers,
        5,
        2.5,
        2.2,
        Point3::origin(),
    )
}

fn origin(scene: &SyntheticScene, id: MarkerId) -> Point3<f64> {
    scene.marker(id).expect("marker in scene")[0]
}

/// Arbitrary working frame: the survey frame under a scaled rotation and
/// offset.
fn working_frame() -> Similarity3<f64> {
    Similarity3::new(
        Vector3::new(3.0, -1.0, 0.5),
        Vector3::new(0.2, 0.3, 1.0).normalize() * 0.7,
        0.4,
    )
}

fn seeds(scene: &SyntheticScene) -> Vec<SeedPoint> {
    let frame = working_frame();
    scene
        .markers
        .iter()
        .map(|(id, corners)| SeedPoint {
            marker_id: *id,
            position: frame * corners[0],
        })
        .collect()
}

fn distances(scene: &SyntheticScene) -> Vec<DistanceConstraint> {
    vec![DistanceConstraint {
        marker_a: 10,
        marker_b: 12,
        distance: (origin(scene, 12) - origin(scene, 10)).norm(),
    }]
}

fn alignment(scene: &SyntheticScene) -> Vec<AlignmentConstraint> {
    [10, 11, 13]
        .into_iter()
        .map(|id| AlignmentConstraint {
            marker_id: id,
            position: origin(scene, id),
        })
        .collect()
}

fn run(scene: &SyntheticScene, observations: ObservationSet) -> ReconstructionResult {
    let mut pipeline = Pipeline::new(scene.camera.clone(), ReconConfig::default());
    pipeline.with_observations(observations).expect("observed");
    pipeline
        .triangulate(&seeds(scene), &BTreeMap::new())
        .expect("triangulated");
    pipeline.scale(&distances(scene)).expect("scaled");
    pipeline.align(&alignment(scene)).expect("aligned");
    let mut table = Vec::new();
    let result = pipeline.export(&mut table).expect("exported");
    assert_eq!(pipeline.stage(), Stage::Exported);
    assert!(String::from_utf8(table)
        .expect("utf8")
        .starts_with("marker_id,x,y,z\n10,"));
    result
}

#[test]
fn recovers_survey_positions_from_five_views() {
    let scene = scene();
    let observations = scene.observations();
    for (image_id, _) in &scene.poses {
        assert_eq!(observations.for_image(image_id).len(), 4, "{image_id}");
    }

    let result = run(&scene, observations);

    assert!(
        result.diagnostics.warnings.is_empty(),
        "{:?}",
        result.diagnostics.warnings
    );
    assert!(result.diagnostics.converged);
    assert_eq!(result.markers.len(), 4);
    for m in &result.markers {
        let truth = origin(&scene, m.marker_id);
        let rel = (m.position - truth).norm() / truth.coords.norm();
        assert!(rel < 1e-3, "marker {} off by {rel:e}", m.marker_id);
    }

    let scale = result.diagnostics.scale.as_ref().expect("scale report");
    assert!((scale.factor - 2.5).abs() < 1e-3, "scale {}", scale.factor);
    let align = result.diagnostics.alignment.as_ref().expect("alignment report");
    assert!(!align.low_confidence);
    assert!(align.residual_rms < 1e-6);
}

#[test]
fn single_view_marker_degrades_without_failing() {
    let scene = scene();
    let mut observations = scene.observations();
    let (image_id, pose) = &scene.poses[2];
    let lone = marker_corners(Point3::new(0.0, 0.0, 0.0), Vector3::x(), Vector3::y(), 0.1);
    let extra = scene
        .project_marker(image_id, pose, 42, &lone)
        .expect("extra marker visible");
    let mut obs = observations.for_image(image_id).to_vec();
    obs.push(extra);
    observations.insert_image(image_id.clone(), obs);

    let result = run(&scene, observations);

    assert_eq!(result.markers.len(), 4);
    assert!(result.position(42).is_none());
    let diag = result.diagnostics.marker(42).expect("diagnosed");
    assert_eq!(diag.status, MarkerStatus::Underdetermined);
    assert_eq!(
        result.diagnostics.warnings,
        vec![Warning::UnderdeterminedMarker {
            marker_id: 42,
            posed_views: 1
        }]
    );
}

#[test]
fn report_survives_a_json_round_trip() {
    let scene = scene();
    let result = run(&scene, scene.observations());
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("report.json");
    result.write_json(&path).expect("write report");
    let back = ReconstructionResult::load_json(&path).expect("read report");
    assert_eq!(back.markers.len(), result.markers.len());
    assert_eq!(back.diagnostics.poses.len(), 5);
    approx::assert_relative_eq!(
        back.position(13).expect("marker 13"),
        result.position(13).expect("marker 13"),
        epsilon = 1e-12
    );
}
