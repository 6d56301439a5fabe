#![cfg(feature = "cli")]

use assert_cmd::Command;
use nalgebra::Point3;
use predicates::prelude::*;
use scene_recon::core::synthetic::SyntheticScene;
use scene_recon::extract::PseudoMarkerRow;
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};

struct Fixture {
    _dir: tempfile::TempDir,
    root: PathBuf,
}

impl Fixture {
    fn path(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }
}

fn point_table(rows: &[(u32, Point3<f64>)]) -> String {
    let mut out = String::from("marker_id,x,y,z\n");
    for (id, p) in rows {
        writeln!(out, "{id},{},{},{}", p.x, p.y, p.z).expect("format row");
    }
    out
}

fn fixture(alignment_ids: &[u32]) -> Fixture {
    let markers = SyntheticScene::ground_markers(
        &[
            (0, Point3::new(-0.5, -0.4, 0.0)),
            (1, Point3::new(0.5, -0.4, 0.0)),
            (2, Point3::new(0.4, 0.5, 0.0)),
            (3, Point3::new(-0.5, 0.4, 0.0)),
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
    let dir = tempfile::tempdir().expect("tempdir");
    let root = dir.path().to_path_buf();

    scene
        .camera
        .write_json(root.join("camera.json"))
        .expect("camera json");

    let rows: Vec<PseudoMarkerRow> = scene
        .observations()
        .iter()
        .map(|o| PseudoMarkerRow {
            image: o.image_id.to_string(),
            marker_id: o.marker_id,
            corners: o.corners.map(|c| [c.x, c.y]),
        })
        .collect();
    fs::write(
        root.join("markers.json"),
        serde_json::to_string_pretty(&rows).expect("rows json"),
    )
    .expect("write table");

    let origin = |id: u32| scene.marker(id).expect("marker")[0];
    let all: Vec<_> = (0..4).map(|id| (id, origin(id))).collect();
    fs::write(root.join("known.csv"), point_table(&all)).expect("known");
    fs::write(
        root.join("distances.csv"),
        format!(
            "marker_id_a,marker_id_b,distance\n0,2,{}\n",
            (origin(2) - origin(0)).norm()
        ),
    )
    .expect("distances");
    let align: Vec<_> = alignment_ids
        .iter()
        .map(|&id| (id, if id < 4 { origin(id) } else { Point3::origin() }))
        .collect();
    fs::write(root.join("align.csv"), point_table(&align)).expect("align");

    Fixture { _dir: dir, root }
}

fn command(fx: &Fixture) -> Command {
    let mut cmd = Command::cargo_bin("scene-recon").expect("binary");
    cmd.arg("--camera")
        .arg(fx.path("camera.json"))
        .arg("--pseudo-markers")
        .arg(fx.path("markers.json"))
        .arg("--known")
        .arg(fx.path("known.csv"))
        .arg("--distances")
        .arg(fx.path("distances.csv"))
        .arg("--alignment")
        .arg(fx.path("align.csv"))
        .arg("--output")
        .arg(fx.path("points.csv"))
        .arg("--report")
        .arg(fx.path("report.json"))
        .arg("--log-level")
        .arg("warn");
    cmd
}

fn read(path: &Path) -> String {
    fs::read_to_string(path).expect("read output")
}

#[test]
fn reconstructs_from_pseudo_marker_table() {
    let fx = fixture(&[0, 1, 3]);
    command(&fx)
        .assert()
        .success()
        .stdout(predicate::str::contains("4 marker(s) written"));

    let table = read(&fx.path("points.csv"));
    let lines: Vec<&str> = table.lines().collect();
    assert_eq!(lines[0], "marker_id,x,y,z");
    assert_eq!(lines.len(), 5);
    let first: Vec<f64> = lines[1]
        .split(',')
        .skip(1)
        .map(|v| v.parse().expect("number"))
        .collect();
    assert!((first[0] + 0.6).abs() < 1e-4, "{first:?}");
    assert!((first[1] + 0.3).abs() < 1e-4, "{first:?}");

    let report: serde_json::Value =
        serde_json::from_str(&read(&fx.path("report.json"))).expect("report json");
    assert_eq!(report["markers"].as_array().map(Vec::len), Some(4));
    assert_eq!(report["diagnostics"]["warnings"], serde_json::json!([]));
}

#[test]
fn failing_stage_is_named_in_report() {
    let fx = fixture(&[7, 8, 9]);
    command(&fx)
        .assert()
        .failure()
        .stderr(predicate::str::contains("aligned stage failed"));

    let report: serde_json::Value =
        serde_json::from_str(&read(&fx.path("report.json"))).expect("report json");
    assert_eq!(report["failed_stage"], "aligned");
    assert!(report["error"]
        .as_str()
        .is_some_and(|e| e.contains("alignment point")));
    assert!(report["diagnostics"]["scale"].is_object());
    assert!(!fx.path("points.csv").exists());
}

#[test]
fn requires_an_observation_source() {
    let fx = fixture(&[0, 1, 3]);
    Command::cargo_bin("scene-recon")
        .expect("binary")
        .arg("--camera")
        .arg(fx.path("camera.json"))
        .arg("--known")
        .arg(fx.path("known.csv"))
        .arg("--distances")
        .arg(fx.path("distances.csv"))
        .arg("--alignment")
        .arg(fx.path("align.csv"))
        .arg("--output")
        .arg(fx.path("points.csv"))
        .assert()
        .failure()
        .stderr(predicate::str::contains("--dictionary"));
}
