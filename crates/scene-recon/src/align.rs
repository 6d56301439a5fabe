//! Rigid alignment of the scaled cloud onto externally known positions.

use crate::diagnostics::Warning;
use crate::error::SolveError;
use crate::pipeline::Stage;
use nalgebra::{Isometry3, Matrix3, Point3, SymmetricEigen, Translation3, UnitQuaternion};
use scene_recon_core::math::{centroid, fit_rigid, median, rms};
use scene_recon_core::{AlignmentConstraint, MarkerCloud, MarkerId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlignmentParams {
    /// Second-to-first singular value ratio of the centered points below
    /// which they count as collinear.
    pub collinearity_tolerance: f64,
    /// A residual this many times the median of the others is an outlier.
    pub outlier_ratio: f64,
    /// Residuals below this are never outliers.
    pub outlier_floor: f64,
    /// RMS residual of the final fit, in the units of the known positions,
    /// above which the alignment is low confidence.
    pub max_residual: f64,
}

impl Default for AlignmentParams {
    fn default() -> Self {
        Self {
            collinearity_tolerance: 0.01,
            outlier_ratio: 5.0,
            outlier_floor: 1e-6,
            max_residual: 0.01,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PointResidual {
    pub marker_id: MarkerId,
    pub residual: f64,
    /// Disagrees with the other points.
    pub outlier: bool,
    /// Left out of the final fit.
    pub excluded: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AlignmentReport {
    /// Maps the scaled working frame into the external frame.
    pub transform: Isometry3<f64>,
    /// RMS residual over the points used in the final fit.
    pub residual_rms: f64,
    pub residuals: Vec<PointResidual>,
    pub low_confidence: bool,
    pub used: usize,
}

#[derive(Clone, Debug)]
pub struct AlignOutput {
    pub cloud: MarkerCloud,
    pub report: AlignmentReport,
    pub warnings: Vec<Warning>,
}

#[derive(Clone, Copy)]
struct Pair {
    marker_id: MarkerId,
    src: Point3<f64>,
    dst: Point3<f64>,
}

/// Rigid fit `dst ≈ T * src` for any number of points. One point fixes the
/// translation only; two points use the minimal rotation between their
/// directions.
pub fn fit_alignment(src: &[Point3<f64>], dst: &[Point3<f64>]) -> Option<Isometry3<f64>> {
    if src.len() != dst.len() {
        return None;
    }
    match src.len() {
        0 => None,
        1 => Some(Isometry3::from_parts(
            Translation3::from(dst[0] - src[0]),
            UnitQuaternion::identity(),
        )),
        2 => {
            let rotation = UnitQuaternion::rotation_between(&(src[1] - src[0]), &(dst[1] - dst[0]))
                .or_else(|| fit_rigid(src, dst).map(|t| t.rotation))?;
            let c_src = centroid(src)?;
            let c_dst = centroid(dst)?;
            Some(Isometry3::from_parts(
                Translation3::from(c_dst.coords - rotation * c_src.coords),
                rotation,
            ))
        }
        _ => fit_rigid(src, dst),
    }
}

/// Ratio of the second to the first singular value of the centered points.
fn spread_ratio(points: &[Point3<f64>]) -> f64 {
    let Some(c) = centroid(points) else {
        return 0.0;
    };
    let mut scatter = Matrix3::zeros();
    for p in points {
        let d = p - c;
        scatter += d * d.transpose();
    }
    let mut ev: Vec<f64> = SymmetricEigen::new(scatter)
        .eigenvalues
        .iter()
        .map(|v| v.max(0.0))
        .collect();
    ev.sort_by(|a, b| b.total_cmp(a));
    if ev[0] <= 0.0 {
        return 0.0;
    }
    (ev[1] / ev[0]).sqrt()
}

fn fit_pairs(pairs: &[Pair]) -> Option<Isometry3<f64>> {
    let src: Vec<_> = pairs.iter().map(|p| p.src).collect();
    let dst: Vec<_> = pairs.iter().map(|p| p.dst).collect();
    fit_alignment(&src, &dst)
}

fn residual(t: &Isometry3<f64>, pair: &Pair) -> f64 {
    (t.transform_point(&pair.src) - pair.dst).norm()
}

/// How far each point sits from where the others put it, paired with the
/// spread of those others.
///
/// With four or more points this is the residual under a fit of the rest
/// against the median residual of the rest. Two points cannot fix a
/// rotation, so with three the score is the smaller of the point's two
/// distance discrepancies against the discrepancy of the remaining pair.
fn leave_one_out(pairs: &[Pair]) -> Vec<Option<(f64, f64)>> {
    if pairs.len() == 3 {
        let gap = |i: usize, j: usize| {
            ((pairs[i].src - pairs[j].src).norm() - (pairs[i].dst - pairs[j].dst).norm()).abs()
        };
        return (0..3)
            .map(|i| {
                let (j, k) = ((i + 1) % 3, (i + 2) % 3);
                Some((gap(i, j).min(gap(i, k)), gap(j, k)))
            })
            .collect();
    }
    (0..pairs.len())
        .map(|i| {
            let rest: Vec<Pair> = pairs
                .iter()
                .enumerate()
                .filter(|(j, _)| *j != i)
                .map(|(_, p)| *p)
                .collect();
            let t = fit_pairs(&rest)?;
            let rest_res: Vec<f64> = rest.iter().map(|p| residual(&t, p)).collect();
            Some((residual(&t, &pairs[i]), median(&rest_res).unwrap_or(0.0)))
        })
        .collect()
}

/// Point with the largest leave-one-out score among those passing both the
/// ratio test against the rest and the floor.
fn worst_outlier(pairs: &[Pair], params: &AlignmentParams) -> Option<(usize, f64)> {
    leave_one_out(pairs)
        .into_iter()
        .enumerate()
        .filter_map(|(i, score)| score.map(|(r, m)| (i, r, m)))
        .filter(|&(_, r, m)| r > params.outlier_floor && r > params.outlier_ratio * m)
        .map(|(i, r, _)| (i, r))
        .max_by(|a, b| a.1.total_cmp(&b.1))
}

/// Point with the largest leave-one-out score, regardless of the ratio test.
fn least_consistent(pairs: &[Pair]) -> Option<(usize, f64)> {
    leave_one_out(pairs)
        .into_iter()
        .enumerate()
        .filter_map(|(i, score)| score.map(|(r, _)| (i, r)))
        .max_by(|a, b| a.1.total_cmp(&b.1))
}

/// Find the rigid transform onto the known positions and apply it to every
/// marker of the cloud.
///
/// From three usable points up, the point that disagrees most with the rest
/// is flagged. It is dropped and the fit recomputed only while at least
/// three points would remain, so with exactly three it stays in the fit and
/// the result is marked low confidence.
pub fn align_cloud(
    cloud: &MarkerCloud,
    constraints: &[AlignmentConstraint],
    params: &AlignmentParams,
) -> Result<AlignOutput, SolveError> {
    let mut warnings = Vec::new();
    let mut pairs = Vec::new();
    let mut seen = BTreeSet::new();
    for c in constraints {
        let reason = if !c.position.coords.iter().all(|v| v.is_finite()) {
            Some("known position is not finite".to_string())
        } else if !seen.insert(c.marker_id) {
            Some("duplicate constraint for the same marker".to_string())
        } else if !cloud.contains(c.marker_id) {
            Some("marker not in the cloud".to_string())
        } else {
            None
        };
        match (reason, cloud.position(c.marker_id)) {
            (None, Some(src)) => pairs.push(Pair {
                marker_id: c.marker_id,
                src,
                dst: c.position,
            }),
            (reason, _) => Warning::SkippedConstraint {
                stage: Stage::Aligned,
                marker_ids: vec![c.marker_id],
                reason: reason.unwrap_or_default(),
            }
            .raise(&mut warnings),
        }
    }
    if pairs.is_empty() {
        return Err(SolveError::Underdetermined(format!(
            "none of {} alignment point(s) is usable",
            constraints.len()
        )));
    }

    let mut excluded: Vec<Pair> = Vec::new();
    let mut suspect: Option<MarkerId> = None;
    while pairs.len() >= 3 {
        let Some((worst, r_worst)) = worst_outlier(&pairs, params) else {
            break;
        };
        let exclude = pairs.len() > 3;
        Warning::AlignmentOutlier {
            marker_id: pairs[worst].marker_id,
            residual: r_worst,
            excluded: exclude,
        }
        .raise(&mut warnings);
        if !exclude {
            suspect = Some(pairs[worst].marker_id);
            break;
        }
        excluded.push(pairs.remove(worst));
    }
    let transform = fit_pairs(&pairs)
        .ok_or_else(|| SolveError::Underdetermined("alignment fit failed".into()))?;
    let used_res: Vec<f64> = pairs.iter().map(|p| residual(&transform, p)).collect();
    let residual_rms = rms(&used_res);

    let src: Vec<_> = pairs.iter().map(|p| p.src).collect();
    let mut low_confidence = if pairs.len() < 3 {
        Warning::LowConfidenceAlignment {
            reason: format!("only {} usable alignment point(s)", pairs.len()),
        }
        .raise(&mut warnings);
        true
    } else {
        let ratio = spread_ratio(&src);
        if ratio < params.collinearity_tolerance {
            Warning::LowConfidenceAlignment {
                reason: format!("alignment points are nearly collinear (ratio {ratio:.2e})"),
            }
            .raise(&mut warnings);
            true
        } else {
            false
        }
    };
    if suspect.is_some() {
        Warning::LowConfidenceAlignment {
            reason: "an outlier is kept because dropping it would leave fewer than 3 points"
                .into(),
        }
        .raise(&mut warnings);
        low_confidence = true;
    }
    if residual_rms > params.max_residual {
        Warning::LowConfidenceAlignment {
            reason: format!(
                "rms residual {residual_rms:.3e} exceeds max_residual {:.3e}",
                params.max_residual
            ),
        }
        .raise(&mut warnings);
        low_confidence = true;
        if suspect.is_none() && pairs.len() >= 3 {
            if let Some((worst, r_worst)) = least_consistent(&pairs) {
                Warning::AlignmentOutlier {
                    marker_id: pairs[worst].marker_id,
                    residual: r_worst,
                    excluded: false,
                }
                .raise(&mut warnings);
                suspect = Some(pairs[worst].marker_id);
            }
        }
    }

    let mut residuals: Vec<PointResidual> = pairs
        .iter()
        .zip(&used_res)
        .map(|(p, r)| PointResidual {
            marker_id: p.marker_id,
            residual: *r,
            outlier: suspect == Some(p.marker_id),
            excluded: false,
        })
        .chain(excluded.iter().map(|p| PointResidual {
            marker_id: p.marker_id,
            residual: residual(&transform, p),
            outlier: true,
            excluded: true,
        }))
        .collect();
    residuals.sort_by_key(|r| r.marker_id);

    let report = AlignmentReport {
        transform,
        residual_rms,
        residuals,
        low_confidence,
        used: pairs.len(),
    };
    log::info!(
        "aligned with {} point(s), rms residual {:.3e}{}",
        report.used,
        report.residual_rms,
        if low_confidence { " (low confidence)" } else { "" }
    );

    Ok(AlignOutput {
        cloud: cloud.transformed(&transform),
        report,
        warnings,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::Vector3;
    use scene_recon_core::MarkerPoint3D;

    fn points() -> Vec<(MarkerId, Point3<f64>)> {
        vec![
            (1, Point3::new(0.0, 0.0, 0.0)),
            (2, Point3::new(1.0, 0.0, 0.0)),
            (3, Point3::new(0.0, 1.0, 0.0)),
            (4, Point3::new(0.3, 0.4, 0.8)),
            (5, Point3::new(-0.5, 0.7, 0.2)),
        ]
    }

    fn cloud() -> MarkerCloud {
        points()
            .into_iter()
            .map(|(id, p)| MarkerPoint3D::from_corners(id, [p; 4], BTreeSet::new()))
            .collect()
    }

    fn truth() -> Isometry3<f64> {
        Isometry3::new(Vector3::new(10.0, -2.0, 0.5), Vector3::new(0.2, -0.4, 1.1))
    }

    fn known(ids: &[MarkerId]) -> Vec<AlignmentConstraint> {
        let t = truth();
        points()
            .into_iter()
            .filter(|(id, _)| ids.contains(id))
            .map(|(marker_id, p)| AlignmentConstraint {
                marker_id,
                position: t.transform_point(&p),
            })
            .collect()
    }

    #[test]
    fn recovers_known_transform() {
        let out = align_cloud(&cloud(), &known(&[1, 2, 3]), &AlignmentParams::default()).unwrap();
        assert!(!out.report.low_confidence);
        assert!(out.report.residual_rms < 1e-10);
        assert!(out.report.transform.rotation.angle_to(&truth().rotation) < 1e-10);
        assert_relative_eq!(
            out.cloud.position(5).unwrap(),
            truth().transform_point(&Point3::new(-0.5, 0.7, 0.2)),
            epsilon = 1e-9
        );
        assert!(out.warnings.is_empty());
    }

    #[test]
    fn two_points_are_low_confidence() {
        let out = align_cloud(&cloud(), &known(&[1, 2]), &AlignmentParams::default()).unwrap();
        assert!(out.report.low_confidence);
        assert!(out.report.residual_rms < 1e-10);
        assert!(matches!(
            out.warnings.as_slice(),
            [Warning::LowConfidenceAlignment { .. }]
        ));
    }

    #[test]
    fn single_point_fixes_translation_only() {
        let target = Point3::new(5.0, 5.0, 5.0);
        let out = align_cloud(
            &cloud(),
            &[AlignmentConstraint {
                marker_id: 2,
                position: target,
            }],
            &AlignmentParams::default(),
        )
        .unwrap();
        assert!(out.report.low_confidence);
        assert_relative_eq!(out.cloud.position(2).unwrap(), target, epsilon = 1e-12);
        assert_relative_eq!(
            out.cloud.position(1).unwrap(),
            Point3::new(4.0, 5.0, 5.0),
            epsilon = 1e-12
        );
    }

    #[test]
    fn collinear_points_are_low_confidence() {
        let line: MarkerCloud = (0..3)
            .map(|i| {
                MarkerPoint3D::from_corners(
                    i,
                    [Point3::new(i as f64, 0.0, 0.0); 4],
                    BTreeSet::new(),
                )
            })
            .collect();
        let constraints: Vec<_> = (0..3)
            .map(|i| AlignmentConstraint {
                marker_id: i,
                position: Point3::new(0.0, i as f64, 1.0),
            })
            .collect();
        let out = align_cloud(&line, &constraints, &AlignmentParams::default()).unwrap();
        assert!(out.report.low_confidence);
    }

    #[test]
    fn gross_outlier_is_excluded_and_fit_recomputed() {
        let mut constraints = known(&[1, 2, 3, 4, 5]);
        constraints[3].position += Vector3::new(0.5, 0.0, 0.0);
        let out = align_cloud(&cloud(), &constraints, &AlignmentParams::default()).unwrap();
        assert_eq!(out.report.used, 4);
        assert!(out.report.residual_rms < 1e-9);
        let flagged: Vec<_> = out
            .report
            .residuals
            .iter()
            .filter(|r| r.outlier)
            .map(|r| r.marker_id)
            .collect();
        assert_eq!(flagged, vec![4]);
        assert!(out.report.residuals.iter().all(|r| r.excluded == r.outlier));
        assert!(!out.report.low_confidence);
        assert!(out.warnings.iter().any(|w| matches!(
            w,
            Warning::AlignmentOutlier {
                marker_id: 4,
                excluded: true,
                ..
            }
        )));
    }

    #[test]
    fn wrong_point_among_three_is_flagged_and_kept() {
        let mut constraints = known(&[1, 2, 3]);
        constraints[2].position += truth().rotation * Vector3::new(0.0, 0.0, 0.5);
        let out = align_cloud(&cloud(), &constraints, &AlignmentParams::default()).unwrap();

        assert_eq!(out.report.used, 3);
        assert!(out.report.low_confidence);
        assert!(out.report.residual_rms > AlignmentParams::default().max_residual);
        let flagged: Vec<_> = out
            .report
            .residuals
            .iter()
            .filter(|r| r.outlier)
            .map(|r| (r.marker_id, r.excluded))
            .collect();
        assert_eq!(flagged, vec![(3, false)]);
        assert!(out.warnings.iter().any(|w| matches!(
            w,
            Warning::AlignmentOutlier {
                marker_id: 3,
                excluded: false,
                ..
            }
        )));
        assert!(out
            .warnings
            .iter()
            .any(|w| matches!(w, Warning::LowConfidenceAlignment { .. })));
    }

    #[test]
    fn residual_above_cap_is_low_confidence() {
        let mut constraints = known(&[1, 2, 3, 4, 5]);
        for (k, c) in constraints.iter_mut().enumerate() {
            let s = if k % 2 == 0 { 1.0 } else { -1.0 };
            c.position += Vector3::new(0.04 * s, -0.03 * s, 0.01);
        }
        let params = AlignmentParams {
            outlier_ratio: 1e3,
            ..AlignmentParams::default()
        };
        let out = align_cloud(&cloud(), &constraints, &params).unwrap();
        assert_eq!(out.report.used, 5);
        assert!(out.report.residual_rms > params.max_residual);
        assert!(out.report.low_confidence);
        assert_eq!(out.report.residuals.iter().filter(|r| r.outlier).count(), 1);
        assert!(out.report.residuals.iter().all(|r| !r.excluded));

        let relaxed = AlignmentParams {
            max_residual: 1.0,
            ..params
        };
        let out = align_cloud(&cloud(), &constraints, &relaxed).unwrap();
        assert!(!out.report.low_confidence);
        assert!(out.warnings.is_empty());
    }

    #[test]
    fn unknown_markers_are_skipped() {
        let mut constraints = known(&[1, 2, 3]);
        constraints.push(AlignmentConstraint {
            marker_id: 42,
            position: Point3::origin(),
        });
        let out = align_cloud(&cloud(), &constraints, &AlignmentParams::default()).unwrap();
        assert_eq!(out.report.used, 3);
        assert_eq!(out.warnings.len(), 1);
    }

    #[test]
    fn no_usable_points_is_underdetermined() {
        let constraints = [AlignmentConstraint {
            marker_id: 42,
            position: Point3::origin(),
        }];
        let err = align_cloud(&cloud(), &constraints, &AlignmentParams::default()).unwrap_err();
        assert!(matches!(err, SolveError::Underdetermined(_)));
    }
}
