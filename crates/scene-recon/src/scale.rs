//! Uniform scale correction from known inter-marker distances.

use crate::diagnostics::Warning;
use crate::error::SolveError;
use crate::pipeline::Stage;
use scene_recon_core::{DistanceConstraint, MarkerCloud, MarkerId};
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScaleParams {
    /// Reconstructed distances at or below this are treated as zero.
    pub min_reconstructed_distance: f64,
}

impl Default for ScaleParams {
    fn default() -> Self {
        Self {
            min_reconstructed_distance: 1e-12,
        }
    }
}

/// How one distance constraint fits after scaling.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConstraintFit {
    pub marker_a: MarkerId,
    pub marker_b: MarkerId,
    pub known_distance: f64,
    pub reconstructed_distance: f64,
    pub scaled_distance: f64,
    /// `(scaled - known) / known`
    pub relative_error: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ScaleReport {
    pub factor: f64,
    /// RMS of the per-constraint relative errors, each weighted by its known
    /// distance so that long baselines count for more than short ones.
    pub rms_relative_error: f64,
    pub constraints: Vec<ConstraintFit>,
    pub skipped: usize,
}

#[derive(Clone, Debug)]
pub struct ScaleOutput {
    pub cloud: MarkerCloud,
    pub report: ScaleReport,
    pub warnings: Vec<Warning>,
}

/// Least-squares scale over `(reconstructed, known)` pairs minimizing the
/// squared relative error. `None` for empty or degenerate input.
pub fn fit_scale(pairs: &[(f64, f64)]) -> Option<f64> {
    let (num, den) = pairs.iter().fold((0.0, 0.0), |(num, den), &(r, k)| {
        let q = r / k;
        (num + q, den + q * q)
    });
    let s = num / den;
    (den > 0.0 && s.is_finite() && s > 0.0).then_some(s)
}

/// `sqrt(Σ k·e² / Σ k)` over `(known, relative_error)` pairs.
pub fn weighted_rms_relative_error(fits: &[ConstraintFit]) -> f64 {
    let (num, den) = fits.iter().fold((0.0, 0.0), |(num, den), f| {
        (
            num + f.known_distance * f.relative_error * f.relative_error,
            den + f.known_distance,
        )
    });
    if den > 0.0 {
        (num / den).sqrt()
    } else {
        0.0
    }
}

/// Scale the cloud about the working-frame origin so that the constrained
/// distances match their known values.
pub fn scale_cloud(
    cloud: &MarkerCloud,
    constraints: &[DistanceConstraint],
    params: &ScaleParams,
) -> Result<ScaleOutput, SolveError> {
    let mut warnings = Vec::new();
    let mut usable = Vec::new();
    for c in constraints {
        let skip = |reason: String, warnings: &mut Vec<Warning>| {
            Warning::SkippedConstraint {
                stage: Stage::Scaled,
                marker_ids: vec![c.marker_a, c.marker_b],
                reason,
            }
            .raise(warnings);
        };

        if !(c.distance.is_finite() && c.distance > 0.0) {
            skip(format!("known distance {} is not positive", c.distance), &mut warnings);
            continue;
        }
        if c.marker_a == c.marker_b {
            skip("constraint joins a marker to itself".into(), &mut warnings);
            continue;
        }
        let (Some(a), Some(b)) = (cloud.position(c.marker_a), cloud.position(c.marker_b)) else {
            let missing: Vec<_> = [c.marker_a, c.marker_b]
                .into_iter()
                .filter(|id| !cloud.contains(*id))
                .collect();
            skip(format!("marker(s) {missing:?} not in the cloud"), &mut warnings);
            continue;
        };
        let reconstructed = (b - a).norm();
        if reconstructed <= params.min_reconstructed_distance {
            skip("reconstructed distance is zero".into(), &mut warnings);
            continue;
        }
        usable.push((c, reconstructed));
    }

    if usable.is_empty() {
        return Err(SolveError::Underdetermined(format!(
            "none of {} distance constraint(s) is usable",
            constraints.len()
        )));
    }

    let pairs: Vec<(f64, f64)> = usable.iter().map(|(c, r)| (*r, c.distance)).collect();
    let factor = fit_scale(&pairs).ok_or_else(|| {
        SolveError::Underdetermined("distance constraints admit no positive scale".into())
    })?;

    let fits: Vec<ConstraintFit> = usable
        .iter()
        .map(|(c, r)| {
            let scaled = factor * r;
            ConstraintFit {
                marker_a: c.marker_a,
                marker_b: c.marker_b,
                known_distance: c.distance,
                reconstructed_distance: *r,
                scaled_distance: scaled,
                relative_error: (scaled - c.distance) / c.distance,
            }
        })
        .collect();
    let report = ScaleReport {
        factor,
        rms_relative_error: weighted_rms_relative_error(&fits),
        constraints: fits,
        skipped: constraints.len() - usable.len(),
    };
    log::info!(
        "scale factor {:.6} from {} constraint(s), rms relative error {:.2e}",
        report.factor,
        usable.len(),
        report.rms_relative_error
    );

    Ok(ScaleOutput {
        cloud: cloud.scaled(factor),
        report,
        warnings,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::Point3;
    use scene_recon_core::MarkerPoint3D;
    use std::collections::BTreeSet;

    fn cloud() -> MarkerCloud {
        [
            (1, Point3::new(0.0, 0.0, 0.0)),
            (2, Point3::new(2.0, 0.0, 0.0)),
            (3, Point3::new(0.0, 3.0, 0.0)),
            (4, Point3::new(1.0, 1.0, 1.0)),
        ]
        .into_iter()
        .map(|(id, p)| MarkerPoint3D::from_corners(id, [p; 4], BTreeSet::new()))
        .collect()
    }

    fn dist(a: MarkerId, b: MarkerId, d: f64) -> DistanceConstraint {
        DistanceConstraint {
            marker_a: a,
            marker_b: b,
            distance: d,
        }
    }

    #[test]
    fn single_constraint_is_exact() {
        let out = scale_cloud(&cloud(), &[dist(1, 2, 5.0)], &ScaleParams::default()).unwrap();
        assert_relative_eq!(out.report.factor, 2.5, epsilon = 1e-12);
        assert_relative_eq!(out.report.rms_relative_error, 0.0, epsilon = 1e-12);
        assert_relative_eq!(
            out.cloud.position(2).unwrap(),
            Point3::new(5.0, 0.0, 0.0),
            epsilon = 1e-12
        );
        assert!(out.warnings.is_empty());
    }

    #[test]
    fn several_constraints_minimize_relative_error() {
        let constraints = [dist(1, 2, 4.0), dist(1, 3, 6.6)];
        let out = scale_cloud(&cloud(), &constraints, &ScaleParams::default()).unwrap();
        // ratios 2.0 and 2.2
        let s = out.report.factor;
        assert!(s > 2.0 && s < 2.2);
        assert_eq!(out.report.constraints.len(), 2);
        assert!(out.report.rms_relative_error > 0.0);
        let again = scale_cloud(&cloud(), &constraints, &ScaleParams::default()).unwrap();
        assert_eq!(again.report.factor, s);
    }

    #[test]
    fn residual_is_weighted_by_known_distance() {
        let constraints = [dist(1, 2, 4.0), dist(1, 3, 6.6)];
        let out = scale_cloud(&cloud(), &constraints, &ScaleParams::default()).unwrap();
        let e: Vec<f64> = out
            .report
            .constraints
            .iter()
            .map(|f| f.relative_error)
            .collect();
        let expected = ((4.0 * e[0] * e[0] + 6.6 * e[1] * e[1]) / 10.6).sqrt();
        assert_relative_eq!(out.report.rms_relative_error, expected, epsilon = 1e-12);
        let unweighted = ((e[0] * e[0] + e[1] * e[1]) / 2.0).sqrt();
        assert!((out.report.rms_relative_error - unweighted).abs() > 1e-6);
    }

    #[test]
    fn dropping_a_constraint_stays_within_ratio_spread() {
        let constraints = [dist(1, 2, 4.0), dist(1, 3, 6.6), dist(2, 3, 7.5)];
        let ratios: Vec<f64> = {
            let c = cloud();
            constraints
                .iter()
                .map(|k| {
                    k.distance
                        / (c.position(k.marker_b).unwrap() - c.position(k.marker_a).unwrap())
                            .norm()
                })
                .collect()
        };
        let lo = ratios.iter().cloned().fold(f64::INFINITY, f64::min);
        let hi = ratios.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        let full = scale_cloud(&cloud(), &constraints, &ScaleParams::default()).unwrap();
        for skip in 0..constraints.len() {
            let subset: Vec<_> = constraints
                .iter()
                .enumerate()
                .filter(|(i, _)| *i != skip)
                .map(|(_, c)| *c)
                .collect();
            let s = scale_cloud(&cloud(), &subset, &ScaleParams::default())
                .unwrap()
                .report
                .factor;
            assert!(s >= lo - 1e-12 && s <= hi + 1e-12);
            assert!((s - full.report.factor).abs() <= hi - lo);
        }
    }

    #[test]
    fn missing_marker_is_skipped_with_warning() {
        let constraints = [dist(1, 2, 4.0), dist(1, 9, 1.0), dist(3, 3, 1.0)];
        let out = scale_cloud(&cloud(), &constraints, &ScaleParams::default()).unwrap();
        assert_relative_eq!(out.report.factor, 2.0, epsilon = 1e-12);
        assert_eq!(out.report.skipped, 2);
        assert_eq!(out.warnings.len(), 2);
        assert!(matches!(
            &out.warnings[0],
            Warning::SkippedConstraint { marker_ids, .. } if marker_ids == &vec![1, 9]
        ));
    }

    #[test]
    fn no_usable_constraint_is_underdetermined() {
        let err = scale_cloud(&cloud(), &[dist(1, 9, 1.0)], &ScaleParams::default()).unwrap_err();
        assert!(matches!(err, SolveError::Underdetermined(_)));
        let err = scale_cloud(&cloud(), &[], &ScaleParams::default()).unwrap_err();
        assert!(matches!(err, SolveError::Underdetermined(_)));
    }

    #[test]
    fn non_positive_distance_is_skipped() {
        let out = scale_cloud(
            &cloud(),
            &[dist(1, 2, -1.0), dist(1, 3, 3.0)],
            &ScaleParams::default(),
        )
        .unwrap();
        assert_relative_eq!(out.report.factor, 1.0, epsilon = 1e-12);
        assert_eq!(out.report.skipped, 1);
    }
}
