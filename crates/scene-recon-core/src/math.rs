//! Small numeric helpers shared by the solvers.

use nalgebra::{
    DMatrix, Isometry3, Matrix3, Point2, Point3, Rotation3, Schur, Translation3, UnitQuaternion,
    Vector3,
};

/// Arithmetic mean of a point set; `None` when empty.
pub fn centroid(points: &[Point3<f64>]) -> Option<Point3<f64>> {
    if points.is_empty() {
        return None;
    }
    let sum = points
        .iter()
        .fold(Vector3::zeros(), |acc, p| acc + p.coords);
    Some(Point3::from(sum / points.len() as f64))
}

pub fn centroid_2d(points: &[Point2<f64>]) -> Option<Point2<f64>> {
    if points.is_empty() {
        return None;
    }
    let sum = points
        .iter()
        .fold(nalgebra::Vector2::zeros(), |acc, p| acc + p.coords);
    Some(Point2::from(sum / points.len() as f64))
}

/// Root mean square of the values; zero for an empty slice.
pub fn rms(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    (values.iter().map(|v| v * v).sum::<f64>() / values.len() as f64).sqrt()
}

/// Median of the values (mean of the two middle values for even counts).
pub fn median(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    let mid = sorted.len() / 2;
    Some(if sorted.len() % 2 == 0 {
        0.5 * (sorted[mid - 1] + sorted[mid])
    } else {
        sorted[mid]
    })
}

/// Angle between two vectors in radians, robust near 0 and pi.
pub fn angle_between(a: &Vector3<f64>, b: &Vector3<f64>) -> f64 {
    a.cross(b).norm().atan2(a.dot(b))
}

#[inline]
pub fn skew(v: &Vector3<f64>) -> Matrix3<f64> {
    Matrix3::new(0.0, -v.z, v.y, v.z, 0.0, -v.x, -v.y, v.x, 0.0)
}

/// Closest proper rotation to `m` (polar decomposition via SVD).
pub fn nearest_rotation(m: &Matrix3<f64>) -> Option<UnitQuaternion<f64>> {
    let svd = m.svd(true, true);
    let u = svd.u?;
    let v_t = svd.v_t?;
    let mut r = u * v_t;
    if r.determinant() < 0.0 {
        let mut u_fix = u;
        u_fix.column_mut(2).neg_mut();
        r = u_fix * v_t;
    }
    Some(UnitQuaternion::from_rotation_matrix(
        &Rotation3::from_matrix_unchecked(r),
    ))
}

/// Least-squares rigid transform `T` with `dst ≈ T * src` (Kabsch).
///
/// Needs at least three correspondences; with collinear input the rotation
/// about the common line is arbitrary but the result is still a valid
/// isometry.
pub fn fit_rigid(src: &[Point3<f64>], dst: &[Point3<f64>]) -> Option<Isometry3<f64>> {
    if src.len() != dst.len() || src.is_empty() {
        return None;
    }
    let c_src = centroid(src)?;
    let c_dst = centroid(dst)?;

    let mut h = Matrix3::zeros();
    for (s, d) in src.iter().zip(dst) {
        h += (d - c_dst) * (s - c_src).transpose();
    }

    let rotation = nearest_rotation(&h)?;
    let t = c_dst.coords - rotation * c_src.coords;
    Some(Isometry3::from_parts(Translation3::from(t), rotation))
}

/// Real roots of `a·x⁴ + b·x³ + c·x² + d·x + e = 0`, ascending, with
/// duplicates merged.
///
/// Eigenvalues of the companion matrix, each polished by a few Newton
/// steps. Negligible leading coefficients lower the degree.
pub fn solve_quartic_real(a: f64, b: f64, c: f64, d: f64, e: f64) -> Vec<f64> {
    let coeffs = [a, b, c, d, e];
    if coeffs.iter().any(|v| !v.is_finite()) {
        return Vec::new();
    }
    let scale = coeffs.iter().fold(0.0_f64, |m, v| m.max(v.abs()));
    let Some(lead) = coeffs.iter().position(|v| v.abs() > 1e-12 * scale) else {
        return Vec::new();
    };
    let poly = &coeffs[lead..];
    let n = poly.len() - 1;
    if n == 0 {
        return Vec::new();
    }

    let mut companion = DMatrix::<f64>::zeros(n, n);
    for (j, c) in poly[1..].iter().enumerate() {
        companion[(0, j)] = -c / poly[0];
    }
    for i in 1..n {
        companion[(i, i - 1)] = 1.0;
    }

    let eval = |x: f64| poly.iter().fold(0.0, |acc, c| acc * x + c);
    let slope = |x: f64| {
        poly[..n]
            .iter()
            .enumerate()
            .fold(0.0, |acc, (k, c)| acc * x + c * (n - k) as f64)
    };
    let polish = |mut x: f64| {
        for _ in 0..4 {
            let dp = slope(x);
            if dp.abs() <= f64::EPSILON {
                break;
            }
            let next = x - eval(x) / dp;
            if !next.is_finite() || eval(next).abs() > eval(x).abs() {
                break;
            }
            x = next;
        }
        x
    };

    let mut roots: Vec<f64> = Schur::new(companion)
        .complex_eigenvalues()
        .iter()
        .filter(|z| z.im.abs() <= 1e-6 * (1.0 + z.re.abs()))
        .map(|z| polish(z.re))
        .collect();
    roots.sort_by(f64::total_cmp);
    roots.dedup_by(|a, b| (*a - *b).abs() < 1e-8);
    roots
}
