//! Absolute camera pose from world-to-image correspondences.
//!
//! All solvers work on normalized, undistorted image points and return
//! `camera_from_world`. Initial estimates come from one of three linear or
//! minimal solvers depending on the point configuration, and every estimate
//! is polished by Levenberg-Marquardt on the reprojection error.

use super::linear::projection_jacobian;
use levenberg_marquardt::{LeastSquaresProblem, LevenbergMarquardt};
use lm_nalgebra as lm;
use nalgebra::{DMatrix, Isometry3, Matrix3, Point2, Point3, SymmetricEigen, Translation3, Vector3};
use scene_recon_core::estimate_homography;
use scene_recon_core::math::{centroid, fit_rigid, nearest_rotation, skew, solve_quartic_real};

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum PoseError {
    #[error("need at least {required} correspondences, got {got}")]
    TooFewPoints { required: usize, got: usize },
    #[error("correspondence slices differ in length")]
    LengthMismatch,
    #[error("degenerate point configuration")]
    Degenerate,
    #[error("no pose places every point in front of the camera")]
    Cheirality,
}

#[derive(Clone, Copy, Debug)]
pub(crate) struct PoseOptions {
    pub lm_iterations: usize,
    /// Points count as planar when the smallest spread axis is below this
    /// fraction of the largest one.
    pub planarity_tolerance: f64,
}

impl Default for PoseOptions {
    fn default() -> Self {
        Self {
            lm_iterations: 50,
            planarity_tolerance: 0.02,
        }
    }
}

/// Estimate `camera_from_world` from at least four correspondences.
pub(crate) fn estimate_pose(
    world: &[Point3<f64>],
    image: &[Point2<f64>],
    options: &PoseOptions,
) -> Result<Isometry3<f64>, PoseError> {
    if world.len() != image.len() {
        return Err(PoseError::LengthMismatch);
    }
    if world.len() < 4 {
        return Err(PoseError::TooFewPoints {
            required: 4,
            got: world.len(),
        });
    }

    let spread = principal_axes(world).ok_or(PoseError::Degenerate)?;
    if spread.values[1] <= 1e-12 * spread.values[0].max(1e-300) {
        return Err(PoseError::Degenerate);
    }
    let planar = spread.values[2].sqrt() < options.planarity_tolerance * spread.values[0].sqrt();

    let mut candidates = Vec::new();
    if planar {
        candidates.extend(planar_pose(world, image, &spread));
    } else {
        if world.len() >= 6 {
            candidates.extend(epnp(world, image));
        }
        if let Some(idx) = spread_triplet(world) {
            candidates.extend(p3p(&idx.map(|i| world[i]), &idx.map(|i| image[i])));
        }
        if candidates.is_empty() {
            candidates.extend(planar_pose(world, image, &spread));
        }
    }

    candidates
        .into_iter()
        .map(|c| refine_pose(c, world, image, options.lm_iterations))
        .filter(|c| in_front(c, world))
        .map(|c| (reprojection_cost(&c, world, image), c))
        .filter(|(cost, _)| cost.is_finite())
        .min_by(|a, b| a.0.total_cmp(&b.0))
        .map(|(_, c)| c)
        .ok_or(PoseError::Cheirality)
}

/// Levenberg-Marquardt on the normalized reprojection error. The
/// parameters are the translation followed by the rotation vector of
/// `camera_from_world`.
struct PoseProblem<'a> {
    world: &'a [Point3<f64>],
    image: &'a [Point2<f64>],
    params: lm::Vector6<f64>,
}

impl PoseProblem<'_> {
    fn pose(&self) -> Isometry3<f64> {
        let p = &self.params;
        Isometry3::new(Vector3::new(p[0], p[1], p[2]), Vector3::new(p[3], p[4], p[5]))
    }
}

impl LeastSquaresProblem<f64, lm::Dyn, lm::U6> for PoseProblem<'_> {
    type ResidualStorage = lm::storage::Owned<f64, lm::Dyn>;
    type JacobianStorage = lm::storage::Owned<f64, lm::Dyn, lm::U6>;
    type ParameterStorage = lm::storage::Owned<f64, lm::U6>;

    fn set_params(&mut self, x: &lm::Vector6<f64>) {
        self.params = *x;
    }

    fn params(&self) -> lm::Vector6<f64> {
        self.params
    }

    fn residuals(&self) -> Option<lm::DVector<f64>> {
        let pose = self.pose();
        let mut r = Vec::with_capacity(2 * self.world.len());
        for (pw, uv) in self.world.iter().zip(self.image) {
            let (proj, _) = projection_jacobian(&pose.transform_point(pw))?;
            r.extend([proj.x - uv.x, proj.y - uv.y]);
        }
        Some(lm::DVector::from_vec(r))
    }

    fn jacobian(&self) -> Option<lm::OMatrix<f64, lm::Dyn, lm::U6>> {
        let pose = self.pose();
        let rotation_vector = Vector3::new(self.params[3], self.params[4], self.params[5]);
        let jl = left_jacobian(&rotation_vector);
        let mut rows = Vec::with_capacity(12 * self.world.len());
        for pw in self.world {
            let rotated = pose.rotation * pw.coords;
            let (_, jp) = projection_jacobian(&Point3::from(rotated + pose.translation.vector))?;
            let d_rot = jp * (-skew(&rotated) * jl);
            for row in 0..2 {
                rows.extend(jp.row(row).iter());
                rows.extend(d_rot.row(row).iter());
            }
        }
        Some(lm::OMatrix::from_row_slice_generic(
            lm::Dyn(2 * self.world.len()),
            lm::U6,
            &rows,
        ))
    }
}

/// Jacobian of `exp(phi)` with respect to `phi`, acting from the left.
fn left_jacobian(phi: &Vector3<f64>) -> Matrix3<f64> {
    let theta = phi.norm();
    let k = skew(phi);
    let (a, b) = if theta < 1e-8 {
        (0.5, 1.0 / 6.0)
    } else {
        let t2 = theta * theta;
        ((1.0 - theta.cos()) / t2, (theta - theta.sin()) / (t2 * theta))
    };
    Matrix3::identity() + k * a + k * k * b
}

/// Polish `initial` by Levenberg-Marquardt; the start is kept when the
/// solver does not improve on it.
pub(crate) fn refine_pose(
    initial: Isometry3<f64>,
    world: &[Point3<f64>],
    image: &[Point2<f64>],
    iterations: usize,
) -> Isometry3<f64> {
    let t = initial.translation.vector;
    let r = initial.rotation.scaled_axis();
    let problem = PoseProblem {
        world,
        image,
        params: lm::Vector6::new(t.x, t.y, t.z, r.x, r.y, r.z),
    };
    let (problem, report) = LevenbergMarquardt::new()
        .with_patience(iterations.max(1))
        .minimize(problem);
    let refined = problem.pose();
    log::trace!("pose refinement: {:?}", report.termination);
    let cost = reprojection_cost(&refined, world, image);
    if cost.is_finite() && cost <= reprojection_cost(&initial, world, image) {
        refined
    } else {
        initial
    }
}

/// Sum of squared normalized residuals; infinite if a point is behind the
/// camera.
pub(crate) fn reprojection_cost(
    pose: &Isometry3<f64>,
    world: &[Point3<f64>],
    image: &[Point2<f64>],
) -> f64 {
    world
        .iter()
        .zip(image)
        .try_fold(0.0, |cost, (pw, uv)| {
            let (proj, _) = projection_jacobian(&pose.transform_point(pw))?;
            Some(cost + (proj - uv).norm_squared())
        })
        .unwrap_or(f64::INFINITY)
}

fn in_front(pose: &Isometry3<f64>, world: &[Point3<f64>]) -> bool {
    world.iter().all(|p| pose.transform_point(p).z > 0.0)
}

struct PrincipalAxes {
    center: Point3<f64>,
    /// Unit axes as columns, sorted by descending variance.
    axes: Matrix3<f64>,
    values: Vector3<f64>,
}

fn principal_axes(world: &[Point3<f64>]) -> Option<PrincipalAxes> {
    let center = centroid(world)?;
    let mut cov = Matrix3::zeros();
    for p in world {
        let d = p - center;
        cov += d * d.transpose();
    }
    cov /= world.len() as f64;

    let eig = SymmetricEigen::new(cov);
    let mut order = [0usize, 1, 2];
    order.sort_by(|&a, &b| eig.eigenvalues[b].total_cmp(&eig.eigenvalues[a]));
    let mut axes = Matrix3::zeros();
    let mut values = Vector3::zeros();
    for (dst, &src) in order.iter().enumerate() {
        axes.set_column(dst, &eig.eigenvectors.column(src));
        values[dst] = eig.eigenvalues[src].max(0.0);
    }
    // right-handed frame
    let normal = axes.column(0).cross(&axes.column(1));
    axes.set_column(2, &normal);
    Some(PrincipalAxes {
        center,
        axes,
        values,
    })
}

/// Pose of a planar point set from the plane-to-image homography.
fn planar_pose(
    world: &[Point3<f64>],
    image: &[Point2<f64>],
    frame: &PrincipalAxes,
) -> Option<Isometry3<f64>> {
    let plane: Vec<Point2<f64>> = world
        .iter()
        .map(|p| {
            let d = frame.axes.transpose() * (p - frame.center);
            Point2::new(d.x, d.y)
        })
        .collect();
    let hmg = estimate_homography(&plane, image)?;
    let h = hmg.h;

    let h1 = h.column(0).into_owned();
    let h2 = h.column(1).into_owned();
    let h3 = h.column(2).into_owned();
    let norm = 0.5 * (h1.norm() + h2.norm());
    if norm <= f64::EPSILON {
        return None;
    }
    let mut lambda = 1.0 / norm;
    // plane origin (the centroid) must lie in front of the camera
    if h3.z * lambda < 0.0 {
        lambda = -lambda;
    }
    let r1 = h1 * lambda;
    let r2 = h2 * lambda;
    let t = h3 * lambda;
    let rotation = nearest_rotation(&Matrix3::from_columns(&[r1, r2, r1.cross(&r2)]))?;

    // camera_from_plane composed with plane_from_world
    let r_cw = rotation.to_rotation_matrix().matrix() * frame.axes.transpose();
    let t_cw = t - r_cw * frame.center.coords;
    let rot = nearest_rotation(&r_cw)?;
    Some(Isometry3::from_parts(Translation3::from(t_cw), rot))
}

/// Control-point EPnP for six or more non-planar points.
fn epnp(world: &[Point3<f64>], image: &[Point2<f64>]) -> Option<Isometry3<f64>> {
    let n = world.len();
    let frame = principal_axes(world)?;

    let mut control_w = [frame.center.coords; 4];
    for i in 0..3 {
        control_w[i + 1] = frame.center.coords + frame.axes.column(i) * frame.values[i].sqrt();
    }
    let basis = Matrix3::from_columns(&[
        control_w[1] - control_w[0],
        control_w[2] - control_w[0],
        control_w[3] - control_w[0],
    ]);
    let basis_inv = basis.try_inverse()?;

    let alphas: Vec<[f64; 4]> = world
        .iter()
        .map(|p| {
            let c = basis_inv * (p.coords - control_w[0]);
            [1.0 - c.x - c.y - c.z, c.x, c.y, c.z]
        })
        .collect();

    let mut m = DMatrix::<f64>::zeros(2 * n, 12);
    for (i, (a, uv)) in alphas.iter().zip(image).enumerate() {
        for (j, &alpha) in a.iter().enumerate() {
            let c = 3 * j;
            m[(2 * i, c)] = alpha;
            m[(2 * i, c + 2)] = -uv.x * alpha;
            m[(2 * i + 1, c + 1)] = alpha;
            m[(2 * i + 1, c + 2)] = -uv.y * alpha;
        }
    }

    let svd = m.svd(false, true);
    let v_t = svd.v_t?;
    let (min_row, _) = svd
        .singular_values
        .iter()
        .enumerate()
        .min_by(|a, b| a.1.total_cmp(b.1))?;
    let sol = v_t.row(min_row);

    let mut control_c = [Vector3::zeros(); 4];
    for (j, cc) in control_c.iter_mut().enumerate() {
        *cc = Vector3::new(sol[3 * j], sol[3 * j + 1], sol[3 * j + 2]);
    }

    let mut sum_w = 0.0;
    let mut sum_c = 0.0;
    for i in 0..4 {
        for j in (i + 1)..4 {
            sum_w += (control_w[i] - control_w[j]).norm_squared();
            sum_c += (control_c[i] - control_c[j]).norm_squared();
        }
    }
    if sum_c <= f64::EPSILON {
        return None;
    }
    let mut scale = (sum_w / sum_c).sqrt();

    let camera_pts = |scale: f64| -> Vec<Point3<f64>> {
        alphas
            .iter()
            .map(|a| {
                let mut pc = Vector3::zeros();
                for (j, &alpha) in a.iter().enumerate() {
                    pc += control_c[j] * alpha;
                }
                Point3::from(pc * scale)
            })
            .collect()
    };
    // the null vector's sign is arbitrary
    if camera_pts(scale).iter().map(|p| p.z).sum::<f64>() < 0.0 {
        scale = -scale;
    }
    fit_rigid(world, &camera_pts(scale))
}

/// Closed-form three-point pose (Grunert's quartic in the ratio of the
/// first two depths). Up to four candidates, each with positive depths.
pub(crate) fn p3p(world: &[Point3<f64>; 3], image: &[Point2<f64>; 3]) -> Vec<Isometry3<f64>> {
    let f = image.map(|p| Vector3::new(p.x, p.y, 1.0).normalize());
    let a2 = (world[1] - world[2]).norm_squared();
    let b2 = (world[0] - world[2]).norm_squared();
    let c2 = (world[0] - world[1]).norm_squared();
    if a2 <= 0.0 || b2 <= 0.0 || c2 <= 0.0 {
        return Vec::new();
    }
    let cos_alpha = f[1].dot(&f[2]);
    let cos_beta = f[0].dot(&f[2]);
    let cos_gamma = f[0].dot(&f[1]);

    // v = N(u) / D(u) and v² - 2cos(beta)·v + M(u) = 0, ascending powers of u
    let d = (b2 - a2) / c2;
    let e = b2 / c2;
    let n = [1.0 - d, 2.0 * d * cos_gamma, -(1.0 + d)];
    let den = [2.0 * cos_beta, -2.0 * cos_alpha];
    let m = [1.0 - e, 2.0 * e * cos_gamma, -e];

    let nn = poly_mul(&n, &n);
    let nd = poly_mul(&n, &den);
    let dd = poly_mul(&den, &den);
    let mdd = poly_mul(&m, &dd);
    let mut q = [0.0; 5];
    for (k, qk) in q.iter_mut().enumerate() {
        *qk = nn[k] + mdd[k] - 2.0 * cos_beta * nd[k];
    }

    let eval = |p: &[f64], u: f64| p.iter().rev().fold(0.0, |acc, c| acc * u + c);
    solve_quartic_real(q[4], q[3], q[2], q[1], q[0])
        .into_iter()
        .filter_map(|u| {
            let den_u = eval(&den, u);
            if den_u.abs() <= 1e-12 {
                return None;
            }
            let v = eval(&n, u) / den_u;
            let k = 1.0 + u * u - 2.0 * u * cos_gamma;
            if k <= 0.0 || u <= 0.0 || v <= 0.0 {
                return None;
            }
            let s0 = (c2 / k).sqrt();
            let cam = [f[0] * s0, f[1] * (u * s0), f[2] * (v * s0)].map(Point3::from);
            fit_rigid(world, &cam)
        })
        .collect()
}

fn poly_mul<const A: usize, const B: usize>(a: &[f64; A], b: &[f64; B]) -> [f64; 5] {
    let mut out = [0.0; 5];
    for (i, x) in a.iter().enumerate() {
        for (j, y) in b.iter().enumerate() {
            out[i + j] += x * y;
        }
    }
    out
}

/// Farthest pair plus the point farthest from their line.
fn spread_triplet(world: &[Point3<f64>]) -> Option<[usize; 3]> {
    let mut best = (0, 0, 0.0);
    for i in 0..world.len() {
        for j in (i + 1)..world.len() {
            let d = (world[i] - world[j]).norm_squared();
            if d > best.2 {
                best = (i, j, d);
            }
        }
    }
    let (a, b, d) = best;
    if d <= 0.0 {
        return None;
    }
    let axis = (world[b] - world[a]).normalize();
    let (c, off) = world
        .iter()
        .enumerate()
        .map(|(k, p)| (k, (p - world[a]).cross(&axis).norm()))
        .max_by(|l, r| l.1.total_cmp(&r.1))?;
    (off > 1e-9 * d.sqrt()).then_some([a, b, c])
}
