//! Multi-view point triangulation in normalized image coordinates.
//!
//! A view is a `camera_from_world` transform plus the undistorted,
//! normalized image point (`x/z`, `y/z`) of the same world point.

use levenberg_marquardt::{LeastSquaresProblem, LevenbergMarquardt};
use lm_nalgebra as lm;
use nalgebra::{DMatrix, Isometry3, Matrix2x3, Matrix3, Point2, Point3, SymmetricEigen, Vector3};
use scene_recon_core::math::angle_between;

#[derive(Clone, Copy, Debug)]
pub(crate) struct View {
    pub camera_from_world: Isometry3<f64>,
    pub point: Point2<f64>,
}

/// Geometric quality of a triangulated point.
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) struct PointQuality {
    /// Largest angle between any two viewing rays, in degrees.
    pub parallax_deg: f64,
    /// Ratio of the extreme eigenvalues of the Gauss-Newton normal matrix.
    pub condition: f64,
}

/// Linear (DLT) triangulation. `None` with fewer than two views or when the
/// homogeneous solution lies at infinity.
pub(crate) fn triangulate_dlt(views: &[View]) -> Option<Point3<f64>> {
    if views.len() < 2 {
        return None;
    }

    let mut a = DMatrix::<f64>::zeros(2 * views.len(), 4);
    for (i, view) in views.iter().enumerate() {
        let p = view.camera_from_world.to_homogeneous();
        let (u, v) = (view.point.x, view.point.y);
        for c in 0..4 {
            a[(2 * i, c)] = u * p[(2, c)] - p[(0, c)];
            a[(2 * i + 1, c)] = v * p[(2, c)] - p[(1, c)];
        }
    }

    let svd = a.svd(false, true);
    let v_t = svd.v_t?;
    let (min_row, _) = svd
        .singular_values
        .iter()
        .enumerate()
        .min_by(|a, b| a.1.total_cmp(b.1))?;
    let x = v_t.row(min_row);

    let w = x[3];
    if w.abs() <= f64::EPSILON {
        return None;
    }
    let point = Point3::new(x[0] / w, x[1] / w, x[2] / w);
    point.coords.iter().all(|v| v.is_finite()).then_some(point)
}

/// Camera-frame point and the Jacobian of its normalized projection with
/// respect to the camera-frame coordinates. `None` behind the camera.
pub(crate) fn projection_jacobian(pc: &Point3<f64>) -> Option<(Point2<f64>, Matrix2x3<f64>)> {
    if pc.z <= 1e-12 {
        return None;
    }
    let iz = 1.0 / pc.z;
    let proj = Point2::new(pc.x * iz, pc.y * iz);
    let j = Matrix2x3::new(iz, 0.0, -pc.x * iz * iz, 0.0, iz, -pc.y * iz * iz);
    Some((proj, j))
}

/// Reprojection of one world point into every view; three parameters.
struct PointProblem<'a> {
    views: &'a [View],
    params: lm::Vector3<f64>,
}

impl PointProblem<'_> {
    fn point(&self) -> Point3<f64> {
        Point3::new(self.params[0], self.params[1], self.params[2])
    }
}

impl LeastSquaresProblem<f64, lm::Dyn, lm::U3> for PointProblem<'_> {
    type ResidualStorage = lm::storage::Owned<f64, lm::Dyn>;
    type JacobianStorage = lm::storage::Owned<f64, lm::Dyn, lm::U3>;
    type ParameterStorage = lm::storage::Owned<f64, lm::U3>;

    fn set_params(&mut self, x: &lm::Vector3<f64>) {
        self.params = *x;
    }

    fn params(&self) -> lm::Vector3<f64> {
        self.params
    }

    fn residuals(&self) -> Option<lm::DVector<f64>> {
        let point = self.point();
        let mut r = Vec::with_capacity(2 * self.views.len());
        for view in self.views {
            let (proj, _) = projection_jacobian(&view.camera_from_world.transform_point(&point))?;
            r.extend([proj.x - view.point.x, proj.y - view.point.y]);
        }
        Some(lm::DVector::from_vec(r))
    }

    fn jacobian(&self) -> Option<lm::OMatrix<f64, lm::Dyn, lm::U3>> {
        let point = self.point();
        let mut rows = Vec::with_capacity(6 * self.views.len());
        for view in self.views {
            rows.extend(point_jacobian(view, &point)?.transpose().iter());
        }
        Some(lm::OMatrix::from_row_slice_generic(
            lm::Dyn(2 * self.views.len()),
            lm::U3,
            &rows,
        ))
    }
}

/// Derivative of a view's normalized projection with respect to the world
/// point.
fn point_jacobian(view: &View, point: &Point3<f64>) -> Option<Matrix2x3<f64>> {
    let pc = view.camera_from_world.transform_point(point);
    let (_, jp) = projection_jacobian(&pc)?;
    Some(jp * view.camera_from_world.rotation.to_rotation_matrix().matrix())
}

/// Sum of squared normalized residuals; infinite if the point is behind a
/// view.
pub(crate) fn point_cost(views: &[View], point: &Point3<f64>) -> f64 {
    views
        .iter()
        .try_fold(0.0, |cost, view| {
            let (proj, _) = projection_jacobian(&view.camera_from_world.transform_point(point))?;
            Some(cost + (proj - view.point).norm_squared())
        })
        .unwrap_or(f64::INFINITY)
}

/// Levenberg-Marquardt refinement of a point's reprojection error. The
/// start is kept when the solver does not improve on it.
pub(crate) fn refine_point(views: &[View], initial: Point3<f64>, iterations: usize) -> Point3<f64> {
    let problem = PointProblem {
        views,
        params: lm::Vector3::new(initial.x, initial.y, initial.z),
    };
    let (problem, _) = LevenbergMarquardt::new()
        .with_patience(iterations.max(1))
        .minimize(problem);
    let refined = problem.point();
    let cost = point_cost(views, &refined);
    if cost.is_finite() && cost <= point_cost(views, &initial) {
        refined
    } else {
        initial
    }
}

/// Parallax and conditioning of `point` as seen from `views`.
pub(crate) fn point_quality(views: &[View], point: &Point3<f64>) -> PointQuality {
    let rays: Vec<Vector3<f64>> = views
        .iter()
        .map(|v| {
            let center = v.camera_from_world.inverse_transform_point(&Point3::origin());
            point - center
        })
        .collect();

    let mut parallax = 0.0_f64;
    for (i, a) in rays.iter().enumerate() {
        for b in &rays[i + 1..] {
            parallax = parallax.max(angle_between(a, b));
        }
    }

    let information = views.iter().try_fold(Matrix3::zeros(), |h, view| {
        let j = point_jacobian(view, point)?;
        Some(h + j.transpose() * j)
    });
    let condition = match information {
        Some(h) => {
            let eig = SymmetricEigen::new(h).eigenvalues;
            let max = eig.max();
            let min = eig.min();
            if min > 0.0 {
                max / min
            } else {
                f64::INFINITY
            }
        }
        None => f64::INFINITY,
    };

    PointQuality {
        parallax_deg: parallax.to_degrees(),
        condition,
    }
}
