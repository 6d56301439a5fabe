//! Candidate quadrilaterals: dark connected regions whose outline is a
//! convex four-sided polygon.

use crate::threshold::adaptive_dark_mask;
use nalgebra::{Point2, Vector2};
use scene_recon_core::GrayImageView;
use serde::{Deserialize, Serialize};

/// Quad finder parameters.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuadParams {
    /// Side of the local-mean window used for binarization (pixels).
    pub threshold_window: usize,
    /// A pixel is dark when it is this much below its local mean.
    pub threshold_offset: f64,
    /// Smallest dark region considered (pixels).
    pub min_area_px: usize,
    /// Largest dark region considered, as a fraction of the image area.
    pub max_area_frac: f64,
    /// Shortest acceptable quad side (pixels).
    pub min_side_px: f64,
    /// Minimum ratio between quad area and outline hull area.
    pub min_fill: f64,
    /// Largest allowed distance of the outline from the quad, relative to
    /// the mean side length.
    pub max_outline_deviation: f64,
    /// Refine corners by fitting lines to sub-pixel edge crossings.
    pub refine_edges: bool,
}

impl Default for QuadParams {
    fn default() -> Self {
        Self {
            threshold_window: 31,
            threshold_offset: 7.0,
            min_area_px: 64,
            max_area_frac: 0.5,
            min_side_px: 10.0,
            min_fill: 0.85,
            max_outline_deviation: 0.08,
            refine_edges: true,
        }
    }
}

/// A candidate marker outline, corners clockwise in the image.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Quad {
    pub corners: [Point2<f64>; 4],
}

struct Region {
    area: usize,
    touches_border: bool,
    boundary: Vec<(usize, usize)>,
}

/// Find all quad candidates in the image.
pub fn find_quads(img: &GrayImageView<'_>, params: &QuadParams) -> Vec<Quad> {
    if img.width < 3 || img.height < 3 {
        return Vec::new();
    }
    let mask = adaptive_dark_mask(img, params.threshold_window, params.threshold_offset);
    let max_area = (params.max_area_frac * (img.width * img.height) as f64) as usize;

    let mut quads = Vec::new();
    for region in dark_regions(&mask, img.width, img.height) {
        if region.touches_border || region.area < params.min_area_px || region.area > max_area {
            continue;
        }
        let outline: Vec<Point2<f64>> = region
            .boundary
            .iter()
            .flat_map(|&(x, y)| {
                let (fx, fy) = (x as f64, y as f64);
                [
                    Point2::new(fx - 0.5, fy - 0.5),
                    Point2::new(fx + 0.5, fy - 0.5),
                    Point2::new(fx + 0.5, fy + 0.5),
                    Point2::new(fx - 0.5, fy + 0.5),
                ]
            })
            .collect();
        let hull = convex_hull(outline);
        let Some(mut corners) = fit_quad(&hull, params) else {
            continue;
        };
        if params.refine_edges {
            corners = refine_corners(img, &corners);
        }
        quads.push(Quad { corners });
    }
    log::debug!("quad candidates: {}", quads.len());
    quads
}

/// 4-connected components of the mask with their boundary pixels.
fn dark_regions(mask: &[bool], w: usize, h: usize) -> Vec<Region> {
    let mut visited = vec![false; mask.len()];
    let mut regions = Vec::new();
    let mut stack = Vec::new();

    for start in 0..mask.len() {
        if !mask[start] || visited[start] {
            continue;
        }
        visited[start] = true;
        stack.push(start);
        let mut region = Region {
            area: 0,
            touches_border: false,
            boundary: Vec::new(),
        };

        while let Some(idx) = stack.pop() {
            let (x, y) = (idx % w, idx / w);
            region.area += 1;
            if x == 0 || y == 0 || x + 1 == w || y + 1 == h {
                region.touches_border = true;
            }

            let mut on_boundary = false;
            let neighbors = [
                (x > 0).then(|| idx - 1),
                (x + 1 < w).then(|| idx + 1),
                (y > 0).then(|| idx - w),
                (y + 1 < h).then(|| idx + w),
            ];
            for n in neighbors {
                match n {
                    Some(n) if mask[n] => {
                        if !visited[n] {
                            visited[n] = true;
                            stack.push(n);
                        }
                    }
                    _ => on_boundary = true,
                }
            }
            if on_boundary {
                region.boundary.push((x, y));
            }
        }
        regions.push(region);
    }
    regions
}

#[inline]
fn cross(o: &Point2<f64>, a: &Point2<f64>, b: &Point2<f64>) -> f64 {
    (a.x - o.x) * (b.y - o.y) - (a.y - o.y) * (b.x - o.x)
}

/// Andrew's monotone chain; collinear points are dropped.
fn convex_hull(mut pts: Vec<Point2<f64>>) -> Vec<Point2<f64>> {
    pts.sort_by(|a, b| a.x.total_cmp(&b.x).then(a.y.total_cmp(&b.y)));
    pts.dedup();
    if pts.len() < 3 {
        return pts;
    }

    let mut hull: Vec<Point2<f64>> = Vec::with_capacity(2 * pts.len());
    for p in &pts {
        while hull.len() >= 2 && cross(&hull[hull.len() - 2], &hull[hull.len() - 1], p) <= 0.0 {
            hull.pop();
        }
        hull.push(*p);
    }
    let lower_len = hull.len() + 1;
    for p in pts.iter().rev().skip(1) {
        while hull.len() >= lower_len
            && cross(&hull[hull.len() - 2], &hull[hull.len() - 1], p) <= 0.0
        {
            hull.pop();
        }
        hull.push(*p);
    }
    hull.pop();
    hull
}

fn polygon_area(poly: &[Point2<f64>]) -> f64 {
    let n = poly.len();
    0.5 * (0..n)
        .map(|i| {
            let (a, b) = (poly[i], poly[(i + 1) % n]);
            a.x * b.y - b.x * a.y
        })
        .sum::<f64>()
}

fn distance_to_segment(p: &Point2<f64>, a: &Point2<f64>, b: &Point2<f64>) -> f64 {
    let ab = b - a;
    let len2 = ab.norm_squared();
    if len2 <= f64::EPSILON {
        return (p - a).norm();
    }
    let t = ((p - a).dot(&ab) / len2).clamp(0.0, 1.0);
    (p - (a + ab * t)).norm()
}

/// Reduce a convex outline to four corners (diameter endpoints plus the
/// farthest point on each side of the diameter) and validate the fit.
fn fit_quad(hull: &[Point2<f64>], params: &QuadParams) -> Option<[Point2<f64>; 4]> {
    if hull.len() < 4 {
        return None;
    }

    let mut best = (0, 0, 0.0);
    for i in 0..hull.len() {
        for j in (i + 1)..hull.len() {
            let d = (hull[j] - hull[i]).norm_squared();
            if d > best.2 {
                best = (i, j, d);
            }
        }
    }
    let (a, c) = (hull[best.0], hull[best.1]);

    let (mut b, mut b_dist) = (None, 0.0);
    let (mut d, mut d_dist) = (None, 0.0);
    for p in hull {
        let s = cross(&a, &c, p);
        if s > b_dist {
            b = Some(*p);
            b_dist = s;
        } else if s < d_dist {
            d = Some(*p);
            d_dist = s;
        }
    }
    let mut quad = [a, b?, c, d?];
    if polygon_area(&quad) < 0.0 {
        quad.swap(1, 3);
    }

    let sides: Vec<f64> = (0..4).map(|i| (quad[(i + 1) % 4] - quad[i]).norm()).collect();
    if sides.iter().any(|&s| s < params.min_side_px) {
        return None;
    }
    let hull_area = polygon_area(hull).abs();
    if hull_area <= 0.0 || polygon_area(&quad) / hull_area < params.min_fill {
        return None;
    }
    let mean_side = sides.iter().sum::<f64>() / 4.0;
    let worst = hull
        .iter()
        .map(|p| {
            (0..4)
                .map(|i| distance_to_segment(p, &quad[i], &quad[(i + 1) % 4]))
                .fold(f64::INFINITY, f64::min)
        })
        .fold(0.0, f64::max);
    (worst <= params.max_outline_deviation * mean_side).then_some(quad)
}

const EDGE_SAMPLES: usize = 12;
const EDGE_STEP: f64 = 0.25;
const MIN_EDGE_CONTRAST: f64 = 20.0;
const MAX_CORNER_SHIFT: f64 = 3.0;

/// Line through `point` with unit `dir`.
struct Line {
    point: Point2<f64>,
    dir: Vector2<f64>,
}

/// Snap each side to the intensity mid-level crossing along its normal and
/// re-intersect neighbouring sides. Corners whose refinement fails or moves
/// too far keep their coarse position.
fn refine_corners(img: &GrayImageView<'_>, quad: &[Point2<f64>; 4]) -> [Point2<f64>; 4] {
    let lines: Vec<Option<Line>> = (0..4)
        .map(|i| fit_edge(img, &quad[i], &quad[(i + 1) % 4]))
        .collect();

    let mut out = *quad;
    for (i, corner) in out.iter_mut().enumerate() {
        let prev = &lines[(i + 3) % 4];
        let next = &lines[i];
        if let (Some(l0), Some(l1)) = (prev, next) {
            if let Some(p) = intersect(l0, l1) {
                if (p - *corner).norm() <= MAX_CORNER_SHIFT {
                    *corner = p;
                }
            }
        }
    }
    out
}

fn fit_edge(img: &GrayImageView<'_>, a: &Point2<f64>, b: &Point2<f64>) -> Option<Line> {
    let along = b - a;
    let len = along.norm();
    if len < 4.0 {
        return None;
    }
    let dir = along / len;
    // Clockwise outline in y-down coordinates: outward normal is (dy, -dx).
    let outward = Vector2::new(dir.y, -dir.x);
    let reach = (0.06 * len).clamp(1.5, 4.0);

    let mut crossings = Vec::with_capacity(EDGE_SAMPLES);
    for k in 0..EDGE_SAMPLES {
        let f = 0.2 + 0.6 * k as f64 / (EDGE_SAMPLES - 1) as f64;
        let base = a + along * f;
        if let Some(t) = edge_crossing(img, &base, &outward, reach) {
            crossings.push(base + outward * t);
        }
    }
    if crossings.len() < 3 {
        return None;
    }

    let n = crossings.len() as f64;
    let mean = crossings
        .iter()
        .fold(Vector2::zeros(), |acc, p| acc + p.coords)
        / n;
    let (mut sxx, mut sxy, mut syy) = (0.0, 0.0, 0.0);
    for p in &crossings {
        let d = p.coords - mean;
        sxx += d.x * d.x;
        sxy += d.x * d.y;
        syy += d.y * d.y;
    }
    // Principal direction of the 2x2 scatter matrix.
    let theta = 0.5 * (2.0 * sxy).atan2(sxx - syy);
    Some(Line {
        point: Point2::from(mean),
        dir: Vector2::new(theta.cos(), theta.sin()),
    })
}

/// Offset along `normal` where the profile crosses the mid-level between
/// its dark (inner) and light (outer) ends.
fn edge_crossing(
    img: &GrayImageView<'_>,
    base: &Point2<f64>,
    normal: &Vector2<f64>,
    reach: f64,
) -> Option<f64> {
    let (inner, outer) = (base - normal * reach, base + normal * reach);
    if !img.contains(inner.x, inner.y) || !img.contains(outer.x, outer.y) {
        return None;
    }
    let steps = (2.0 * reach / EDGE_STEP).round() as usize;
    let profile: Vec<(f64, f64)> = (0..=steps)
        .map(|k| {
            let t = -reach + k as f64 * EDGE_STEP;
            let p = base + normal * t;
            (t, img.sample_bilinear(p.x, p.y))
        })
        .collect();

    let dark = profile.first()?.1;
    let light = profile.last()?.1;
    if light - dark < MIN_EDGE_CONTRAST {
        return None;
    }
    let mid = 0.5 * (dark + light);
    profile.windows(2).find_map(|w| {
        let ((t0, v0), (t1, v1)) = (w[0], w[1]);
        (v0 < mid && v1 >= mid).then(|| t0 + (mid - v0) / (v1 - v0) * (t1 - t0))
    })
}

fn intersect(l0: &Line, l1: &Line) -> Option<Point2<f64>> {
    let denom = l0.dir.x * l1.dir.y - l0.dir.y * l1.dir.x;
    if denom.abs() < 1e-6 {
        return None;
    }
    let d = l1.point - l0.point;
    let t = (d.x * l1.dir.y - d.y * l1.dir.x) / denom;
    Some(l0.point + l0.dir * t)
}
