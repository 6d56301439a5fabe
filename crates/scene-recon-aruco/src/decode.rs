//! Bit-grid sampling of one marker quad.

use crate::threshold::otsu_threshold;
use nalgebra::Point2;
use scene_recon_core::{homography_from_4pt, GrayImageView, Homography};
use serde::{Deserialize, Serialize};

/// Parameters for reading the bit grid inside a quad.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DecodeParams {
    /// Marker border width in cells (OpenCV uses 1).
    pub border_bits: usize,
    /// Fraction of each cell ignored near its edges when averaging.
    pub cell_margin: f64,
    /// Require at least this fraction of border cells to read black.
    pub min_border_score: f32,
    /// Reject quads whose cells are smaller than this many pixels.
    pub min_px_per_cell: f64,
}

impl Default for DecodeParams {
    fn default() -> Self {
        Self {
            border_bits: 1,
            cell_margin: 0.25,
            min_border_score: 0.85,
            min_px_per_cell: 3.0,
        }
    }
}

/// Raw bits read from a quad, before dictionary lookup.
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) struct QuadBits {
    /// Inner bits, row-major, black = 1, in the quad's own corner order.
    pub code: u64,
    pub border_score: f32,
}

const SUBSAMPLES: usize = 3;
const THRESH_SUBDIV: usize = 3;

const UNIT_SQUARE: [Point2<f64>; 4] = [
    Point2::new(0.0, 0.0),
    Point2::new(1.0, 0.0),
    Point2::new(1.0, 1.0),
    Point2::new(0.0, 1.0),
];

/// Precomputed sampling pattern in unit-square coordinates.
pub(crate) struct QuadDecoder {
    params: DecodeParams,
    bits: usize,
    cells: usize,
    /// Per cell (row-major), the sub-sample points averaged into one value.
    cell_points: Vec<[Point2<f64>; SUBSAMPLES * SUBSAMPLES]>,
    threshold_points: Vec<Point2<f64>>,
}

impl QuadDecoder {
    pub fn new(params: &DecodeParams, bits: usize) -> Option<Self> {
        if bits == 0 || bits * bits > 64 {
            return None;
        }
        let cells = bits + 2 * params.border_bits;
        let step = 1.0 / cells as f64;
        let margin = params.cell_margin.clamp(0.0, 0.45);

        let mut cell_points = Vec::with_capacity(cells * cells);
        for cy in 0..cells {
            for cx in 0..cells {
                let mut pts = [Point2::origin(); SUBSAMPLES * SUBSAMPLES];
                for (k, p) in pts.iter_mut().enumerate() {
                    let fx = margin + (1.0 - 2.0 * margin) * (k % SUBSAMPLES) as f64
                        / (SUBSAMPLES - 1) as f64;
                    let fy = margin + (1.0 - 2.0 * margin) * (k / SUBSAMPLES) as f64
                        / (SUBSAMPLES - 1) as f64;
                    *p = Point2::new((cx as f64 + fx) * step, (cy as f64 + fy) * step);
                }
                cell_points.push(pts);
            }
        }

        let grid = cells * THRESH_SUBDIV;
        let tstep = 1.0 / grid as f64;
        let threshold_points = (0..grid)
            .flat_map(|ty| {
                (0..grid).map(move |tx| {
                    Point2::new((tx as f64 + 0.5) * tstep, (ty as f64 + 0.5) * tstep)
                })
            })
            .collect();

        Some(Self {
            params: params.clone(),
            bits,
            cells,
            cell_points,
            threshold_points,
        })
    }

    /// Read the bits of the marker whose outer corners are `corners`
    /// (image coordinates, clockwise, sampling origin at corner 0).
    pub fn decode(&self, img: &GrayImageView<'_>, corners: &[Point2<f64>; 4]) -> Option<QuadBits> {
        let shortest = (0..4)
            .map(|i| (corners[(i + 1) % 4] - corners[i]).norm())
            .fold(f64::INFINITY, f64::min);
        if shortest / (self.cells as f64) < self.params.min_px_per_cell {
            return None;
        }

        let h = homography_from_4pt(&UNIT_SQUARE, corners)?;
        let means = self.sample_cells(img, &h)?;

        let thr_samples: Vec<u8> = self
            .threshold_points
            .iter()
            .map(|p| h.apply(*p))
            .filter(|q| img.contains(q.x, q.y))
            .map(|q| img.sample_bilinear(q.x, q.y).round().clamp(0.0, 255.0) as u8)
            .collect();
        let thr = otsu_threshold(&thr_samples) as f64;

        classify_cells(
            &means,
            thr,
            self.cells,
            self.bits,
            self.params.border_bits,
            self.params.min_border_score,
        )
    }

    fn sample_cells(&self, img: &GrayImageView<'_>, h: &Homography) -> Option<Vec<f64>> {
        let mut means = Vec::with_capacity(self.cell_points.len());
        for pts in &self.cell_points {
            let mut sum = 0.0;
            for p in pts {
                let q = h.apply(*p);
                if !img.contains(q.x, q.y) {
                    return None;
                }
                sum += img.sample_bilinear(q.x, q.y);
            }
            means.push(sum / pts.len() as f64);
        }
        Some(means)
    }
}

/// Split cell means into border and code bits.
fn classify_cells(
    means: &[f64],
    thr: f64,
    cells: usize,
    bits: usize,
    border: usize,
    min_border_score: f32,
) -> Option<QuadBits> {
    if means.len() != cells * cells {
        return None;
    }

    let mut border_ok = 0u32;
    let mut border_total = 0u32;
    let mut code = 0u64;
    for cy in 0..cells {
        for cx in 0..cells {
            let is_black = means[cy * cells + cx] < thr;
            let is_border =
                cx < border || cy < border || cx >= cells - border || cy >= cells - border;
            if is_border {
                border_total += 1;
                border_ok += is_black as u32;
            } else if is_black {
                code |= 1u64 << ((cy - border) * bits + (cx - border));
            }
        }
    }

    let border_score = if border_total > 0 {
        border_ok as f32 / border_total as f32
    } else {
        1.0
    };
    (border_score >= min_border_score).then_some(QuadBits { code, border_score })
}
