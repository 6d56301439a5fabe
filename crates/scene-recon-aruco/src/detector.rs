//! Full-image marker detection: quads, bit decoding, dictionary lookup and
//! canonical corner ordering.

use crate::decode::{DecodeParams, QuadDecoder};
use crate::quad::{find_quads, QuadParams};
use crate::{Dictionary, Matcher};
use nalgebra::Point2;
use scene_recon_core::GrayImageView;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[cfg(feature = "tracing")]
use tracing::instrument;

/// Detector configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorParams {
    pub quad: QuadParams,
    pub decode: DecodeParams,
    /// Hamming budget for dictionary matches (clamped to the dictionary's
    /// correction capability).
    pub max_hamming: u8,
}

impl Default for DetectorParams {
    fn default() -> Self {
        Self {
            quad: QuadParams::default(),
            decode: DecodeParams::default(),
            max_hamming: 1,
        }
    }
}

/// One decoded marker.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MarkerDetection {
    pub id: u32,
    /// Image corners in canonical marker order: corner 0 is the marker's
    /// top-left bit-grid corner, then clockwise.
    pub corners: [Point2<f64>; 4],
    /// Quarter turns between the canonical and the observed bit grid.
    pub rotation: u8,
    pub hamming: u8,
    pub border_score: f32,
    /// Combined quality in `0..=1` (border agreement and Hamming penalty).
    pub score: f32,
}

pub struct MarkerDetector {
    matcher: Matcher,
    decoder: Option<QuadDecoder>,
    params: DetectorParams,
}

impl MarkerDetector {
    pub fn new(dict: Dictionary, params: DetectorParams) -> Self {
        let decoder = QuadDecoder::new(&params.decode, dict.marker_size);
        if decoder.is_none() {
            log::warn!(
                "dictionary `{}` has unsupported marker size {}; nothing will decode",
                dict.name,
                dict.marker_size
            );
        }
        let matcher = Matcher::new(dict, params.max_hamming);
        Self {
            matcher,
            decoder,
            params,
        }
    }

    #[inline]
    pub fn params(&self) -> &DetectorParams {
        &self.params
    }

    #[inline]
    pub fn dictionary(&self) -> &Dictionary {
        self.matcher.dictionary()
    }

    /// Detect all markers; at most one detection per id (best score wins),
    /// sorted by id.
    #[cfg_attr(
        feature = "tracing",
        instrument(level = "debug", skip(self, img), fields(width = img.width, height = img.height))
    )]
    pub fn detect(&self, img: &GrayImageView<'_>) -> Vec<MarkerDetection> {
        let Some(decoder) = self.decoder.as_ref() else {
            return Vec::new();
        };

        let mut best: BTreeMap<u32, MarkerDetection> = BTreeMap::new();
        for quad in find_quads(img, &self.params.quad) {
            let Some(bits) = decoder.decode(img, &quad.corners) else {
                continue;
            };
            let Some(m) = self.matcher.match_code(bits.code) else {
                continue;
            };

            let bit_count = self.matcher.dictionary().bit_count().max(1) as f32;
            let score =
                (bits.border_score * (1.0 - m.hamming as f32 / bit_count)).clamp(0.0, 1.0);
            let r = m.rotation as usize;
            let corners = std::array::from_fn(|j| quad.corners[(j + r) % 4]);
            let det = MarkerDetection {
                id: m.id,
                corners,
                rotation: m.rotation,
                hamming: m.hamming,
                border_score: bits.border_score,
                score,
            };

            if best
                .get(&det.id)
                .is_none_or(|prev| det.score > prev.score)
            {
                best.insert(det.id, det);
            } else {
                log::debug!("duplicate marker {} dropped (score {:.3})", det.id, det.score);
            }
        }
        best.into_values().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::tests::{paint_marker, render_marker};
    use scene_recon_core::GrayImage;

    fn dict() -> Dictionary {
        Dictionary::new("test_4x4", 4, 1, vec![0x0003, 0x0011, 0xB64D, 0x0E13]).unwrap()
    }

    /// Square with canonical corner 0 at angle `angle` around the center.
    fn square(cx: f64, cy: f64, half: f64, angle: f64) -> [Point2<f64>; 4] {
        let (s, c) = angle.sin_cos();
        [(-1.0, -1.0), (1.0, -1.0), (1.0, 1.0), (-1.0, 1.0)].map(|(u, v)| {
            let (x, y) = (u * half, v * half);
            Point2::new(cx + c * x - s * y, cy + s * x + c * y)
        })
    }

    fn assert_corners_close(found: &[Point2<f64>; 4], truth: &[Point2<f64>; 4], tol: f64) {
        for (f, t) in found.iter().zip(truth) {
            assert!(
                (f - t).norm() < tol,
                "corner ({:.2},{:.2}) != ({:.2},{:.2})",
                f.x,
                f.y,
                t.x,
                t.y
            );
        }
    }

    #[test]
    fn recovers_id_and_origin_in_every_orientation() {
        let detector = MarkerDetector::new(dict(), DetectorParams::default());
        for quarter in 0..4 {
            let angle = 0.2 + quarter as f64 * std::f64::consts::FRAC_PI_2;
            let truth = square(110.0, 100.0, 50.0, angle);
            let img = render_marker(0xB64D, 4, &truth, 220, 200);
            let dets = detector.detect(&img.view());
            assert_eq!(dets.len(), 1, "orientation {quarter}");
            assert_eq!(dets[0].id, 2);
            assert_eq!(dets[0].hamming, 0);
            assert_corners_close(&dets[0].corners, &truth, 1.5);
        }
    }

    #[test]
    fn detects_several_markers_under_perspective() {
        let mut img = GrayImage::new(400, 260, 230);
        let a = [
            Point2::new(30.0, 40.0),
            Point2::new(150.0, 55.0),
            Point2::new(140.0, 170.0),
            Point2::new(35.0, 160.0),
        ];
        let b = [
            Point2::new(220.0, 60.0),
            Point2::new(350.0, 50.0),
            Point2::new(360.0, 200.0),
            Point2::new(230.0, 180.0),
        ];
        paint_marker(&mut img, 0x0011, 4, &a);
        paint_marker(&mut img, 0x0E13, 4, &b);

        let detector = MarkerDetector::new(dict(), DetectorParams::default());
        let dets = detector.detect(&img.view());
        let ids: Vec<u32> = dets.iter().map(|d| d.id).collect();
        assert_eq!(ids, vec![1, 3]);
        assert_corners_close(&dets[0].corners, &a, 1.5);
        assert_corners_close(&dets[1].corners, &b, 1.5);
    }

    #[test]
    fn blank_image_has_no_markers() {
        let img = GrayImage::new(120, 120, 200);
        let detector = MarkerDetector::new(dict(), DetectorParams::default());
        assert!(detector.detect(&img.view()).is_empty());
    }
}
