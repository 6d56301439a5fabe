//! Thresholding: Otsu for bit sampling, local-mean binarization for quad
//! candidates.

use scene_recon_core::GrayImageView;

/// Otsu threshold of a set of intensities. Values `< t` count as dark.
pub(crate) fn otsu_threshold(samples: &[u8]) -> u8 {
    let Some((&min_v, &max_v)) = samples
        .iter()
        .min()
        .zip(samples.iter().max())
    else {
        return 127;
    };
    if min_v == max_v {
        return min_v;
    }

    let mut hist = [0u32; 256];
    for &v in samples {
        hist[v as usize] += 1;
    }
    if hist.iter().filter(|&&h| h > 0).count() <= 2 {
        return ((min_v as u16 + max_v as u16 + 1) / 2) as u8;
    }

    let total = samples.len() as f64;
    let sum_total: f64 = hist
        .iter()
        .enumerate()
        .map(|(i, &h)| i as f64 * h as f64)
        .sum();

    let mut sum_b = 0.0;
    let mut w_b = 0.0;
    let mut best_var = -1.0;
    let mut best_t = 127u8;
    for (t, &h) in hist.iter().enumerate() {
        w_b += h as f64;
        if w_b < 1.0 {
            continue;
        }
        let w_f = total - w_b;
        if w_f < 1.0 {
            break;
        }
        sum_b += t as f64 * h as f64;
        let m_b = sum_b / w_b;
        let m_f = (sum_total - sum_b) / w_f;
        let var_between = w_b * w_f * (m_b - m_f) * (m_b - m_f);
        if var_between > best_var {
            best_var = var_between;
            // Everything up to and including `t` is background-dark.
            best_t = (t + 1).min(255) as u8;
        }
    }
    best_t
}

/// Binary mask of pixels darker than their local mean by more than `offset`.
///
/// The mean is taken over a `window × window` box (clipped at the image
/// border) using an integral image.
pub(crate) fn adaptive_dark_mask(img: &GrayImageView<'_>, window: usize, offset: f64) -> Vec<bool> {
    let (w, h) = (img.width, img.height);
    let stride = w + 1;
    let mut integral = vec![0u64; stride * (h + 1)];
    for y in 0..h {
        let mut row = 0u64;
        for x in 0..w {
            row += img.data[y * w + x] as u64;
            integral[(y + 1) * stride + x + 1] = integral[y * stride + x + 1] + row;
        }
    }

    let r = (window.max(3) / 2) as isize;
    let mut mask = vec![false; w * h];
    for y in 0..h {
        let y0 = (y as isize - r).max(0) as usize;
        let y1 = ((y as isize + r + 1) as usize).min(h);
        for x in 0..w {
            let x0 = (x as isize - r).max(0) as usize;
            let x1 = ((x as isize + r + 1) as usize).min(w);
            let sum = integral[y1 * stride + x1] + integral[y0 * stride + x0]
                - integral[y0 * stride + x1]
                - integral[y1 * stride + x0];
            let area = ((y1 - y0) * (x1 - x0)) as f64;
            let mean = sum as f64 / area;
            mask[y * w + x] = (img.data[y * w + x] as f64) < mean - offset;
        }
    }
    mask
}
