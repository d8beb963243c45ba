//! Adaptive phase-contrast segmentation.
//!
//! Per frame:
//!   1. Local log-variance over a small window (box sums via integral
//!      images, O(H*W) independent of the window size).
//!   2. Threshold from the log-variance histogram: mode + 3x the stddev of
//!      the sub-mode population.
//!   3. Morphological cleanup: fill 4-connected holes, then opening and
//!      closing with a square structuring element.
//!
//! Frames are independent and the whole stage is deterministic.

use std::path::{Path, PathBuf};

use ndarray::Array2;

use crate::arr::{ArrReader, ArrWriter, DType};
use crate::config::SegmentParams;
use crate::error::Result;
use crate::progress::StageCtx;

/// Variance floor before the log; zero-variance flats land here.
const VAR_FLOOR: f64 = 1e-12;

pub fn segment_fov(
    pc: &ArrReader,
    out_path: &Path,
    params: &SegmentParams,
    ctx: &StageCtx,
) -> Result<PathBuf> {
    let shape = pc.shape();
    let (n_frames, h, w) = shape;
    let mut writer = ArrWriter::create(out_path, shape, DType::Bool)?;
    for t in 0..n_frames {
        let frame = pc.read_frame_u16(t)?;
        let mask = mask_frame(&frame, h, w, params);
        writer.write_frame_bool(t, &mask)?;
        ctx.tick(t)?;
    }
    writer.finish()
}

pub fn mask_frame(frame: &[u16], h: usize, w: usize, params: &SegmentParams) -> Vec<bool> {
    let log_var = local_log_variance(frame, h, w, params.window_halfsize);
    let tau = variance_threshold(&log_var, params.hist_bins);
    let mut mask: Vec<bool> = log_var.iter().map(|&v| v > tau).collect();
    fill_holes(&mut mask, h, w);
    let radius = params.struct_side / 2;
    for _ in 0..params.morph_iterations {
        erode(&mut mask, h, w, radius);
        dilate(&mut mask, h, w, radius);
    }
    for _ in 0..params.morph_iterations {
        dilate(&mut mask, h, w, radius);
        erode(&mut mask, h, w, radius);
    }
    mask
}

/// `log(max(var, floor))` of the clipped window around each pixel, where
/// `var = E[I^2] - E[I]^2` over the window.
fn local_log_variance(frame: &[u16], h: usize, w: usize, halfsize: usize) -> Array2<f64> {
    let stride = w + 1;
    let mut s1 = vec![0f64; (h + 1) * stride];
    let mut s2 = vec![0f64; (h + 1) * stride];
    for y in 0..h {
        for x in 0..w {
            let v = frame[y * w + x] as f64;
            let i = (y + 1) * stride + x + 1;
            s1[i] = v + s1[i - 1] + s1[i - stride] - s1[i - stride - 1];
            s2[i] = v * v + s2[i - 1] + s2[i - stride] - s2[i - stride - 1];
        }
    }
    let window = |s: &[f64], y0: usize, y1: usize, x0: usize, x1: usize| {
        s[(y1 + 1) * stride + x1 + 1] - s[y0 * stride + x1 + 1] - s[(y1 + 1) * stride + x0]
            + s[y0 * stride + x0]
    };
    Array2::from_shape_fn((h, w), |(y, x)| {
        let y0 = y.saturating_sub(halfsize);
        let y1 = (y + halfsize).min(h - 1);
        let x0 = x.saturating_sub(halfsize);
        let x1 = (x + halfsize).min(w - 1);
        let n = ((y1 - y0 + 1) * (x1 - x0 + 1)) as f64;
        let mean = window(&s1, y0, y1, x0, x1) / n;
        let var = window(&s2, y0, y1, x0, x1) / n - mean * mean;
        var.max(VAR_FLOOR).ln()
    })
}

/// Histogram the log-variance image, take the mode as the background level,
/// and return `mode + 3 * stddev(values <= mode)`.
fn variance_threshold(log_var: &Array2<f64>, bins: usize) -> f64 {
    let mut lo = f64::INFINITY;
    let mut hi = f64::NEG_INFINITY;
    for &v in log_var.iter() {
        lo = lo.min(v);
        hi = hi.max(v);
    }
    if !(hi > lo) {
        return hi;
    }
    let width = (hi - lo) / bins as f64;
    let mut counts = vec![0usize; bins];
    for &v in log_var.iter() {
        let bin = (((v - lo) / width) as usize).min(bins - 1);
        counts[bin] += 1;
    }
    let mode = counts
        .iter()
        .enumerate()
        .max_by(|a, b| a.1.cmp(b.1).then(b.0.cmp(&a.0)))
        .map(|(i, _)| i)
        .unwrap_or(0);
    let mu = lo + (mode as f64 + 0.5) * width;

    let mut n = 0usize;
    let mut sum = 0f64;
    let mut sum2 = 0f64;
    for &v in log_var.iter() {
        if v <= mu {
            n += 1;
            sum += v;
            sum2 += v * v;
        }
    }
    if n == 0 {
        return mu;
    }
    let mean = sum / n as f64;
    let sigma = (sum2 / n as f64 - mean * mean).max(0.0).sqrt();
    mu + 3.0 * sigma
}

/// Foreground-ize every 4-connected background component that does not
/// touch the frame border.
fn fill_holes(mask: &mut [bool], h: usize, w: usize) {
    if h == 0 || w == 0 {
        return;
    }
    let mut reached = vec![false; h * w];
    let mut stack: Vec<usize> = Vec::new();
    let mut seed = |i: usize, stack: &mut Vec<usize>, reached: &mut Vec<bool>| {
        if !mask[i] && !reached[i] {
            reached[i] = true;
            stack.push(i);
        }
    };
    for x in 0..w {
        seed(x, &mut stack, &mut reached);
        seed((h - 1) * w + x, &mut stack, &mut reached);
    }
    for y in 0..h {
        seed(y * w, &mut stack, &mut reached);
        seed(y * w + w - 1, &mut stack, &mut reached);
    }
    while let Some(i) = stack.pop() {
        let (y, x) = (i / w, i % w);
        if y > 0 {
            seed(i - w, &mut stack, &mut reached);
        }
        if y + 1 < h {
            seed(i + w, &mut stack, &mut reached);
        }
        if x > 0 {
            seed(i - 1, &mut stack, &mut reached);
        }
        if x + 1 < w {
            seed(i + 1, &mut stack, &mut reached);
        }
    }
    for i in 0..h * w {
        if !mask[i] && !reached[i] {
            mask[i] = true;
        }
    }
}

// ---------------------------------------------------------------------------
// Square-element morphology, shared with the background corrector.
// Separable row/column passes over prefix sums; outside the frame counts
// as background.
// ---------------------------------------------------------------------------

pub(crate) fn dilate(mask: &mut Vec<bool>, h: usize, w: usize, radius: usize) {
    if radius == 0 {
        return;
    }
    morph_pass(mask, h, w, radius, false);
}

pub(crate) fn erode(mask: &mut Vec<bool>, h: usize, w: usize, radius: usize) {
    if radius == 0 {
        return;
    }
    morph_pass(mask, h, w, radius, true);
}

fn morph_pass(mask: &mut Vec<bool>, h: usize, w: usize, radius: usize, all: bool) {
    let full = 2 * radius + 1;
    let mut tmp = vec![false; h * w];
    let mut pre = vec![0u32; w.max(h) + 1];
    // horizontal
    for y in 0..h {
        for x in 0..w {
            pre[x + 1] = pre[x] + u32::from(mask[y * w + x]);
        }
        for x in 0..w {
            let x0 = x.saturating_sub(radius);
            let x1 = (x + radius).min(w - 1);
            let count = pre[x1 + 1] - pre[x0];
            tmp[y * w + x] = if all { count == full as u32 } else { count > 0 };
        }
    }
    // vertical
    for x in 0..w {
        for y in 0..h {
            pre[y + 1] = pre[y] + u32::from(tmp[y * w + x]);
        }
        for y in 0..h {
            let y0 = y.saturating_sub(radius);
            let y1 = (y + radius).min(h - 1);
            let count = pre[y1 + 1] - pre[y0];
            mask[y * w + x] = if all { count == full as u32 } else { count > 0 };
        }
    }
}
