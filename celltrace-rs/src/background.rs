//! Illumination/background removal for fluorescence frames.
//!
//! The segmentation mask is dilated so cell halos stay out of the
//! estimate, tile medians over the remaining pixels form a coarse grid at
//! 50% tile overlap, and a degree-1 bivariate spline through the tile
//! centres (bilinear inside, linear extrapolation outside) is subtracted
//! from the frame. Output is f32 and may be negative.

use std::path::{Path, PathBuf};

use ndarray::Array2;

use crate::arr::{ArrReader, ArrWriter, DType};
use crate::config::BackgroundParams;
use crate::error::{PipelineError, Result};
use crate::progress::StageCtx;
use crate::segment::dilate;

pub fn correct_fov(
    fl: &ArrReader,
    seg: &ArrReader,
    out_path: &Path,
    params: &BackgroundParams,
    ctx: &StageCtx,
) -> Result<PathBuf> {
    if fl.shape() != seg.shape() {
        return Err(PipelineError::Shape(format!(
            "fluorescence {:?} vs segmentation {:?}",
            fl.shape(),
            seg.shape()
        )));
    }
    let (n_frames, h, w) = fl.shape();
    let mut writer = ArrWriter::create(out_path, (n_frames, h, w), DType::F32)?;
    for t in 0..n_frames {
        let frame = fl.read_frame_u16(t)?;
        let mask = seg.read_frame_bool(t)?;
        let corrected = correct_frame(&frame, &mask, h, w, params);
        writer.write_frame_f32(t, &corrected)?;
        ctx.tick(t)?;
    }
    writer.finish()
}

pub fn correct_frame(
    frame: &[u16],
    mask: &[bool],
    h: usize,
    w: usize,
    params: &BackgroundParams,
) -> Vec<f32> {
    let mut excluded = mask.to_vec();
    dilate(&mut excluded, h, w, params.dilate_radius);

    let surface = background_surface(frame, &excluded, h, w, params);
    frame
        .iter()
        .zip(surface.iter())
        .map(|(&v, &s)| v as f32 - s as f32)
        .collect()
}

fn background_surface(
    frame: &[u16],
    excluded: &[bool],
    h: usize,
    w: usize,
    params: &BackgroundParams,
) -> Vec<f64> {
    let tile_h = effective_tile(h, params.tile_height);
    let tile_w = effective_tile(w, params.tile_width);
    let starts_y = tile_starts(h, tile_h);
    let starts_x = tile_starts(w, tile_w);
    let centers_y: Vec<f64> = starts_y.iter().map(|&s| s as f64 + (tile_h as f64 - 1.0) / 2.0).collect();
    let centers_x: Vec<f64> = starts_x.iter().map(|&s| s as f64 + (tile_w as f64 - 1.0) / 2.0).collect();

    // whole-frame fallback: background pixels if any, else every pixel
    let mut background: Vec<f32> = frame
        .iter()
        .zip(excluded.iter())
        .filter(|(_, &m)| !m)
        .map(|(&v, _)| v as f32)
        .collect();
    let global = match median_f32(&mut background) {
        Some(m) => m,
        None => {
            let mut all: Vec<f32> = frame.iter().map(|&v| v as f32).collect();
            median_f32(&mut all).unwrap_or(0.0)
        }
    };

    let mut grid = Array2::<f64>::zeros((starts_y.len(), starts_x.len()));
    let mut scratch: Vec<f32> = Vec::with_capacity(tile_h * tile_w);
    for (i, &sy) in starts_y.iter().enumerate() {
        for (j, &sx) in starts_x.iter().enumerate() {
            scratch.clear();
            for y in sy..(sy + tile_h).min(h) {
                for x in sx..(sx + tile_w).min(w) {
                    let idx = y * w + x;
                    if !excluded[idx] {
                        scratch.push(frame[idx] as f32);
                    }
                }
            }
            grid[(i, j)] = median_f32(&mut scratch).unwrap_or(global);
        }
    }

    let mut surface = vec![0f64; h * w];
    let mut row = vec![0f64; centers_x.len()];
    for y in 0..h {
        let (iy, ty) = interp_axis(&centers_y, y as f64);
        for (j, slot) in row.iter_mut().enumerate() {
            *slot = if centers_y.len() == 1 {
                grid[(0, j)]
            } else {
                (1.0 - ty) * grid[(iy, j)] + ty * grid[(iy + 1, j)]
            };
        }
        for x in 0..w {
            let (ix, tx) = interp_axis(&centers_x, x as f64);
            surface[y * w + x] = if centers_x.len() == 1 {
                row[0]
            } else {
                (1.0 - tx) * row[ix] + tx * row[ix + 1]
            };
        }
    }
    surface
}

/// Shrink the nominal tile so both axes carry at least a 2x2 grid.
fn effective_tile(dim: usize, tile: usize) -> usize {
    tile.min(2 * dim / 3).max(1)
}

/// Window starts at 50% overlap, final window clipped against the far edge.
fn tile_starts(dim: usize, tile: usize) -> Vec<usize> {
    let stride = (tile / 2).max(1);
    let mut starts = Vec::new();
    let mut s = 0;
    while s + tile <= dim {
        starts.push(s);
        s += stride;
    }
    let last = dim.saturating_sub(tile);
    if starts.last() != Some(&last) {
        starts.push(last);
    }
    starts
}

/// Median with even-count averaging. Mutates the slice; `None` when empty.
fn median_f32(values: &mut [f32]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mid = values.len() / 2;
    values.select_nth_unstable_by(mid, |a, b| a.partial_cmp(b).expect("finite medians"));
    let upper = values[mid] as f64;
    if values.len() % 2 == 1 {
        Some(upper)
    } else {
        let lower = values[..mid]
            .iter()
            .fold(f32::NEG_INFINITY, |acc, &v| acc.max(v)) as f64;
        Some((lower + upper) / 2.0)
    }
}

/// Segment index and interpolation weight along one axis; weights outside
/// `[0, 1]` extrapolate linearly past the outer centres.
fn interp_axis(centers: &[f64], coord: f64) -> (usize, f64) {
    if centers.len() < 2 {
        return (0, 0.0);
    }
    let mut i = match centers.binary_search_by(|c| c.partial_cmp(&coord).expect("finite centers")) {
        Ok(i) => i,
        Err(i) => i.saturating_sub(1),
    };
    i = i.min(centers.len() - 2);
    let t = (coord - centers[i]) / (centers[i + 1] - centers[i]);
    (i, t)
}
