//! Frame-to-frame cell tracking.
//!
//! Regions are 4-connected components of the segmentation mask. Linking
//! solves a linear sum assignment on bounding-box IoU between consecutive
//! frames; pairs under the IoU floor never link. Traces originate in frame
//! 0 (optionally in later frames, see `TrackParams::track_new_cells`),
//! short traces are discarded, surviving traces get dense ids `1..N` and
//! are rendered into the labeled mask.

use std::collections::HashMap;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use pathfinding::prelude::{kuhn_munkres, Matrix};

use crate::arr::{ArrReader, ArrWriter, DType};
use crate::config::TrackParams;
use crate::error::{PipelineError, Result};
use crate::progress::StageCtx;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BBox {
    pub r0: usize,
    pub c0: usize,
    pub r1: usize,
    pub c1: usize,
}

impl BBox {
    fn area(&self) -> usize {
        (self.r1 - self.r0 + 1) * (self.c1 - self.c0 + 1)
    }

    pub fn iou(&self, other: &BBox) -> f64 {
        let r0 = self.r0.max(other.r0);
        let c0 = self.c0.max(other.c0);
        let r1 = self.r1.min(other.r1);
        let c1 = self.c1.min(other.c1);
        if r1 < r0 || c1 < c0 {
            return 0.0;
        }
        let inter = ((r1 - r0 + 1) * (c1 - c0 + 1)) as f64;
        let union = (self.area() + other.area()) as f64 - inter;
        inter / union
    }

    pub fn center(&self) -> (f64, f64) {
        (
            (self.r0 + self.r1) as f64 / 2.0,
            (self.c0 + self.c1) as f64 / 2.0,
        )
    }
}

#[derive(Debug, Clone)]
pub struct Region {
    /// 1-based label in row-major discovery order.
    pub label: u32,
    pub bbox: BBox,
    pub area: usize,
}

/// 4-connected components. Returns the label image (0 = background) and
/// the regions in discovery order.
pub fn label_regions(mask: &[bool], h: usize, w: usize) -> (Vec<u32>, Vec<Region>) {
    let mut labels = vec![0u32; h * w];
    let mut regions = Vec::new();
    let mut stack: Vec<usize> = Vec::new();
    let mut next_label = 0u32;
    for start in 0..h * w {
        if !mask[start] || labels[start] != 0 {
            continue;
        }
        next_label += 1;
        labels[start] = next_label;
        stack.push(start);
        let mut bbox = BBox {
            r0: start / w,
            c0: start % w,
            r1: start / w,
            c1: start % w,
        };
        let mut area = 0usize;
        while let Some(i) = stack.pop() {
            area += 1;
            let (y, x) = (i / w, i % w);
            bbox.r0 = bbox.r0.min(y);
            bbox.r1 = bbox.r1.max(y);
            bbox.c0 = bbox.c0.min(x);
            bbox.c1 = bbox.c1.max(x);
            let mut visit = |j: usize, stack: &mut Vec<usize>, labels: &mut Vec<u32>| {
                if mask[j] && labels[j] == 0 {
                    labels[j] = next_label;
                    stack.push(j);
                }
            };
            if y > 0 {
                visit(i - w, &mut stack, &mut labels);
            }
            if y + 1 < h {
                visit(i + w, &mut stack, &mut labels);
            }
            if x > 0 {
                visit(i - 1, &mut stack, &mut labels);
            }
            if x + 1 < w {
                visit(i + 1, &mut stack, &mut labels);
            }
        }
        regions.push(Region {
            label: next_label,
            bbox,
            area,
        });
    }
    (labels, regions)
}

fn size_filter(regions: Vec<Region>, params: &TrackParams) -> Vec<Region> {
    regions
        .into_iter()
        .filter(|r| {
            params.min_region_size.map_or(true, |lo| r.area >= lo)
                && params.max_region_size.map_or(true, |hi| r.area <= hi)
        })
        .collect()
}

/// Optimal one-to-one matching between consecutive frames, as index pairs
/// into `prev`/`next`. Pairs whose IoU falls under the floor are dropped
/// after the solve, which is equivalent to forbidding them.
fn match_regions(prev: &[Region], next: &[Region], min_iou: f64) -> Vec<(usize, usize)> {
    if prev.is_empty() || next.is_empty() {
        return Vec::new();
    }
    const SCALE: f64 = 1e6;
    let transpose = prev.len() > next.len();
    let (rows, cols) = if transpose {
        (next.len(), prev.len())
    } else {
        (prev.len(), next.len())
    };
    let mut weights = Matrix::new(rows, cols, 0i64);
    for (i, a) in prev.iter().enumerate() {
        for (j, b) in next.iter().enumerate() {
            let wgt = (a.bbox.iou(&b.bbox) * SCALE).round() as i64;
            if transpose {
                weights[(j, i)] = wgt;
            } else {
                weights[(i, j)] = wgt;
            }
        }
    }
    let (_, assignment) = kuhn_munkres(&weights);
    let mut pairs = Vec::new();
    for (row, &col) in assignment.iter().enumerate() {
        let (i, j) = if transpose { (col, row) } else { (row, col) };
        if prev[i].bbox.iou(&next[j].bbox) >= min_iou {
            pairs.push((i, j));
        }
    }
    pairs.sort_unstable();
    pairs
}

#[derive(Debug, Clone, Default)]
pub struct Trace {
    /// frame index -> region label in that frame.
    pub entries: BTreeMap<usize, u32>,
}

impl Trace {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

pub fn track_fov(
    seg: &ArrReader,
    out_path: &Path,
    params: &TrackParams,
    ctx: &StageCtx,
) -> Result<PathBuf> {
    let (n_frames, h, w) = seg.shape();

    // pass 1: regions and links
    let mut traces: Vec<Trace> = Vec::new();
    let mut prev_regions: Vec<Region> = Vec::new();
    let mut prev_trace: Vec<Option<usize>> = Vec::new();
    for t in 0..n_frames {
        let mask = seg.read_frame_bool(t)?;
        let (_, regions) = label_regions(&mask, h, w);
        let regions = size_filter(regions, params);
        let mut trace_of: Vec<Option<usize>> = vec![None; regions.len()];
        if t == 0 {
            for (j, region) in regions.iter().enumerate() {
                let mut trace = Trace::default();
                trace.entries.insert(0, region.label);
                trace_of[j] = Some(traces.len());
                traces.push(trace);
            }
        } else {
            for (i, j) in match_regions(&prev_regions, &regions, params.min_iou) {
                if let Some(idx) = prev_trace[i] {
                    traces[idx].entries.insert(t, regions[j].label);
                    trace_of[j] = Some(idx);
                }
            }
            if params.track_new_cells {
                for (j, region) in regions.iter().enumerate() {
                    if trace_of[j].is_none() {
                        let mut trace = Trace::default();
                        trace.entries.insert(t, region.label);
                        trace_of[j] = Some(traces.len());
                        traces.push(trace);
                    }
                }
            }
        }
        prev_regions = regions;
        prev_trace = trace_of;
        ctx.tick(t)?;
    }

    // length filter, then dense ids in creation order
    let surviving: Vec<&Trace> = traces
        .iter()
        .filter(|t| t.len() >= params.min_trace_length)
        .collect();
    if surviving.len() > u16::MAX as usize {
        return Err(PipelineError::Unexpected(format!(
            "{} traces exceed the u16 label space",
            surviving.len()
        )));
    }
    let mut frame_maps: Vec<HashMap<u32, u16>> = vec![HashMap::new(); n_frames];
    for (idx, trace) in surviving.iter().enumerate() {
        let id = (idx + 1) as u16;
        for (&frame, &label) in &trace.entries {
            frame_maps[frame].insert(label, id);
        }
    }

    // pass 2: render (connected components are deterministic, so labels
    // from pass 1 are reproduced exactly)
    let mut writer = ArrWriter::create(out_path, (n_frames, h, w), DType::U16)?;
    let mut out_frame = vec![0u16; h * w];
    for t in 0..n_frames {
        ctx.cancel.check()?;
        let mask = seg.read_frame_bool(t)?;
        let (labels, _) = label_regions(&mask, h, w);
        let map = &frame_maps[t];
        for (dst, &lbl) in out_frame.iter_mut().zip(labels.iter()) {
            *dst = if lbl == 0 {
                0
            } else {
                map.get(&lbl).copied().unwrap_or(0)
            };
        }
        writer.write_frame_u16(t, &out_frame)?;
    }
    writer.finish()
}
