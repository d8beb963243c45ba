//! Per-cell measurements over the labeled mask.
//!
//! One pass per frame accumulates area, total intensity and bounding box
//! for every label present, then cells with fewer rows than the trace
//! length floor are dropped and the rest is written as one CSV per
//! fluorescence channel. Position is the bounding-box centre, not the
//! centroid of mass.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::arr::ArrReader;
use crate::error::{PipelineError, Result};
use crate::progress::StageCtx;

pub const TRACE_HEADER: [&str; 9] = [
    "fov",
    "cell",
    "frame",
    "time",
    "good",
    "position_x",
    "position_y",
    "area",
    "intensity_total",
];

#[derive(Debug, Clone)]
struct Row {
    cell: u16,
    frame: usize,
    time: f64,
    good: bool,
    position_x: f64,
    position_y: f64,
    area: usize,
    intensity_total: f64,
}

#[derive(Debug, Default)]
struct Acc {
    area: usize,
    sum: f64,
    r0: usize,
    r1: usize,
    c0: usize,
    c1: usize,
}

pub fn measure_fov(
    labeled: &ArrReader,
    intensity: &ArrReader,
    fov: usize,
    timepoints: &[f64],
    out_csv: &Path,
    min_trace_length: usize,
    ctx: &StageCtx,
) -> Result<PathBuf> {
    if labeled.shape() != intensity.shape() {
        return Err(PipelineError::Shape(format!(
            "labeled mask {:?} vs intensity {:?}",
            labeled.shape(),
            intensity.shape()
        )));
    }
    let (n_frames, h, w) = labeled.shape();
    if timepoints.len() != n_frames {
        return Err(PipelineError::Shape(format!(
            "{} timepoints for {n_frames} frames",
            timepoints.len()
        )));
    }

    let mut rows: Vec<Row> = Vec::new();
    for t in 0..n_frames {
        let labels = labeled.read_frame_u16(t)?;
        let values = intensity.read_frame_as_f32(t)?;
        let mut accs: BTreeMap<u16, Acc> = BTreeMap::new();
        for y in 0..h {
            for x in 0..w {
                let lbl = labels[y * w + x];
                if lbl == 0 {
                    continue;
                }
                let acc = accs.entry(lbl).or_insert(Acc {
                    area: 0,
                    sum: 0.0,
                    r0: y,
                    r1: y,
                    c0: x,
                    c1: x,
                });
                acc.area += 1;
                acc.sum += values[y * w + x] as f64;
                acc.r0 = acc.r0.min(y);
                acc.r1 = acc.r1.max(y);
                acc.c0 = acc.c0.min(x);
                acc.c1 = acc.c1.max(x);
            }
        }
        for (cell, acc) in accs {
            rows.push(Row {
                cell,
                frame: t,
                time: timepoints[t],
                good: true,
                position_x: (acc.c0 + acc.c1) as f64 / 2.0,
                position_y: (acc.r0 + acc.r1) as f64 / 2.0,
                area: acc.area,
                intensity_total: acc.sum,
            });
        }
        ctx.tick(t)?;
    }

    // drop cells shorter than the trace floor
    let mut counts: BTreeMap<u16, usize> = BTreeMap::new();
    for row in &rows {
        *counts.entry(row.cell).or_insert(0) += 1;
    }
    rows.retain(|row| counts[&row.cell] >= min_trace_length);
    rows.sort_by_key(|row| (row.cell, row.frame));

    let mut wtr = csv::Writer::from_path(out_csv)?;
    wtr.write_record(TRACE_HEADER)?;
    for row in &rows {
        wtr.write_record([
            fov.to_string(),
            row.cell.to_string(),
            row.frame.to_string(),
            format!("{:.6}", row.time),
            if row.good { "True" } else { "False" }.to_string(),
            row.position_x.to_string(),
            row.position_y.to_string(),
            row.area.to_string(),
            row.intensity_total.to_string(),
        ])?;
    }
    wtr.flush()?;
    Ok(out_csv.to_path_buf())
}

/// Resume check for a trace CSV: present, non-empty, expected header.
pub fn csv_is_valid(path: &Path) -> bool {
    let text = match std::fs::read_to_string(path) {
        Ok(t) => t,
        Err(_) => return false,
    };
    match text.lines().next() {
        Some(header) => header == TRACE_HEADER.join(","),
        None => false,
    }
}
