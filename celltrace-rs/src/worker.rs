//! Per-process stage driver.
//!
//! A worker owns a contiguous FOV range and runs segmentation, background
//! correction, tracking and measurement for each FOV in order, resuming
//! over any complete artifact already on disk. Panics and errors are
//! contained at the FOV boundary; the worker itself always reports an
//! outcome for every FOV it owns.

use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::arr::{self, ArrReader, DType};
use crate::background::correct_fov;
use crate::config::{ChannelSelection, StageParams};
use crate::error::{PipelineError, Result};
use crate::manifest::{
    fl_corrected_path, fl_path, pc_path, seg_labeled_path, seg_path, traces_path, FovEntry,
    FovStatus,
};
use crate::measure::{csv_is_valid, measure_fov};
use crate::progress::{CancelToken, ProgressMsg, ProgressOut, StageCtx, CANCEL_MARKER};
use crate::segment::segment_fov;
use crate::source::AcquisitionMetadata;
use crate::track::track_fov;

/// Everything a worker process needs, serialized to a JSON file by the
/// coordinator and passed by path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerSpec {
    pub out_dir: PathBuf,
    pub meta: AcquisitionMetadata,
    pub selection: ChannelSelection,
    pub params: StageParams,
    /// Inclusive FOV range owned by this worker.
    pub fov_start: usize,
    pub fov_end: usize,
    /// FOVs inside the range that already reached a terminal state in the
    /// coordinator (extraction failed or cancelled).
    #[serde(default)]
    pub skip: Vec<usize>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct WorkerOutcome {
    pub fovs: BTreeMap<usize, FovEntry>,
}

/// One stdout line of a worker process: either a progress message or the
/// final outcome. Anything that parses as neither is dropped by the
/// coordinator.
#[derive(Serialize, Deserialize)]
#[serde(untagged)]
pub enum WorkerLine {
    Progress(ProgressMsg),
    Outcome { worker_outcome: WorkerOutcome },
}

pub fn run_worker(spec: &WorkerSpec, out: &ProgressOut, cancel: &CancelToken) -> WorkerOutcome {
    let mut outcome = WorkerOutcome::default();
    for fov in spec.fov_start..=spec.fov_end {
        if spec.skip.contains(&fov) {
            continue;
        }
        let entry = if cancel.is_cancelled() {
            FovEntry {
                status: FovStatus::Cancelled,
                ..FovEntry::default()
            }
        } else {
            process_fov(spec, fov, out, cancel)
        };
        let text = match &entry.status {
            FovStatus::Done => "done".to_string(),
            FovStatus::Cancelled => "cancelled".to_string(),
            FovStatus::Failed { stage, reason } => format!("failed at {stage}: {reason}"),
            other => format!("{other:?}"),
        };
        out.send(ProgressMsg::event("status", fov, text));
        outcome.fovs.insert(fov, entry);
    }
    outcome
}

fn process_fov(spec: &WorkerSpec, fov: usize, out: &ProgressOut, cancel: &CancelToken) -> FovEntry {
    let mut entry = FovEntry::default();
    entry.status = FovStatus::Extracted;
    match run_stages(spec, fov, &mut entry, out, cancel) {
        Ok(()) => entry.status = FovStatus::Done,
        Err((_, PipelineError::Cancelled)) => entry.status = FovStatus::Cancelled,
        Err((stage, err)) => {
            tracing::error!(fov, stage, error = %err, "FOV failed");
            entry.status = FovStatus::Failed {
                stage: stage.to_string(),
                reason: err.to_string(),
            };
        }
    }
    entry
}

/// Contain both errors and panics of a stage closure.
fn guard<T>(
    stage: &'static str,
    f: impl FnOnce() -> Result<T>,
) -> std::result::Result<T, (&'static str, PipelineError)> {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(v)) => Ok(v),
        Ok(Err(e)) => Err((stage, e)),
        Err(panic) => {
            let text = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "panic".to_string());
            Err((stage, PipelineError::Unexpected(text)))
        }
    }
}

fn run_stages(
    spec: &WorkerSpec,
    fov: usize,
    entry: &mut FovEntry,
    out: &ProgressOut,
    cancel: &CancelToken,
) -> std::result::Result<(), (&'static str, PipelineError)> {
    let meta = &spec.meta;
    let base = &meta.base_name;
    let out_dir = &spec.out_dir;
    let shape = (meta.n_frames, meta.height, meta.width);
    let ctx = |stage: &'static str| StageCtx {
        out,
        cancel,
        stage,
        fov,
        frame_total: meta.n_frames,
    };

    let pc = pc_path(out_dir, base, fov);
    if pc.is_file() {
        entry.pc = Some(pc.clone());
    }
    for &k in &spec.selection.fl {
        let fl = fl_path(out_dir, base, fov, k);
        if fl.is_file() {
            FovEntry::set_channel_path(&mut entry.fl, k, fl);
        }
    }

    // segmentation
    let seg_file = seg_path(out_dir, base, fov);
    let seg = guard("segment", || {
        if let Some(reader) = arr::open_expecting(&seg_file, shape, DType::Bool) {
            tracing::debug!(fov, "reusing segmentation");
            return Ok(reader);
        }
        let pc_reader = ArrReader::open(&pc)?;
        segment_fov(&pc_reader, &seg_file, &spec.params.segment, &ctx("segment"))?;
        ArrReader::open(&seg_file)
    })?;
    entry.seg = Some(seg_file.clone());
    entry.status = FovStatus::Segmented;

    // background correction, one file per fluorescence channel
    for &k in &spec.selection.fl {
        let corrected_file = fl_corrected_path(out_dir, base, fov, k);
        guard("correct", || {
            if arr::open_expecting(&corrected_file, shape, DType::F32).is_some() {
                tracing::debug!(fov, channel = k, "reusing corrected fluorescence");
                return Ok(());
            }
            let fl_reader = ArrReader::open(&fl_path(out_dir, base, fov, k))?;
            correct_fov(
                &fl_reader,
                &seg,
                &corrected_file,
                &spec.params.background,
                &ctx("correct"),
            )?;
            Ok(())
        })?;
        FovEntry::set_channel_path(&mut entry.fl_corrected, k, corrected_file);
    }
    entry.status = FovStatus::Corrected;

    // tracking
    let labeled_file = seg_labeled_path(out_dir, base, fov);
    let labeled = guard("track", || {
        if let Some(reader) = arr::open_expecting(&labeled_file, shape, DType::U16) {
            tracing::debug!(fov, "reusing labeled segmentation");
            return Ok(reader);
        }
        track_fov(&seg, &labeled_file, &spec.params.track, &ctx("track"))?;
        ArrReader::open(&labeled_file)
    })?;
    entry.seg_labeled = Some(labeled_file);
    entry.status = FovStatus::Tracked;

    // measurement, preferring corrected fluorescence
    for &k in &spec.selection.fl {
        let csv_file = traces_path(out_dir, base, fov, k);
        guard("measure", || {
            if csv_is_valid(&csv_file) {
                tracing::debug!(fov, channel = k, "reusing traces");
                return Ok(());
            }
            let corrected = fl_corrected_path(out_dir, base, fov, k);
            let intensity = match arr::open_expecting(&corrected, shape, DType::F32) {
                Some(reader) => reader,
                None => ArrReader::open(&fl_path(out_dir, base, fov, k))?,
            };
            measure_fov(
                &labeled,
                &intensity,
                fov,
                &meta.timepoints,
                &csv_file,
                spec.params.track.min_trace_length,
                &ctx("measure"),
            )?;
            Ok(())
        })?;
        FovEntry::set_channel_path(&mut entry.traces, k, csv_file);
    }
    entry.status = FovStatus::Measured;

    Ok(())
}

/// Entry point of the `worker` subcommand: load the spec, run, and print
/// the outcome as the final stdout line.
pub fn worker_main(spec_path: &Path) -> Result<()> {
    let text = std::fs::read_to_string(spec_path)?;
    let spec: WorkerSpec = serde_json::from_str(&text)?;
    let out = ProgressOut::Stdout;
    let cancel = CancelToken::with_marker(spec.out_dir.join(CANCEL_MARKER));
    let outcome = run_worker(&spec, &out, &cancel);
    let line = serde_json::to_string(&WorkerLine::Outcome {
        worker_outcome: outcome,
    })?;
    println!("{line}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arr::ArrWriter;
    use crate::config::TrackParams;
    use crate::manifest::fov_dir;

    fn disk(h: usize, w: usize, cy: f64, cx: f64, r: f64) -> Vec<bool> {
        let mut mask = vec![false; h * w];
        for y in 0..h {
            for x in 0..w {
                let dy = y as f64 - cy;
                let dx = x as f64 - cx;
                if (dy * dy + dx * dx).sqrt() <= r {
                    mask[y * w + x] = true;
                }
            }
        }
        mask
    }

    /// Write a synthetic extracted FOV (pc + one fluorescence channel).
    fn seed_fov(out_dir: &Path, meta: &AcquisitionMetadata, fov: usize) {
        let dir = fov_dir(out_dir, fov);
        std::fs::create_dir_all(&dir).unwrap();
        let (h, w) = (meta.height, meta.width);
        let shape = (meta.n_frames, h, w);
        let blob = disk(h, w, 32.0, 32.0, 8.0);

        let mut pc = ArrWriter::create(&pc_path(out_dir, &meta.base_name, fov), shape, DType::U16)
            .unwrap();
        let mut fl =
            ArrWriter::create(&fl_path(out_dir, &meta.base_name, fov, 1), shape, DType::U16)
                .unwrap();
        for t in 0..meta.n_frames {
            let pc_frame: Vec<u16> = blob.iter().map(|&m| if m { 3000 } else { 100 }).collect();
            let fl_frame: Vec<u16> = blob
                .iter()
                .enumerate()
                .map(|(i, &m)| {
                    let x = (i % w) as u16;
                    if m {
                        2000 + x
                    } else {
                        200 + x
                    }
                })
                .collect();
            pc.write_frame_u16(t, &pc_frame).unwrap();
            fl.write_frame_u16(t, &fl_frame).unwrap();
        }
        pc.finish().unwrap();
        fl.finish().unwrap();
    }

    fn spec_for(out_dir: &Path, n_frames: usize) -> WorkerSpec {
        let meta = AcquisitionMetadata {
            base_name: "exp".into(),
            n_fovs: 1,
            n_frames,
            n_channels: 2,
            height: 64,
            width: 64,
            dtype: DType::U16,
            channel_names: vec!["ch0".into(), "ch1".into()],
            timepoints: (0..n_frames).map(|t| t as f64).collect(),
            time_units: crate::source::TimeUnits::Frames,
        };
        WorkerSpec {
            out_dir: out_dir.to_path_buf(),
            meta,
            selection: ChannelSelection { pc: 0, fl: vec![1] },
            params: StageParams {
                track: TrackParams {
                    min_trace_length: 10,
                    ..TrackParams::default()
                },
                ..StageParams::default()
            },
            fov_start: 0,
            fov_end: 0,
            skip: vec![],
        }
    }

    #[test]
    fn runs_all_stages_to_done() {
        let dir = tempfile::tempdir().unwrap();
        let spec = spec_for(dir.path(), 30);
        seed_fov(dir.path(), &spec.meta, 0);
        let (tx, rx) = crossbeam_channel::unbounded();
        let out = ProgressOut::Channel(tx);
        let cancel = CancelToken::new();
        let outcome = run_worker(&spec, &out, &cancel);
        let entry = &outcome.fovs[&0];
        assert_eq!(entry.status, FovStatus::Done);
        assert!(entry.seg.as_ref().unwrap().is_file());
        assert!(entry.seg_labeled.as_ref().unwrap().is_file());
        assert!(entry.fl_corrected[0].1.is_file());
        assert!(entry.traces[0].1.is_file());
        // one terminal status event was sent
        let events: Vec<ProgressMsg> = rx.try_iter().collect();
        assert!(events.iter().any(|m| m.stage == "status" && m.text == "done"));
    }

    #[test]
    fn missing_artifact_fails_the_fov_only() {
        let dir = tempfile::tempdir().unwrap();
        let spec = WorkerSpec {
            fov_end: 1,
            ..spec_for(dir.path(), 30)
        };
        // only FOV 1 gets data; FOV 0 has nothing on disk
        seed_fov(dir.path(), &spec.meta, 1);
        let (tx, _rx) = crossbeam_channel::unbounded();
        let out = ProgressOut::Channel(tx);
        let cancel = CancelToken::new();
        let outcome = run_worker(&spec, &out, &cancel);
        match &outcome.fovs[&0].status {
            FovStatus::Failed { stage, .. } => assert_eq!(stage, "segment"),
            other => panic!("expected Failed, got {other:?}"),
        }
        assert_eq!(outcome.fovs[&1].status, FovStatus::Done);
    }

    #[test]
    fn cancelled_before_start_marks_all_fovs() {
        let dir = tempfile::tempdir().unwrap();
        let spec = WorkerSpec {
            fov_end: 2,
            skip: vec![1],
            ..spec_for(dir.path(), 30)
        };
        let (tx, _rx) = crossbeam_channel::unbounded();
        let out = ProgressOut::Channel(tx);
        let cancel = CancelToken::new();
        cancel.cancel();
        let outcome = run_worker(&spec, &out, &cancel);
        assert_eq!(outcome.fovs.len(), 2);
        assert_eq!(outcome.fovs[&0].status, FovStatus::Cancelled);
        assert!(!outcome.fovs.contains_key(&1));
        assert_eq!(outcome.fovs[&2].status, FovStatus::Cancelled);
    }

    #[test]
    fn resume_reuses_stage_outputs() {
        let dir = tempfile::tempdir().unwrap();
        let spec = spec_for(dir.path(), 30);
        seed_fov(dir.path(), &spec.meta, 0);
        let (tx, _rx) = crossbeam_channel::unbounded();
        let out = ProgressOut::Channel(tx);
        let cancel = CancelToken::new();
        run_worker(&spec, &out, &cancel);

        let seg_file = seg_path(dir.path(), "exp", 0);
        let before = std::fs::metadata(&seg_file).unwrap().modified().unwrap();
        let csv_file = traces_path(dir.path(), "exp", 0, 1);
        let csv_before = std::fs::read_to_string(&csv_file).unwrap();
        // delete the traces, keep everything else
        std::fs::remove_file(&csv_file).unwrap();

        let outcome = run_worker(&spec, &out, &cancel);
        assert_eq!(outcome.fovs[&0].status, FovStatus::Done);
        let after = std::fs::metadata(&seg_file).unwrap().modified().unwrap();
        assert_eq!(before, after, "segmentation was recomputed");
        let csv_after = std::fs::read_to_string(&csv_file).unwrap();
        assert_eq!(csv_before, csv_after, "traces differ after resume");
    }

    #[test]
    fn worker_line_parsing() {
        let progress = serde_json::to_string(&ProgressMsg::frame_tick("segment", 0, 30, 100)).unwrap();
        assert!(matches!(
            serde_json::from_str::<WorkerLine>(&progress).unwrap(),
            WorkerLine::Progress(_)
        ));
        let outcome = serde_json::to_string(&WorkerLine::Outcome {
            worker_outcome: WorkerOutcome::default(),
        })
        .unwrap();
        assert!(matches!(
            serde_json::from_str::<WorkerLine>(&outcome).unwrap(),
            WorkerLine::Outcome { .. }
        ));
        assert!(serde_json::from_str::<WorkerLine>("{\"garbage\": 1}").is_err());
    }
}
