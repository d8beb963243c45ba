//! Per-stage parameters and the run configuration. Defaults live here, not
//! scattered through the stages; everything round-trips through serde so the
//! manifest can record the exact parameter set of a run.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};
use crate::source::TimeUnits;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SegmentParams {
    /// Half-size of the local variance window (1 gives a 3x3 window).
    pub window_halfsize: usize,
    /// Bins of the log-variance histogram the threshold is derived from.
    pub hist_bins: usize,
    /// Side of the square structuring element for opening/closing.
    pub struct_side: usize,
    /// Opening/closing repetitions.
    pub morph_iterations: usize,
}

impl Default for SegmentParams {
    fn default() -> Self {
        SegmentParams {
            window_halfsize: 1,
            hist_bins: 200,
            struct_side: 7,
            morph_iterations: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackgroundParams {
    /// Radius of the mask dilation that keeps cell halos out of the
    /// background estimate.
    pub dilate_radius: usize,
    pub tile_height: usize,
    pub tile_width: usize,
}

impl Default for BackgroundParams {
    fn default() -> Self {
        BackgroundParams {
            dilate_radius: 10,
            tile_height: 256,
            tile_width: 256,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackParams {
    /// Regions below/above these pixel counts are ignored entirely.
    pub min_region_size: Option<usize>,
    pub max_region_size: Option<usize>,
    /// Bounding-box IoU below this never links two regions.
    pub min_iou: f64,
    /// Traces covering fewer frames than this are discarded.
    pub min_trace_length: usize,
    /// Open a new trace for every unmatched region after frame 0. Off by
    /// default: traces originate in frame 0 only.
    pub track_new_cells: bool,
}

impl Default for TrackParams {
    fn default() -> Self {
        TrackParams {
            min_region_size: None,
            max_region_size: None,
            min_iou: 0.1,
            min_trace_length: 30,
            track_new_cells: false,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StageParams {
    pub segment: SegmentParams,
    pub background: BackgroundParams,
    pub track: TrackParams,
}

/// Which acquisition channels feed the pipeline: exactly one phase-contrast
/// channel and an ordered set of fluorescence channels.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelSelection {
    pub pc: usize,
    pub fl: Vec<usize>,
}

impl ChannelSelection {
    pub fn validate(&self, n_channels: usize) -> Result<()> {
        if self.pc >= n_channels {
            return Err(PipelineError::Config(format!(
                "phase-contrast channel {} out of range (acquisition has {n_channels})",
                self.pc
            )));
        }
        for &k in &self.fl {
            if k >= n_channels {
                return Err(PipelineError::Config(format!(
                    "fluorescence channel {k} out of range (acquisition has {n_channels})"
                )));
            }
            if k == self.pc {
                return Err(PipelineError::Config(format!(
                    "channel {k} selected as both phase contrast and fluorescence"
                )));
            }
        }
        let mut seen = std::collections::HashSet::new();
        for &k in &self.fl {
            if !seen.insert(k) {
                return Err(PipelineError::Config(format!(
                    "fluorescence channel {k} selected twice"
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct RunConfig {
    pub source: PathBuf,
    pub out_dir: PathBuf,
    pub selection: ChannelSelection,
    /// Inclusive FOV range; `fov_end = None` means the last FOV.
    pub fov_start: usize,
    pub fov_end: Option<usize>,
    pub batch_size: usize,
    pub n_workers: usize,
    pub params: StageParams,
    /// Overrides the unit recorded with sidecar timepoints.
    pub time_units: Option<TimeUnits>,
    /// Optional `frame,time` sidecar replacing source timepoints.
    pub timepoints_csv: Option<PathBuf>,
    /// Binary spawned for worker processes; defaults to the current
    /// executable.
    pub worker_exe: Option<PathBuf>,
}

impl RunConfig {
    pub fn new(source: PathBuf, out_dir: PathBuf, selection: ChannelSelection) -> RunConfig {
        RunConfig {
            source,
            out_dir,
            selection,
            fov_start: 0,
            fov_end: None,
            batch_size: 4,
            n_workers: 1,
            params: StageParams::default(),
            time_units: None,
            timepoints_csv: None,
            worker_exe: None,
        }
    }

    /// Resolve and validate against acquisition metadata. Returns the
    /// inclusive FOV range to process.
    pub fn resolve(&self, n_fovs: usize, n_channels: usize) -> Result<(usize, usize)> {
        if self.batch_size < 1 {
            return Err(PipelineError::Config("batch size must be at least 1".into()));
        }
        if self.n_workers < 1 {
            return Err(PipelineError::Config("worker count must be at least 1".into()));
        }
        if n_fovs == 0 {
            return Err(PipelineError::Config("acquisition has no fields of view".into()));
        }
        let end = self.fov_end.unwrap_or(n_fovs - 1);
        if self.fov_start >= n_fovs || end >= n_fovs {
            return Err(PipelineError::Config(format!(
                "FOV range {}..={} outside acquisition 0..={}",
                self.fov_start,
                end,
                n_fovs - 1
            )));
        }
        if end < self.fov_start {
            return Err(PipelineError::Config(format!(
                "empty FOV range {}..={}",
                self.fov_start, end
            )));
        }
        self.selection.validate(n_channels)?;
        Ok((self.fov_start, end))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let s = SegmentParams::default();
        assert_eq!(
            (s.window_halfsize, s.hist_bins, s.struct_side, s.morph_iterations),
            (1, 200, 7, 3)
        );
        let b = BackgroundParams::default();
        assert_eq!((b.dilate_radius, b.tile_height, b.tile_width), (10, 256, 256));
        let t = TrackParams::default();
        assert_eq!(t.min_iou, 0.1);
        assert_eq!(t.min_trace_length, 30);
        assert!(!t.track_new_cells);
        assert!(t.min_region_size.is_none() && t.max_region_size.is_none());
    }

    #[test]
    fn selection_rejects_overlap_and_range() {
        let ok = ChannelSelection { pc: 0, fl: vec![1, 2] };
        assert!(ok.validate(3).is_ok());
        let overlap = ChannelSelection { pc: 1, fl: vec![1] };
        assert!(matches!(overlap.validate(3), Err(PipelineError::Config(_))));
        let out = ChannelSelection { pc: 0, fl: vec![5] };
        assert!(matches!(out.validate(3), Err(PipelineError::Config(_))));
        let dup = ChannelSelection { pc: 0, fl: vec![1, 1] };
        assert!(matches!(dup.validate(3), Err(PipelineError::Config(_))));
    }

    #[test]
    fn resolve_defaults_open_end_to_last_fov() {
        let mut cfg = RunConfig::new(
            PathBuf::from("in"),
            PathBuf::from("out"),
            ChannelSelection { pc: 0, fl: vec![1] },
        );
        assert_eq!(cfg.resolve(10, 2).unwrap(), (0, 9));
        cfg.fov_start = 3;
        cfg.fov_end = Some(7);
        assert_eq!(cfg.resolve(10, 2).unwrap(), (3, 7));
        cfg.fov_end = Some(12);
        assert!(matches!(cfg.resolve(10, 2), Err(PipelineError::Config(_))));
        cfg.fov_end = Some(2);
        assert!(matches!(cfg.resolve(10, 2), Err(PipelineError::Config(_))));
    }
}
