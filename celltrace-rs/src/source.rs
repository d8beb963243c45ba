//! Acquisition sources. The pipeline reads frames through the [`Source`]
//! enum and never sees the container format; each process opens its own
//! handle, handles are never shared.
//!
//! Two containers are supported:
//!   - ND2 files (`.nd2`), read through nd2-rs.
//!   - TIFF folders: one `Pos{N}` directory per FOV holding
//!     `img_channel{CCC}_position{PPP}_time{TTTTTTTTT}_z{ZZZ}.tif` frames,
//!     with an optional `timepoints.csv` sidecar (`frame,time` header).

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use nd2_rs::Nd2File;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::arr::DType;
use crate::error::{PipelineError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeUnits {
    Seconds,
    Minutes,
    Hours,
    Frames,
}

impl TimeUnits {
    pub fn name(self) -> &'static str {
        match self {
            TimeUnits::Seconds => "seconds",
            TimeUnits::Minutes => "minutes",
            TimeUnits::Hours => "hours",
            TimeUnits::Frames => "frames",
        }
    }
}

impl FromStr for TimeUnits {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<TimeUnits, String> {
        match s.to_ascii_lowercase().as_str() {
            "seconds" | "s" => Ok(TimeUnits::Seconds),
            "minutes" | "m" => Ok(TimeUnits::Minutes),
            "hours" | "h" => Ok(TimeUnits::Hours),
            "frames" => Ok(TimeUnits::Frames),
            other => Err(format!("unknown time unit {other:?}")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcquisitionMetadata {
    pub base_name: String,
    pub n_fovs: usize,
    pub n_frames: usize,
    pub n_channels: usize,
    pub height: usize,
    pub width: usize,
    pub dtype: DType,
    pub channel_names: Vec<String>,
    /// One entry per frame, monotonically non-decreasing, in `time_units`.
    pub timepoints: Vec<f64>,
    pub time_units: TimeUnits,
}

impl AcquisitionMetadata {
    pub fn frame_shape(&self) -> (usize, usize) {
        (self.height, self.width)
    }

    /// Replace the timepoint axis (sidecar override). Length and
    /// monotonicity are validated.
    pub fn set_timepoints(&mut self, timepoints: Vec<f64>, units: TimeUnits) -> Result<()> {
        if timepoints.len() != self.n_frames {
            return Err(PipelineError::Config(format!(
                "{} timepoints supplied for {} frames",
                timepoints.len(),
                self.n_frames
            )));
        }
        check_monotonic(&timepoints)?;
        self.timepoints = timepoints;
        self.time_units = units;
        Ok(())
    }
}

fn check_monotonic(timepoints: &[f64]) -> Result<()> {
    for pair in timepoints.windows(2) {
        if !(pair[1] >= pair[0]) {
            return Err(PipelineError::Config(format!(
                "timepoints not monotonically non-decreasing ({} after {})",
                pair[1], pair[0]
            )));
        }
    }
    if timepoints.iter().any(|t| !t.is_finite()) {
        return Err(PipelineError::Config("non-finite timepoint".into()));
    }
    Ok(())
}

fn synthesized_timepoints(n_frames: usize) -> Vec<f64> {
    (0..n_frames).map(|t| t as f64).collect()
}

fn synthesized_channel_names(n_channels: usize) -> Vec<String> {
    (0..n_channels).map(|c| format!("ch{c}")).collect()
}

/// `frame,time` sidecar. Rows must cover frames 0..n in order.
pub fn load_timepoints_csv(path: &Path) -> Result<Vec<f64>> {
    let text = fs::read_to_string(path)?;
    let mut lines = text.lines();
    let header = lines
        .next()
        .ok_or_else(|| PipelineError::Config(format!("{}: empty file", path.display())))?;
    let cols: Vec<&str> = header.split(',').map(|c| c.trim()).collect();
    if cols.len() < 2 || cols[0] != "frame" || cols[1] != "time" {
        return Err(PipelineError::Config(format!(
            "{}: expected 'frame,time' header, found {header:?}",
            path.display()
        )));
    }
    let mut out = Vec::new();
    for (i, line) in lines.enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let parts: Vec<&str> = line.split(',').collect();
        let frame: usize = parts[0]
            .trim()
            .parse()
            .map_err(|_| PipelineError::Config(format!("{}: bad frame {:?}", path.display(), parts[0])))?;
        if frame != i {
            return Err(PipelineError::Config(format!(
                "{}: frames must be dense and ordered (row {i} has frame {frame})",
                path.display()
            )));
        }
        let time: f64 = parts
            .get(1)
            .map(|p| p.trim())
            .and_then(|p| p.parse().ok())
            .ok_or_else(|| {
                PipelineError::Config(format!("{}: bad time on row {i}", path.display()))
            })?;
        out.push(time);
    }
    check_monotonic(&out)?;
    Ok(out)
}

// ---------------------------------------------------------------------------
// Source dispatch
// ---------------------------------------------------------------------------

pub enum Source {
    Nd2(Nd2Source),
    TiffFolder(TiffFolderSource),
}

impl Source {
    /// Pick a variant by path shape: an `.nd2` file, or a directory holding
    /// `Pos*` subdirectories.
    pub fn open(path: &Path) -> Result<Source> {
        if path.is_file() {
            let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
            if ext.eq_ignore_ascii_case("nd2") {
                return Ok(Source::Nd2(Nd2Source::open(path)?));
            }
            return Err(PipelineError::UnsupportedFormat(format!(
                "{}: not an .nd2 file",
                path.display()
            )));
        }
        if path.is_dir() {
            return Ok(Source::TiffFolder(TiffFolderSource::open(path)?));
        }
        Err(PipelineError::UnsupportedFormat(format!(
            "{}: no such file or directory",
            path.display()
        )))
    }

    pub fn metadata(&mut self) -> Result<AcquisitionMetadata> {
        match self {
            Source::Nd2(s) => s.metadata(),
            Source::TiffFolder(s) => s.metadata(),
        }
    }

    pub fn read_frame(&mut self, fov: usize, frame: usize, channel: usize) -> Result<Vec<u16>> {
        match self {
            Source::Nd2(s) => s.read_frame(fov, frame, channel),
            Source::TiffFolder(s) => s.read_frame(fov, frame, channel),
        }
    }
}

// ---------------------------------------------------------------------------
// ND2
// ---------------------------------------------------------------------------

pub struct Nd2Source {
    file: Nd2File,
    base_name: String,
}

impl Nd2Source {
    pub fn open(path: &Path) -> Result<Nd2Source> {
        let path_str = path
            .to_str()
            .ok_or_else(|| PipelineError::UnsupportedFormat("non-UTF-8 path".into()))?;
        let file = Nd2File::open(path_str)
            .map_err(|e| PipelineError::UnsupportedFormat(format!("{path_str}: {e}")))?;
        let base_name = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("acquisition")
            .to_string();
        Ok(Nd2Source { file, base_name })
    }

    pub fn metadata(&mut self) -> Result<AcquisitionMetadata> {
        let sizes = self
            .file
            .sizes()
            .map_err(|e| PipelineError::UnsupportedFormat(format!("ND2 sizes: {e}")))?;
        let n_fovs = *sizes.get("P").unwrap_or(&1);
        let n_frames = *sizes.get("T").unwrap_or(&1);
        let n_channels = *sizes.get("C").unwrap_or(&1);
        let height = *sizes.get("Y").unwrap_or(&1);
        let width = *sizes.get("X").unwrap_or(&1);
        Ok(AcquisitionMetadata {
            base_name: self.base_name.clone(),
            n_fovs,
            n_frames,
            n_channels,
            height,
            width,
            dtype: DType::U16,
            channel_names: synthesized_channel_names(n_channels),
            timepoints: synthesized_timepoints(n_frames),
            time_units: TimeUnits::Frames,
        })
    }

    pub fn read_frame(&mut self, fov: usize, frame: usize, channel: usize) -> Result<Vec<u16>> {
        self.file
            .read_frame_2d(fov, frame, channel, 0)
            .map_err(|e| PipelineError::Read {
                fov,
                channel,
                frame,
                message: e.to_string(),
            })
    }
}

// ---------------------------------------------------------------------------
// TIFF folder
// ---------------------------------------------------------------------------

const TIFF_RE: &str = r"^img_channel(\d+)_position(\d+)_time(\d+)_z(\d+)\.tif$";
const POS_RE: &str = r"^Pos(\d+)$";

pub struct TiffFolderSource {
    root: PathBuf,
    /// FOV index -> position directory, numerically ordered.
    pos_dirs: Vec<PathBuf>,
    meta: AcquisitionMetadata,
    /// Lazily built per-FOV `(channel, frame) -> path` indexes.
    indexes: HashMap<usize, HashMap<(usize, usize), PathBuf>>,
}

impl TiffFolderSource {
    pub fn open(root: &Path) -> Result<TiffFolderSource> {
        let pos_re = Regex::new(POS_RE).expect("position regex");
        let mut positions: Vec<(u32, PathBuf)> = Vec::new();
        for entry in fs::read_dir(root)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if let Some(cap) = pos_re.captures(&name) {
                let n: u32 = cap[1].parse().map_err(|_| {
                    PipelineError::UnsupportedFormat(format!("bad position directory {name}"))
                })?;
                positions.push((n, entry.path()));
            }
        }
        if positions.is_empty() {
            return Err(PipelineError::UnsupportedFormat(format!(
                "{}: no Pos* directories",
                root.display()
            )));
        }
        positions.sort();
        let pos_dirs: Vec<PathBuf> = positions.into_iter().map(|(_, p)| p).collect();

        let first_index = index_frames(&pos_dirs[0])?;
        let n_frames = 1 + first_index.keys().map(|&(_, t)| t).max().unwrap_or(0);
        let n_channels = 1 + first_index.keys().map(|&(c, _)| c).max().unwrap_or(0);
        if first_index.len() != n_frames * n_channels {
            return Err(PipelineError::UnsupportedFormat(format!(
                "{}: sparse frame grid ({} files for {n_frames}x{n_channels})",
                pos_dirs[0].display(),
                first_index.len()
            )));
        }
        let probe = first_index
            .get(&(0, 0))
            .ok_or_else(|| PipelineError::UnsupportedFormat("missing frame (0, 0)".into()))?;
        let (_, width, height) = decode_tiff(probe, 0, 0, 0)?;

        let base_name = root
            .file_name()
            .and_then(|s| s.to_str())
            .unwrap_or("acquisition")
            .to_string();
        let n_fovs = pos_dirs.len();

        let sidecar = root.join("timepoints.csv");
        let (timepoints, time_units) = if sidecar.is_file() {
            (load_timepoints_csv(&sidecar)?, TimeUnits::Seconds)
        } else {
            (synthesized_timepoints(n_frames), TimeUnits::Frames)
        };
        if timepoints.len() != n_frames {
            return Err(PipelineError::Config(format!(
                "{}: {} timepoints for {n_frames} frames",
                sidecar.display(),
                timepoints.len()
            )));
        }

        let meta = AcquisitionMetadata {
            base_name,
            n_fovs,
            n_frames,
            n_channels,
            height: height as usize,
            width: width as usize,
            dtype: DType::U16,
            channel_names: synthesized_channel_names(n_channels),
            timepoints,
            time_units,
        };
        let mut indexes = HashMap::new();
        indexes.insert(0, first_index);
        Ok(TiffFolderSource {
            root: root.to_path_buf(),
            pos_dirs,
            meta,
            indexes,
        })
    }

    pub fn metadata(&mut self) -> Result<AcquisitionMetadata> {
        Ok(self.meta.clone())
    }

    pub fn read_frame(&mut self, fov: usize, frame: usize, channel: usize) -> Result<Vec<u16>> {
        let read_err = |message: String| PipelineError::Read {
            fov,
            channel,
            frame,
            message,
        };
        if fov >= self.pos_dirs.len() {
            return Err(read_err(format!("FOV {fov} out of range")));
        }
        if !self.indexes.contains_key(&fov) {
            let index = index_frames(&self.pos_dirs[fov])?;
            if index.len() != self.meta.n_frames * self.meta.n_channels {
                return Err(read_err(format!(
                    "{}: frame grid disagrees with {}",
                    self.pos_dirs[fov].display(),
                    self.root.display()
                )));
            }
            self.indexes.insert(fov, index);
        }
        let path = self.indexes[&fov]
            .get(&(channel, frame))
            .ok_or_else(|| read_err("missing frame file".into()))?;
        let (data, width, height) = decode_tiff(path, fov, frame, channel)?;
        if (height as usize, width as usize) != (self.meta.height, self.meta.width) {
            return Err(read_err(format!(
                "{}: frame is {width}x{height}, acquisition is {}x{}",
                path.display(),
                self.meta.width,
                self.meta.height
            )));
        }
        Ok(data)
    }
}

/// Scan one position directory into a `(channel, frame) -> path` map.
/// Only z = 0 planes participate.
fn index_frames(pos_dir: &Path) -> Result<HashMap<(usize, usize), PathBuf>> {
    let re = Regex::new(TIFF_RE).expect("frame regex");
    let mut index = HashMap::new();
    for entry in fs::read_dir(pos_dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let name = entry.file_name();
        let name = name.to_string_lossy();
        let cap = match re.captures(&name) {
            Some(c) => c,
            None => continue,
        };
        let c: usize = cap[1].parse().unwrap_or(usize::MAX);
        let t: usize = cap[3].parse().unwrap_or(usize::MAX);
        let z: usize = cap[4].parse().unwrap_or(usize::MAX);
        if z != 0 {
            continue;
        }
        index.insert((c, t), entry.path());
    }
    Ok(index)
}

fn decode_tiff(path: &Path, fov: usize, frame: usize, channel: usize) -> Result<(Vec<u16>, u32, u32)> {
    let read_err = |message: String| PipelineError::Read {
        fov,
        channel,
        frame,
        message,
    };
    let file = fs::File::open(path).map_err(|e| read_err(format!("{}: {e}", path.display())))?;
    let mut decoder = tiff::decoder::Decoder::new(file)
        .map_err(|e| read_err(format!("{}: {e}", path.display())))?;
    let (width, height) = decoder
        .dimensions()
        .map_err(|e| read_err(format!("{}: {e}", path.display())))?;
    let result = decoder
        .read_image()
        .map_err(|e| read_err(format!("{}: {e}", path.display())))?;
    let data = match result {
        tiff::decoder::DecodingResult::U16(v) => v,
        tiff::decoder::DecodingResult::U8(v) => v.iter().map(|&b| b as u16).collect(),
        _ => {
            return Err(read_err(format!(
                "{}: unsupported TIFF pixel format (need u8 or u16)",
                path.display()
            )))
        }
    };
    Ok((data, width, height))
}
