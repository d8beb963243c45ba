//! Persisted run manifest (`processing_results.yml`) and the output
//! directory layout. The manifest is the only record that survives a run:
//! acquisition channels, time units, per-FOV artifact paths and terminal
//! statuses, plus a free-form `extra` map.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::config::ChannelSelection;
use crate::error::{PipelineError, Result};
use crate::source::TimeUnits;

pub const MANIFEST_FILE: &str = "processing_results.yml";

// ---------------------------------------------------------------------------
// Layout
// ---------------------------------------------------------------------------

pub fn fov_dir(out_dir: &Path, fov: usize) -> PathBuf {
    out_dir.join(format!("fov_{fov:03}"))
}

pub fn pc_path(out_dir: &Path, base: &str, fov: usize) -> PathBuf {
    fov_dir(out_dir, fov).join(format!("{base}_fov_{fov:03}_pc.arr"))
}

pub fn fl_path(out_dir: &Path, base: &str, fov: usize, channel: usize) -> PathBuf {
    fov_dir(out_dir, fov).join(format!("{base}_fov_{fov:03}_fl_ch_{channel}.arr"))
}

pub fn seg_path(out_dir: &Path, base: &str, fov: usize) -> PathBuf {
    fov_dir(out_dir, fov).join(format!("{base}_fov_{fov:03}_seg.arr"))
}

pub fn seg_labeled_path(out_dir: &Path, base: &str, fov: usize) -> PathBuf {
    fov_dir(out_dir, fov).join(format!("{base}_fov_{fov:03}_seg_labeled.arr"))
}

pub fn fl_corrected_path(out_dir: &Path, base: &str, fov: usize, channel: usize) -> PathBuf {
    fov_dir(out_dir, fov).join(format!("{base}_fov_{fov:03}_fl_corrected_ch_{channel}.arr"))
}

pub fn traces_path(out_dir: &Path, base: &str, fov: usize, channel: usize) -> PathBuf {
    fov_dir(out_dir, fov).join(format!("{base}_fov_{fov:03}_traces_ch_{channel}.csv"))
}

// ---------------------------------------------------------------------------
// Per-FOV state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FovStatus {
    Pending,
    Extracted,
    Segmented,
    Corrected,
    Tracked,
    Measured,
    Done,
    Cancelled,
    Failed { stage: String, reason: String },
}

impl Default for FovStatus {
    fn default() -> Self {
        FovStatus::Pending
    }
}

impl FovStatus {
    /// Terminal states never get overwritten by a later, weaker report.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            FovStatus::Done | FovStatus::Cancelled | FovStatus::Failed { .. }
        )
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FovEntry {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pc: Option<PathBuf>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub fl: Vec<(usize, PathBuf)>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seg: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seg_labeled: Option<PathBuf>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub fl_corrected: Vec<(usize, PathBuf)>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub traces: Vec<(usize, PathBuf)>,
    pub status: FovStatus,
}

impl FovEntry {
    pub fn channel_path(list: &[(usize, PathBuf)], channel: usize) -> Option<&PathBuf> {
        list.iter().find(|(k, _)| *k == channel).map(|(_, p)| p)
    }

    pub fn set_channel_path(list: &mut Vec<(usize, PathBuf)>, channel: usize, path: PathBuf) {
        match list.iter_mut().find(|(k, _)| *k == channel) {
            Some(slot) => slot.1 = path,
            None => list.push((channel, path)),
        }
    }
}

// ---------------------------------------------------------------------------
// Manifest
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub project_path: PathBuf,
    pub n_fov: usize,
    pub channels: ChannelSelection,
    pub time_units: TimeUnits,
    #[serde(default)]
    pub fov_data: BTreeMap<usize, FovEntry>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, serde_yaml::Value>,
}

impl Manifest {
    pub fn new(
        project_path: PathBuf,
        n_fov: usize,
        channels: ChannelSelection,
        time_units: TimeUnits,
    ) -> Manifest {
        Manifest {
            project_path,
            n_fov,
            channels,
            time_units,
            fov_data: BTreeMap::new(),
            extra: BTreeMap::new(),
        }
    }

    /// Load and re-anchor against the manifest's own `project_path`.
    pub fn load(path: &Path) -> Result<Manifest> {
        let text = fs::read_to_string(path)?;
        let mut manifest: Manifest = serde_yaml::from_str(&text)?;
        let root = manifest.project_path.clone();
        manifest.apply_reanchor(&root);
        Ok(manifest)
    }

    /// Atomic write: serialize next to the target, then rename over it.
    pub fn save(&self, path: &Path) -> Result<()> {
        let text = serde_yaml::to_string(self)?;
        let parent = path.parent().unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(parent)?;
        let tmp = parent.join(format!(
            ".{}.tmp",
            path.file_name().and_then(|n| n.to_str()).unwrap_or(MANIFEST_FILE)
        ));
        fs::write(&tmp, text).map_err(|source| PipelineError::Write {
            path: tmp.clone(),
            source,
        })?;
        fs::rename(&tmp, path).map_err(|source| PipelineError::Write {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(())
    }

    /// Point the manifest at a (possibly moved) project root and resolve
    /// every artifact path under it. The last two path components (FOV
    /// directory plus filename) are the stable identity; a path stays
    /// untouched when neither it nor its re-anchored candidate exists.
    pub fn reanchor_to(&mut self, root: &Path) {
        self.project_path = root.to_path_buf();
        self.apply_reanchor(&root.to_path_buf());
    }

    fn apply_reanchor(&mut self, root: &Path) {
        for entry in self.fov_data.values_mut() {
            for slot in [&mut entry.pc, &mut entry.seg, &mut entry.seg_labeled] {
                if let Some(p) = slot.take() {
                    *slot = Some(reanchor_path(root, p));
                }
            }
            for list in [&mut entry.fl, &mut entry.fl_corrected, &mut entry.traces] {
                for (_, p) in list.iter_mut() {
                    *p = reanchor_path(root, std::mem::take(p));
                }
            }
        }
    }
}

fn reanchor_path(root: &Path, path: PathBuf) -> PathBuf {
    if path.is_file() {
        return path;
    }
    let mut tail = path.components().rev().take(2).collect::<Vec<_>>();
    tail.reverse();
    if tail.len() != 2 {
        return path;
    }
    let candidate = root.join(tail[0]).join(tail[1]);
    if candidate.is_file() {
        candidate
    } else {
        path
    }
}
