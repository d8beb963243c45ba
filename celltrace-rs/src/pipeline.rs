//! Pipeline coordinator.
//!
//! FOVs are processed in contiguous batches. Extraction for a batch runs
//! in this process (the acquisition reader is not process-safe), then the
//! batch is split into contiguous near-equal ranges, one worker each.
//! Workers are separate OS processes talking JSON lines over stdout; with
//! `n_workers == 1` the single worker runs inline through the same code
//! path. All bulk state lives on the filesystem; the manifest is saved
//! once, after the last batch.

use std::fs;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, Sender};

use crate::config::RunConfig;
use crate::error::{PipelineError, Result};
use crate::extract::extract_fov;
use crate::manifest::{FovEntry, FovStatus, Manifest, MANIFEST_FILE};
use crate::progress::{
    spawn_drainer, CancelToken, ProgressMsg, ProgressOut, ProgressSink, CANCEL_MARKER,
};
use crate::source::{load_timepoints_csv, AcquisitionMetadata, Source, TimeUnits};
use crate::worker::{run_worker, WorkerLine, WorkerOutcome, WorkerSpec};

/// Run the full pipeline. Returns `Ok(true)` iff every in-scope FOV ended
/// in the `done` state; configuration problems surface as
/// [`PipelineError::Config`] before any work happens.
pub fn run(config: &RunConfig, sink: Box<dyn ProgressSink>, cancel: &CancelToken) -> Result<bool> {
    let mut source = Source::open(&config.source)?;
    let mut meta = source.metadata()?;
    if let Some(csv) = &config.timepoints_csv {
        let timepoints = load_timepoints_csv(csv)?;
        meta.set_timepoints(timepoints, config.time_units.unwrap_or(TimeUnits::Seconds))?;
    } else if let Some(units) = config.time_units {
        meta.time_units = units;
    }
    let (fov_start, fov_end) = config.resolve(meta.n_fovs, meta.n_channels)?;

    fs::create_dir_all(&config.out_dir)?;
    let cancel = cancel.bind_marker(config.out_dir.join(CANCEL_MARKER));
    cancel.clear_marker();

    let manifest_path = config.out_dir.join(MANIFEST_FILE);
    let mut manifest = load_or_new_manifest(&manifest_path, config, &meta);
    for fov in fov_start..=fov_end {
        manifest.fov_data.entry(fov).or_default().status = FovStatus::Pending;
    }

    let (tx, rx) = bounded::<ProgressMsg>(1024);
    let drainer = spawn_drainer(rx, sink);

    let worker_exe = match &config.worker_exe {
        Some(path) => path.clone(),
        None => std::env::current_exe()?,
    };

    let fovs: Vec<usize> = (fov_start..=fov_end).collect();
    for batch in fovs.chunks(config.batch_size) {
        if cancel.is_cancelled() {
            break;
        }
        let (first, last) = (batch[0], *batch.last().unwrap());
        tracing::info!(first, last, "starting batch");

        let mut extracted: Vec<usize> = Vec::new();
        for &fov in batch {
            if cancel.is_cancelled() {
                break;
            }
            match extract_fov(
                &mut source,
                &meta,
                &config.selection,
                fov,
                &config.out_dir,
                &ProgressOut::Channel(tx.clone()),
                &cancel,
            ) {
                Ok(entry) => {
                    manifest.fov_data.insert(fov, entry);
                    extracted.push(fov);
                }
                Err(PipelineError::Cancelled) => {
                    manifest.fov_data.entry(fov).or_default().status = FovStatus::Cancelled;
                }
                Err(err) => {
                    tracing::error!(fov, error = %err, "extraction failed");
                    let entry = manifest.fov_data.entry(fov).or_default();
                    entry.status = FovStatus::Failed {
                        stage: "extract".into(),
                        reason: err.to_string(),
                    };
                }
            }
        }
        if extracted.is_empty() {
            continue;
        }
        let skip: Vec<usize> = batch
            .iter()
            .copied()
            .filter(|fov| !extracted.contains(fov))
            .collect();

        let outcomes = if config.n_workers == 1 {
            let spec = WorkerSpec {
                out_dir: config.out_dir.clone(),
                meta: meta.clone(),
                selection: config.selection.clone(),
                params: config.params.clone(),
                fov_start: first,
                fov_end: last,
                skip,
            };
            vec![run_worker(
                &spec,
                &ProgressOut::Channel(tx.clone()),
                &cancel,
            )]
        } else {
            run_worker_processes(&worker_exe, config, &meta, first, last, &skip, &tx)?
        };
        for outcome in outcomes {
            for (fov, entry) in outcome.fovs {
                manifest.fov_data.insert(fov, entry);
            }
        }
    }

    // FOVs the scheduler never reached
    for fov in fov_start..=fov_end {
        let entry = manifest.fov_data.entry(fov).or_default();
        if !entry.status.is_terminal() && cancel.is_cancelled() {
            entry.status = FovStatus::Cancelled;
        }
    }

    manifest
        .extra
        .insert("params".into(), serde_yaml::to_value(&config.params)?);
    manifest.save(&manifest_path)?;

    drop(tx);
    let _ = drainer.join();

    let mut done = 0usize;
    let mut cancelled = 0usize;
    let mut failed = 0usize;
    for fov in fov_start..=fov_end {
        match manifest.fov_data[&fov].status {
            FovStatus::Done => done += 1,
            FovStatus::Cancelled => cancelled += 1,
            FovStatus::Failed { .. } => failed += 1,
            _ => {}
        }
    }
    tracing::info!(done, cancelled, failed, total = fovs.len(), "pipeline finished");
    Ok(done == fovs.len())
}

fn load_or_new_manifest(
    manifest_path: &Path,
    config: &RunConfig,
    meta: &AcquisitionMetadata,
) -> Manifest {
    let mut manifest = if manifest_path.is_file() {
        match Manifest::load(manifest_path) {
            Ok(mut prior) => {
                prior.reanchor_to(&config.out_dir);
                prior
            }
            Err(err) => {
                tracing::warn!(error = %err, "ignoring unreadable manifest");
                Manifest::new(
                    config.out_dir.clone(),
                    meta.n_fovs,
                    config.selection.clone(),
                    meta.time_units,
                )
            }
        }
    } else {
        Manifest::new(
            config.out_dir.clone(),
            meta.n_fovs,
            config.selection.clone(),
            meta.time_units,
        )
    };
    manifest.project_path = config.out_dir.clone();
    manifest.n_fov = meta.n_fovs;
    manifest.channels = config.selection.clone();
    manifest.time_units = meta.time_units;
    manifest
}

/// Contiguous near-equal split of `[start, end]`; any remainder goes to
/// the earliest ranges.
pub(crate) fn partition(start: usize, end: usize, n_workers: usize) -> Vec<(usize, usize)> {
    let count = end - start + 1;
    let n = n_workers.clamp(1, count);
    let base = count / n;
    let rem = count % n;
    let mut parts = Vec::with_capacity(n);
    let mut s = start;
    for i in 0..n {
        let size = base + usize::from(i < rem);
        parts.push((s, s + size - 1));
        s += size;
    }
    parts
}

#[allow(clippy::type_complexity)]
fn run_worker_processes(
    worker_exe: &Path,
    config: &RunConfig,
    meta: &AcquisitionMetadata,
    batch_start: usize,
    batch_end: usize,
    skip: &[usize],
    tx: &Sender<ProgressMsg>,
) -> Result<Vec<WorkerOutcome>> {
    let mut children: Vec<(
        Child,
        JoinHandle<Option<WorkerOutcome>>,
        PathBuf,
        (usize, usize),
        Vec<usize>,
    )> = Vec::new();

    for (s, e) in partition(batch_start, batch_end, config.n_workers) {
        let part_skip: Vec<usize> = skip.iter().copied().filter(|f| *f >= s && *f <= e).collect();
        if part_skip.len() == e - s + 1 {
            continue;
        }
        let spec = WorkerSpec {
            out_dir: config.out_dir.clone(),
            meta: meta.clone(),
            selection: config.selection.clone(),
            params: config.params.clone(),
            fov_start: s,
            fov_end: e,
            skip: part_skip.clone(),
        };
        let spec_path = config.out_dir.join(format!(".worker_spec_{s:03}_{e:03}.json"));
        fs::write(&spec_path, serde_json::to_vec(&spec)?)?;
        let mut child = Command::new(worker_exe)
            .arg("worker")
            .arg("--spec")
            .arg(&spec_path)
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| PipelineError::Unexpected("worker stdout not captured".into()))?;
        let tx = tx.clone();
        let reader = thread::spawn(move || {
            let mut outcome = None;
            for line in BufReader::new(stdout).lines() {
                let Ok(line) = line else { break };
                match serde_json::from_str::<WorkerLine>(&line) {
                    Ok(WorkerLine::Progress(msg)) => {
                        let _ = tx.send(msg);
                    }
                    Ok(WorkerLine::Outcome { worker_outcome }) => outcome = Some(worker_outcome),
                    // malformed lines are dropped
                    Err(_) => {}
                }
            }
            outcome
        });
        children.push((child, reader, spec_path, (s, e), part_skip));
    }

    let mut outcomes = Vec::new();
    for (mut child, reader, spec_path, (s, e), part_skip) in children {
        let outcome = reader.join().unwrap_or(None);
        let status = child.wait()?;
        let _ = fs::remove_file(&spec_path);
        match outcome {
            Some(outcome) => {
                if !status.success() {
                    tracing::warn!(%status, "worker exited abnormally after reporting");
                }
                outcomes.push(outcome);
            }
            None => {
                tracing::error!(%status, fov_start = s, fov_end = e, "worker died without reporting");
                let mut fallback = WorkerOutcome::default();
                for fov in s..=e {
                    if part_skip.contains(&fov) {
                        continue;
                    }
                    fallback.fovs.insert(
                        fov,
                        FovEntry {
                            status: FovStatus::Failed {
                                stage: "worker".into(),
                                reason: format!("worker process exited with {status}"),
                            },
                            ..FovEntry::default()
                        },
                    );
                }
                outcomes.push(fallback);
            }
        }
    }
    Ok(outcomes)
}
