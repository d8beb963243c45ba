//! Progress stream and cooperative cancellation.
//!
//! Workers report through a [`ProgressOut`]: inline workers feed the
//! coordinator's channel directly, worker processes print one JSON object
//! per line on stdout and the coordinator forwards parsed lines into the
//! same channel. A single drainer thread hands messages to a pluggable
//! [`ProgressSink`]; nothing a sink does can fail the run.

use std::io::{self, Write};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{Receiver, Sender};
use indicatif::{ProgressBar, ProgressStyle};
use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};

/// Frames between two progress reports inside a stage loop.
pub const PROGRESS_STRIDE: usize = 30;

/// Marker file polled by worker processes; the coordinator creates it when
/// the cancel token trips.
pub const CANCEL_MARKER: &str = ".cancel";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressMsg {
    pub stage: String,
    pub fov: usize,
    pub frame: usize,
    pub frame_total: usize,
    pub text: String,
}

impl ProgressMsg {
    pub fn frame_tick(stage: &str, fov: usize, frame: usize, frame_total: usize) -> ProgressMsg {
        ProgressMsg {
            stage: stage.to_string(),
            fov,
            frame,
            frame_total,
            text: String::new(),
        }
    }

    pub fn event(stage: &str, fov: usize, text: String) -> ProgressMsg {
        ProgressMsg {
            stage: stage.to_string(),
            fov,
            frame: 0,
            frame_total: 0,
            text,
        }
    }
}

#[derive(Clone)]
pub enum ProgressOut {
    /// In-process: straight into the coordinator's queue.
    Channel(Sender<ProgressMsg>),
    /// Worker process: JSON lines on stdout, drained by the parent.
    Stdout,
}

impl ProgressOut {
    pub fn send(&self, msg: ProgressMsg) {
        match self {
            ProgressOut::Channel(tx) => {
                let _ = tx.send(msg);
            }
            ProgressOut::Stdout => {
                if let Ok(line) = serde_json::to_string(&msg) {
                    let mut out = io::stdout();
                    let _ = writeln!(out, "{line}");
                    let _ = out.flush();
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Sinks
// ---------------------------------------------------------------------------

pub trait ProgressSink: Send {
    fn emit(&mut self, msg: &ProgressMsg);
}

/// Default sink: structured log records.
pub struct LogSink;

impl ProgressSink for LogSink {
    fn emit(&mut self, msg: &ProgressMsg) {
        if msg.text.is_empty() {
            tracing::info!(
                stage = %msg.stage,
                fov = msg.fov,
                frame = msg.frame,
                frame_total = msg.frame_total,
                "progress"
            );
        } else {
            tracing::info!(stage = %msg.stage, fov = msg.fov, text = %msg.text, "progress");
        }
    }
}

/// Terminal progress bar; tracks whichever (stage, fov) reported last.
pub struct BarSink {
    bar: ProgressBar,
}

impl BarSink {
    pub fn new() -> BarSink {
        let bar = ProgressBar::new(0);
        bar.set_style(
            ProgressStyle::with_template("{msg:24} {wide_bar} {pos}/{len}")
                .expect("progress bar template"),
        );
        BarSink { bar }
    }
}

impl Default for BarSink {
    fn default() -> Self {
        BarSink::new()
    }
}

impl ProgressSink for BarSink {
    fn emit(&mut self, msg: &ProgressMsg) {
        if !msg.text.is_empty() {
            self.bar.println(format!("fov {:03}: {}", msg.fov, msg.text));
            return;
        }
        self.bar.set_length(msg.frame_total as u64);
        self.bar.set_position(msg.frame as u64);
        self.bar.set_message(format!("{} fov {:03}", msg.stage, msg.fov));
    }
}

/// Consume until every sender hangs up. Sink panics are swallowed;
/// malformed input never reaches here (the line parsers drop it).
pub fn spawn_drainer(rx: Receiver<ProgressMsg>, mut sink: Box<dyn ProgressSink>) -> JoinHandle<()> {
    std::thread::spawn(move || {
        for msg in rx.iter() {
            let _ = catch_unwind(AssertUnwindSafe(|| sink.emit(&msg)));
        }
    })
}

// ---------------------------------------------------------------------------
// Cancellation
// ---------------------------------------------------------------------------

/// Cooperative cancel signal, monotonic within a run. The in-process flag
/// covers the coordinator and inline workers; the marker file carries the
/// signal to worker processes.
#[derive(Clone)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
    marker: Option<PathBuf>,
}

impl CancelToken {
    pub fn new() -> CancelToken {
        CancelToken {
            flag: Arc::new(AtomicBool::new(false)),
            marker: None,
        }
    }

    pub fn with_marker(marker: PathBuf) -> CancelToken {
        CancelToken {
            flag: Arc::new(AtomicBool::new(false)),
            marker: Some(marker),
        }
    }

    /// Same flag, now also carried through the given marker file. Used by
    /// the coordinator once the output directory is known.
    pub fn bind_marker(&self, marker: PathBuf) -> CancelToken {
        CancelToken {
            flag: self.flag.clone(),
            marker: Some(marker),
        }
    }

    /// Trip the token. Creates the marker file so worker processes see it.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
        if let Some(marker) = &self.marker {
            let _ = std::fs::File::create(marker);
        }
    }

    pub fn is_cancelled(&self) -> bool {
        if self.flag.load(Ordering::SeqCst) {
            return true;
        }
        match &self.marker {
            Some(marker) if marker.exists() => {
                self.flag.store(true, Ordering::SeqCst);
                true
            }
            _ => false,
        }
    }

    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(PipelineError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Remove a marker left over from a previous run.
    pub fn clear_marker(&self) {
        if let Some(marker) = &self.marker {
            let _ = std::fs::remove_file(marker);
        }
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        CancelToken::new()
    }
}

// ---------------------------------------------------------------------------
// Stage context
// ---------------------------------------------------------------------------

/// Everything a stage loop needs at a frame boundary: throttled progress
/// and the cancellation check.
pub struct StageCtx<'a> {
    pub out: &'a ProgressOut,
    pub cancel: &'a CancelToken,
    pub stage: &'static str,
    pub fov: usize,
    pub frame_total: usize,
}

impl StageCtx<'_> {
    pub fn tick(&self, frame: usize) -> Result<()> {
        self.cancel.check()?;
        if frame % PROGRESS_STRIDE == 0 || frame + 1 == self.frame_total {
            self.out.send(ProgressMsg::frame_tick(
                self.stage,
                self.fov,
                frame + 1,
                self.frame_total,
            ));
        }
        Ok(())
    }

    pub fn event(&self, text: String) {
        self.out
            .send(ProgressMsg::event(self.stage, self.fov, text));
    }
}
