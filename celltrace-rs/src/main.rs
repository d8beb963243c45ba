use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use celltrace_rs::config::{ChannelSelection, RunConfig};
use celltrace_rs::error::PipelineError;
use celltrace_rs::pipeline;
use celltrace_rs::progress::{BarSink, CancelToken, LogSink, ProgressSink, CANCEL_MARKER};
use celltrace_rs::slices;
use celltrace_rs::source::{Source, TimeUnits};
use celltrace_rs::worker;

#[derive(Parser)]
#[command(name = "celltrace", about = "Single-cell fluorescence traces from time-lapse microscopy")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the processing pipeline over an acquisition
    Run(RunArgs),
    /// Internal: stage driver spawned by the coordinator
    #[command(hide = true)]
    Worker(WorkerArgs),
}

#[derive(Args)]
struct RunArgs {
    /// Acquisition: an .nd2 file or a TIFF folder with Pos* directories
    #[arg(long)]
    source: PathBuf,

    /// Output directory
    #[arg(long)]
    out: PathBuf,

    /// Phase-contrast channel index
    #[arg(long)]
    pc: usize,

    /// Fluorescence channels: comma-separated indices/slices, e.g. "1" or "1,2"
    #[arg(long, default_value = "")]
    fl: String,

    /// FOVs to process: "all" or a contiguous slice, e.g. "0:8" or "3"
    #[arg(long, default_value = "all")]
    fov: String,

    /// FOVs per batch (default: the worker count)
    #[arg(long)]
    batch_size: Option<usize>,

    /// Worker processes (default: CPUs, capped at the FOV count)
    #[arg(long)]
    workers: Option<usize>,

    /// Unit of sidecar timepoints: seconds, minutes, hours or frames
    #[arg(long)]
    time_units: Option<String>,

    /// Optional frame,time CSV overriding the source timepoints
    #[arg(long)]
    timepoints: Option<PathBuf>,

    /// Open traces for cells entering after the first frame
    #[arg(long)]
    track_new_cells: bool,

    /// Show a progress bar instead of log lines
    #[arg(long)]
    progress_bar: bool,
}

#[derive(Args)]
struct WorkerArgs {
    /// Path to the worker spec JSON written by the coordinator
    #[arg(long)]
    spec: PathBuf,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Run(args) => match run_command(args) {
            Ok(true) => ExitCode::SUCCESS,
            Ok(false) => ExitCode::from(1),
            Err(err) => {
                eprintln!("error: {err:#}");
                let config_error = err
                    .downcast_ref::<PipelineError>()
                    .is_some_and(|e| matches!(e, PipelineError::Config(_)));
                ExitCode::from(if config_error { 2 } else { 1 })
            }
        },
        Commands::Worker(args) => match worker::worker_main(&args.spec) {
            Ok(()) => ExitCode::SUCCESS,
            Err(err) => {
                eprintln!("worker error: {err}");
                ExitCode::from(1)
            }
        },
    }
}

fn run_command(args: RunArgs) -> anyhow::Result<bool> {
    // one metadata probe to resolve the CLI selections
    let mut probe = Source::open(&args.source)?;
    let meta = probe.metadata()?;
    drop(probe);

    let fl = if args.fl.trim().is_empty() {
        Vec::new()
    } else {
        slices::parse_slice_string(&args.fl, meta.n_channels).map_err(PipelineError::Config)?
    };
    let (fov_start, fov_end) =
        slices::parse_contiguous_range(&args.fov, meta.n_fovs).map_err(PipelineError::Config)?;

    let mut config = RunConfig::new(
        args.source.clone(),
        args.out.clone(),
        ChannelSelection { pc: args.pc, fl },
    );
    config.fov_start = fov_start;
    config.fov_end = Some(fov_end);
    config.n_workers = args
        .workers
        .unwrap_or_else(|| num_cpus::get().min(meta.n_fovs).max(1));
    config.batch_size = args.batch_size.unwrap_or(config.n_workers);
    if let Some(units) = &args.time_units {
        config.time_units = Some(units.parse::<TimeUnits>().map_err(PipelineError::Config)?);
    }
    config.timepoints_csv = args.timepoints.clone();
    config.params.track.track_new_cells = args.track_new_cells;

    let cancel = CancelToken::with_marker(args.out.join(CANCEL_MARKER));
    let handler_token = cancel.clone();
    ctrlc::set_handler(move || {
        tracing::warn!("interrupt received, finishing in-flight work");
        handler_token.cancel();
    })
    .context("installing the interrupt handler")?;

    let sink: Box<dyn ProgressSink> = if args.progress_bar {
        Box::new(BarSink::new())
    } else {
        Box::new(LogSink)
    };
    Ok(pipeline::run(&config, sink, &cancel)?)
}
