mod cli;

use anyhow::{bail, Context, Result};
use chrono::{Local, Utc};
use cli::{Args, CalibrationArgs, Command};
use finish_line::ledger::{BibTimeLedger, CsvFileSink};
use finish_line::pipeline::orchestrator::{PipelineOptions, ReconstructionPipeline, RunOutcome};
use finish_line::run_context::{self, RunContext, RunMetadata};
use finish_line::timing::{self, CaptureRates, TimeMapping, Timestamp};
use finish_line::video::{preview, ContainerMetadata, VideoSource};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};
use std::time::Duration;

fn main() -> Result<()> {
    // Load environment variables from .env if present
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt::init();

    let args = Args::parse_args();

    match args.command {
        Command::Probe { video } => {
            let source = open_video(&video)?;
            println!("{}", serde_json::to_string_pretty(source.info())?);
        }
        Command::Preview {
            video,
            calibration,
            out,
            corrected,
        } => {
            let mut source = open_video(&video)?;
            let info = source.info();
            let cal = calibration.to_calibration(info.width, info.height);
            preview::extract_preview_frame(&mut source, &cal, &out, corrected)?;
            println!("{}", out.display());
        }
        Command::Scan {
            video,
            calibration,
            output_root,
            workers,
            fps,
            start_time,
            utc_offset,
            raster_name,
            overwrite,
        } => {
            let opts = ScanOptions {
                calibration,
                output_root,
                workers,
                fps,
                start_time,
                utc_offset,
                raster_name,
                overwrite,
            };
            scan(&video, opts)?;
        }
        Command::Time { run_dir, column } => {
            let run = RunContext::load(&run_dir)?;
            let mapping = run.time_mapping()?;
            check_column(&mapping, column)?;
            println!("{}", mapping.format_column(column));
        }
        Command::Bib {
            run_dir,
            column,
            identifier,
            ledger,
        } => {
            let run = RunContext::load(&run_dir)?;
            let mapping = run.time_mapping()?;
            check_column(&mapping, column)?;
            let timestamp = mapping.format_column(column);
            let mut ledger = open_ledger(&run, ledger)?;
            ledger.add(identifier.clone(), timestamp.clone())?;
            println!("{}, {}", identifier, timestamp);
        }
        Command::Bibs { run_dir, ledger } => {
            let run = RunContext::load(&run_dir)?;
            for entry in open_ledger(&run, ledger)?.entries() {
                println!("{}, {}", entry.identifier, entry.timestamp);
            }
        }
        Command::Runs { output_root } => {
            for run in run_context::list_runs(&output_root)? {
                let (start, end) = run.time_mapping()?.window();
                println!(
                    "{}\t{}\t{} - {}",
                    run.output_dir.display(),
                    run.metadata.original_name,
                    timing::format_timestamp(&start),
                    timing::format_timestamp(&end)
                );
            }
        }
    }

    Ok(())
}

struct ScanOptions {
    calibration: CalibrationArgs,
    output_root: PathBuf,
    workers: Option<usize>,
    fps: Option<f64>,
    start_time: Option<String>,
    utc_offset: String,
    raster_name: Option<String>,
    overwrite: bool,
}

fn scan(video: &Path, opts: ScanOptions) -> Result<()> {
    let source = open_video(video)?;
    let info = source.info().clone();
    let cal = opts.calibration.to_calibration(info.width, info.height);
    let config = cal.sampling_config(info.frame_count)?;

    let rates = CaptureRates::from_metadata(&info.metadata);
    if rates.capture_fps.is_some() {
        tracing::info!(
            "Slow-motion recording: {:.1}x, real duration {:?}s",
            rates.slow_motion_factor(),
            info.metadata.duration_secs.map(|d| rates.real_duration(d))
        );
    }
    let fps = opts.fps.unwrap_or_else(|| rates.effective_fps());
    let start = resolve_start_time(
        opts.start_time.as_deref(),
        &info.metadata,
        &opts.utc_offset,
    )?;
    // Fail on a bad fps before decoding anything.
    let mapping = TimeMapping::new(start, fps, cal.direction, info.frame_count)?;

    // Only a completed run creates the directory; check for a clash up front.
    run_context::run_dir(&opts.output_root, video, opts.overwrite)?;

    let mut options = PipelineOptions::default();
    if let Some(workers) = opts.workers {
        options = options.with_workers(workers);
    }
    let mut pipeline = ReconstructionPipeline::new(options);
    let handle = pipeline.start(source, config)?;

    let pb = ProgressBar::new((info.frame_count * 2) as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template(
                "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {percent}% {msg}",
            )?
            .progress_chars("#>-"),
    );
    while !handle.is_finished() {
        let progress = handle.progress();
        pb.set_position((progress.submitted + progress.written) as u64);
        pb.set_message(format!("{:.0} cols/s", progress.columns_per_sec));
        std::thread::sleep(Duration::from_millis(100));
    }

    let raster = match handle.wait() {
        RunOutcome::Completed(raster) => raster,
        RunOutcome::Cancelled => {
            pb.abandon_with_message("cancelled");
            bail!("Reconstruction cancelled");
        }
        RunOutcome::Failed(e) => {
            pb.abandon_with_message("failed");
            return Err(e).context("Reconstruction failed");
        }
    };
    pb.finish_with_message("done");

    let output_dir = run_context::create_run(&opts.output_root, video, opts.overwrite)?;

    let raster_file = opts
        .raster_name
        .unwrap_or_else(|| mapping.export_filename());
    let run = RunContext::new(
        output_dir,
        RunMetadata {
            original_name: video
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            created_at: Utc::now(),
            start_time: mapping.start_time(),
            fps: mapping.fps(),
            direction: mapping.direction(),
            raster_width: raster.width() as usize,
            raster_height: raster.height() as usize,
            raster_file,
            ledger_file: run_context::default_ledger_file(),
            calibration: cal,
        },
    );
    run.discard_stale_ledger()?;
    raster.save(&run.raster_path())?;
    run.save()?;

    let (start, end) = mapping.window();
    println!(
        "{} ({} - {}, 1 px = {:.6} s)",
        run.raster_path().display(),
        timing::format_timestamp(&start),
        timing::format_timestamp(&end),
        mapping.seconds_per_column()
    );
    Ok(())
}

fn resolve_start_time(
    start_time: Option<&str>,
    metadata: &ContainerMetadata,
    utc_offset: &str,
) -> Result<Timestamp> {
    let offset = timing::parse_utc_offset(utc_offset)?;
    let recorded = metadata
        .creation_time
        .as_deref()
        .and_then(|s| match timing::parse_creation_time(s) {
            Ok(t) => Some(timing::apply_capture_timezone_offset(t, offset)),
            Err(e) => {
                tracing::warn!("Ignoring container creation time: {}", e);
                None
            }
        });

    match (start_time, recorded) {
        (Some(s), recorded) => {
            let date = recorded
                .map(|t| t.date())
                .unwrap_or_else(|| Local::now().date_naive());
            Ok(timing::parse_start_time(s, date)?)
        }
        (None, Some(recorded)) => Ok(recorded),
        (None, None) => {
            tracing::warn!("No creation time in container, using the current time as start");
            Ok(Local::now().naive_local())
        }
    }
}

fn check_column(mapping: &TimeMapping, column: usize) -> Result<()> {
    if column > mapping.raster_width() {
        bail!(
            "Column {} is outside the raster (width {})",
            column,
            mapping.raster_width()
        );
    }
    Ok(())
}

fn open_ledger(
    run: &RunContext,
    ledger: Option<PathBuf>,
) -> Result<BibTimeLedger<CsvFileSink>> {
    match ledger {
        Some(path) => Ok(BibTimeLedger::open(CsvFileSink::new(path))?),
        None => run.open_ledger(),
    }
}

#[cfg(feature = "ffmpeg")]
fn open_video(path: &Path) -> Result<Box<dyn VideoSource>> {
    let reader = finish_line::video::ffmpeg_reader::FfmpegReader::open(path)
        .with_context(|| format!("Failed to open {:?}", path))?;
    Ok(Box::new(reader))
}

#[cfg(not(feature = "ffmpeg"))]
fn open_video(path: &Path) -> Result<Box<dyn VideoSource>> {
    bail!(
        "Cannot decode {:?}: built without the `ffmpeg` feature",
        path
    )
}
