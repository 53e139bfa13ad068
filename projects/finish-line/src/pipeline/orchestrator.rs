// Pipeline orchestrator: manages the reconstruction lifecycle
//
// One decode thread feeds a bounded pool of sample workers; a collector
// thread writes each worker's column into the raster and owns the run's
// terminal transition.

use crate::error::{Result, SlitScanError};
use crate::pipeline::placer::destination_column;
use crate::pipeline::raster::OutputRaster;
use crate::pipeline::sampler::sample;
pub use crate::pipeline::types::ProcessingState;
use crate::pipeline::types::{ColumnPixels, Frame, Progress, RunStatus, SamplingConfig};
use crate::video::{VideoInfo, VideoSource};
use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// A frame handed to the pool together with its precomputed destination.
struct WorkUnit {
    column: usize,
    frame: Frame,
    config: Arc<SamplingConfig>,
}

/// Messages flowing into the collector.
enum PipelineEvent {
    Column(usize, ColumnPixels),
    /// The decoder reached end of stream with exactly the reported frame count.
    DecodeFinished,
    Failed(SlitScanError),
}

#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub workers: usize,
    /// Work queue slots per worker
    pub queue_per_worker: usize,
    /// How long the collector waits for a result before re-checking cancellation.
    pub poll_interval: Duration,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            workers: thread::available_parallelism().map(|n| n.get()).unwrap_or(4),
            queue_per_worker: 2,
            poll_interval: Duration::from_millis(50),
        }
    }
}

impl PipelineOptions {
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }
}

/// Terminal result of a run.
pub enum RunOutcome {
    Completed(OutputRaster),
    Cancelled,
    Failed(SlitScanError),
}

impl RunOutcome {
    pub fn status(&self) -> RunStatus {
        match self {
            RunOutcome::Completed(_) => RunStatus::Completed,
            RunOutcome::Cancelled => RunStatus::Cancelled,
            RunOutcome::Failed(_) => RunStatus::Failed,
        }
    }
}

/// Handle on a running reconstruction.
pub struct RunHandle {
    state: Arc<ProcessingState>,
    collector: JoinHandle<RunOutcome>,
}

impl RunHandle {
    pub fn state(&self) -> Arc<ProcessingState> {
        self.state.clone()
    }

    pub fn progress(&self) -> Progress {
        self.state.progress()
    }

    pub fn status(&self) -> RunStatus {
        self.state.status()
    }

    /// Requests cooperative cancellation. Returns immediately.
    pub fn cancel(&self) {
        tracing::info!("Cancellation requested");
        self.state.request_cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.collector.is_finished()
    }

    /// Blocks until the collector reaches a terminal state.
    pub fn wait(self) -> RunOutcome {
        match self.collector.join() {
            Ok(outcome) => outcome,
            Err(_) => {
                let err = SlitScanError::Decode("collector thread panicked".to_string());
                self.state.fail(err.to_string());
                RunOutcome::Failed(err)
            }
        }
    }
}

/// Drives LineSampler and ColumnPlacer over every frame of a video.
pub struct ReconstructionPipeline {
    options: PipelineOptions,
    current: Option<Arc<ProcessingState>>,
}

impl Default for ReconstructionPipeline {
    fn default() -> Self {
        Self::new(PipelineOptions::default())
    }
}

impl ReconstructionPipeline {
    pub fn new(options: PipelineOptions) -> Self {
        Self {
            options,
            current: None,
        }
    }

    pub fn status(&self) -> RunStatus {
        self.current
            .as_ref()
            .map(|s| s.status())
            .unwrap_or(RunStatus::Idle)
    }

    /// Validates the config against the source and starts a run.
    ///
    /// Configuration errors are reported here, before any frame is decoded.
    pub fn start<S>(&mut self, source: S, config: SamplingConfig) -> Result<RunHandle>
    where
        S: VideoSource + 'static,
    {
        if self.status() == RunStatus::Running {
            return Err(SlitScanError::AlreadyRunning);
        }
        validate_run(source.info(), &config)?;

        let total = config.frame_count;
        let workers = self.options.workers.max(1);
        let state = Arc::new(ProcessingState::new(total));
        self.current = Some(state.clone());

        tracing::info!(
            "Starting reconstruction: {} frames, {}x{} calibrated frame, line={}, rotation={:.3}deg, direction={}, workers={}",
            total,
            config.frame_width,
            config.frame_height,
            config.line_position,
            config.rotation_degrees,
            config.direction,
            workers
        );

        let config = Arc::new(config);
        let (work_tx, work_rx) =
            channel::bounded::<WorkUnit>(workers * self.options.queue_per_worker.max(1));
        let (event_tx, event_rx) = channel::unbounded::<PipelineEvent>();

        for worker_id in 0..workers {
            spawn_sample_worker(worker_id, work_rx.clone(), event_tx.clone(), state.clone());
        }
        drop(work_rx);

        spawn_decode_worker(source, work_tx, event_tx, state.clone(), config.clone());

        let collector_state = state.clone();
        let poll_interval = self.options.poll_interval;
        let frame_height = config.frame_height;
        let collector = thread::spawn(move || {
            collect_worker(event_rx, collector_state, total, frame_height, poll_interval)
        });

        Ok(RunHandle { state, collector })
    }
}

/// Checks that a calibration still matches the video it is about to run on.
pub fn validate_run(info: &VideoInfo, config: &SamplingConfig) -> Result<()> {
    config.validate()?;
    if info.frame_count != config.frame_count {
        return Err(SlitScanError::InvalidFrameGeometry(format!(
            "config expects {} frames, video reports {}",
            config.frame_count, info.frame_count
        )));
    }
    if info.width != config.source_width || info.height != config.source_height {
        return Err(SlitScanError::InvalidFrameGeometry(format!(
            "config built for {}x{} frames, video is {}x{}",
            config.source_width, config.source_height, info.width, info.height
        )));
    }
    Ok(())
}

fn spawn_decode_worker<S>(
    source: S,
    work_tx: Sender<WorkUnit>,
    event_tx: Sender<PipelineEvent>,
    state: Arc<ProcessingState>,
    config: Arc<SamplingConfig>,
) where
    S: VideoSource + 'static,
{
    thread::spawn(move || {
        tracing::debug!("Decode worker started");
        match decode_worker(source, &work_tx, &state, &config) {
            Ok(true) => {
                tracing::debug!("Decode worker finished gracefully");
                let _ = event_tx.send(PipelineEvent::DecodeFinished);
            }
            Ok(false) => tracing::debug!("Decode worker stopped early"),
            Err(e) => {
                tracing::error!("Decode worker failed: {}", e);
                let _ = event_tx.send(PipelineEvent::Failed(e));
            }
        }
    });
}

/// Decodes frames in order and submits each one with its destination column.
///
/// Returns `Ok(true)` once the stream ended with exactly the reported number
/// of frames, `Ok(false)` when stopped early by cancellation or failure.
fn decode_worker<S: VideoSource>(
    mut source: S,
    work_tx: &Sender<WorkUnit>,
    state: &ProcessingState,
    config: &Arc<SamplingConfig>,
) -> Result<bool> {
    let total = config.frame_count;
    let mut expected = 0usize;

    loop {
        if state.should_stop() {
            tracing::debug!("Decode worker stopping after {} submissions", expected);
            return Ok(false);
        }

        let frame = match source.next_frame()? {
            Some(frame) => frame,
            None if expected == total => return Ok(true),
            None => {
                return Err(SlitScanError::Decode(format!(
                    "decoder ended after {} of {} reported frames",
                    expected, total
                )))
            }
        };

        if frame.index != expected {
            return Err(SlitScanError::Decode(format!(
                "decoder produced frame {} where {} was expected",
                frame.index, expected
            )));
        }
        if frame.index >= total {
            return Err(SlitScanError::Decode(format!(
                "decoder produced more frames than the {} reported",
                total
            )));
        }

        let column = destination_column(frame.index, total, config.direction);
        let unit = WorkUnit {
            column,
            frame,
            config: config.clone(),
        };
        if work_tx.send(unit).is_err() {
            // Every worker has exited.
            return Ok(false);
        }
        state.record_submitted();
        expected += 1;
    }
}

fn spawn_sample_worker(
    worker_id: usize,
    work_rx: Receiver<WorkUnit>,
    event_tx: Sender<PipelineEvent>,
    state: Arc<ProcessingState>,
) {
    thread::spawn(move || {
        let mut processed = 0usize;
        for unit in work_rx {
            if state.should_stop() {
                break;
            }
            let event = match sample(&unit.frame, &unit.config) {
                Ok(pixels) => PipelineEvent::Column(unit.column, pixels),
                Err(e) => PipelineEvent::Failed(e),
            };
            if event_tx.send(event).is_err() {
                break;
            }
            processed += 1;
        }
        tracing::debug!("Sample worker {} finished after {} frames", worker_id, processed);
    });
}

/// Writes results into the raster until every column lands and the decoder
/// confirms end of stream, a result fails, or cancellation is observed.
fn collect_worker(
    event_rx: Receiver<PipelineEvent>,
    state: Arc<ProcessingState>,
    total: usize,
    frame_height: u32,
    poll_interval: Duration,
) -> RunOutcome {
    let mut raster = OutputRaster::new(total, frame_height);
    let mut decode_finished = false;

    loop {
        if state.is_cancel_requested() {
            return cancelled(&state);
        }

        match event_rx.recv_timeout(poll_interval) {
            Ok(PipelineEvent::Column(column, pixels)) => {
                if let Err(e) = raster.write_column(column, &pixels) {
                    return failed(&state, e);
                }
                // The last column is counted only once the run is complete.
                if !raster.is_complete() {
                    state.record_written();
                }
            }
            Ok(PipelineEvent::DecodeFinished) => decode_finished = true,
            Ok(PipelineEvent::Failed(e)) => return failed(&state, e),
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => {
                if state.is_cancel_requested() {
                    return cancelled(&state);
                }
                let e = SlitScanError::Decode(format!(
                    "pipeline stopped after {} of {} columns",
                    raster.written_columns(),
                    total
                ));
                return failed(&state, e);
            }
        }

        if decode_finished && raster.is_complete() {
            state.finish(RunStatus::Completed);
            state.record_written();
            tracing::info!(
                "Reconstruction complete: {} columns in {:.2}s",
                total,
                state.progress().elapsed_secs
            );
            return RunOutcome::Completed(raster);
        }
    }
}

fn cancelled(state: &ProcessingState) -> RunOutcome {
    state.finish(RunStatus::Cancelled);
    tracing::info!(
        "Reconstruction cancelled after {} of {} columns",
        state.written(),
        state.total_frames
    );
    RunOutcome::Cancelled
}

fn failed(state: &ProcessingState, e: SlitScanError) -> RunOutcome {
    tracing::error!("Reconstruction failed: {}", e);
    state.fail(e.to_string());
    RunOutcome::Failed(e)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::types::{Direction, BACKGROUND};
    use crate::video::memory::MemorySource;
    use image::{Rgb, RgbImage};

    /// Frame `i` is filled with a colour unique to `i`, with a row gradient.
    fn coded_frames(count: usize, width: u32, height: u32) -> Vec<RgbImage> {
        (0..count)
            .map(|i| {
                RgbImage::from_fn(width, height, |x, y| {
                    Rgb([(i % 251) as u8, (i / 251) as u8, ((x + y) % 256) as u8])
                })
            })
            .collect()
    }

    fn run_to_end(source: MemorySource, config: SamplingConfig, workers: usize) -> RunOutcome {
        let mut pipeline =
            ReconstructionPipeline::new(PipelineOptions::default().with_workers(workers));
        let handle = pipeline.start(source, config).unwrap();
        let outcome = handle.wait();
        assert_eq!(pipeline.status(), outcome.status());
        outcome
    }

    fn expect_raster(outcome: RunOutcome) -> OutputRaster {
        match outcome {
            RunOutcome::Completed(raster) => raster,
            RunOutcome::Cancelled => panic!("run was cancelled"),
            RunOutcome::Failed(e) => panic!("run failed: {}", e),
        }
    }

    #[test]
    fn test_forward_places_earliest_frame_on_the_right() {
        let frames = coded_frames(60, 16, 10);
        let source = MemorySource::new(frames, 30.0);
        let config = SamplingConfig::unrotated(16, 10, 5, Direction::Forward, 60);

        let raster = expect_raster(run_to_end(source, config, 4));
        assert!(raster.is_complete());
        assert_eq!(raster.image().dimensions(), (60, 10));
        for column in 0..60u32 {
            let frame_index = 60 - column - 1;
            let px = raster.image().get_pixel(column, 3);
            assert_eq!(px.0[0], frame_index as u8);
            assert_eq!(px.0[2], 5 + 3);
        }
    }

    #[test]
    fn test_reverse_places_earliest_frame_on_the_left() {
        let frames = coded_frames(20, 8, 4);
        let source = MemorySource::new(frames, 30.0);
        let config = SamplingConfig::unrotated(8, 4, 0, Direction::Reverse, 20);

        let raster = expect_raster(run_to_end(source, config, 3));
        for column in 0..20u32 {
            assert_eq!(raster.image().get_pixel(column, 0).0[0], column as u8);
        }
        assert!(raster.image().pixels().all(|p| *p != BACKGROUND));
    }

    #[test]
    fn test_parallel_runs_are_deterministic() {
        let frames = coded_frames(300, 12, 8);
        let config = SamplingConfig {
            rotation_degrees: 7.5,
            ..SamplingConfig::unrotated(12, 8, 6, Direction::Forward, 300)
        };

        let a = expect_raster(run_to_end(
            MemorySource::new(frames.clone(), 30.0),
            config.clone(),
            8,
        ));
        let b = expect_raster(run_to_end(MemorySource::new(frames, 30.0), config, 2));
        assert_eq!(a.image().as_raw(), b.image().as_raw());
    }

    #[test]
    fn test_progress_reaches_one_only_on_completion() {
        let frames = coded_frames(10, 4, 4);
        let mut pipeline = ReconstructionPipeline::new(PipelineOptions::default().with_workers(2));
        let handle = pipeline
            .start(
                MemorySource::new(frames, 30.0),
                SamplingConfig::unrotated(4, 4, 1, Direction::Forward, 10),
            )
            .unwrap();
        let state = handle.state();
        let mut last = 0.0;
        while !handle.is_finished() {
            let p = handle.progress();
            assert!(p.fraction >= last);
            if p.fraction >= 1.0 {
                assert_eq!(p.status, RunStatus::Completed);
            }
            last = p.fraction;
        }
        assert!(matches!(handle.wait(), RunOutcome::Completed(_)));
        let p = state.progress();
        assert_eq!(p.fraction, 1.0);
        assert_eq!(p.status, RunStatus::Completed);
        assert_eq!(state.to_progress_json()["status"], "completed");
    }

    #[test]
    fn test_cancellation_mid_run() {
        let frames = coded_frames(50, 4, 4);
        let source = MemorySource::new(frames, 30.0).with_frame_delay(Duration::from_millis(10));
        let mut pipeline = ReconstructionPipeline::new(PipelineOptions::default().with_workers(2));
        let handle = pipeline
            .start(source, SamplingConfig::unrotated(4, 4, 1, Direction::Forward, 50))
            .unwrap();

        while handle.state().submitted() < 5 {
            thread::sleep(Duration::from_millis(1));
        }
        handle.cancel();
        let state = handle.state();
        assert!(matches!(handle.wait(), RunOutcome::Cancelled));
        assert_eq!(state.status(), RunStatus::Cancelled);
        assert!(state.submitted() < 50);
        assert!(state.progress().fraction < 1.0);
        assert_eq!(pipeline.status(), RunStatus::Cancelled);
    }

    #[test]
    fn test_second_start_rejected_while_running() {
        let slow = MemorySource::new(coded_frames(40, 4, 4), 30.0)
            .with_frame_delay(Duration::from_millis(10));
        let mut pipeline = ReconstructionPipeline::new(PipelineOptions::default().with_workers(2));
        let config = SamplingConfig::unrotated(4, 4, 1, Direction::Forward, 40);
        let handle = pipeline.start(slow, config).unwrap();
        assert_eq!(pipeline.status(), RunStatus::Running);

        let again = MemorySource::new(coded_frames(40, 4, 4), 30.0);
        let config = SamplingConfig::unrotated(4, 4, 1, Direction::Forward, 40);
        assert!(matches!(
            pipeline.start(again, config),
            Err(SlitScanError::AlreadyRunning)
        ));

        handle.cancel();
        assert!(matches!(handle.wait(), RunOutcome::Cancelled));

        // A terminal pipeline accepts a fresh run.
        let next = MemorySource::new(coded_frames(6, 4, 4), 30.0);
        let config = SamplingConfig::unrotated(4, 4, 2, Direction::Reverse, 6);
        let raster = expect_raster(pipeline.start(next, config).unwrap().wait());
        assert_eq!(raster.written_columns(), 6);
        assert_eq!(pipeline.status(), RunStatus::Completed);
    }

    #[test]
    fn test_decode_error_fails_run() {
        let frames = coded_frames(30, 4, 4);
        let source = MemorySource::new(frames, 30.0).failing_at(12);
        let config = SamplingConfig::unrotated(4, 4, 1, Direction::Forward, 30);
        let outcome = run_to_end(source, config, 2);
        assert!(matches!(outcome, RunOutcome::Failed(SlitScanError::Decode(_))));
    }

    #[test]
    fn test_over_reported_frame_count_fails() {
        let frames = coded_frames(8, 4, 4);
        let source = MemorySource::new(frames, 30.0).with_reported_frame_count(10);
        let config = SamplingConfig::unrotated(4, 4, 1, Direction::Forward, 10);
        let outcome = run_to_end(source, config, 2);
        match outcome {
            RunOutcome::Failed(SlitScanError::Decode(msg)) => assert!(msg.contains("8 of 10")),
            _ => panic!("expected decode failure"),
        }
    }

    #[test]
    fn test_under_reported_frame_count_fails() {
        let frames = coded_frames(12, 4, 4);
        let source = MemorySource::new(frames, 30.0).with_reported_frame_count(10);
        let config = SamplingConfig::unrotated(4, 4, 1, Direction::Forward, 10);
        let outcome = run_to_end(source, config, 2);
        assert!(matches!(outcome, RunOutcome::Failed(SlitScanError::Decode(_))));
    }

    #[test]
    fn test_line_outside_frame_rejected_before_decoding() {
        let frames = coded_frames(5, 16, 4);
        let source = MemorySource::new(frames, 30.0).failing_at(0);
        let mut pipeline = ReconstructionPipeline::default();
        let err = pipeline
            .start(source, SamplingConfig::unrotated(16, 4, 16, Direction::Forward, 5))
            .err()
            .unwrap();
        assert!(matches!(err, SlitScanError::InvalidLinePosition { position: 16, width: 16 }));
        assert_eq!(pipeline.status(), RunStatus::Idle);
    }

    #[test]
    fn test_stale_calibration_rejected() {
        let frames = coded_frames(5, 16, 4);
        let source = MemorySource::new(frames, 30.0);
        let config = SamplingConfig::unrotated(32, 4, 3, Direction::Forward, 5);
        let mut pipeline = ReconstructionPipeline::default();
        assert!(matches!(
            pipeline.start(source, config),
            Err(SlitScanError::InvalidFrameGeometry(_))
        ));
    }
}
