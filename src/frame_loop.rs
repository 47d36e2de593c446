//! Capture → segment → blend → present loop.
//!
//! One worker thread runs the loop for the lifetime of a capture session.
//! Iterations run back to back on that thread and the next tick is armed only
//! after the previous iteration (including its present) has returned, so at
//! most one frame is ever in flight. `stop` is cooperative: the flag is read
//! at iteration boundaries and never interrupts a frame.

use crate::blend;
use crate::capture::{CaptureDevice, CaptureError, CaptureGuard, CaptureStream};
use crate::output::DisplaySurface;
use crate::segmentation::{InferenceSession, Mask, RunningMode, SegmentError};
use crossbeam_channel::{bounded, Sender};
use image::RgbaImage;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Debug, Clone)]
pub struct LoopConfig {
    /// Refresh ticks per second
    pub fps: u32,
    /// Bound of the single wait for camera metadata per iteration
    pub metadata_timeout: Duration,
    /// Iterations between statistics log lines (0 disables them)
    pub stats_interval: u64,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            fps: 30,
            metadata_timeout: Duration::from_secs(2),
            stats_interval: 30,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Idle,
    Starting,
    Running,
    Stopping,
}

#[derive(Debug, Error)]
pub enum StartError {
    #[error("frame loop is already running")]
    AlreadyRunning,

    #[error(transparent)]
    CaptureUnavailable(#[from] CaptureError),

    #[error("segmentation engine failed: {0}")]
    EngineLoad(String),

    #[error("start was cancelled by a stop request")]
    Cancelled,

    #[error("frame loop worker is gone")]
    WorkerLost,
}

/// Loop state shared between the controller and the worker thread.
/// Only the side currently driving a transition writes it.
struct StateCell(AtomicU8);

impl StateCell {
    fn new(state: LoopState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    fn get(&self) -> LoopState {
        match self.0.load(Ordering::Acquire) {
            0 => LoopState::Idle,
            1 => LoopState::Starting,
            2 => LoopState::Running,
            _ => LoopState::Stopping,
        }
    }

    fn set(&self, state: LoopState) {
        self.0.store(state as u8, Ordering::Release);
    }
}

/// Requests a cooperative stop from any thread
#[derive(Clone)]
pub struct StopHandle {
    requested: Arc<AtomicBool>,
    state: Arc<StateCell>,
}

impl StopHandle {
    fn new(state: Arc<StateCell>) -> Self {
        Self {
            requested: Arc::new(AtomicBool::new(false)),
            state,
        }
    }

    /// Loop state as seen from outside the controller
    pub fn state(&self) -> LoopState {
        self.state.get()
    }

    pub fn request_stop(&self) {
        self.requested.store(true, Ordering::Release);
    }

    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::Acquire)
    }

    fn reset(&self) {
        self.requested.store(false, Ordering::Release);
    }
}

/// Why an iteration ended without presenting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    DimensionsNotReady,
    CaptureFailed,
    EngineNotReady,
    SegmentFailed,
    MaskAbsent,
    PresentFailed,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            SkipReason::DimensionsNotReady => "dimensions not ready",
            SkipReason::CaptureFailed => "capture failed",
            SkipReason::EngineNotReady => "engine not ready",
            SkipReason::SegmentFailed => "segmentation failed",
            SkipReason::MaskAbsent => "mask absent",
            SkipReason::PresentFailed => "present failed",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Presented,
    Skipped(SkipReason),
}

/// Accumulated time of one pipeline stage, averaged over the frames that
/// actually reached it
#[derive(Debug, Clone, Copy, Default)]
struct StageTime {
    total: Duration,
    count: u64,
}

impl StageTime {
    fn add(&mut self, elapsed: Duration) {
        self.total += elapsed;
        self.count += 1;
    }

    fn average_ms(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.total.as_secs_f64() * 1000.0 / self.count as f64
        }
    }
}

/// Counters and stage timings for one capture session
#[derive(Debug, Clone, Default)]
pub struct LoopStats {
    pub iterations: u64,
    pub presented: u64,
    pub dimensions_not_ready: u64,
    pub capture_failed: u64,
    pub engine_not_ready: u64,
    pub segment_failed: u64,
    pub mask_absent: u64,
    pub present_failed: u64,
    started: Option<Instant>,
    finished: Option<Instant>,
    capture: StageTime,
    segment: StageTime,
    blend: StageTime,
    present: StageTime,
}

impl LoopStats {
    pub fn skipped(&self) -> u64 {
        self.iterations - self.presented
    }

    /// Presented frames per wall-clock second of the session (so far, while
    /// it is still running)
    pub fn effective_fps(&self) -> f64 {
        self.effective_fps_at(self.finished.unwrap_or_else(Instant::now))
    }

    fn effective_fps_at(&self, now: Instant) -> f64 {
        let Some(started) = self.started else {
            return 0.0;
        };
        let elapsed = now.saturating_duration_since(started).as_secs_f64();
        if elapsed > 0.0 {
            self.presented as f64 / elapsed
        } else {
            0.0
        }
    }

    fn record(&mut self, outcome: Outcome) {
        self.iterations += 1;
        match outcome {
            Outcome::Presented => self.presented += 1,
            Outcome::Skipped(reason) => {
                let counter = match reason {
                    SkipReason::DimensionsNotReady => &mut self.dimensions_not_ready,
                    SkipReason::CaptureFailed => &mut self.capture_failed,
                    SkipReason::EngineNotReady => &mut self.engine_not_ready,
                    SkipReason::SegmentFailed => &mut self.segment_failed,
                    SkipReason::MaskAbsent => &mut self.mask_absent,
                    SkipReason::PresentFailed => &mut self.present_failed,
                };
                *counter += 1;
            }
        }
    }

    fn log(&self) {
        tracing::info!(
            "Frame {}: presented={}, skipped={}, capture={:.1}ms, segment={:.1}ms, blend={:.1}ms, present={:.1}ms, fps={:.1}",
            self.iterations,
            self.presented,
            self.skipped(),
            self.capture.average_ms(),
            self.segment.average_ms(),
            self.blend.average_ms(),
            self.present.average_ms(),
            self.effective_fps()
        );
    }
}

/// Everything the worker thread owns while a session runs
struct Pipeline {
    device: Box<dyn CaptureDevice>,
    session: InferenceSession,
    display: Box<dyn DisplaySurface>,
    stats: LoopStats,
}

/// Start/stop controller for the segmentation overlay loop
pub struct FrameLoop {
    config: LoopConfig,
    state: Arc<StateCell>,
    stop: StopHandle,
    pipeline: Option<Pipeline>,
    worker: Option<JoinHandle<Pipeline>>,
    stats: LoopStats,
}

impl FrameLoop {
    pub fn new(
        config: LoopConfig,
        device: Box<dyn CaptureDevice>,
        session: InferenceSession,
        display: Box<dyn DisplaySurface>,
    ) -> Self {
        let state = Arc::new(StateCell::new(LoopState::Idle));
        Self {
            config,
            stop: StopHandle::new(Arc::clone(&state)),
            state,
            pipeline: Some(Pipeline {
                device,
                session,
                display,
                stats: LoopStats::default(),
            }),
            worker: None,
            stats: LoopStats::default(),
        }
    }

    pub fn state(&self) -> LoopState {
        self.state.get()
    }

    pub fn is_running(&self) -> bool {
        self.state.get() == LoopState::Running
            && self.worker.as_ref().is_some_and(|worker| !worker.is_finished())
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// Statistics of the most recently stopped session
    pub fn stats(&self) -> &LoopStats {
        &self.stats
    }

    /// Open the camera and begin a new capture session
    ///
    /// Blocks until the camera is open. On failure the loop is back to Idle
    /// and nothing is retried.
    pub fn start(&mut self) -> Result<(), StartError> {
        let worker_done = self.state.get() == LoopState::Idle
            || self.worker.as_ref().is_some_and(|worker| worker.is_finished());
        if self.worker.is_some() && worker_done {
            // Stopped through a handle (or died); collect it before restarting
            self.join_worker();
        }
        if self.state.get() != LoopState::Idle {
            return Err(StartError::AlreadyRunning);
        }

        let mut pipeline = self.pipeline.take().ok_or(StartError::WorkerLost)?;
        if let Some(reason) = pipeline.session.load_error() {
            let err = StartError::EngineLoad(reason.to_string());
            self.pipeline = Some(pipeline);
            return Err(err);
        }

        tracing::info!("Starting frame loop");
        self.state.set(LoopState::Starting);
        self.stop.reset();
        pipeline.stats = LoopStats::default();

        let (ready_tx, ready_rx) = bounded(1);
        let config = self.config.clone();
        let state = Arc::clone(&self.state);
        let stop = self.stop.clone();
        let spawned = thread::Builder::new()
            .name("frame-loop".to_string())
            .spawn(move || run_session(pipeline, config, state, stop, ready_tx));
        let worker = match spawned {
            Ok(worker) => worker,
            Err(err) => {
                tracing::error!("Failed to spawn frame loop thread: {}", err);
                self.state.set(LoopState::Idle);
                return Err(StartError::WorkerLost);
            }
        };
        self.worker = Some(worker);

        // A closed channel means the worker died before reporting
        let started = ready_rx.recv().unwrap_or(Err(StartError::WorkerLost));
        if let Err(err) = started {
            tracing::warn!("Frame loop failed to start: {}", err);
            self.join_worker();
            return Err(err);
        }

        tracing::info!("Frame loop running");
        Ok(())
    }

    /// Stop after the in-flight frame completes and release the camera
    ///
    /// No-op unless a session is running.
    pub fn stop(&mut self) {
        if self.worker.is_none() {
            return;
        }

        tracing::info!("Stopping frame loop");
        self.stop.request_stop();
        self.join_worker();
        tracing::info!(
            "Frame loop stopped after {} frames ({} presented)",
            self.stats.iterations,
            self.stats.presented
        );
    }

    fn join_worker(&mut self) {
        let Some(worker) = self.worker.take() else {
            return;
        };

        match worker.join() {
            Ok(pipeline) => {
                self.stats = pipeline.stats.clone();
                self.pipeline = Some(pipeline);
            }
            Err(_) => {
                tracing::error!("Frame loop worker panicked; pipeline lost");
            }
        }
        self.state.set(LoopState::Idle);
    }
}

impl Drop for FrameLoop {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Worker thread body: acquire the camera, report start, loop until stopped
fn run_session(
    mut pipeline: Pipeline,
    config: LoopConfig,
    state: Arc<StateCell>,
    stop: StopHandle,
    ready: Sender<Result<(), StartError>>,
) -> Pipeline {
    let mut guard = match CaptureGuard::acquire(pipeline.device.as_mut()) {
        Ok(guard) => guard,
        Err(err) => {
            let _ = ready.send(Err(err.into()));
            return pipeline;
        }
    };

    if stop.is_requested() {
        guard.release();
        let _ = ready.send(Err(StartError::Cancelled));
        return pipeline;
    }

    if let Err(err) = pipeline.session.begin() {
        guard.release();
        let _ = ready.send(Err(StartError::EngineLoad(format!("{:#}", err))));
        return pipeline;
    }

    state.set(LoopState::Running);
    pipeline.stats.started = Some(Instant::now());
    if !pipeline.session.is_ready() {
        tracing::info!("Segmentation engine still loading, frames are skipped until it is ready");
    }
    let _ = ready.send(Ok(()));
    drop(ready);

    let tick = Duration::from_secs_f64(1.0 / config.fps.max(1) as f64);
    let mut frames = FrameRunner::new(&config);

    while !stop.is_requested() {
        let tick_start = Instant::now();

        let outcome = frames.iterate(&mut pipeline, guard.stream());
        if let Outcome::Skipped(reason) = outcome {
            tracing::debug!("Frame {} skipped: {}", pipeline.stats.iterations + 1, reason);
        }
        pipeline.stats.record(outcome);

        if config.stats_interval > 0 && pipeline.stats.iterations % config.stats_interval == 0 {
            pipeline.stats.log();
        }

        // Arm the next tick only now that this frame is fully done
        let elapsed = tick_start.elapsed();
        if elapsed < tick {
            thread::sleep(tick - elapsed);
        }
    }

    state.set(LoopState::Stopping);
    pipeline.stats.finished = Some(Instant::now());
    guard.release();
    state.set(LoopState::Idle);
    pipeline
}

/// Per-session iteration state
struct FrameRunner {
    metadata_timeout: Duration,
    session_start: Instant,
    destination: RgbaImage,
    warned_dimensions: bool,
    warned_engine: bool,
}

impl FrameRunner {
    fn new(config: &LoopConfig) -> Self {
        Self {
            metadata_timeout: config.metadata_timeout,
            session_start: Instant::now(),
            destination: RgbaImage::new(0, 0),
            warned_dimensions: false,
            warned_engine: false,
        }
    }

    /// One capture → segment → blend → present pass
    fn iterate(&mut self, pipeline: &mut Pipeline, stream: &mut dyn CaptureStream) -> Outcome {
        if !self.dimensions_ready(stream) {
            return Outcome::Skipped(SkipReason::DimensionsNotReady);
        }

        let capture_start = Instant::now();
        let source = match stream.current_frame() {
            Ok(frame) => frame,
            Err(err) => {
                tracing::warn!("Failed to capture frame: {:#}", err);
                return Outcome::Skipped(SkipReason::CaptureFailed);
            }
        };
        pipeline.stats.capture.add(capture_start.elapsed());
        if source.width() == 0 || source.height() == 0 {
            return Outcome::Skipped(SkipReason::DimensionsNotReady);
        }

        let segment_start = Instant::now();
        let mask = self.segment(&mut pipeline.session, &source);
        pipeline.stats.segment.add(segment_start.elapsed());
        let mask = match mask {
            Ok(mask) => mask,
            Err(reason) => return Outcome::Skipped(reason),
        };

        let blend_start = Instant::now();
        blend::blend_into(&mask, &source, &mut self.destination);
        pipeline.stats.blend.add(blend_start.elapsed());

        let present_start = Instant::now();
        let presented = pipeline.display.present(&self.destination);
        pipeline.stats.present.add(present_start.elapsed());
        if let Err(err) = presented {
            tracing::warn!("Failed to present frame: {:#}", err);
            return Outcome::Skipped(SkipReason::PresentFailed);
        }

        Outcome::Presented
    }

    /// Check frame dimensions, waiting once for metadata if they are unknown
    fn dimensions_ready(&mut self, stream: &mut dyn CaptureStream) -> bool {
        let (width, height) = stream.dimensions();
        if width != 0 && height != 0 {
            return true;
        }

        if !self.warned_dimensions {
            tracing::warn!("Video dimensions are not ready yet, waiting for metadata");
            self.warned_dimensions = true;
        }
        stream.wait_for_metadata(self.metadata_timeout);

        let (width, height) = stream.dimensions();
        if width == 0 || height == 0 {
            tracing::debug!("Video dimensions are still 0, skipping frame");
            return false;
        }
        tracing::info!("Video dimensions ready: {}x{}", width, height);
        true
    }

    /// Segment the frame; the first completed frame of a session runs in
    /// image mode and flips the session to video mode
    fn segment(
        &mut self,
        session: &mut InferenceSession,
        source: &RgbaImage,
    ) -> Result<Mask, SkipReason> {
        let timestamp_ms = self.session_start.elapsed().as_secs_f64() * 1000.0;
        let first_frame = session.mode() == RunningMode::Image;

        let result = session.segment(source, timestamp_ms);

        if first_frame && result.is_ok() {
            if let Err(err) = session.ensure_video_mode() {
                tracing::warn!("Failed to switch to video mode: {}", err);
            }
        }

        match result {
            Ok(Some(mask)) => Ok(mask),
            Ok(None) => Err(SkipReason::MaskAbsent),
            Err(SegmentError::EngineNotReady) => {
                if !self.warned_engine {
                    tracing::warn!("Segmentation engine not ready, skipping frames");
                    self.warned_engine = true;
                }
                Err(SkipReason::EngineNotReady)
            }
            Err(err) => {
                tracing::warn!("Segmentation failed: {}", err);
                Err(SkipReason::SegmentFailed)
            }
        }
    }
}
