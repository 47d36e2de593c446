//! Test doubles for the engine, camera and display boundaries.

use crate::capture::{CaptureDevice, CaptureError, CaptureStream};
use crate::output::DisplaySurface;
use crate::segmentation::{Mask, RunningMode, SegmentationEngine};
use anyhow::{anyhow, Result};
use crossbeam_channel::{unbounded, Receiver, Sender};
use image::{Rgba, RgbaImage};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

/// Poll `condition` until it holds or `timeout` elapses
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(1));
    }
    condition()
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Default)]
struct EngineState {
    mode: Option<RunningMode>,
    configured: Vec<RunningMode>,
    segment_modes: Vec<RunningMode>,
    delay: Duration,
    absent: bool,
    mask_len: Option<usize>,
    failures_left: usize,
}

/// Engine labelling every pixel with class 0
pub struct FakeEngine {
    state: Arc<Mutex<EngineState>>,
    in_flight: Arc<AtomicUsize>,
    max_in_flight: Arc<AtomicUsize>,
    gate: Option<(Sender<()>, Receiver<()>)>,
}

#[derive(Clone)]
pub struct EngineRecord {
    state: Arc<Mutex<EngineState>>,
    max_in_flight: Arc<AtomicUsize>,
}

/// Test side of a gated call: `entered` fires when the call begins, the call
/// blocks until `release` is sent or dropped
pub struct Gate {
    pub entered: Receiver<()>,
    pub release: Sender<()>,
}

impl Gate {
    fn new() -> (Self, (Sender<()>, Receiver<()>)) {
        let (entered_tx, entered_rx) = unbounded();
        let (release_tx, release_rx) = unbounded();
        (
            Self {
                entered: entered_rx,
                release: release_tx,
            },
            (entered_tx, release_rx),
        )
    }
}

fn pass_gate(gate: &Option<(Sender<()>, Receiver<()>)>) {
    if let Some((entered, release)) = gate {
        let _ = entered.send(());
        let _ = release.recv();
    }
}

impl FakeEngine {
    pub fn new() -> (Self, EngineRecord) {
        let state = Arc::new(Mutex::new(EngineState::default()));
        let max_in_flight = Arc::new(AtomicUsize::new(0));
        let engine = Self {
            state: Arc::clone(&state),
            in_flight: Arc::new(AtomicUsize::new(0)),
            max_in_flight: Arc::clone(&max_in_flight),
            gate: None,
        };
        (
            engine,
            EngineRecord {
                state,
                max_in_flight,
            },
        )
    }

    pub fn gated() -> (Self, EngineRecord, Gate) {
        let (mut engine, record) = Self::new();
        let (gate, engine_side) = Gate::new();
        engine.gate = Some(engine_side);
        (engine, record, gate)
    }
}

impl SegmentationEngine for FakeEngine {
    fn configure(&mut self, mode: RunningMode) -> Result<()> {
        let mut state = lock(&self.state);
        state.mode = Some(mode);
        state.configured.push(mode);
        Ok(())
    }

    fn segment(&mut self, frame: &RgbaImage, _timestamp_ms: f64) -> Result<Option<Mask>> {
        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(running, Ordering::SeqCst);

        let (delay, absent, mask_len, fail) = {
            let mut state = lock(&self.state);
            let mode = state.mode.unwrap_or(RunningMode::Image);
            state.segment_modes.push(mode);
            let fail = state.failures_left > 0;
            if fail {
                state.failures_left -= 1;
            }
            (state.delay, state.absent, state.mask_len, fail)
        };

        pass_gate(&self.gate);
        if !delay.is_zero() {
            thread::sleep(delay);
        }

        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if fail {
            return Err(anyhow!("inference backend fault"));
        }
        if absent {
            return Ok(None);
        }
        let len = mask_len.unwrap_or((frame.width() * frame.height()) as usize);
        Ok(Some(vec![0.0; len]))
    }
}

impl EngineRecord {
    pub fn configured(&self) -> Vec<RunningMode> {
        lock(&self.state).configured.clone()
    }

    /// Engine mode observed by each segment call, in call order
    pub fn segment_modes(&self) -> Vec<RunningMode> {
        lock(&self.state).segment_modes.clone()
    }

    pub fn segment_calls(&self) -> usize {
        lock(&self.state).segment_modes.len()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn set_delay(&self, delay: Duration) {
        lock(&self.state).delay = delay;
    }

    pub fn set_absent(&self, absent: bool) {
        lock(&self.state).absent = absent;
    }

    pub fn set_mask_len(&self, len: Option<usize>) {
        lock(&self.state).mask_len = len;
    }

    pub fn fail_next_segments(&self, count: usize) {
        lock(&self.state).failures_left = count;
    }
}

#[derive(Default)]
struct CameraState {
    dimensions: (u32, u32),
    after_wait: Option<(u32, u32)>,
    fail_opens: usize,
    opens: usize,
    closes: usize,
    metadata_waits: usize,
    frames_read: usize,
}

/// Camera producing solid-color frames
pub struct FakeCamera {
    state: Arc<Mutex<CameraState>>,
    color: Rgba<u8>,
    open_gate: Option<(Sender<()>, Receiver<()>)>,
}

#[derive(Clone)]
pub struct CameraRecord {
    state: Arc<Mutex<CameraState>>,
}

impl FakeCamera {
    pub fn new(width: u32, height: u32) -> (Self, CameraRecord) {
        Self::with_color(width, height, Rgba([40, 80, 120, 255]))
    }

    pub fn with_color(width: u32, height: u32, color: Rgba<u8>) -> (Self, CameraRecord) {
        let state = Arc::new(Mutex::new(CameraState {
            dimensions: (width, height),
            ..CameraState::default()
        }));
        (
            Self {
                state: Arc::clone(&state),
                color,
                open_gate: None,
            },
            CameraRecord { state },
        )
    }

    /// Camera whose `open` blocks until the gate is released
    pub fn gated(width: u32, height: u32) -> (Self, CameraRecord, Gate) {
        let (mut camera, record) = Self::new(width, height);
        let (gate, camera_side) = Gate::new();
        camera.open_gate = Some(camera_side);
        (camera, record, gate)
    }
}

impl CaptureDevice for FakeCamera {
    fn open(&mut self) -> Result<Box<dyn CaptureStream>, CaptureError> {
        pass_gate(&self.open_gate);

        let mut state = lock(&self.state);
        state.opens += 1;
        if state.fail_opens > 0 {
            state.fail_opens -= 1;
            return Err(CaptureError::Unavailable {
                device: "fake".to_string(),
                source: anyhow!("permission denied"),
            });
        }
        Ok(Box::new(FakeStream {
            state: Arc::clone(&self.state),
            color: self.color,
        }))
    }
}

struct FakeStream {
    state: Arc<Mutex<CameraState>>,
    color: Rgba<u8>,
}

impl CaptureStream for FakeStream {
    fn dimensions(&self) -> (u32, u32) {
        lock(&self.state).dimensions
    }

    fn wait_for_metadata(&mut self, timeout: Duration) -> bool {
        let ready = {
            let mut state = lock(&self.state);
            state.metadata_waits += 1;
            if let Some(dimensions) = state.after_wait.take() {
                state.dimensions = dimensions;
                true
            } else {
                false
            }
        };
        if !ready {
            thread::sleep(timeout);
        }
        ready
    }

    fn current_frame(&mut self) -> Result<RgbaImage> {
        let mut state = lock(&self.state);
        state.frames_read += 1;
        let (width, height) = state.dimensions;
        Ok(RgbaImage::from_pixel(width, height, self.color))
    }

    fn close(&mut self) {
        lock(&self.state).closes += 1;
    }
}

impl CameraRecord {
    pub fn opens(&self) -> usize {
        lock(&self.state).opens
    }

    pub fn closes(&self) -> usize {
        lock(&self.state).closes
    }

    pub fn metadata_waits(&self) -> usize {
        lock(&self.state).metadata_waits
    }

    pub fn frames_read(&self) -> usize {
        lock(&self.state).frames_read
    }

    pub fn fail_next_opens(&self, count: usize) {
        lock(&self.state).fail_opens = count;
    }

    /// Report `(width, height)` once the stream is waited on
    pub fn dimensions_after_wait(&self, width: u32, height: u32) {
        lock(&self.state).after_wait = Some((width, height));
    }
}

/// Display keeping every presented frame
pub struct RecordingDisplay {
    frames: Arc<Mutex<Vec<RgbaImage>>>,
}

#[derive(Clone)]
pub struct PresentedFrames {
    frames: Arc<Mutex<Vec<RgbaImage>>>,
}

impl RecordingDisplay {
    pub fn new() -> (Self, PresentedFrames) {
        let frames = Arc::new(Mutex::new(Vec::new()));
        (
            Self {
                frames: Arc::clone(&frames),
            },
            PresentedFrames { frames },
        )
    }
}

impl DisplaySurface for RecordingDisplay {
    fn present(&mut self, frame: &RgbaImage) -> Result<()> {
        lock(&self.frames).push(frame.clone());
        Ok(())
    }
}

impl PresentedFrames {
    pub fn count(&self) -> usize {
        lock(&self.frames).len()
    }

    pub fn last(&self) -> Option<RgbaImage> {
        lock(&self.frames).last().cloned()
    }
}
