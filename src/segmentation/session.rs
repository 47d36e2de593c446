use super::types::{Mask, RunningMode, SegmentError, SegmentationEngine};
use super::PendingEngine;
use anyhow::Result;
use image::RgbaImage;
use crossbeam_channel::TryRecvError;

enum EngineSlot {
    Loading(PendingEngine),
    Ready(Box<dyn SegmentationEngine>),
    Failed(String),
}

/// Owns the segmentation engine and sequences its running mode
///
/// A session starts in [`RunningMode::Image`]. The first frame is segmented
/// in that mode, after which [`InferenceSession::ensure_video_mode`] switches
/// the engine to video once; [`InferenceSession::begin`] resets this for the
/// next capture session.
pub struct InferenceSession {
    slot: EngineSlot,
    mode: RunningMode,
    last_timestamp_ms: Option<f64>,
}

impl InferenceSession {
    /// Session over an engine that is still loading
    pub fn new(pending: PendingEngine) -> Self {
        Self {
            slot: EngineSlot::Loading(pending),
            mode: RunningMode::Image,
            last_timestamp_ms: None,
        }
    }

    /// Session over an already loaded engine
    #[cfg(test)]
    pub fn with_engine(engine: Box<dyn SegmentationEngine>) -> Self {
        Self {
            slot: EngineSlot::Ready(engine),
            mode: RunningMode::Image,
            last_timestamp_ms: None,
        }
    }

    /// Pick up the result of a background load, if it has arrived
    fn poll(&mut self) {
        let EngineSlot::Loading(pending) = &self.slot else {
            return;
        };

        let next = match pending.receiver.try_recv() {
            Ok(Ok(engine)) => {
                tracing::info!("Segmentation engine ready");
                EngineSlot::Ready(engine)
            }
            Ok(Err(err)) => {
                tracing::error!("Segmentation engine failed to load: {:#}", err);
                EngineSlot::Failed(format!("{:#}", err))
            }
            Err(TryRecvError::Empty) => return,
            Err(TryRecvError::Disconnected) => {
                tracing::error!("Segmentation engine loader exited without a result");
                EngineSlot::Failed("engine loader exited without a result".to_string())
            }
        };
        self.slot = next;
    }

    pub fn is_ready(&mut self) -> bool {
        self.poll();
        matches!(self.slot, EngineSlot::Ready(_))
    }

    /// Reason the engine failed to load, once the load has finished
    pub fn load_error(&mut self) -> Option<&str> {
        self.poll();
        match &self.slot {
            EngineSlot::Failed(reason) => Some(reason.as_str()),
            _ => None,
        }
    }

    pub fn mode(&self) -> RunningMode {
        self.mode
    }

    /// Reset mode and timestamp tracking for a new capture session
    pub fn begin(&mut self) -> Result<()> {
        self.poll();
        if self.mode == RunningMode::Video {
            if let EngineSlot::Ready(engine) = &mut self.slot {
                engine.configure(RunningMode::Image)?;
            }
        }
        self.mode = RunningMode::Image;
        self.last_timestamp_ms = None;
        Ok(())
    }

    /// Switch the engine to video mode if it is still in image mode
    ///
    /// The mode is updated before returning; later calls are no-ops.
    pub fn ensure_video_mode(&mut self) -> Result<(), SegmentError> {
        if self.mode == RunningMode::Video {
            return Ok(());
        }

        self.poll();
        let EngineSlot::Ready(engine) = &mut self.slot else {
            return Err(SegmentError::EngineNotReady);
        };
        engine.configure(RunningMode::Video)?;
        self.mode = RunningMode::Video;
        tracing::debug!("Running mode switched to {}", self.mode);
        Ok(())
    }

    /// Segment one frame in the current mode
    ///
    /// In video mode timestamps must strictly increase within the session.
    pub fn segment(
        &mut self,
        frame: &RgbaImage,
        timestamp_ms: f64,
    ) -> Result<Option<Mask>, SegmentError> {
        self.poll();
        let EngineSlot::Ready(engine) = &mut self.slot else {
            return Err(SegmentError::EngineNotReady);
        };

        if self.mode == RunningMode::Video {
            if let Some(previous) = self.last_timestamp_ms {
                if timestamp_ms <= previous {
                    return Err(SegmentError::NonMonotonicTimestamp {
                        previous,
                        current: timestamp_ms,
                    });
                }
            }
            self.last_timestamp_ms = Some(timestamp_ms);
        }

        let Some(mask) = engine.segment(frame, timestamp_ms)? else {
            return Ok(None);
        };

        let expected = frame.width() as usize * frame.height() as usize;
        if mask.len() != expected {
            return Err(SegmentError::MaskShape {
                expected,
                actual: mask.len(),
            });
        }

        Ok(Some(mask))
    }
}
