use anyhow::Result;
use image::RgbaImage;
use std::fmt;
use thiserror::Error;

/// Category mask: one value per pixel, class id encoded as `class / 255`.
/// Dimensions match the input frame dimensions, flattened in row-major order.
pub type Mask = Vec<f32>;

/// Inference configuration of an engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunningMode {
    Image,
    Video,
}

impl fmt::Display for RunningMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunningMode::Image => f.write_str("IMAGE"),
            RunningMode::Video => f.write_str("VIDEO"),
        }
    }
}

/// Execution backend requested when loading an engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Backend {
    Cpu,
    Cuda,
    #[value(name = "tensorrt")]
    TensorRt,
}

/// Trait for segmentation engines
/// Allows swapping between backends (ONNX DeepLab, test doubles, ...)
pub trait SegmentationEngine: Send {
    /// Switch the engine between single-image and video inference
    fn configure(&mut self, mode: RunningMode) -> Result<()>;

    /// Segment a frame
    ///
    /// # Returns
    /// * `Some(mask)` sized to the frame, or `None` if the engine produced no
    ///   category mask for this frame
    fn segment(&mut self, frame: &RgbaImage, timestamp_ms: f64) -> Result<Option<Mask>>;
}

/// Per-frame segmentation failures. None of these stop the frame loop.
#[derive(Debug, Error)]
pub enum SegmentError {
    #[error("segmentation engine is not ready")]
    EngineNotReady,

    #[error("mask has {actual} values, frame needs {expected}")]
    MaskShape { expected: usize, actual: usize },

    #[error("video timestamp {current}ms does not follow {previous}ms")]
    NonMonotonicTimestamp { previous: f64, current: f64 },

    #[error(transparent)]
    Inference(#[from] anyhow::Error),
}
