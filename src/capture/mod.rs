mod guard;
mod v4l_capture;

pub use guard::CaptureGuard;
pub use v4l_capture::WebcamCapture;

use anyhow::Result;
use image::RgbaImage;
use std::time::Duration;
use thiserror::Error;

/// Camera that can be opened into a frame stream
///
/// Devices are moved onto the frame loop thread, so the stream itself never
/// has to cross threads.
pub trait CaptureDevice: Send {
    /// Open the camera stream (may fail with a permission/availability error)
    fn open(&mut self) -> Result<Box<dyn CaptureStream>, CaptureError>;
}

/// Open camera stream yielding decoded RGBA frames
pub trait CaptureStream {
    /// Intrinsic frame dimensions, (0, 0) until stream metadata is known
    fn dimensions(&self) -> (u32, u32);

    /// Block until stream metadata is known or `timeout` elapses
    ///
    /// Returns whether the metadata became available.
    fn wait_for_metadata(&mut self, timeout: Duration) -> bool;

    /// Snapshot of the current frame
    fn current_frame(&mut self) -> Result<RgbaImage>;

    /// Stop the stream and release the device
    fn close(&mut self);
}

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("camera {device} is unavailable")]
    Unavailable {
        device: String,
        #[source]
        source: anyhow::Error,
    },
}
