use super::{CaptureDevice, CaptureError, CaptureStream};
use anyhow::{anyhow, Context, Result};
use image::RgbaImage;
use nokhwa::pixel_format::RgbAFormat;
use nokhwa::utils::{CameraIndex, RequestedFormat, RequestedFormatType, Resolution};
use nokhwa::Camera;
use std::time::{Duration, Instant};

/// Webcam opened through nokhwa's v4l backend
pub struct WebcamCapture {
    device_index: u32,
    width: u32,
    height: u32,
}

impl WebcamCapture {
    pub fn new(device_index: u32, width: u32, height: u32) -> Self {
        Self {
            device_index,
            width,
            height,
        }
    }

    fn open_camera(&self) -> Result<Camera> {
        let index = CameraIndex::Index(self.device_index);
        let requested = RequestedFormat::new::<RgbAFormat>(RequestedFormatType::HighestResolution(
            Resolution::new(self.width, self.height),
        ));

        let mut camera = Camera::new(index, requested).context("Failed to open camera")?;
        camera
            .open_stream()
            .context("Failed to open camera stream")?;
        Ok(camera)
    }
}

impl CaptureDevice for WebcamCapture {
    fn open(&mut self) -> Result<Box<dyn CaptureStream>, CaptureError> {
        tracing::info!(
            "Opening webcam {} (requested {}x{})",
            self.device_index,
            self.width,
            self.height
        );

        let camera = self.open_camera().map_err(|source| CaptureError::Unavailable {
            device: format!("#{}", self.device_index),
            source,
        })?;

        let resolution = camera.resolution();
        tracing::info!(
            "Webcam stream open at {}x{}",
            resolution.width(),
            resolution.height()
        );

        Ok(Box::new(WebcamStream {
            camera,
            width: resolution.width(),
            height: resolution.height(),
        }))
    }
}

struct WebcamStream {
    camera: Camera,
    width: u32,
    height: u32,
}

impl WebcamStream {
    fn refresh_dimensions(&mut self) {
        let resolution = self.camera.resolution();
        self.width = resolution.width();
        self.height = resolution.height();
    }
}

impl CaptureStream for WebcamStream {
    fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn wait_for_metadata(&mut self, timeout: Duration) -> bool {
        // Drivers that report no format until streaming settle after the
        // first buffer, so pull one and re-read the negotiated resolution.
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if self.camera.frame().is_ok() {
                self.refresh_dimensions();
                return self.width != 0 && self.height != 0;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        false
    }

    fn current_frame(&mut self) -> Result<RgbaImage> {
        let frame = self.camera.frame().context("Failed to capture frame")?;

        let decoded = frame
            .decode_image::<RgbAFormat>()
            .context("Failed to decode frame")?;

        let (width, height) = decoded.dimensions();
        if (width, height) != (self.width, self.height) {
            tracing::debug!("Webcam frame size changed to {}x{}", width, height);
            self.width = width;
            self.height = height;
        }

        RgbaImage::from_raw(width, height, decoded.into_raw())
            .ok_or_else(|| anyhow!("Decoded frame buffer does not match {}x{}", width, height))
    }

    fn close(&mut self) {
        if let Err(err) = self.camera.stop_stream() {
            tracing::warn!("Failed to stop webcam stream: {}", err);
        }
    }
}
