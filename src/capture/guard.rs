use super::{CaptureDevice, CaptureError, CaptureStream};

/// Camera stream held open for the lifetime of one capture session
///
/// The stream is closed when the guard is released or dropped, including
/// while unwinding out of the frame loop.
pub struct CaptureGuard {
    stream: Box<dyn CaptureStream>,
}

impl CaptureGuard {
    pub fn acquire(device: &mut dyn CaptureDevice) -> Result<Self, CaptureError> {
        let stream = device.open()?;
        tracing::debug!("Capture stream acquired");
        Ok(Self { stream })
    }

    pub fn stream(&mut self) -> &mut dyn CaptureStream {
        self.stream.as_mut()
    }

    pub fn release(self) {
        drop(self);
    }
}

impl Drop for CaptureGuard {
    fn drop(&mut self) {
        self.stream.close();
        tracing::debug!("Capture stream released");
    }
}
