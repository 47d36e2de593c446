mod loopback;

pub use loopback::V4L2Output;

use anyhow::Result;
use image::RgbaImage;

/// Raster surface that blended frames are presented to
pub trait DisplaySurface: Send {
    /// Present a frame
    fn present(&mut self, frame: &RgbaImage) -> Result<()>;
}
