use super::DisplaySurface;
use anyhow::{Context, Result};
use image::RgbaImage;
use std::fs::File;
use std::io::Write;
use std::path::Path;
use v4l::video::Output;
use v4l::{Device, Format, FourCC};

/// v4l2loopback device presented as a display surface
pub struct V4L2Output {
    file: File,
    width: u32,
    height: u32,
    yuyv: Vec<u8>,
}

impl V4L2Output {
    pub fn new<P: AsRef<Path>>(device_path: P, width: u32, height: u32) -> Result<Self> {
        let path = device_path.as_ref();
        tracing::info!(
            "Opening v4l2loopback device at {} ({}x{})",
            path.display(),
            width,
            height
        );

        // Negotiate YUYV at the output size so readers see the right format
        let device = Device::with_path(path)
            .with_context(|| format!("Failed to open v4l2 device at {}", path.display()))?;
        let requested = Format::new(width, height, FourCC::new(b"YUYV"));
        let actual = Output::set_format(&device, &requested)
            .context("Failed to set v4l2loopback output format")?;
        if (actual.width, actual.height) != (width, height) {
            tracing::warn!(
                "v4l2loopback accepted {}x{} instead of {}x{}",
                actual.width,
                actual.height,
                width,
                height
            );
        }

        // v4l2loopback accepts raw frame data written to the device file
        let file = File::options()
            .write(true)
            .open(path)
            .with_context(|| format!("Failed to open v4l2loopback device at {}", path.display()))?;

        tracing::info!("v4l2loopback device opened successfully");

        Ok(Self {
            file,
            width: actual.width,
            height: actual.height,
            yuyv: Vec::new(),
        })
    }
}

/// Pack an RGBA frame as YUV 4:2:2 (YUYV), alpha ignored
///
/// Pixels are taken in pairs along each row; the pair shares the averaged
/// chroma. An odd trailing pixel is paired with itself.
fn rgba_to_yuyv(frame: &RgbaImage, out: &mut Vec<u8>) {
    out.clear();
    let row_bytes = frame.width() as usize * 4;
    if row_bytes == 0 {
        return;
    }
    out.reserve(frame.as_raw().len() / 2 + frame.height() as usize * 2);

    for row in frame.as_raw().chunks_exact(row_bytes) {
        for pair in row.chunks(8) {
            let (first, second) = pair.split_at(4);
            let second = if second.is_empty() { first } else { second };

            let [y0, u0, v0] = bt601(first);
            let [y1, u1, v1] = bt601(second);

            out.extend_from_slice(&[
                to_byte(y0),
                to_byte((u0 + u1) / 2.0 + 128.0),
                to_byte(y1),
                to_byte((v0 + v1) / 2.0 + 128.0),
            ]);
        }
    }
}

/// BT.601 luma and zero-centred chroma of an RGBA pixel
fn bt601(px: &[u8]) -> [f32; 3] {
    let (r, g, b) = (px[0] as f32, px[1] as f32, px[2] as f32);
    [
        0.299 * r + 0.587 * g + 0.114 * b,
        -0.147 * r - 0.289 * g + 0.436 * b,
        0.615 * r - 0.515 * g - 0.100 * b,
    ]
}

fn to_byte(value: f32) -> u8 {
    value.clamp(0.0, 255.0) as u8
}

impl DisplaySurface for V4L2Output {
    fn present(&mut self, frame: &RgbaImage) -> Result<()> {
        let scaled;
        let frame = if frame.dimensions() != (self.width, self.height) {
            scaled = image::imageops::resize(
                frame,
                self.width,
                self.height,
                image::imageops::FilterType::Triangle,
            );
            &scaled
        } else {
            frame
        };

        rgba_to_yuyv(frame, &mut self.yuyv);

        self.file
            .write_all(&self.yuyv)
            .context("Failed to write frame to v4l2loopback device")?;

        Ok(())
    }
}
