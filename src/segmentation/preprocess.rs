use anyhow::{bail, Result};
use image::{imageops, GrayImage, Luma, RgbaImage};
use ndarray::{Array4, ArrayView4};

/// ImageNet channel statistics used by DeepLab exports
const MEAN: [f32; 3] = [0.485, 0.456, 0.406];
const STD: [f32; 3] = [0.229, 0.224, 0.225];

/// Converts RGBA frames into model input tensors and model logits back into
/// category masks
pub struct Preprocessor {
    target_width: u32,
    target_height: u32,
}

impl Preprocessor {
    pub fn new(target_width: u32, target_height: u32) -> Self {
        Self {
            target_width,
            target_height,
        }
    }

    /// Preprocess an RGBA frame into a normalized NCHW tensor
    ///
    /// Steps:
    /// 1. Resize to target dimensions (bilinear)
    /// 2. Scale to [0, 1] and normalize with per-channel mean/std
    /// 3. Transpose from HWC to NCHW, dropping alpha
    ///
    /// Returns: Array4<f32> with shape [1, 3, height, width]
    pub fn preprocess(&self, frame: &RgbaImage) -> Array4<f32> {
        let _span = tracing::debug_span!("preprocess").entered();

        let resized;
        let image = if frame.dimensions() != (self.target_width, self.target_height) {
            resized = imageops::resize(
                frame,
                self.target_width,
                self.target_height,
                imageops::FilterType::Triangle,
            );
            &resized
        } else {
            frame
        };

        let (width, height) = image.dimensions();
        let mut tensor = Array4::<f32>::zeros((1, 3, height as usize, width as usize));
        for (x, y, pixel) in image.enumerate_pixels() {
            for c in 0..3 {
                let value = pixel[c] as f32 / 255.0;
                tensor[[0, c, y as usize, x as usize]] = (value - MEAN[c]) / STD[c];
            }
        }

        tensor
    }

    /// Reduce logits shaped [1, classes, h, w] to a category mask at frame
    /// resolution
    ///
    /// Each pixel takes the argmax class, the class map is resized with
    /// nearest-neighbor sampling (class ids must not be interpolated), and
    /// ids are encoded as `class / 255`.
    pub fn logits_to_mask(
        logits: ArrayView4<f32>,
        frame_width: u32,
        frame_height: u32,
    ) -> Result<Vec<f32>> {
        let _span = tracing::debug_span!("postprocess").entered();

        let (batch, classes, height, width) = logits.dim();
        if batch != 1 || classes < 2 {
            bail!("unexpected logits shape {:?}", logits.dim());
        }
        if classes > u8::MAX as usize + 1 {
            bail!("{} classes do not fit a category mask", classes);
        }

        let class_map = GrayImage::from_fn(width as u32, height as u32, |x, y| {
            let (x, y) = (x as usize, y as usize);
            let mut best = 0usize;
            let mut best_score = f32::NEG_INFINITY;
            for c in 0..classes {
                let score = logits[[0, c, y, x]];
                if score > best_score {
                    best = c;
                    best_score = score;
                }
            }
            Luma([best as u8])
        });

        let class_map = if class_map.dimensions() != (frame_width, frame_height) {
            imageops::resize(
                &class_map,
                frame_width,
                frame_height,
                imageops::FilterType::Nearest,
            )
        } else {
            class_map
        };

        Ok(class_map.pixels().map(|p| p[0] as f32 / 255.0).collect())
    }
}
