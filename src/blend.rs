use crate::palette;
use image::RgbaImage;

/// Blend a category mask over a source frame, writing every pixel of
/// `destination`.
///
/// Each output channel is `(legend + source) / 2` with integer division, where
/// the legend color is picked by the class id encoded in the mask value.
/// `destination` is reallocated only when its dimensions differ from the
/// source, so steady-state frames reuse the same buffer.
///
/// # Panics
/// If the mask does not hold exactly one value per source pixel.
pub fn blend_into(mask: &[f32], source: &RgbaImage, destination: &mut RgbaImage) {
    let _span = tracing::debug_span!("blend").entered();

    let (width, height) = source.dimensions();
    assert_eq!(
        mask.len(),
        width as usize * height as usize,
        "mask length does not match {}x{} frame",
        width,
        height
    );

    if destination.dimensions() != (width, height) {
        *destination = RgbaImage::new(width, height);
    }

    let src = source.as_raw();
    let dst: &mut [u8] = &mut **destination;
    for ((value, src_px), dst_px) in mask
        .iter()
        .zip(src.chunks_exact(4))
        .zip(dst.chunks_exact_mut(4))
    {
        let color = palette::color_for(palette::class_of(*value));
        for channel in 0..4 {
            dst_px[channel] = ((color[channel] as u16 + src_px[channel] as u16) / 2) as u8;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgba;

    fn blend(mask: &[f32], source: &RgbaImage) -> RgbaImage {
        let mut destination = RgbaImage::new(0, 0);
        blend_into(mask, source, &mut destination);
        destination
    }

    #[test]
    fn averages_legend_with_opaque_black() {
        let source = RgbaImage::from_pixel(3, 1, Rgba([0, 0, 0, 255]));
        let mask = [0.0, 1.0 / 255.0, 2.0 / 255.0];

        let out = blend(&mask, &source);

        assert_eq!(out.get_pixel(0, 0), &Rgba([127, 98, 0, 255]));
        assert_eq!(out.get_pixel(1, 0), &Rgba([64, 31, 58, 255]));
        assert_eq!(out.get_pixel(2, 0), &Rgba([127, 52, 0, 255]));
    }

    #[test]
    fn uniform_mask_over_matching_color_is_unchanged() {
        for class_id in 0..palette::LEGEND_LEN as i64 {
            let color = palette::color_for(class_id);
            let source = RgbaImage::from_pixel(4, 3, color);
            let mask = vec![class_id as f32 / 255.0; 12];

            let out = blend(&mask, &source);

            assert_eq!(out, source, "class {}", class_id);
        }
    }

    #[test]
    fn reuses_destination_of_matching_size() {
        let source = RgbaImage::from_pixel(2, 2, Rgba([10, 20, 30, 40]));
        let mut destination = RgbaImage::from_pixel(2, 2, Rgba([1, 2, 3, 4]));
        let ptr = destination.as_raw().as_ptr();

        blend_into(&[0.0; 4], &source, &mut destination);

        assert_eq!(destination.as_raw().as_ptr(), ptr);
        assert_eq!(destination.get_pixel(1, 1), &Rgba([132, 108, 15, 147]));
    }

    #[test]
    fn resizes_stale_destination() {
        let source = RgbaImage::from_pixel(3, 2, Rgba([0, 0, 0, 255]));
        let mut destination = RgbaImage::new(1, 1);

        blend_into(&[0.0; 6], &source, &mut destination);

        assert_eq!(destination.dimensions(), (3, 2));
        assert!(destination.pixels().all(|p| *p == Rgba([127, 98, 0, 255])));
    }

    #[test]
    #[should_panic(expected = "mask length")]
    fn short_mask_fails_fast() {
        let source = RgbaImage::new(2, 2);
        blend(&[0.0; 3], &source);
    }
}
