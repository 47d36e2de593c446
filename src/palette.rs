use image::Rgba;

/// Number of entries in the class legend
pub const LEGEND_LEN: usize = 21;

/// Display colors indexed by class id (RGBA)
const LEGEND: [[u8; 4]; LEGEND_LEN] = [
    [255, 197, 0, 255],
    [128, 62, 117, 255],
    [255, 104, 0, 255],
    [166, 189, 215, 255],
    [193, 0, 32, 255],
    [206, 162, 98, 255],
    [129, 112, 102, 255],
    [0, 125, 52, 255],
    [246, 118, 142, 255],
    [0, 83, 138, 255],
    [255, 112, 92, 255],
    [83, 55, 112, 255],
    [255, 142, 0, 255],
    [179, 40, 81, 255],
    [244, 200, 0, 255],
    [127, 24, 13, 255],
    [147, 170, 0, 255],
    [89, 51, 21, 255],
    [241, 58, 19, 255],
    [35, 44, 22, 255],
    [0, 161, 194, 255],
];

/// Color for a class id. Any integer is accepted; indexing wraps modulo the
/// legend length, negative ids included.
pub fn color_for(class_id: i64) -> Rgba<u8> {
    let index = class_id.rem_euclid(LEGEND_LEN as i64) as usize;
    Rgba(LEGEND[index])
}

/// Discrete class id encoded in a category mask value
pub fn class_of(value: f32) -> i64 {
    ((value * 255.0).round() as i64).rem_euclid(LEGEND_LEN as i64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn indexing_wraps_modulo_legend() {
        for c in -50i64..50 {
            for k in -3i64..=3 {
                assert_eq!(color_for(c), color_for(c + k * LEGEND_LEN as i64));
            }
        }
    }

    #[test]
    fn first_and_last_entries() {
        assert_eq!(color_for(0), Rgba([255, 197, 0, 255]));
        assert_eq!(color_for(20), Rgba([0, 161, 194, 255]));
        assert_eq!(color_for(21), color_for(0));
        assert_eq!(color_for(-1), color_for(20));
    }

    #[test]
    fn mask_values_round_to_class_ids() {
        assert_eq!(class_of(0.0), 0);
        assert_eq!(class_of(1.0 / 255.0), 1);
        assert_eq!(class_of(2.0 / 255.0), 2);
        assert_eq!(class_of(1.4 / 255.0), 1);
        assert_eq!(class_of(1.6 / 255.0), 2);
        // 255 mod 21 == 3
        assert_eq!(class_of(1.0), 3);
    }
}
