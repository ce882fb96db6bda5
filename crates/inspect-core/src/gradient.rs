//! Sobel gradient maps and the comparisons built on them.

use image::GrayImage;

use crate::types::Roi;

/// Largest magnitude a 3x3 Sobel pair can produce on 8-bit input; used to
/// normalize maps into [0, 1].
const SOBEL_MAX: f32 = 1442.5;

/// Per-pixel gradient data for one image. `magnitude` is normalized to
/// [0, 1]; `gx`/`gy` keep the raw signed responses for direction queries.
pub(crate) struct GradientMap {
    pub width: u32,
    pub height: u32,
    pub magnitude: Vec<f32>,
    pub gx: Vec<f32>,
    pub gy: Vec<f32>,
}

impl GradientMap {
    pub(crate) fn at(&self, x: u32, y: u32) -> f32 {
        self.magnitude[(y * self.width + x) as usize]
    }
}

/// Combined horizontal/vertical derivative magnitude of `image`.
pub(crate) fn gradient_map(image: &GrayImage) -> GradientMap {
    let (width, height) = image.dimensions();
    let (w, h) = (width as usize, height as usize);
    let src = image.as_raw();
    let mut magnitude = vec![0f32; w * h];
    let mut gx_map = vec![0f32; w * h];
    let mut gy_map = vec![0f32; w * h];

    let px = |x: usize, y: usize| f32::from(src[y * w + x]);

    for y in 1..h.saturating_sub(1) {
        for x in 1..w.saturating_sub(1) {
            let gx = (px(x + 1, y - 1) + 2.0 * px(x + 1, y) + px(x + 1, y + 1))
                - (px(x - 1, y - 1) + 2.0 * px(x - 1, y) + px(x - 1, y + 1));
            let gy = (px(x - 1, y + 1) + 2.0 * px(x, y + 1) + px(x + 1, y + 1))
                - (px(x - 1, y - 1) + 2.0 * px(x, y - 1) + px(x + 1, y - 1));
            let idx = y * w + x;
            gx_map[idx] = gx;
            gy_map[idx] = gy;
            magnitude[idx] = (gx * gx + gy * gy).sqrt() / SOBEL_MAX;
        }
    }

    GradientMap {
        width,
        height,
        magnitude,
        gx: gx_map,
        gy: gy_map,
    }
}

/// Mean absolute difference between two gradient maps, restricted to pixels
/// where `mask` is non-zero when a mask is given. Both maps are normalized,
/// so the result is already in [0, 1]; it is clamped for safety.
///
/// A mask with no on-pixels yields 0.0: there is nothing to compare.
pub(crate) fn mean_absolute_difference(
    a: &GradientMap,
    b: &GradientMap,
    mask: Option<&GrayImage>,
) -> f32 {
    debug_assert_eq!((a.width, a.height), (b.width, b.height));
    let mut total = 0f64;
    let mut count = 0u64;

    for y in 0..a.height {
        for x in 0..a.width {
            if let Some(mask) = mask {
                if mask.get_pixel(x, y)[0] == 0 {
                    continue;
                }
            }
            total += f64::from((a.at(x, y) - b.at(x, y)).abs());
            count += 1;
        }
    }

    if count == 0 {
        return 0.0;
    }
    ((total / count as f64) as f32).clamp(0.0, 1.0)
}

/// Fraction of pixels inside `roi` (or the whole map) whose normalized
/// gradient magnitude exceeds `threshold`.
pub(crate) fn high_gradient_ratio(map: &GradientMap, roi: Option<Roi>, threshold: f32) -> f32 {
    let (x0, y0, x1, y1) = match roi {
        Some(r) => (r.x, r.y, r.x + r.width, r.y + r.height),
        None => (0, 0, map.width, map.height),
    };
    let mut hits = 0u64;
    let mut count = 0u64;
    for y in y0..y1.min(map.height) {
        for x in x0..x1.min(map.width) {
            if map.at(x, y) > threshold {
                hits += 1;
            }
            count += 1;
        }
    }
    if count == 0 {
        0.0
    } else {
        hits as f32 / count as f32
    }
}

/// Absolute per-pixel difference of two maps, for heat-map rendering.
pub(crate) fn difference_field(a: &GradientMap, b: &GradientMap) -> Vec<f32> {
    a.magnitude
        .iter()
        .zip(b.magnitude.iter())
        .map(|(x, y)| (x - y).abs())
        .collect()
}
