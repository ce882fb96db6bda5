//! Registers a captured sample into reference-image coordinates.
//!
//! The pipeline is classic binary-descriptor registration: FAST corners,
//! BRIEF descriptors, Hamming nearest-neighbour matching with a ratio test,
//! then a RANSAC homography fit. When too few matches survive, or the fit
//! fails, registration degrades to a plain resize to reference dimensions —
//! logged, never raised, so downstream comparison always receives a frame of
//! the right shape.

use std::sync::OnceLock;

use image::{imageops, imageops::FilterType, GrayImage};
use tracing::{debug, warn};

/// Tunables for the matching and fitting stages.
#[derive(Clone, Debug)]
pub struct RegistrationParams {
    /// Intensity delta a circle pixel must exceed to count for FAST.
    pub fast_threshold: u8,
    /// Keypoint cap per image after non-max suppression.
    pub max_keypoints: usize,
    /// Hamming distance ceiling for an acceptable descriptor match.
    pub match_max_distance: u32,
    /// Minimum surviving matches before homography fitting is attempted.
    pub min_matches: usize,
    /// RANSAC sampling rounds.
    pub ransac_iterations: usize,
    /// Reprojection inlier threshold in reference pixels.
    pub ransac_threshold: f32,
}

impl Default for RegistrationParams {
    fn default() -> Self {
        Self {
            fast_threshold: 20,
            max_keypoints: 500,
            match_max_distance: 64,
            min_matches: 8,
            ransac_iterations: 500,
            ransac_threshold: 3.0,
        }
    }
}

/// Outcome of registering a frame against a reference.
pub struct Registration {
    /// The frame expressed in reference coordinates.
    pub image: GrayImage,
    /// True when the fallback resize was used instead of a homography.
    pub degraded: bool,
    /// Matches that survived the ratio test.
    pub match_count: usize,
}

/// Register `current` against `reference`.
pub fn register(
    current: &GrayImage,
    reference: &GrayImage,
    params: &RegistrationParams,
) -> Registration {
    let (ref_w, ref_h) = reference.dimensions();

    let ref_keypoints = detect_keypoints(reference, params);
    let cur_keypoints = detect_keypoints(current, params);
    let ref_descriptors = describe(reference, &ref_keypoints);
    let cur_descriptors = describe(current, &cur_keypoints);

    let matches = match_descriptors(&cur_descriptors, &ref_descriptors, params.match_max_distance);
    debug!(
        matches = matches.len(),
        ref_keypoints = ref_descriptors.len(),
        cur_keypoints = cur_descriptors.len(),
        "descriptor matching complete"
    );

    if matches.len() < params.min_matches {
        warn!(
            matches = matches.len(),
            required = params.min_matches,
            "insufficient matches, falling back to plain resize"
        );
        return Registration {
            image: resize_fallback(current, ref_w, ref_h),
            degraded: true,
            match_count: matches.len(),
        };
    }

    let pairs: Vec<(Point, Point)> = matches
        .iter()
        .map(|&(cur_idx, ref_idx)| {
            (
                ref_descriptors[ref_idx].position,
                cur_descriptors[cur_idx].position,
            )
        })
        .collect();

    match ransac_homography(&pairs, params) {
        Some(h) => Registration {
            image: warp_into(current, &h, ref_w, ref_h),
            degraded: false,
            match_count: matches.len(),
        },
        None => {
            warn!(
                matches = matches.len(),
                "homography fit failed, falling back to plain resize"
            );
            Registration {
                image: resize_fallback(current, ref_w, ref_h),
                degraded: true,
                match_count: matches.len(),
            }
        }
    }
}

fn resize_fallback(current: &GrayImage, width: u32, height: u32) -> GrayImage {
    if current.dimensions() == (width, height) {
        current.clone()
    } else {
        imageops::resize(current, width, height, FilterType::Triangle)
    }
}

#[derive(Clone, Copy)]
struct Point {
    x: f64,
    y: f64,
}

struct Keypoint {
    x: u32,
    y: u32,
    score: u32,
}

struct Descriptor {
    position: Point,
    bits: [u64; 4],
}

/// Bresenham circle of radius 3 used by FAST.
const FAST_CIRCLE: [(i32, i32); 16] = [
    (0, -3),
    (1, -3),
    (2, -2),
    (3, -1),
    (3, 0),
    (3, 1),
    (2, 2),
    (1, 3),
    (0, 3),
    (-1, 3),
    (-2, 2),
    (-3, 1),
    (-3, 0),
    (-3, -1),
    (-2, -2),
    (-1, -3),
];

const FAST_ARC: usize = 9;
/// Keypoints closer than this to the border cannot host a BRIEF patch.
const PATCH_MARGIN: u32 = 16;

fn detect_keypoints(image: &GrayImage, params: &RegistrationParams) -> Vec<Keypoint> {
    let (width, height) = image.dimensions();
    if width <= 2 * PATCH_MARGIN || height <= 2 * PATCH_MARGIN {
        return Vec::new();
    }
    let threshold = i32::from(params.fast_threshold);
    let mut candidates = Vec::new();

    for y in PATCH_MARGIN..height - PATCH_MARGIN {
        for x in PATCH_MARGIN..width - PATCH_MARGIN {
            let center = i32::from(image.get_pixel(x, y)[0]);

            let mut brighter = [false; 16];
            let mut darker = [false; 16];
            for (i, &(dx, dy)) in FAST_CIRCLE.iter().enumerate() {
                let v = i32::from(
                    image.get_pixel((x as i32 + dx) as u32, (y as i32 + dy) as u32)[0],
                );
                brighter[i] = v >= center + threshold;
                darker[i] = v <= center - threshold;
            }

            if has_contiguous_arc(&brighter) || has_contiguous_arc(&darker) {
                let mut score = 0u32;
                for &(dx, dy) in &FAST_CIRCLE {
                    let v = i32::from(
                        image.get_pixel((x as i32 + dx) as u32, (y as i32 + dy) as u32)[0],
                    );
                    score += ((v - center).abs() - threshold).max(0) as u32;
                }
                candidates.push(Keypoint { x, y, score });
            }
        }
    }

    // Greedy non-max suppression: strongest first, 4px exclusion radius.
    candidates.sort_by(|a, b| b.score.cmp(&a.score));
    let mut kept: Vec<Keypoint> = Vec::new();
    for cand in candidates {
        if kept.len() >= params.max_keypoints {
            break;
        }
        let clear = kept.iter().all(|k| {
            (k.x as i32 - cand.x as i32).abs() >= 4 || (k.y as i32 - cand.y as i32).abs() >= 4
        });
        if clear {
            kept.push(cand);
        }
    }
    kept
}

fn has_contiguous_arc(flags: &[bool; 16]) -> bool {
    let mut run = 0usize;
    // Wrap around once so arcs crossing index 0 are counted.
    for i in 0..32 {
        if flags[i % 16] {
            run += 1;
            if run >= FAST_ARC {
                return true;
            }
        } else {
            run = 0;
        }
    }
    false
}

/// 256 BRIEF sampling pairs, generated once from a fixed seed so descriptors
/// are identical across runs and processes.
fn brief_pairs() -> &'static [((i32, i32), (i32, i32)); 256] {
    static PAIRS: OnceLock<[((i32, i32), (i32, i32)); 256]> = OnceLock::new();
    PAIRS.get_or_init(|| {
        let mut rng = XorShift64::new(0x9E37_79B9_7F4A_7C15);
        let mut pairs = [((0, 0), (0, 0)); 256];
        for pair in &mut pairs {
            let sample = |rng: &mut XorShift64| {
                let x = (rng.next() % 25) as i32 - 12;
                let y = (rng.next() % 25) as i32 - 12;
                (x, y)
            };
            *pair = (sample(&mut rng), sample(&mut rng));
        }
        pairs
    })
}

fn describe(image: &GrayImage, keypoints: &[Keypoint]) -> Vec<Descriptor> {
    let smoothed = box_smooth(image);
    let (width, _) = image.dimensions();
    let stride = width as usize;
    let pairs = brief_pairs();

    keypoints
        .iter()
        .map(|kp| {
            let mut bits = [0u64; 4];
            for (i, &((ax, ay), (bx, by))) in pairs.iter().enumerate() {
                let a = smoothed
                    [(kp.y as i32 + ay) as usize * stride + (kp.x as i32 + ax) as usize];
                let b = smoothed
                    [(kp.y as i32 + by) as usize * stride + (kp.x as i32 + bx) as usize];
                if a < b {
                    bits[i / 64] |= 1u64 << (i % 64);
                }
            }
            Descriptor {
                position: Point {
                    x: f64::from(kp.x),
                    y: f64::from(kp.y),
                },
                bits,
            }
        })
        .collect()
}

/// 3x3 box filter; BRIEF compares smoothed intensities to tame pixel noise.
fn box_smooth(image: &GrayImage) -> Vec<u8> {
    let (width, height) = image.dimensions();
    let (w, h) = (width as usize, height as usize);
    let src = image.as_raw();
    let mut out = src.clone();
    for y in 1..h.saturating_sub(1) {
        for x in 1..w.saturating_sub(1) {
            let mut sum = 0u32;
            for dy in 0..3 {
                for dx in 0..3 {
                    sum += u32::from(src[(y + dy - 1) * w + (x + dx - 1)]);
                }
            }
            out[y * w + x] = (sum / 9) as u8;
        }
    }
    out
}

fn hamming(a: &[u64; 4], b: &[u64; 4]) -> u32 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| (x ^ y).count_ones())
        .sum()
}

/// Nearest-neighbour matching with a 0.8 ratio test. Returns
/// `(current_index, reference_index)` pairs.
fn match_descriptors(
    current: &[Descriptor],
    reference: &[Descriptor],
    max_distance: u32,
) -> Vec<(usize, usize)> {
    let mut matches = Vec::new();
    for (cur_idx, cur) in current.iter().enumerate() {
        let mut best = u32::MAX;
        let mut second = u32::MAX;
        let mut best_idx = 0usize;
        for (ref_idx, r) in reference.iter().enumerate() {
            let d = hamming(&cur.bits, &r.bits);
            if d < best {
                second = best;
                best = d;
                best_idx = ref_idx;
            } else if d < second {
                second = d;
            }
        }
        if best <= max_distance && (second == u32::MAX || best * 5 < second * 4) {
            matches.push((cur_idx, best_idx));
        }
    }
    matches
}

/// Row-major 3x3 homography mapping reference coordinates to current-frame
/// coordinates.
type Homography = [f64; 9];

fn project(h: &Homography, p: Point) -> Point {
    let denom = h[6] * p.x + h[7] * p.y + h[8];
    Point {
        x: (h[0] * p.x + h[1] * p.y + h[2]) / denom,
        y: (h[3] * p.x + h[4] * p.y + h[5]) / denom,
    }
}

/// Fit a homography with RANSAC over 4-point DLT samples. Sampling uses a
/// fixed-seed generator so identical inputs always produce the same model.
fn ransac_homography(pairs: &[(Point, Point)], params: &RegistrationParams) -> Option<Homography> {
    if pairs.len() < 4 {
        return None;
    }
    let threshold_sq = f64::from(params.ransac_threshold * params.ransac_threshold);
    let mut rng = XorShift64::new(0xD1B5_4A32_D192_ED03);
    let mut best_inliers: Vec<usize> = Vec::new();

    for _ in 0..params.ransac_iterations {
        let sample = pick_distinct(&mut rng, pairs.len());
        let sampled: Vec<(Point, Point)> = sample.iter().map(|&i| pairs[i]).collect();
        let Some(h) = solve_dlt(&sampled) else {
            continue;
        };

        let inliers: Vec<usize> = pairs
            .iter()
            .enumerate()
            .filter(|(_, &(src, dst))| {
                let p = project(&h, src);
                let dx = p.x - dst.x;
                let dy = p.y - dst.y;
                dx * dx + dy * dy < threshold_sq
            })
            .map(|(i, _)| i)
            .collect();

        if inliers.len() > best_inliers.len() {
            best_inliers = inliers;
        }
    }

    if best_inliers.len() < params.min_matches.max(4) {
        return None;
    }

    let inlier_pairs: Vec<(Point, Point)> = best_inliers.iter().map(|&i| pairs[i]).collect();
    solve_dlt(&inlier_pairs)
}

fn pick_distinct(rng: &mut XorShift64, len: usize) -> [usize; 4] {
    let mut out = [0usize; 4];
    let mut filled = 0;
    while filled < 4 {
        let idx = (rng.next() as usize) % len;
        if !out[..filled].contains(&idx) {
            out[filled] = idx;
            filled += 1;
        }
    }
    out
}

/// Direct linear transform with `h33 = 1`, solved via the 8x8 normal
/// equations so the same routine covers both the minimal 4-point sample and
/// the final all-inlier refit.
fn solve_dlt(pairs: &[(Point, Point)]) -> Option<Homography> {
    if pairs.len() < 4 {
        return None;
    }
    // Accumulate A^T A and A^T b for rows:
    //   [X Y 1 0 0 0 -xX -xY] h = x
    //   [0 0 0 X Y 1 -yX -yY] h = y
    let mut ata = [[0f64; 8]; 8];
    let mut atb = [0f64; 8];
    for &(src, dst) in pairs {
        let rows = [
            (
                [src.x, src.y, 1.0, 0.0, 0.0, 0.0, -dst.x * src.x, -dst.x * src.y],
                dst.x,
            ),
            (
                [0.0, 0.0, 0.0, src.x, src.y, 1.0, -dst.y * src.x, -dst.y * src.y],
                dst.y,
            ),
        ];
        for (row, rhs) in rows {
            for i in 0..8 {
                for j in 0..8 {
                    ata[i][j] += row[i] * row[j];
                }
                atb[i] += row[i] * rhs;
            }
        }
    }

    let h = solve_linear_8(&mut ata, &mut atb)?;
    Some([h[0], h[1], h[2], h[3], h[4], h[5], h[6], h[7], 1.0])
}

/// Gaussian elimination with partial pivoting on an 8x8 system.
fn solve_linear_8(a: &mut [[f64; 8]; 8], b: &mut [f64; 8]) -> Option<[f64; 8]> {
    for col in 0..8 {
        let pivot_row = (col..8).max_by(|&r1, &r2| {
            a[r1][col]
                .abs()
                .partial_cmp(&a[r2][col].abs())
                .unwrap_or(std::cmp::Ordering::Equal)
        })?;
        if a[pivot_row][col].abs() < 1e-10 {
            return None;
        }
        a.swap(col, pivot_row);
        b.swap(col, pivot_row);

        for row in col + 1..8 {
            let factor = a[row][col] / a[col][col];
            for k in col..8 {
                a[row][k] -= factor * a[col][k];
            }
            b[row] -= factor * b[col];
        }
    }

    let mut x = [0f64; 8];
    for row in (0..8).rev() {
        let mut sum = b[row];
        for k in row + 1..8 {
            sum -= a[row][k] * x[k];
        }
        x[row] = sum / a[row][row];
    }
    Some(x)
}

/// Inverse-warp `current` into a reference-sized frame via bilinear sampling.
fn warp_into(current: &GrayImage, h: &Homography, width: u32, height: u32) -> GrayImage {
    let (cur_w, cur_h) = current.dimensions();
    let mut out = GrayImage::new(width, height);
    for y in 0..height {
        for x in 0..width {
            let p = project(
                h,
                Point {
                    x: f64::from(x),
                    y: f64::from(y),
                },
            );
            out.put_pixel(x, y, image::Luma([bilinear(current, p, cur_w, cur_h)]));
        }
    }
    out
}

fn bilinear(image: &GrayImage, p: Point, width: u32, height: u32) -> u8 {
    if p.x < 0.0 || p.y < 0.0 {
        return 0;
    }
    let x0 = p.x.floor() as u32;
    let y0 = p.y.floor() as u32;
    if x0 + 1 >= width || y0 + 1 >= height {
        return 0;
    }
    let fx = p.x - f64::from(x0);
    let fy = p.y - f64::from(y0);
    let sample = |x: u32, y: u32| f64::from(image.get_pixel(x, y)[0]);
    let top = sample(x0, y0) * (1.0 - fx) + sample(x0 + 1, y0) * fx;
    let bottom = sample(x0, y0 + 1) * (1.0 - fx) + sample(x0 + 1, y0 + 1) * fx;
    (top * (1.0 - fy) + bottom * fy).round().clamp(0.0, 255.0) as u8
}

/// Small deterministic generator for RANSAC sampling and BRIEF layout.
struct XorShift64 {
    state: u64,
}

impl XorShift64 {
    fn new(seed: u64) -> Self {
        Self { state: seed }
    }

    fn next(&mut self) -> u64 {
        let mut x = self.state;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.state = x;
        x
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    fn noise_image(width: u32, height: u32, seed: u64) -> GrayImage {
        let mut rng = XorShift64::new(seed);
        GrayImage::from_fn(width, height, |_, _| Luma([(rng.next() % 256) as u8]))
    }

    #[test]
    fn flat_images_degrade_to_resize() {
        let current = GrayImage::from_pixel(320, 240, Luma([128]));
        let reference = GrayImage::from_pixel(640, 480, Luma([128]));
        let reg = register(&current, &reference, &RegistrationParams::default());
        assert!(reg.degraded);
        assert_eq!(reg.image.dimensions(), (640, 480));
        assert_eq!(reg.image.get_pixel(320, 240)[0], 128);
    }

    #[test]
    fn identical_textured_images_register_close_to_identity() {
        let image = noise_image(200, 160, 42);
        let reg = register(&image, &image, &RegistrationParams::default());
        assert_eq!(reg.image.dimensions(), (200, 160));

        let mut total = 0u64;
        let mut count = 0u64;
        for y in 20..140 {
            for x in 20..180 {
                let a = i64::from(reg.image.get_pixel(x, y)[0]);
                let b = i64::from(image.get_pixel(x, y)[0]);
                total += a.abs_diff(b);
                count += 1;
            }
        }
        let mean = total as f64 / count as f64;
        assert!(mean < 4.0, "mean interior error {mean}");
    }

    #[test]
    fn integer_translation_is_recovered() {
        let reference = noise_image(220, 180, 7);
        // Current frame: reference shifted right/down by (5, 3).
        let current = GrayImage::from_fn(220, 180, |x, y| {
            if x >= 5 && y >= 3 {
                *reference.get_pixel(x - 5, y - 3)
            } else {
                Luma([0])
            }
        });

        let reg = register(&current, &reference, &RegistrationParams::default());
        assert!(!reg.degraded, "expected homography path, got fallback");

        let mut total = 0u64;
        let mut count = 0u64;
        for y in 20..160 {
            for x in 20..200 {
                let a = i64::from(reg.image.get_pixel(x, y)[0]);
                let b = i64::from(reference.get_pixel(x, y)[0]);
                total += a.abs_diff(b);
                count += 1;
            }
        }
        let mean = total as f64 / count as f64;
        assert!(mean < 6.0, "mean interior error {mean}");
    }

    #[test]
    fn registration_is_deterministic() {
        let reference = noise_image(180, 140, 11);
        let current = noise_image(180, 140, 11);
        let first = register(&current, &reference, &RegistrationParams::default());
        let second = register(&current, &reference, &RegistrationParams::default());
        assert_eq!(first.degraded, second.degraded);
        assert_eq!(first.image.as_raw(), second.image.as_raw());
    }

    #[test]
    fn degraded_output_still_feeds_difference_computation() {
        let current = GrayImage::from_pixel(100, 80, Luma([40]));
        let reference = GrayImage::from_pixel(640, 480, Luma([200]));
        let reg = register(&current, &reference, &RegistrationParams::default());
        assert!(reg.degraded);
        assert_eq!(reg.image.dimensions(), reference.dimensions());
    }
}
