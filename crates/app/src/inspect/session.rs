//! Frame accumulation and averaging for one capture sequence.

use frame_ingest::CaptureError;
use image::{imageops, GrayImage, Luma};
use inspect_core::AverageMethod;
use tracing::debug;

/// Ordered, bounded collection of frames being accumulated toward averaging.
/// Exists only between capture trigger and finalize; the controller is its
/// sole owner.
pub struct CaptureSession {
    width: u32,
    height: u32,
    capacity: usize,
    frames: Vec<GrayImage>,
}

impl CaptureSession {
    pub fn new(width: u32, height: u32, capacity: usize) -> Self {
        Self {
            width,
            height,
            capacity,
            frames: Vec::with_capacity(capacity),
        }
    }

    /// Append a frame, conforming it to the session resolution if the source
    /// delivered a different size.
    pub fn push(&mut self, frame: GrayImage) {
        let frame = if frame.dimensions() == (self.width, self.height) {
            frame
        } else {
            debug!(
                got_w = frame.width(),
                got_h = frame.height(),
                want_w = self.width,
                want_h = self.height,
                "resizing mismatched capture frame"
            );
            imageops::resize(
                &frame,
                self.width,
                self.height,
                imageops::FilterType::Triangle,
            )
        };
        self.frames.push(frame);
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.frames.len() >= self.capacity
    }

    /// Collapse the session into a single frame.
    pub fn finalize(self, method: AverageMethod) -> Result<GrayImage, CaptureError> {
        if self.frames.is_empty() {
            return Err(CaptureError::Empty);
        }
        let n = self.frames.len();
        let pixels = (self.width * self.height) as usize;

        let data = match method {
            AverageMethod::Mean => {
                let mut acc = vec![0u32; pixels];
                for frame in &self.frames {
                    for (slot, &v) in acc.iter_mut().zip(frame.as_raw()) {
                        *slot += u32::from(v);
                    }
                }
                acc.into_iter().map(|sum| (sum / n as u32) as u8).collect()
            }
            AverageMethod::Median => {
                let mut column = vec![0u8; n];
                let mut out = Vec::with_capacity(pixels);
                for idx in 0..pixels {
                    for (slot, frame) in column.iter_mut().zip(&self.frames) {
                        *slot = frame.as_raw()[idx];
                    }
                    column.sort_unstable();
                    let value = if n % 2 == 1 {
                        column[n / 2]
                    } else {
                        ((u16::from(column[n / 2 - 1]) + u16::from(column[n / 2])) / 2) as u8
                    };
                    out.push(value);
                }
                out
            }
        };

        GrayImage::from_raw(self.width, self.height, data).ok_or(CaptureError::Empty)
    }
}

/// Standard cumulative-histogram equalization.
pub fn equalize_histogram(image: &GrayImage) -> GrayImage {
    let total = image.as_raw().len() as u64;
    if total == 0 {
        return image.clone();
    }

    let mut histogram = [0u64; 256];
    for &v in image.as_raw() {
        histogram[v as usize] += 1;
    }

    let mut cdf = [0u64; 256];
    let mut running = 0u64;
    for (level, &count) in histogram.iter().enumerate() {
        running += count;
        cdf[level] = running;
    }
    let cdf_min = cdf
        .iter()
        .copied()
        .find(|&c| c > 0)
        .unwrap_or(0);
    if cdf_min == total {
        // Single gray level: nothing to spread.
        return image.clone();
    }

    let mut lut = [0u8; 256];
    for level in 0..256 {
        let scaled = (cdf[level] - cdf_min) * 255 / (total - cdf_min);
        lut[level] = scaled as u8;
    }

    GrayImage::from_fn(image.width(), image.height(), |x, y| {
        Luma([lut[image.get_pixel(x, y)[0] as usize]])
    })
}

/// Gaussian smoothing pass applied after averaging when configured.
pub fn smooth(image: &GrayImage) -> GrayImage {
    imageops::blur(image, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn solid(width: u32, height: u32, level: u8) -> GrayImage {
        GrayImage::from_pixel(width, height, Luma([level]))
    }

    #[test]
    fn mean_of_reference_values() {
        // Per-pixel values [10, 10, 10, 10, 100] average to 28.
        let mut session = CaptureSession::new(8, 8, 5);
        for level in [10, 10, 10, 10, 100] {
            session.push(solid(8, 8, level));
        }
        let averaged = session.finalize(AverageMethod::Mean).expect("finalize");
        assert!(averaged.as_raw().iter().all(|&v| v == 28));
    }

    #[test]
    fn median_of_reference_values() {
        // Per-pixel values [10, 10, 10, 10, 100] have median 10.
        let mut session = CaptureSession::new(8, 8, 5);
        for level in [10, 10, 10, 10, 100] {
            session.push(solid(8, 8, level));
        }
        let averaged = session.finalize(AverageMethod::Median).expect("finalize");
        assert!(averaged.as_raw().iter().all(|&v| v == 10));
    }

    #[test]
    fn averaging_matches_an_independent_computation_per_pixel() {
        // Deterministic per-pixel patterns, checked pixel by pixel.
        let make = |seed: u32| {
            GrayImage::from_fn(16, 12, |x, y| Luma([((x * 7 + y * 13 + seed * 31) % 256) as u8]))
        };
        let frames: Vec<GrayImage> = (0..4).map(make).collect();

        let mut session = CaptureSession::new(16, 12, 4);
        for frame in &frames {
            session.push(frame.clone());
        }
        let averaged = session.finalize(AverageMethod::Mean).expect("finalize");
        assert_eq!(averaged.dimensions(), (16, 12));

        for y in 0..12 {
            for x in 0..16 {
                let sum: u32 = frames
                    .iter()
                    .map(|f| u32::from(f.get_pixel(x, y)[0]))
                    .sum();
                assert_eq!(averaged.get_pixel(x, y)[0], (sum / 4) as u8);
            }
        }
    }

    #[test]
    fn single_frame_session_is_the_identity() {
        let frame = GrayImage::from_fn(10, 10, |x, y| Luma([((x + y) % 256) as u8]));
        let mut session = CaptureSession::new(10, 10, 1);
        session.push(frame.clone());
        assert!(session.is_full());
        let averaged = session.finalize(AverageMethod::Median).expect("finalize");
        assert_eq!(averaged.as_raw(), frame.as_raw());
    }

    #[test]
    fn empty_session_fails_with_no_frames_captured() {
        let session = CaptureSession::new(8, 8, 5);
        let err = session
            .finalize(AverageMethod::Mean)
            .expect_err("must fail");
        assert_eq!(err.to_string(), "no frames captured");
    }

    #[test]
    fn mismatched_frames_are_conformed() {
        let mut session = CaptureSession::new(16, 16, 2);
        session.push(solid(32, 32, 50));
        session.push(solid(16, 16, 50));
        let averaged = session.finalize(AverageMethod::Mean).expect("finalize");
        assert_eq!(averaged.dimensions(), (16, 16));
    }

    #[test]
    fn equalization_spreads_a_gradient_and_keeps_flat_frames_flat() {
        let flat = solid(32, 32, 80);
        assert_eq!(equalize_histogram(&flat).as_raw(), flat.as_raw());

        let ramp = GrayImage::from_fn(256, 1, |x, _| Luma([(x / 2) as u8]));
        let equalized = equalize_histogram(&ramp);
        let min = equalized.as_raw().iter().min().copied().unwrap_or(255);
        let max = equalized.as_raw().iter().max().copied().unwrap_or(0);
        assert_eq!(min, 0);
        assert_eq!(max, 255);
    }

    #[test]
    fn smoothing_preserves_dimensions() {
        let image = GrayImage::from_fn(20, 20, |x, y| Luma([((x * y) % 256) as u8]));
        assert_eq!(smooth(&image).dimensions(), (20, 20));
    }
}
