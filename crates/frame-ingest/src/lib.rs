//! Capture-device boundary for the inspection station.
//!
//! A [`FrameSource`] produces raw frames on demand with a bounded wait per
//! read. Two backends implement the contract: a physical camera behind the
//! `with-opencv` feature, and a simulated source that synthesises a
//! time-varying test image whenever no device is reachable. The simulated
//! backend is a required fallback, not a test-only convenience.

use std::time::Duration;

use image::GrayImage;
use thiserror::Error;

#[cfg(feature = "with-opencv")]
mod camera;
mod simulated;

#[cfg(feature = "with-opencv")]
pub use camera::CameraSource;
pub use simulated::{SimulatedSource, TestPattern};

/// Raw frame captured from a video source.
#[derive(Clone)]
pub struct Frame {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub format: FrameFormat,
    pub origin: FrameOrigin,
    pub timestamp_ms: i64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameFormat {
    Gray8,
    Bgr8,
}

/// Whether a frame came from real hardware or the synthetic fallback.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameOrigin {
    Live,
    Simulated,
}

impl Frame {
    /// Expected byte length for the frame's dimensions and format.
    pub fn expected_len(&self) -> usize {
        let pixels = (self.width as usize) * (self.height as usize);
        match self.format {
            FrameFormat::Gray8 => pixels,
            FrameFormat::Bgr8 => pixels * 3,
        }
    }

    /// Convert the raw buffer into a single-channel image.
    ///
    /// BGR frames are reduced with integer Rec.601 luma weights.
    pub fn to_gray(&self) -> Result<GrayImage, CaptureError> {
        let expected = self.expected_len();
        if self.data.len() != expected {
            return Err(CaptureError::BufferSize {
                got: self.data.len(),
                expected,
            });
        }

        let gray = match self.format {
            FrameFormat::Gray8 => GrayImage::from_raw(self.width, self.height, self.data.clone()),
            FrameFormat::Bgr8 => {
                let mut out = Vec::with_capacity((self.width * self.height) as usize);
                for px in self.data.chunks_exact(3) {
                    let (b, g, r) = (u32::from(px[0]), u32::from(px[1]), u32::from(px[2]));
                    out.push(((77 * r + 150 * g + 29 * b) >> 8) as u8);
                }
                GrayImage::from_raw(self.width, self.height, out)
            }
        };

        gray.ok_or(CaptureError::BufferSize {
            got: self.data.len(),
            expected,
        })
    }
}

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("failed to open capture device {device:?}")]
    Open { device: String },
    #[error("frame read timed out after {0:?}")]
    Timeout(Duration),
    #[error("capture stream disconnected")]
    Disconnected,
    #[error("no frames captured")]
    Empty,
    #[error("frame buffer size mismatch: got {got} bytes, expected {expected}")]
    BufferSize { got: usize, expected: usize },
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Contract every capture backend implements: open, read, release.
///
/// Reads take an explicit timeout so a stalled device surfaces as
/// [`CaptureError::Timeout`] instead of blocking the caller indefinitely.
pub trait FrameSource: Send {
    /// Human-readable identity of the source, for logs.
    fn describe(&self) -> String;

    /// Width and height of frames this source produces.
    fn resolution(&self) -> (u32, u32);

    fn origin(&self) -> FrameOrigin;

    /// Read the next frame, waiting at most `timeout`.
    fn read(&mut self, timeout: Duration) -> Result<Frame, CaptureError>;

    /// Release the underlying device. Idempotent; further reads fail.
    fn release(&mut self);
}

/// Open a physical device at the requested resolution.
///
/// Without the `with-opencv` feature there is no hardware path, so this
/// always reports the device as unopenable and callers drop to
/// [`SimulatedSource`].
pub fn open_device(
    device: &str,
    resolution: (u32, u32),
    fps: f64,
) -> Result<Box<dyn FrameSource>, CaptureError> {
    #[cfg(feature = "with-opencv")]
    {
        return Ok(Box::new(CameraSource::open(device, resolution, fps)?));
    }
    #[cfg(not(feature = "with-opencv"))]
    {
        let _ = (resolution, fps);
        Err(CaptureError::Open {
            device: device.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gray_frame_roundtrip() {
        let frame = Frame {
            data: vec![7; 16],
            width: 4,
            height: 4,
            format: FrameFormat::Gray8,
            origin: FrameOrigin::Simulated,
            timestamp_ms: 0,
        };
        let gray = frame.to_gray().expect("gray conversion");
        assert_eq!(gray.dimensions(), (4, 4));
        assert_eq!(gray.get_pixel(2, 2)[0], 7);
    }

    #[test]
    fn bgr_frame_converts_with_luma_weights() {
        // Pure green pixel: luma weight 150/256.
        let frame = Frame {
            data: vec![0, 255, 0],
            width: 1,
            height: 1,
            format: FrameFormat::Bgr8,
            origin: FrameOrigin::Live,
            timestamp_ms: 0,
        };
        let gray = frame.to_gray().expect("gray conversion");
        assert_eq!(gray.get_pixel(0, 0)[0], (150u32 * 255 >> 8) as u8);
    }

    #[test]
    fn buffer_size_mismatch_is_rejected() {
        let frame = Frame {
            data: vec![0; 5],
            width: 4,
            height: 4,
            format: FrameFormat::Gray8,
            origin: FrameOrigin::Live,
            timestamp_ms: 0,
        };
        assert!(matches!(
            frame.to_gray(),
            Err(CaptureError::BufferSize {
                got: 5,
                expected: 16
            })
        ));
    }

    #[test]
    fn empty_error_message_matches_contract() {
        assert_eq!(CaptureError::Empty.to_string(), "no frames captured");
    }

    #[cfg(not(feature = "with-opencv"))]
    #[test]
    fn open_device_reports_unopenable_without_hardware_backend() {
        let err = open_device("/dev/video0", (640, 480), 30.0).err();
        assert!(matches!(err, Some(CaptureError::Open { .. })));
    }
}
