//! OpenCV-backed physical camera source.
//!
//! A background thread owns the `VideoCapture` handle and feeds a small
//! bounded channel; `read` becomes a `recv_timeout`, which gives every call
//! the bounded wait the [`FrameSource`] contract requires. The buffer is
//! intentionally small to backpressure the reader when the consumer falls
//! behind.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::Duration,
};

use chrono::Utc;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use opencv::{
    core::{self, MatTraitConstManual},
    prelude::*,
    videoio::{self, VideoCapture, VideoCaptureTrait},
};
use tracing::warn;

use crate::{CaptureError, Frame, FrameFormat, FrameOrigin, FrameSource};

pub struct CameraSource {
    device: String,
    resolution: (u32, u32),
    rx: Option<Receiver<Result<Frame, CaptureError>>>,
    running: Arc<AtomicBool>,
}

impl CameraSource {
    /// Open `device` (an index, `/dev/videoX` path, or URI) and start the
    /// background reader.
    pub fn open(device: &str, resolution: (u32, u32), fps: f64) -> Result<Self, CaptureError> {
        let mut cap = open_video_capture(device)?;
        configure_camera(&mut cap, resolution, fps);

        let running = Arc::new(AtomicBool::new(true));
        let (tx, rx) = bounded(2);
        let thread_running = running.clone();
        thread::spawn(move || {
            if let Err(err) = capture_loop(cap, resolution, &tx, &thread_running) {
                let _ = tx.send(Err(err));
            }
        });

        Ok(Self {
            device: device.to_string(),
            resolution,
            rx: Some(rx),
            running,
        })
    }
}

impl FrameSource for CameraSource {
    fn describe(&self) -> String {
        format!(
            "camera {} {}x{}",
            self.device, self.resolution.0, self.resolution.1
        )
    }

    fn resolution(&self) -> (u32, u32) {
        self.resolution
    }

    fn origin(&self) -> FrameOrigin {
        FrameOrigin::Live
    }

    fn read(&mut self, timeout: Duration) -> Result<Frame, CaptureError> {
        let rx = self.rx.as_ref().ok_or(CaptureError::Disconnected)?;
        match rx.recv_timeout(timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => Err(CaptureError::Timeout(timeout)),
            Err(RecvTimeoutError::Disconnected) => Err(CaptureError::Disconnected),
        }
    }

    fn release(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        self.rx = None;
    }
}

impl Drop for CameraSource {
    fn drop(&mut self) {
        self.release();
    }
}

fn capture_loop(
    mut cap: VideoCapture,
    target_size: (u32, u32),
    tx: &Sender<Result<Frame, CaptureError>>,
    running: &AtomicBool,
) -> Result<(), CaptureError> {
    let mut frame = Mat::default();
    let mut scratch = Mat::default();
    let (target_w, target_h) = (target_size.0 as i32, target_size.1 as i32);

    while running.load(Ordering::Relaxed) {
        cap.read(&mut frame)
            .map_err(|e| CaptureError::Other(e.into()))?;

        let size = frame.size().map_err(|e| CaptureError::Other(e.into()))?;
        if size.width <= 0 {
            continue;
        }

        let working = if size.width != target_w || size.height != target_h {
            opencv::imgproc::resize(
                &frame,
                &mut scratch,
                core::Size {
                    width: target_w,
                    height: target_h,
                },
                0.0,
                0.0,
                opencv::imgproc::INTER_LINEAR,
            )
            .map_err(|e| CaptureError::Other(e.into()))?;
            &scratch
        } else {
            &frame
        };

        let data = working
            .data_bytes()
            .map_err(|e| CaptureError::Other(e.into()))?
            .to_vec();

        if tx
            .send(Ok(Frame {
                data,
                width: target_size.0,
                height: target_size.1,
                format: FrameFormat::Bgr8,
                origin: FrameOrigin::Live,
                timestamp_ms: Utc::now().timestamp_millis(),
            }))
            .is_err()
        {
            break;
        }
    }

    Ok(())
}

/// Parse a `/dev/videoX` style identifier and return the zero-based index.
fn parse_device_index(device: &str) -> Option<i32> {
    if let Ok(index) = device.parse::<i32>() {
        return Some(index);
    }
    if let Some(stripped) = device.strip_prefix("/dev/video") {
        if stripped.chars().all(|c| c.is_ascii_digit()) {
            if let Ok(index) = stripped.parse::<i32>() {
                return Some(index);
            }
        }
    }
    None
}

fn open_video_capture(device: &str) -> Result<VideoCapture, CaptureError> {
    if let Some(index) = parse_device_index(device) {
        for backend in [videoio::CAP_V4L, videoio::CAP_ANY] {
            match VideoCapture::new(index, backend) {
                Ok(cap) => {
                    if cap.is_opened().map_err(|e| CaptureError::Other(e.into()))? {
                        return Ok(cap);
                    }
                }
                Err(err) => {
                    warn!("failed to open device #{index} with backend {backend}: {err}");
                }
            }
        }
    }

    for backend in [videoio::CAP_V4L, videoio::CAP_ANY] {
        match VideoCapture::from_file(device, backend) {
            Ok(cap) => {
                if cap.is_opened().map_err(|e| CaptureError::Other(e.into()))? {
                    return Ok(cap);
                }
            }
            Err(err) => {
                warn!("failed to open {device} with backend {backend}: {err}");
            }
        }
    }

    Err(CaptureError::Open {
        device: device.to_string(),
    })
}

/// Apply resolution, frame rate, and preferred pixel format.
fn configure_camera(cap: &mut VideoCapture, target_size: (u32, u32), fps: f64) {
    if let Ok(mjpg) = videoio::VideoWriter::fourcc('M', 'J', 'P', 'G') {
        let _ = cap.set(videoio::CAP_PROP_FOURCC, f64::from(mjpg));
    }
    let _ = cap.set(videoio::CAP_PROP_FRAME_WIDTH, f64::from(target_size.0));
    let _ = cap.set(videoio::CAP_PROP_FRAME_HEIGHT, f64::from(target_size.1));
    let _ = cap.set(videoio::CAP_PROP_FPS, fps);
}
