//! Camera state machine driving preview, capture-and-average, and analysis.
//!
//! One controller owns every mutable piece of the capture pipeline: the open
//! sources, the in-flight session, and the finalized averaged frame. Both
//! periodic cadences (preview at the configured frame rate, capture at a
//! fixed 100 ms) run through the single `tick` entry point, so there is no
//! interleaved mutation to reason about even on a threaded host.

use std::{
    path::PathBuf,
    time::{Duration, Instant},
};

use chrono::Utc;
use crossbeam_channel::{unbounded, Receiver, Sender};
use image::imageops;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use frame_ingest::{open_device, CaptureError, FrameSource, SimulatedSource};
use inspect_core::{AlgorithmEngine, AverageMethod, AveragedFrame, InspectionResult};

use crate::inspect::session::{self, CaptureSession};

/// Fixed cadence of the capture-and-average sequence.
pub const CAPTURE_TICK: Duration = Duration::from_millis(100);
/// Bounded wait applied to every source read.
const READ_TIMEOUT: Duration = Duration::from_millis(750);
/// Preview heartbeat period in frames.
const HEARTBEAT_FRAMES: u64 = 30;

/// Exactly one state is active at any time; transitions happen only through
/// the controller's methods.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CameraState {
    Stopped,
    Streaming,
    Freezing,
    Captured,
    Analyzing,
    Error,
}

impl CameraState {
    pub fn label(self) -> &'static str {
        match self {
            Self::Stopped => "STOPPED",
            Self::Streaming => "STREAMING",
            Self::Freezing => "FREEZING",
            Self::Captured => "CAPTURED",
            Self::Analyzing => "ANALYZING",
            Self::Error => "ERROR",
        }
    }
}

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("{operation} is not valid in state {state}")]
    InvalidTransition {
        state: &'static str,
        operation: &'static str,
    },
}

/// Capture-side configuration, owned by the caller and consumed read-only.
#[derive(Clone, Debug)]
pub struct CaptureConfig {
    pub device: String,
    pub preview_size: (u32, u32),
    /// Dedicated high-resolution capture size; `None` reuses the preview
    /// source for the capture sequence.
    pub capture_size: Option<(u32, u32)>,
    pub fps: f32,
    pub frames_per_capture: usize,
    pub method: AverageMethod,
    pub equalize: bool,
    pub smooth: bool,
    pub flip_horizontal: bool,
    pub flip_vertical: bool,
    pub output_dir: PathBuf,
}

pub struct CaptureController {
    config: CaptureConfig,
    state: CameraState,
    preview: Option<Box<dyn FrameSource>>,
    capture: Option<Box<dyn FrameSource>>,
    session: Option<CaptureSession>,
    averaged: Option<AveragedFrame>,
    preview_interval: Duration,
    next_preview: Option<Instant>,
    next_capture: Option<Instant>,
    last_preview_at: Option<Instant>,
    smoothed_fps: f32,
    preview_count: u64,
    error_tx: Sender<CaptureError>,
}

impl CaptureController {
    /// Build a controller and the receiving end of its error channel. Hard
    /// capture failures arrive there alongside the ERROR state transition.
    pub fn new(config: CaptureConfig) -> (Self, Receiver<CaptureError>) {
        let (error_tx, error_rx) = unbounded();
        let preview_interval = Duration::from_secs_f32(1.0 / config.fps.max(0.1));
        (
            Self {
                config,
                state: CameraState::Stopped,
                preview: None,
                capture: None,
                session: None,
                averaged: None,
                preview_interval,
                next_preview: None,
                next_capture: None,
                last_preview_at: None,
                smoothed_fps: 0.0,
                preview_count: 0,
                error_tx,
            },
            error_rx,
        )
    }

    pub fn state(&self) -> CameraState {
        self.state
    }

    pub fn averaged_frame(&self) -> Option<&AveragedFrame> {
        self.averaged.as_ref()
    }

    pub fn preview_fps(&self) -> f32 {
        self.smoothed_fps
    }

    /// Open the preview source and begin streaming. A device that cannot be
    /// opened is not an error: the simulated source takes its place.
    pub fn start_streaming(&mut self) -> Result<(), ControllerError> {
        if self.state != CameraState::Stopped {
            return Err(ControllerError::InvalidTransition {
                state: self.state.label(),
                operation: "start_streaming",
            });
        }
        let source = open_or_simulated(
            &self.config.device,
            self.config.preview_size,
            self.config.fps,
        );
        info!(source = source.describe(), "streaming started");
        self.preview = Some(source);
        self.state = CameraState::Streaming;
        self.next_preview = Some(Instant::now());
        self.last_preview_at = None;
        self.smoothed_fps = 0.0;
        Ok(())
    }

    /// Begin the capture-and-average sequence. Only valid while streaming.
    pub fn trigger_capture(&mut self) -> Result<(), ControllerError> {
        if self.state != CameraState::Streaming {
            return Err(ControllerError::InvalidTransition {
                state: self.state.label(),
                operation: "trigger_capture",
            });
        }

        if let Some(size) = self.config.capture_size {
            match open_device(&self.config.device, size, f64::from(self.config.fps)) {
                Ok(source) => {
                    debug!(source = source.describe(), "dedicated capture source opened");
                    self.capture = Some(source);
                }
                Err(err) => {
                    warn!(%err, "capture-resolution source unavailable, reusing preview source");
                }
            }
        }

        let (width, height) = self
            .capture
            .as_ref()
            .or(self.preview.as_ref())
            .map(|s| s.resolution())
            .unwrap_or(self.config.preview_size);
        self.session = Some(CaptureSession::new(
            width,
            height,
            self.config.frames_per_capture,
        ));
        self.state = CameraState::Freezing;
        self.next_capture = Some(Instant::now());
        info!(
            frames = self.config.frames_per_capture,
            width, height, "capture sequence started"
        );
        Ok(())
    }

    /// Advance whichever cadence is due at `now`. Safe to call from any
    /// state; does nothing unless streaming or freezing.
    pub fn tick(&mut self, now: Instant) {
        match self.state {
            CameraState::Streaming => self.tick_preview(now),
            CameraState::Freezing => self.tick_capture(now),
            _ => {}
        }
    }

    fn tick_preview(&mut self, now: Instant) {
        let Some(due) = self.next_preview else {
            return;
        };
        if now < due {
            return;
        }
        let Some(source) = self.preview.as_mut() else {
            return;
        };

        match source.read(READ_TIMEOUT) {
            Ok(frame) => {
                if let Some(last) = self.last_preview_at {
                    let elapsed = now.duration_since(last).as_secs_f32();
                    if elapsed > 0.0 {
                        let instant = 1.0 / elapsed;
                        self.smoothed_fps = if self.smoothed_fps == 0.0 {
                            instant
                        } else {
                            0.9 * self.smoothed_fps + 0.1 * instant
                        };
                    }
                }
                self.last_preview_at = Some(now);
                self.preview_count = self.preview_count.wrapping_add(1);
                if self.preview_count % HEARTBEAT_FRAMES == 0 {
                    debug!(
                        frame = self.preview_count,
                        fps = self.smoothed_fps,
                        timestamp = frame.timestamp_ms,
                        "preview heartbeat"
                    );
                }
                // Preview frames are discarded after display.
                self.next_preview = Some(now + self.preview_interval);
            }
            Err(err) => self.fail(err),
        }
    }

    fn tick_capture(&mut self, now: Instant) {
        let Some(due) = self.next_capture else {
            return;
        };
        if now < due {
            return;
        }
        let Some(source) = self.capture.as_mut().or(self.preview.as_mut()) else {
            return;
        };

        let frame = match source.read(READ_TIMEOUT) {
            Ok(frame) => frame,
            Err(err) => {
                self.fail(err);
                return;
            }
        };
        let mut gray = match frame.to_gray() {
            Ok(gray) => gray,
            Err(err) => {
                self.fail(err);
                return;
            }
        };
        if self.config.flip_horizontal {
            gray = imageops::flip_horizontal(&gray);
        }
        if self.config.flip_vertical {
            gray = imageops::flip_vertical(&gray);
        }

        let Some(session) = self.session.as_mut() else {
            return;
        };
        session.push(gray);
        debug!(
            collected = session.len(),
            target = self.config.frames_per_capture,
            "capture frame buffered"
        );

        if session.is_full() {
            if let Err(err) = self.finalize() {
                self.fail(err);
            }
        } else {
            self.next_capture = Some(now + CAPTURE_TICK);
        }
    }

    /// Average the buffered frames and persist the sample. Fails with
    /// `CaptureError::Empty` when nothing was buffered.
    pub fn finalize(&mut self) -> Result<(), CaptureError> {
        if self.session.as_ref().map_or(true, CaptureSession::is_empty) {
            return Err(CaptureError::Empty);
        }
        let Some(session) = self.session.take() else {
            return Err(CaptureError::Empty);
        };
        let count = session.len();
        let mut image = session.finalize(self.config.method)?;
        if self.config.equalize {
            image = session::equalize_histogram(&image);
        }
        if self.config.smooth {
            image = session::smooth(&image);
        }
        self.persist_averaged(&image);

        self.averaged = Some(AveragedFrame::new(
            image,
            self.config.method,
            count,
            Utc::now(),
        ));
        if let Some(mut dedicated) = self.capture.take() {
            dedicated.release();
        }
        self.next_capture = None;
        self.state = CameraState::Captured;
        info!(
            frames = count,
            method = self.config.method.label(),
            "capture finalized"
        );
        Ok(())
    }

    /// Run the engine over the averaged frame. Valid only once captured; the
    /// controller is back in CAPTURED afterwards, ready for another analyze
    /// or capture cycle.
    pub fn analyze(
        &mut self,
        engine: &mut AlgorithmEngine,
        mode: &str,
        selector: &str,
    ) -> Result<InspectionResult, ControllerError> {
        if self.state != CameraState::Captured {
            return Err(ControllerError::InvalidTransition {
                state: self.state.label(),
                operation: "analyze",
            });
        }
        let Some(frame) = self.averaged.as_ref() else {
            return Err(ControllerError::InvalidTransition {
                state: self.state.label(),
                operation: "analyze",
            });
        };
        self.state = CameraState::Analyzing;
        let result = engine.process(frame, mode, selector);
        self.state = CameraState::Captured;
        Ok(result)
    }

    /// Drop the averaged frame and return to live preview.
    pub fn resume_streaming(&mut self) -> Result<(), ControllerError> {
        if !matches!(self.state, CameraState::Captured | CameraState::Analyzing) {
            return Err(ControllerError::InvalidTransition {
                state: self.state.label(),
                operation: "resume_streaming",
            });
        }
        self.averaged = None;
        self.session = None;
        self.state = CameraState::Streaming;
        self.next_preview = Some(Instant::now());
        Ok(())
    }

    /// Release everything and return to STOPPED. Valid from any state,
    /// idempotent, and never fails.
    pub fn stop(&mut self) {
        if let Some(mut source) = self.preview.take() {
            source.release();
        }
        if let Some(mut source) = self.capture.take() {
            source.release();
        }
        self.session = None;
        self.averaged = None;
        self.next_preview = None;
        self.next_capture = None;
        if self.state != CameraState::Stopped {
            info!("controller stopped");
        }
        self.state = CameraState::Stopped;
    }

    fn fail(&mut self, err: CaptureError) {
        error!(%err, "capture failure");
        let _ = self.error_tx.send(err);
        self.state = CameraState::Error;
    }

    fn persist_averaged(&self, image: &image::GrayImage) {
        if let Err(err) = std::fs::create_dir_all(&self.config.output_dir) {
            error!(%err, "failed to create output directory");
            return;
        }
        let fixed = self.config.output_dir.join("averaged_capture.jpg");
        if let Err(err) = image.save(&fixed) {
            error!(%err, path = %fixed.display(), "failed to persist averaged frame");
        }
        let stamp = Utc::now().format("%Y%m%d_%H%M%S");
        let stamped = self
            .config
            .output_dir
            .join(format!("averaged_capture_{stamp}.jpg"));
        if let Err(err) = image.save(&stamped) {
            error!(%err, path = %stamped.display(), "failed to persist averaged frame");
        }
    }
}

fn open_or_simulated(device: &str, size: (u32, u32), fps: f32) -> Box<dyn FrameSource> {
    match open_device(device, size, f64::from(fps)) {
        Ok(source) => source,
        Err(err) => {
            warn!(%err, device, "device unavailable, falling back to simulated source");
            Box::new(SimulatedSource::new(size.0, size.1))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> CaptureConfig {
        CaptureConfig {
            device: "test:none".to_string(),
            preview_size: (64, 48),
            capture_size: None,
            fps: 10.0,
            frames_per_capture: 5,
            method: AverageMethod::Mean,
            equalize: false,
            smooth: false,
            flip_horizontal: false,
            flip_vertical: false,
            output_dir: std::env::temp_dir().join(format!(
                "opticheck-controller-{}-{:?}",
                std::process::id(),
                std::thread::current().id()
            )),
        }
    }

    fn run_capture_to_completion(controller: &mut CaptureController) {
        let mut now = Instant::now();
        for _ in 0..50 {
            controller.tick(now);
            if controller.state() == CameraState::Captured {
                break;
            }
            now += CAPTURE_TICK;
        }
    }

    #[test]
    fn starts_stopped_and_streams_via_fallback_source() {
        let (mut controller, _errors) = CaptureController::new(test_config());
        assert_eq!(controller.state(), CameraState::Stopped);
        controller.start_streaming().expect("start");
        assert_eq!(controller.state(), CameraState::Streaming);
        controller.stop();
    }

    #[test]
    fn trigger_requires_streaming() {
        let (mut controller, _errors) = CaptureController::new(test_config());
        assert!(matches!(
            controller.trigger_capture(),
            Err(ControllerError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn full_capture_cycle_reaches_captured_with_an_averaged_frame() {
        let (mut controller, _errors) = CaptureController::new(test_config());
        controller.start_streaming().expect("start");
        controller.trigger_capture().expect("trigger");
        assert_eq!(controller.state(), CameraState::Freezing);

        run_capture_to_completion(&mut controller);
        assert_eq!(controller.state(), CameraState::Captured);
        let averaged = controller.averaged_frame().expect("averaged frame");
        assert_eq!(averaged.image().dimensions(), (64, 48));
        assert_eq!(averaged.frame_count(), 5);
        assert!(controller
            .config
            .output_dir
            .join("averaged_capture.jpg")
            .exists());

        controller.stop();
        let _ = std::fs::remove_dir_all(&controller.config.output_dir);
    }

    #[test]
    fn finalize_without_frames_reports_no_frames_captured() {
        let (mut controller, _errors) = CaptureController::new(test_config());
        controller.start_streaming().expect("start");
        controller.trigger_capture().expect("trigger");
        // No tick has run, so the session is still empty.
        let err = controller.finalize().expect_err("must fail");
        assert_eq!(err.to_string(), "no frames captured");
        controller.stop();
    }

    #[test]
    fn resume_clears_the_averaged_frame() {
        let (mut controller, _errors) = CaptureController::new(test_config());
        controller.start_streaming().expect("start");
        controller.trigger_capture().expect("trigger");
        run_capture_to_completion(&mut controller);
        assert!(controller.averaged_frame().is_some());

        controller.resume_streaming().expect("resume");
        assert_eq!(controller.state(), CameraState::Streaming);
        assert!(controller.averaged_frame().is_none());

        controller.stop();
        let _ = std::fs::remove_dir_all(&controller.config.output_dir);
    }

    #[test]
    fn analyze_requires_captured_state() {
        let (mut controller, _errors) = CaptureController::new(test_config());
        controller.start_streaming().expect("start");
        let mut engine = AlgorithmEngine::new(
            inspect_core::ReferenceStore::new(),
            inspect_core::EngineParams::default(),
        );
        assert!(matches!(
            controller.analyze(&mut engine, "single", "front"),
            Err(ControllerError::InvalidTransition { .. })
        ));
        controller.stop();
    }

    #[test]
    fn analyze_returns_to_captured_for_another_cycle() {
        let (mut controller, _errors) = CaptureController::new(test_config());
        controller.start_streaming().expect("start");
        controller.trigger_capture().expect("trigger");
        run_capture_to_completion(&mut controller);

        let mut store = inspect_core::ReferenceStore::new();
        store.insert_reference(
            "front",
            image::GrayImage::from_pixel(64, 48, image::Luma([128])),
        );
        let mut engine = AlgorithmEngine::new(store, inspect_core::EngineParams::default());
        let result = controller
            .analyze(&mut engine, "single", "front")
            .expect("analyze");
        assert_eq!(result.status.status_code, 0);
        assert_eq!(controller.state(), CameraState::Captured);

        // A second analyze over the same averaged frame is allowed.
        let again = controller
            .analyze(&mut engine, "single", "front")
            .expect("analyze");
        assert_eq!(again.status.status_code, 0);

        controller.stop();
        let _ = std::fs::remove_dir_all(&controller.config.output_dir);
    }

    #[test]
    fn stop_is_idempotent_from_any_state() {
        let (mut controller, _errors) = CaptureController::new(test_config());
        controller.stop();
        controller.start_streaming().expect("start");
        controller.trigger_capture().expect("trigger");
        controller.stop();
        assert_eq!(controller.state(), CameraState::Stopped);
        controller.stop();
        assert_eq!(controller.state(), CameraState::Stopped);
        let _ = std::fs::remove_dir_all(&controller.config.output_dir);
    }
}
