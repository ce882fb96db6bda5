//! Synthetic frame source used when no physical camera is reachable.

use std::time::Duration;

use chrono::Utc;

use crate::{CaptureError, Frame, FrameFormat, FrameOrigin, FrameSource};

/// Test pattern rendered by the simulated source.
#[derive(Debug, Clone, Copy)]
pub enum TestPattern {
    /// Diagonal gradient whose phase advances every read, so consecutive
    /// frames differ the way a live scene would.
    MovingGradient,
    /// Static vertical bars stepping through eight gray levels.
    Bars,
    /// Single gray level across the whole frame.
    Solid(u8),
}

/// Camera stand-in producing deterministic synthetic frames.
pub struct SimulatedSource {
    width: u32,
    height: u32,
    pattern: TestPattern,
    tick: u64,
    released: bool,
}

impl SimulatedSource {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            pattern: TestPattern::MovingGradient,
            tick: 0,
            released: false,
        }
    }

    /// Select the pattern rendered on each read.
    #[must_use]
    pub fn with_pattern(mut self, pattern: TestPattern) -> Self {
        self.pattern = pattern;
        self
    }

    fn render(&self) -> Vec<u8> {
        let (w, h) = (self.width as usize, self.height as usize);
        let mut data = vec![0u8; w * h];
        match self.pattern {
            TestPattern::MovingGradient => {
                let phase = (self.tick * 3) as usize;
                for y in 0..h {
                    for x in 0..w {
                        data[y * w + x] = ((x + y + phase) % 256) as u8;
                    }
                }
            }
            TestPattern::Bars => {
                let bar = (w / 8).max(1);
                for y in 0..h {
                    for x in 0..w {
                        data[y * w + x] = ((x / bar).min(7) * 32 + 16) as u8;
                    }
                }
            }
            TestPattern::Solid(level) => data.fill(level),
        }
        data
    }
}

impl FrameSource for SimulatedSource {
    fn describe(&self) -> String {
        format!("simulated {}x{} ({:?})", self.width, self.height, self.pattern)
    }

    fn resolution(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn origin(&self) -> FrameOrigin {
        FrameOrigin::Simulated
    }

    fn read(&mut self, _timeout: Duration) -> Result<Frame, CaptureError> {
        if self.released {
            return Err(CaptureError::Disconnected);
        }
        let data = self.render();
        self.tick = self.tick.wrapping_add(1);
        Ok(Frame {
            data,
            width: self.width,
            height: self.height,
            format: FrameFormat::Gray8,
            origin: FrameOrigin::Simulated,
            timestamp_ms: Utc::now().timestamp_millis(),
        })
    }

    fn release(&mut self) {
        self.released = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TIMEOUT: Duration = Duration::from_millis(10);

    #[test]
    fn frames_have_requested_resolution() {
        let mut source = SimulatedSource::new(64, 48);
        let frame = source.read(TIMEOUT).expect("read");
        assert_eq!((frame.width, frame.height), (64, 48));
        assert_eq!(frame.data.len(), 64 * 48);
        assert_eq!(frame.origin, FrameOrigin::Simulated);
    }

    #[test]
    fn moving_gradient_varies_between_reads() {
        let mut source = SimulatedSource::new(32, 32);
        let first = source.read(TIMEOUT).expect("read");
        let second = source.read(TIMEOUT).expect("read");
        assert_ne!(first.data, second.data);
    }

    #[test]
    fn solid_pattern_is_uniform() {
        let mut source = SimulatedSource::new(16, 16).with_pattern(TestPattern::Solid(99));
        let frame = source.read(TIMEOUT).expect("read");
        assert!(frame.data.iter().all(|&v| v == 99));
    }

    #[test]
    fn released_source_stops_producing() {
        let mut source = SimulatedSource::new(16, 16);
        source.release();
        assert!(matches!(source.read(TIMEOUT), Err(CaptureError::Disconnected)));
    }
}
