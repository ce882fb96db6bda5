use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use image::{GrayImage, RgbImage};
use serde::Serialize;

/// Pixel-wise combination rule applied when a capture session finalizes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AverageMethod {
    Mean,
    Median,
}

impl AverageMethod {
    pub fn parse(tag: &str) -> Option<Self> {
        match tag {
            "mean" => Some(Self::Mean),
            "median" => Some(Self::Median),
            _ => None,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Mean => "mean",
            Self::Median => "median",
        }
    }
}

/// Immutable averaged sample; the sole input the engine accepts.
#[derive(Clone)]
pub struct AveragedFrame {
    image: GrayImage,
    method: AverageMethod,
    frame_count: usize,
    captured_at: DateTime<Utc>,
}

impl AveragedFrame {
    pub fn new(
        image: GrayImage,
        method: AverageMethod,
        frame_count: usize,
        captured_at: DateTime<Utc>,
    ) -> Self {
        Self {
            image,
            method,
            frame_count,
            captured_at,
        }
    }

    pub fn image(&self) -> &GrayImage {
        &self.image
    }

    pub fn method(&self) -> AverageMethod {
        self.method
    }

    pub fn frame_count(&self) -> usize {
        self.frame_count
    }

    pub fn captured_at(&self) -> DateTime<Utc> {
        self.captured_at
    }
}

/// Rectangle in reference-image coordinates.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Roi {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Roi {
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Whether the rectangle fits entirely inside a `bounds_w` x `bounds_h`
    /// frame.
    pub fn fits_within(&self, bounds_w: u32, bounds_h: u32) -> bool {
        self.width > 0
            && self.height > 0
            && self.x.saturating_add(self.width) <= bounds_w
            && self.y.saturating_add(self.height) <= bounds_h
    }
}

/// Outcome of the pipeline itself, independent of component pass/fail.
///
/// Code 0 means "the pipeline executed"; individual components may still have
/// failed. Code 1 means the pipeline could not run to completion.
#[derive(Clone, Debug, Serialize)]
pub struct PipelineStatus {
    pub status_code: u8,
    pub message: String,
}

impl PipelineStatus {
    pub fn executed() -> Self {
        Self {
            status_code: 0,
            message: "ok".to_string(),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            status_code: 1,
            message: message.into(),
        }
    }

    pub fn is_executed(&self) -> bool {
        self.status_code == 0
    }
}

/// Component name to 0/1 outcome, ordered for stable serialization.
pub type ComponentResults = BTreeMap<String, u8>;

/// One analysis outcome. Created fresh per analyze call; ownership passes to
/// the caller.
#[derive(Clone)]
pub struct InspectionResult {
    pub original: GrayImage,
    pub annotated: RgbImage,
    pub status: PipelineStatus,
    pub results: ComponentResults,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn average_method_parses_known_tags() {
        assert_eq!(AverageMethod::parse("mean"), Some(AverageMethod::Mean));
        assert_eq!(AverageMethod::parse("median"), Some(AverageMethod::Median));
        assert_eq!(AverageMethod::parse("mode"), None);
    }

    #[test]
    fn roi_bounds_checking() {
        let roi = Roi::new(100, 120, 400, 200);
        assert!(roi.fits_within(640, 480));
        assert!(!roi.fits_within(400, 480));
        assert!(!Roi::new(0, 0, 0, 10).fits_within(640, 480));
    }

    #[test]
    fn status_codes() {
        assert!(PipelineStatus::executed().is_executed());
        let failed = PipelineStatus::failed("unknown mode \"x\"");
        assert_eq!(failed.status_code, 1);
        assert!(!failed.is_executed());
    }
}
