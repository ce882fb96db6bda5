use std::path::PathBuf;

use thiserror::Error;

/// Configuration and processing failures surfaced as a structured status.
///
/// None of these cross the analyze boundary as a panic or an `Err`; the
/// engine folds them into `PipelineStatus { code: 1, .. }` so callers do not
/// need exception-style control flow for expected failure modes.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("unknown mode {0:?}")]
    UnknownMode(String),
    #[error("unknown submode {0:?} (expected \"top\" or \"bottom\")")]
    UnknownSubmode(String),
    #[error("missing side or submode identifier")]
    MissingSelector,
    #[error("reference {0:?} is not loaded")]
    MissingReference(String),
    #[error("mask {0:?} does not match reference dimensions")]
    MaskMismatch(String),
    #[error("roi {0:?} is required for the active submode")]
    MissingRoi(String),
    #[error("roi {0:?} lies outside the reference frame")]
    RoiOutOfBounds(String),
    #[error("failed to load image {}: {source}", .path.display())]
    ImageLoad {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
}
