//! Optional text-presence capability.
//!
//! Text recognition is an injected dependency, not a runtime-conditional
//! import: an engine either carries a backend or it does not, and the absence
//! is an explicit, testable configuration. With no backend installed every
//! text-presence check reports "absent" — the detector fails closed rather
//! than substituting a heuristic.

use std::sync::Arc;

use image::GrayImage;

/// Backend capable of deciding whether a patch contains legible text.
pub trait TextDetector: Send + Sync {
    fn contains_text(&self, patch: &GrayImage) -> bool;
}

/// Evaluate text presence through an optional backend, failing closed.
pub(crate) fn text_present(backend: Option<&Arc<dyn TextDetector>>, patch: &GrayImage) -> bool {
    match backend {
        Some(detector) => detector.contains_text(patch),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    struct AlwaysText;

    impl TextDetector for AlwaysText {
        fn contains_text(&self, _patch: &GrayImage) -> bool {
            true
        }
    }

    #[test]
    fn absent_backend_fails_closed() {
        let patch = GrayImage::from_pixel(8, 8, Luma([0]));
        assert!(!text_present(None, &patch));
    }

    #[test]
    fn installed_backend_is_consulted() {
        let patch = GrayImage::from_pixel(8, 8, Luma([0]));
        let backend: Arc<dyn TextDetector> = Arc::new(AlwaysText);
        assert!(text_present(Some(&backend), &patch));
    }
}
