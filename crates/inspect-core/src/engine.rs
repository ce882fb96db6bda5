//! The engine facade owning references, parameters, and mode dispatch.

use std::{collections::HashMap, sync::Arc};

use tracing::warn;

use crate::annotate;
use crate::circles::CircleParams;
use crate::modes::{evaluate_request, EvalContext, ModeRequest};
use crate::reference::ReferenceStore;
use crate::registration::RegistrationParams;
use crate::text::TextDetector;
use crate::types::{AveragedFrame, ComponentResults, InspectionResult, PipelineStatus, Roi};

/// Numeric thresholds and detector tunables, owned by the caller and consumed
/// read-only.
#[derive(Clone, Debug)]
pub struct EngineParams {
    pub registration: RegistrationParams,
    /// Normalized gradient-difference ceiling for a single-side pass.
    pub diff_threshold: f32,
    /// Normalized magnitude above which a pixel counts as high-gradient.
    pub gradient_threshold: f32,
    /// High-gradient area ratio required for a plate pass.
    pub plate_area_ratio: f32,
    /// Stricter ratio backing the independent screw signal.
    pub screw_area_ratio: f32,
    pub circle: CircleParams,
}

impl Default for EngineParams {
    fn default() -> Self {
        Self {
            registration: RegistrationParams::default(),
            diff_threshold: 0.15,
            gradient_threshold: 0.20,
            plate_area_ratio: 0.08,
            screw_area_ratio: 0.16,
            circle: CircleParams::default(),
        }
    }
}

/// Named ROI tables for the two station component groups, in
/// reference-image coordinates.
#[derive(Clone, Debug, Default)]
pub struct StationLayout {
    pub top: HashMap<String, Roi>,
    pub bottom: HashMap<String, Roi>,
}

impl StationLayout {
    #[must_use]
    pub fn with_top_roi(mut self, name: impl Into<String>, roi: Roi) -> Self {
        self.top.insert(name.into(), roi);
        self
    }

    #[must_use]
    pub fn with_bottom_roi(mut self, name: impl Into<String>, roi: Roi) -> Self {
        self.bottom.insert(name.into(), roi);
        self
    }
}

/// Deterministic analysis engine.
///
/// The reference store is injected and owned, so independent engines never
/// share state. Expected failures (unknown tags, missing references or ROIs)
/// come back as `PipelineStatus { code: 1, .. }`, never as panics or errors
/// across the process boundary.
pub struct AlgorithmEngine {
    store: ReferenceStore,
    layout: StationLayout,
    params: EngineParams,
    text: Option<Arc<dyn TextDetector>>,
    last: Option<InspectionResult>,
}

impl AlgorithmEngine {
    pub fn new(store: ReferenceStore, params: EngineParams) -> Self {
        Self {
            store,
            layout: StationLayout::default(),
            params,
            text: None,
            last: None,
        }
    }

    /// Install the station-mode ROI tables.
    #[must_use]
    pub fn with_layout(mut self, layout: StationLayout) -> Self {
        self.layout = layout;
        self
    }

    /// Install a text-recognition backend. Without one, every text-presence
    /// check reports absent.
    #[must_use]
    pub fn with_text_detector(mut self, detector: Arc<dyn TextDetector>) -> Self {
        self.text = Some(detector);
        self
    }

    pub fn store(&self) -> &ReferenceStore {
        &self.store
    }

    /// Analyze with caller-supplied string identifiers. `selector` is the
    /// side for single-side mode, the submode for station mode.
    pub fn process(
        &mut self,
        frame: &AveragedFrame,
        mode: &str,
        selector: &str,
    ) -> InspectionResult {
        match ModeRequest::parse(mode, selector) {
            Ok(request) => self.process_request(frame, &request),
            Err(err) => {
                warn!(mode, selector, %err, "rejected inspection request");
                let result = Self::error_result(frame, err.to_string());
                self.last = Some(result.clone());
                result
            }
        }
    }

    /// Analyze a parsed request.
    pub fn process_request(
        &mut self,
        frame: &AveragedFrame,
        request: &ModeRequest,
    ) -> InspectionResult {
        let ctx = EvalContext {
            store: &self.store,
            params: &self.params,
            layout: &self.layout,
            text: self.text.as_ref(),
        };
        let result = match evaluate_request(request, frame.image(), &ctx) {
            Ok(eval) => InspectionResult {
                original: frame.image().clone(),
                annotated: eval.annotated,
                status: PipelineStatus::executed(),
                results: eval.results,
            },
            Err(err) => {
                warn!(%err, "inspection pipeline failed");
                Self::error_result(frame, err.to_string())
            }
        };
        self.last = Some(result.clone());
        result
    }

    /// The most recent result, retained for host inspection only.
    pub fn last_result(&self) -> Option<&InspectionResult> {
        self.last.as_ref()
    }

    fn error_result(frame: &AveragedFrame, message: String) -> InspectionResult {
        InspectionResult {
            original: frame.image().clone(),
            annotated: annotate::gray_to_rgb(frame.image()),
            status: PipelineStatus::failed(message),
            results: ComponentResults::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use image::{GrayImage, Luma};

    use crate::types::AverageMethod;

    fn averaged(image: GrayImage) -> AveragedFrame {
        AveragedFrame::new(image, AverageMethod::Mean, 5, Utc::now())
    }

    #[test]
    fn unknown_mode_is_a_status_not_a_panic() {
        let mut engine = AlgorithmEngine::new(ReferenceStore::new(), EngineParams::default());
        let frame = averaged(GrayImage::from_pixel(32, 32, Luma([128])));
        let result = engine.process(&frame, "frobnicate", "front");
        assert_eq!(result.status.status_code, 1);
        assert!(result.status.message.contains("unknown mode"));
        assert!(result.results.is_empty());
    }

    #[test]
    fn missing_reference_is_reported() {
        let mut engine = AlgorithmEngine::new(ReferenceStore::new(), EngineParams::default());
        let frame = averaged(GrayImage::from_pixel(32, 32, Luma([128])));
        let result = engine.process(&frame, "single", "front");
        assert_eq!(result.status.status_code, 1);
        assert!(result.status.message.contains("front"));
    }

    #[test]
    fn missing_plate_roi_is_reported() {
        let mut store = ReferenceStore::new();
        store.insert_reference("top", GrayImage::from_pixel(64, 64, Luma([128])));
        let mut engine = AlgorithmEngine::new(store, EngineParams::default());
        let frame = averaged(GrayImage::from_pixel(64, 64, Luma([128])));
        let result = engine.process(&frame, "station", "top");
        assert_eq!(result.status.status_code, 1);
        assert!(result.status.message.contains("plate"));
    }

    #[test]
    fn last_result_is_cached_for_the_host() {
        let mut engine = AlgorithmEngine::new(ReferenceStore::new(), EngineParams::default());
        assert!(engine.last_result().is_none());
        let frame = averaged(GrayImage::from_pixel(16, 16, Luma([0])));
        engine.process(&frame, "nope", "x");
        assert_eq!(
            engine
                .last_result()
                .map(|r| r.status.status_code),
            Some(1)
        );
    }
}
