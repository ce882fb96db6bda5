//! Inspection-mode dispatch.
//!
//! Callers supply mode/side/submode identifiers as strings; they are parsed
//! once into [`ModeRequest`] and evaluated through a single strategy
//! contract. Unknown tags never reach an evaluator.

use std::sync::Arc;

use image::{imageops, GrayImage, RgbImage};
use tracing::debug;

use crate::annotate;
use crate::circles::detect_circles;
use crate::engine::{EngineParams, StationLayout};
use crate::error::EngineError;
use crate::gradient::{difference_field, gradient_map, high_gradient_ratio, mean_absolute_difference};
use crate::reference::ReferenceStore;
use crate::registration::register;
use crate::text::{text_present, TextDetector};
use crate::types::{ComponentResults, Roi};

/// Component group inspected in station mode.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Submode {
    Top,
    Bottom,
}

impl Submode {
    /// Reference-store key and log label for the submode.
    pub fn key(self) -> &'static str {
        match self {
            Self::Top => "top",
            Self::Bottom => "bottom",
        }
    }

    fn parse(tag: &str) -> Result<Self, EngineError> {
        match tag {
            "top" => Ok(Self::Top),
            "bottom" => Ok(Self::Bottom),
            "" => Err(EngineError::MissingSelector),
            other => Err(EngineError::UnknownSubmode(other.to_string())),
        }
    }
}

/// Parsed inspection request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ModeRequest {
    /// One reference (and optional mask) per side.
    SingleSide { side: String },
    /// Named-ROI component groups over a registered frame.
    Station { submode: Submode },
}

impl ModeRequest {
    /// Parse caller-supplied identifiers. `selector` is the side tag for
    /// single-side mode and the submode tag for station mode.
    pub fn parse(mode: &str, selector: &str) -> Result<Self, EngineError> {
        match mode {
            "single" => {
                if selector.is_empty() {
                    Err(EngineError::MissingSelector)
                } else {
                    Ok(Self::SingleSide {
                        side: selector.to_string(),
                    })
                }
            }
            "station" => Ok(Self::Station {
                submode: Submode::parse(selector)?,
            }),
            other => Err(EngineError::UnknownMode(other.to_string())),
        }
    }
}

/// Everything an evaluator may consult, borrowed from the engine.
pub(crate) struct EvalContext<'a> {
    pub store: &'a ReferenceStore,
    pub params: &'a EngineParams,
    pub layout: &'a StationLayout,
    pub text: Option<&'a Arc<dyn TextDetector>>,
}

pub(crate) struct Evaluation {
    pub results: ComponentResults,
    pub annotated: RgbImage,
}

/// Single contract every mode variant implements.
pub(crate) trait ModeStrategy {
    fn evaluate(&self, frame: &GrayImage, ctx: &EvalContext<'_>) -> Result<Evaluation, EngineError>;
}

pub(crate) fn evaluate_request(
    request: &ModeRequest,
    frame: &GrayImage,
    ctx: &EvalContext<'_>,
) -> Result<Evaluation, EngineError> {
    match request {
        ModeRequest::SingleSide { side } => SingleSideMode { side }.evaluate(frame, ctx),
        ModeRequest::Station { submode } => StationMode { submode: *submode }.evaluate(frame, ctx),
    }
}

struct SingleSideMode<'a> {
    side: &'a str,
}

impl ModeStrategy for SingleSideMode<'_> {
    fn evaluate(&self, frame: &GrayImage, ctx: &EvalContext<'_>) -> Result<Evaluation, EngineError> {
        let reference = ctx
            .store
            .reference(self.side)
            .ok_or_else(|| EngineError::MissingReference(self.side.to_string()))?;
        let mask = ctx.store.mask(self.side);
        if let Some(mask) = mask {
            if mask.dimensions() != reference.dimensions() {
                return Err(EngineError::MaskMismatch(self.side.to_string()));
            }
        }

        let registration = register(frame, reference, &ctx.params.registration);
        let grad_ref = gradient_map(reference);
        let grad_cur = gradient_map(&registration.image);
        let difference = mean_absolute_difference(&grad_ref, &grad_cur, mask);
        let pass = difference <= ctx.params.diff_threshold;
        debug!(
            side = self.side,
            difference,
            threshold = ctx.params.diff_threshold,
            degraded = registration.degraded,
            matches = registration.match_count,
            pass,
            "single-side evaluation"
        );

        let (width, height) = registration.image.dimensions();
        let mut pane = annotate::gray_to_rgb(&registration.image);
        let color = annotate::outcome_color(pass);
        let label = format!("{} {}", self.side, if pass { "PASS" } else { "FAIL" });
        match mask.and_then(annotate::mask_bounding_box) {
            Some((x0, y0, x1, y1)) => {
                annotate::draw_rectangle(
                    &mut pane,
                    x0 as i32,
                    y0 as i32,
                    x1 as i32,
                    y1 as i32,
                    color,
                );
                annotate::draw_label(&mut pane, x0 as i32, (y0 as i32 - 10).max(0), &label, color);
            }
            None => {
                annotate::draw_rectangle(
                    &mut pane,
                    0,
                    0,
                    width as i32 - 1,
                    height as i32 - 1,
                    color,
                );
                annotate::draw_label(&mut pane, 2, 2, &label, color);
            }
        }

        let heat = annotate::heatmap(&difference_field(&grad_ref, &grad_cur), width, height);
        let annotated = annotate::side_by_side(&pane, &heat);

        let mut results = ComponentResults::new();
        results.insert(self.side.to_string(), u8::from(pass));
        Ok(Evaluation { results, annotated })
    }
}

struct StationMode {
    submode: Submode,
}

impl StationMode {
    fn crop(frame: &GrayImage, roi: Roi) -> GrayImage {
        imageops::crop_imm(frame, roi.x, roi.y, roi.width, roi.height).to_image()
    }

    fn draw_component(annotated: &mut RgbImage, roi: Roi, name: &str, pass: bool) {
        let color = annotate::outcome_color(pass);
        annotate::draw_rectangle(
            annotated,
            roi.x as i32,
            roi.y as i32,
            (roi.x + roi.width) as i32 - 1,
            (roi.y + roi.height) as i32 - 1,
            color,
        );
        annotate::draw_label(
            annotated,
            roi.x as i32,
            (roi.y as i32 - 10).max(0),
            name,
            color,
        );
    }
}

impl ModeStrategy for StationMode {
    fn evaluate(&self, frame: &GrayImage, ctx: &EvalContext<'_>) -> Result<Evaluation, EngineError> {
        let key = self.submode.key();
        let reference = ctx
            .store
            .reference(key)
            .ok_or_else(|| EngineError::MissingReference(key.to_string()))?;
        let registration = register(frame, reference, &ctx.params.registration);
        let registered = &registration.image;
        let (width, height) = registered.dimensions();
        let grad = gradient_map(registered);

        let rois = match self.submode {
            Submode::Top => &ctx.layout.top,
            Submode::Bottom => &ctx.layout.bottom,
        };
        let plate_roi = *rois
            .get("plate")
            .ok_or_else(|| EngineError::MissingRoi("plate".to_string()))?;
        if !plate_roi.fits_within(width, height) {
            return Err(EngineError::RoiOutOfBounds("plate".to_string()));
        }

        let plate_ratio =
            high_gradient_ratio(&grad, Some(plate_roi), ctx.params.gradient_threshold);
        let plate = plate_ratio >= ctx.params.plate_area_ratio;

        let mut annotated = annotate::gray_to_rgb(registered);
        let mut results = ComponentResults::new();
        results.insert("plate".to_string(), u8::from(plate));

        match self.submode {
            Submode::Top => {
                // Screw has no sensor of its own on the top face; it carries
                // the plate outcome.
                results.insert("screw".to_string(), u8::from(plate));
                debug!(
                    submode = key,
                    plate_ratio,
                    plate,
                    degraded = registration.degraded,
                    "station top evaluation"
                );
            }
            Submode::Bottom => {
                // Independent screw signal: finer edge-density measurement
                // held against the stricter ratio.
                let fine_ratio = high_gradient_ratio(
                    &grad,
                    Some(plate_roi),
                    ctx.params.gradient_threshold * 0.5,
                );
                let screw = fine_ratio >= ctx.params.screw_area_ratio;
                results.insert("screw".to_string(), u8::from(screw));

                for name in ["antenna", "capacitor"] {
                    if let Some(&roi) = rois.get(name) {
                        if !roi.fits_within(width, height) {
                            return Err(EngineError::RoiOutOfBounds(name.to_string()));
                        }
                        let patch = Self::crop(registered, roi);
                        let present = text_present(ctx.text, &patch);
                        results.insert(name.to_string(), u8::from(present));
                        Self::draw_component(&mut annotated, roi, name, present);
                    }
                }
                if let Some(&roi) = rois.get("speaker") {
                    if !roi.fits_within(width, height) {
                        return Err(EngineError::RoiOutOfBounds("speaker".to_string()));
                    }
                    let patch = Self::crop(registered, roi);
                    let present = text_present(ctx.text, &patch)
                        || !detect_circles(&patch, &ctx.params.circle).is_empty();
                    results.insert("speaker".to_string(), u8::from(present));
                    Self::draw_component(&mut annotated, roi, "speaker", present);
                }
                debug!(
                    submode = key,
                    plate_ratio,
                    fine_ratio,
                    degraded = registration.degraded,
                    "station bottom evaluation"
                );
            }
        }

        Self::draw_component(&mut annotated, plate_roi, "plate", plate);

        Ok(Evaluation { results, annotated })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_accepts_known_modes() {
        assert_eq!(
            ModeRequest::parse("single", "front").expect("parse"),
            ModeRequest::SingleSide {
                side: "front".to_string()
            }
        );
        assert_eq!(
            ModeRequest::parse("station", "top").expect("parse"),
            ModeRequest::Station {
                submode: Submode::Top
            }
        );
    }

    #[test]
    fn parse_rejects_unknown_mode_with_diagnostic() {
        let err = ModeRequest::parse("frobnicate", "front").expect_err("must fail");
        assert!(err.to_string().contains("unknown mode"));
    }

    #[test]
    fn parse_rejects_unknown_or_missing_submode() {
        assert!(matches!(
            ModeRequest::parse("station", "left"),
            Err(EngineError::UnknownSubmode(_))
        ));
        assert!(matches!(
            ModeRequest::parse("station", ""),
            Err(EngineError::MissingSelector)
        ));
        assert!(matches!(
            ModeRequest::parse("single", ""),
            Err(EngineError::MissingSelector)
        ));
    }
}
