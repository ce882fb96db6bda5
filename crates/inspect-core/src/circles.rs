//! Voting-based circular-shape search.
//!
//! Candidates come from a gradient-direction Hough accumulator; each one is
//! then re-validated by cropping a patch around the candidate, collecting its
//! dominant edge contour, and checking the contour's circularity and area
//! against the ideal circle for the reported radius. The re-validation
//! rejects elongated and partial detections without a second detection model.

use std::f32::consts::PI;

use image::GrayImage;

use crate::gradient::{gradient_map, GradientMap};

/// Geometry bounds and sensitivity for the circle search.
#[derive(Clone, Debug)]
pub struct CircleParams {
    pub min_radius: u32,
    pub max_radius: u32,
    /// Normalized gradient magnitude above which a pixel votes.
    pub edge_threshold: f32,
    /// Fraction of the circumference that must vote for a candidate center.
    pub vote_ratio: f32,
}

impl Default for CircleParams {
    fn default() -> Self {
        Self {
            min_radius: 6,
            max_radius: 48,
            edge_threshold: 0.25,
            vote_ratio: 0.5,
        }
    }
}

/// Accepted circle detection.
#[derive(Clone, Copy, Debug)]
pub struct Circle {
    pub cx: f32,
    pub cy: f32,
    pub radius: f32,
}

/// Minimum contour circularity for a candidate to survive validation.
const CIRCULARITY_FLOOR: f32 = 0.65;
/// Minimum contour area relative to the ideal circle's area.
const AREA_FLOOR: f32 = 0.30;

/// Detect validated circles in `image` within the configured radius bounds.
pub fn detect_circles(image: &GrayImage, params: &CircleParams) -> Vec<Circle> {
    let map = gradient_map(image);
    let (width, height) = (map.width as usize, map.height as usize);
    if width == 0 || height == 0 || params.min_radius > params.max_radius {
        return Vec::new();
    }

    let edges: Vec<(usize, usize)> = (0..height)
        .flat_map(|y| (0..width).map(move |x| (x, y)))
        .filter(|&(x, y)| map.at(x as u32, y as u32) > params.edge_threshold)
        .collect();
    if edges.is_empty() {
        return Vec::new();
    }

    let mut candidates: Vec<(Circle, f32)> = Vec::new();
    let mut accumulator = vec![0u32; width * height];

    for radius in params.min_radius..=params.max_radius {
        accumulator.fill(0);
        let r = radius as f32;

        // Vote along the gradient direction, both ways: the center of a
        // bright-on-dark circle lies against the gradient, dark-on-bright
        // along it.
        for &(x, y) in &edges {
            let idx = y * width + x;
            let (gx, gy) = (map.gx[idx], map.gy[idx]);
            let len = (gx * gx + gy * gy).sqrt();
            if len == 0.0 {
                continue;
            }
            let (ux, uy) = (gx / len, gy / len);
            for sign in [1.0f32, -1.0] {
                let cx = x as f32 + sign * ux * r;
                let cy = y as f32 + sign * uy * r;
                if cx < 0.0 || cy < 0.0 {
                    continue;
                }
                let (cxi, cyi) = (cx.round() as usize, cy.round() as usize);
                if cxi < width && cyi < height {
                    accumulator[cyi * width + cxi] += 1;
                }
            }
        }

        let needed = (params.vote_ratio * 2.0 * PI * r).max(8.0) as u32;
        for cy in 1..height - 1 {
            for cx in 1..width - 1 {
                // 3x3 neighbourhood sum absorbs rasterization spread.
                let votes: u32 = (cy - 1..=cy + 1)
                    .flat_map(|yy| (cx - 1..=cx + 1).map(move |xx| (xx, yy)))
                    .map(|(xx, yy)| accumulator[yy * width + xx])
                    .sum();
                if votes < needed {
                    continue;
                }
                let score = votes as f32 / (2.0 * PI * r);
                candidates.push((
                    Circle {
                        cx: cx as f32,
                        cy: cy as f32,
                        radius: r,
                    },
                    score,
                ));
            }
        }
    }

    // Strongest first; suppress near-duplicates across positions and radii.
    candidates.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    let mut accepted: Vec<Circle> = Vec::new();
    for (candidate, _) in candidates {
        let duplicate = accepted.iter().any(|c| {
            let dx = c.cx - candidate.cx;
            let dy = c.cy - candidate.cy;
            (dx * dx + dy * dy).sqrt() < c.radius.min(candidate.radius)
        });
        if duplicate {
            continue;
        }
        if validate_candidate(&map, candidate, params.edge_threshold) {
            accepted.push(candidate);
        }
    }
    accepted
}

/// Re-validate a raw candidate from a cropped surrounding patch.
///
/// Collects the largest connected edge component in the patch and accepts
/// only if its contour is circular enough and covers enough of the ideal
/// circle's area for the reported radius.
fn validate_candidate(map: &GradientMap, candidate: Circle, edge_threshold: f32) -> bool {
    let r = candidate.radius;
    let margin = (r + 4.0) as i64;
    let x0 = (candidate.cx as i64 - margin).max(0) as u32;
    let y0 = (candidate.cy as i64 - margin).max(0) as u32;
    let x1 = ((candidate.cx as i64 + margin) as u32).min(map.width.saturating_sub(1));
    let y1 = ((candidate.cy as i64 + margin) as u32).min(map.height.saturating_sub(1));
    if x1 <= x0 || y1 <= y0 {
        return false;
    }

    let contour = largest_edge_component(map, x0, y0, x1, y1, edge_threshold);
    if contour.len() < 8 {
        return false;
    }

    let hull = convex_hull(&contour);
    if hull.len() < 3 {
        return false;
    }
    let area = polygon_area(&hull);
    let diameter = max_diameter(&hull);
    if diameter == 0.0 {
        return false;
    }

    // Area of the circle spanned by the contour's maximum caliper diameter;
    // elongated contours waste most of that disc.
    let circularity = 4.0 * area / (PI * diameter * diameter);
    let ideal_area = PI * r * r;

    circularity >= CIRCULARITY_FLOOR && area >= AREA_FLOOR * ideal_area
}

/// Largest 8-connected component of edge pixels inside the window.
fn largest_edge_component(
    map: &GradientMap,
    x0: u32,
    y0: u32,
    x1: u32,
    y1: u32,
    threshold: f32,
) -> Vec<(f32, f32)> {
    let w = (x1 - x0 + 1) as usize;
    let h = (y1 - y0 + 1) as usize;
    let mut edge = vec![false; w * h];
    for y in 0..h {
        for x in 0..w {
            edge[y * w + x] = map.at(x0 + x as u32, y0 + y as u32) > threshold;
        }
    }

    let mut visited = vec![false; w * h];
    let mut best: Vec<(f32, f32)> = Vec::new();
    let mut stack = Vec::new();
    let mut component = Vec::new();

    for start in 0..w * h {
        if !edge[start] || visited[start] {
            continue;
        }
        component.clear();
        stack.push(start);
        visited[start] = true;
        while let Some(idx) = stack.pop() {
            let (x, y) = (idx % w, idx / w);
            component.push((x0 as f32 + x as f32, y0 as f32 + y as f32));
            for dy in -1i64..=1 {
                for dx in -1i64..=1 {
                    let (nx, ny) = (x as i64 + dx, y as i64 + dy);
                    if nx < 0 || ny < 0 || nx >= w as i64 || ny >= h as i64 {
                        continue;
                    }
                    let nidx = ny as usize * w + nx as usize;
                    if edge[nidx] && !visited[nidx] {
                        visited[nidx] = true;
                        stack.push(nidx);
                    }
                }
            }
        }
        if component.len() > best.len() {
            best = component.clone();
        }
    }
    best
}

/// Andrew monotone-chain convex hull.
fn convex_hull(points: &[(f32, f32)]) -> Vec<(f32, f32)> {
    if points.len() < 3 {
        return points.to_vec();
    }
    let mut sorted = points.to_vec();
    sorted.sort_by(|a, b| {
        a.0.partial_cmp(&b.0)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))
    });
    sorted.dedup();

    let cross = |o: (f32, f32), a: (f32, f32), b: (f32, f32)| {
        (a.0 - o.0) * (b.1 - o.1) - (a.1 - o.1) * (b.0 - o.0)
    };

    let mut hull: Vec<(f32, f32)> = Vec::with_capacity(sorted.len() * 2);
    for &p in sorted.iter().chain(sorted.iter().rev().skip(1)) {
        while hull.len() >= 2 && cross(hull[hull.len() - 2], hull[hull.len() - 1], p) <= 0.0 {
            hull.pop();
        }
        hull.push(p);
    }
    hull.pop();
    hull
}

fn polygon_area(hull: &[(f32, f32)]) -> f32 {
    let mut twice = 0f32;
    for i in 0..hull.len() {
        let (x0, y0) = hull[i];
        let (x1, y1) = hull[(i + 1) % hull.len()];
        twice += x0 * y1 - x1 * y0;
    }
    twice.abs() / 2.0
}

fn max_diameter(hull: &[(f32, f32)]) -> f32 {
    let mut best = 0f32;
    for i in 0..hull.len() {
        for j in i + 1..hull.len() {
            let dx = hull[i].0 - hull[j].0;
            let dy = hull[i].1 - hull[j].1;
            best = best.max((dx * dx + dy * dy).sqrt());
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    fn filled_disc(width: u32, height: u32, cx: f32, cy: f32, r: f32) -> GrayImage {
        GrayImage::from_fn(width, height, |x, y| {
            let dx = x as f32 - cx;
            let dy = y as f32 - cy;
            if (dx * dx + dy * dy).sqrt() <= r {
                Luma([230])
            } else {
                Luma([20])
            }
        })
    }

    fn filled_ellipse(width: u32, height: u32, cx: f32, cy: f32, a: f32, b: f32) -> GrayImage {
        GrayImage::from_fn(width, height, |x, y| {
            let dx = (x as f32 - cx) / a;
            let dy = (y as f32 - cy) / b;
            if dx * dx + dy * dy <= 1.0 {
                Luma([230])
            } else {
                Luma([20])
            }
        })
    }

    #[test]
    fn perfect_circle_is_detected_with_accurate_radius() {
        let image = filled_disc(120, 120, 60.0, 60.0, 20.0);
        let circles = detect_circles(&image, &CircleParams::default());
        assert!(!circles.is_empty(), "expected a detection");
        let best = circles[0];
        assert!((best.radius - 20.0).abs() <= 2.0, "radius {}", best.radius);
        assert!((best.cx - 60.0).abs() <= 3.0 && (best.cy - 60.0).abs() <= 3.0);
    }

    #[test]
    fn elongated_ellipse_is_rejected() {
        // Aspect ratio 2.5: hull area covers only ~40% of the disc spanned
        // by its own diameter, well under the circularity floor.
        let image = filled_ellipse(160, 120, 80.0, 60.0, 45.0, 18.0);
        let circles = detect_circles(&image, &CircleParams::default());
        assert!(circles.is_empty(), "ellipse must not pass validation");
    }

    #[test]
    fn flat_image_has_no_detections() {
        let image = GrayImage::from_pixel(80, 80, Luma([128]));
        assert!(detect_circles(&image, &CircleParams::default()).is_empty());
    }

    #[test]
    fn radius_outside_bounds_is_ignored() {
        let image = filled_disc(120, 120, 60.0, 60.0, 20.0);
        let params = CircleParams {
            min_radius: 30,
            max_radius: 48,
            ..CircleParams::default()
        };
        assert!(detect_circles(&image, &params).is_empty());
    }
}
