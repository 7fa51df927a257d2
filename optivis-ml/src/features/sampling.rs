//! Key-point sampling.
//!
//! Dense sampling lays a regular grid of square windows over the image.
//! Detector-native methods pick salient corners from a Harris response at a
//! method-specific scale.

use super::descriptors::{DescriptorKind, DescriptorSpec};
use super::plane::{Plane, blurred, gradients};
use crate::error::MlError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Upper bound on detector key points per image.
const MAX_DETECTED: usize = 256;

/// Harris sensitivity constant.
const HARRIS_K: f32 = 0.04;

/// How key regions are chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SamplingMethod {
    Dense,
    Sift,
    Kaze,
    Akaze,
    Orb,
}

impl SamplingMethod {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Dense => "dense",
            Self::Sift => "sift",
            Self::Kaze => "kaze",
            Self::Akaze => "akaze",
            Self::Orb => "orb",
        }
    }

    /// Smoothing scale and window size of the detector.
    fn detector_scale(&self) -> (f32, u32) {
        match self {
            Self::Dense => (0.0, 0),
            Self::Sift => (1.6, 16),
            Self::Kaze => (2.0, 24),
            Self::Akaze => (1.2, 20),
            Self::Orb => (0.0, 31),
        }
    }
}

impl fmt::Display for SamplingMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for SamplingMethod {
    type Err = MlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "dense" => Ok(Self::Dense),
            "sift" => Ok(Self::Sift),
            "kaze" => Ok(Self::Kaze),
            "akaze" => Ok(Self::Akaze),
            "orb" => Ok(Self::Orb),
            other => Err(MlError::UnknownSamplingMethod(other.to_string())),
        }
    }
}

/// Centre and side length of a square key region.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct KeyPoint {
    pub x: u32,
    pub y: u32,
    pub size: u32,
}

impl KeyPoint {
    /// Window `(x0, y0, x1, y1)` clipped to a `width` x `height` image.
    pub fn window(&self, width: u32, height: u32) -> (u32, u32, u32, u32) {
        let half = self.size / 2;
        let x0 = self.x.saturating_sub(half);
        let y0 = self.y.saturating_sub(half);
        let x1 = (self.x + half).min(width);
        let y1 = (self.y + half).min(height);
        (x0, y0, x1, y1)
    }
}

/// Coerce `method` to one compatible with the requested descriptors.
///
/// KAZE descriptors need KAZE-family key points, and SIFT key points only
/// pair with SIFT descriptors. Coercion is logged, never an error.
pub fn validate_sampling(method: SamplingMethod, descriptors: &[DescriptorSpec]) -> SamplingMethod {
    let uses = |kind: DescriptorKind| descriptors.iter().any(|d| d.kind == kind);

    if !matches!(method, SamplingMethod::Kaze | SamplingMethod::Akaze) && uses(DescriptorKind::Kaze) {
        tracing::warn!(
            requested = %method,
            "KAZE descriptors are only compatible with KAZE key points; sampling changed to kaze"
        );
        return SamplingMethod::Kaze;
    }

    if method == SamplingMethod::Sift && !uses(DescriptorKind::Sift) {
        tracing::warn!(
            "SIFT key points are only compatible with SIFT descriptors; sampling changed to kaze"
        );
        return SamplingMethod::Kaze;
    }

    method
}

/// Sampling method with its dense-grid parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct KeyPointSet {
    pub method: SamplingMethod,
    pub step: u32,
    pub window: u32,
}

impl KeyPointSet {
    pub fn new(method: SamplingMethod, step: u32, window: u32) -> Self {
        Self {
            method,
            step: step.max(1),
            window: window.max(2),
        }
    }

    /// Key points for `gray`. Every returned window holds at least 2x2 pixels.
    pub fn sample(&self, gray: &Plane) -> Vec<KeyPoint> {
        match self.method {
            SamplingMethod::Dense => self.dense(gray.width(), gray.height()),
            method => detect(gray, method),
        }
    }

    fn dense(&self, width: u32, height: u32) -> Vec<KeyPoint> {
        if width < self.window || height < self.window {
            return Vec::new();
        }
        let half = self.window / 2;
        let mut points = Vec::new();
        for y in (0..=height - self.window).step_by(self.step as usize) {
            for x in (0..=width - self.window).step_by(self.step as usize) {
                points.push(KeyPoint {
                    x: x + half,
                    y: y + half,
                    size: self.window,
                });
            }
        }
        points
    }
}

fn detect(gray: &Plane, method: SamplingMethod) -> Vec<KeyPoint> {
    let (sigma, size) = method.detector_scale();
    let (w, h) = gray.dimensions();
    if w < 3 || h < 3 {
        return Vec::new();
    }

    let smooth = blurred(gray, sigma);
    let (dx, dy) = gradients(&smooth);
    let response = |x: u32, y: u32| -> f32 {
        let (mut sxx, mut syy, mut sxy) = (0.0f32, 0.0f32, 0.0f32);
        for yy in y - 1..=y + 1 {
            for xx in x - 1..=x + 1 {
                let gx = dx.get_pixel(xx, yy)[0];
                let gy = dy.get_pixel(xx, yy)[0];
                sxx += gx * gx;
                syy += gy * gy;
                sxy += gx * gy;
            }
        }
        sxx * syy - sxy * sxy - HARRIS_K * (sxx + syy).powi(2)
    };

    let mut scores = vec![0.0f32; (w * h) as usize];
    let mut peak = 0.0f32;
    for y in 1..h - 1 {
        for x in 1..w - 1 {
            let r = response(x, y);
            scores[(y * w + x) as usize] = r;
            peak = peak.max(r);
        }
    }
    if peak <= 0.0 {
        return Vec::new();
    }

    let threshold = peak * 0.01;
    let at = |x: u32, y: u32| scores[(y * w + x) as usize];
    let mut candidates = Vec::new();
    for y in 2..h.saturating_sub(2) {
        for x in 2..w.saturating_sub(2) {
            let r = at(x, y);
            if r <= threshold {
                continue;
            }
            // Plateaus keep their first point in raster order.
            let is_max = (y - 1..=y + 1)
                .flat_map(|yy| (x - 1..=x + 1).map(move |xx| (xx, yy)))
                .all(|(xx, yy)| {
                    let other = at(xx, yy);
                    (xx, yy) == (x, y) || other < r || (other == r && (yy, xx) > (y, x))
                });
            if is_max {
                candidates.push((r, x, y));
            }
        }
    }
    candidates.sort_by(|a, b| b.0.total_cmp(&a.0));
    candidates
        .into_iter()
        .take(MAX_DETECTED)
        .map(|(_, x, y)| KeyPoint { x, y, size })
        .filter(|kp| {
            let (x0, y0, x1, y1) = kp.window(w, h);
            x1 - x0 >= 2 && y1 - y0 >= 2
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    fn spec(name: &str) -> DescriptorSpec {
        name.parse().unwrap()
    }

    #[test]
    fn test_dense_grid_count() {
        let set = KeyPointSet::new(SamplingMethod::Dense, 10, 20);
        let plane = Plane::new(50, 40);
        // x: 0,10,20,30 ; y: 0,10,20
        assert_eq!(set.sample(&plane).len(), 12);
    }

    #[test]
    fn test_dense_grid_too_small_image() {
        let set = KeyPointSet::new(SamplingMethod::Dense, 10, 20);
        assert!(set.sample(&Plane::new(10, 40)).is_empty());
    }

    #[test]
    fn test_detector_finds_square_corners() {
        let plane = Plane::from_fn(64, 64, |x, y| {
            if (20..44).contains(&x) && (20..44).contains(&y) {
                Luma([1.0])
            } else {
                Luma([0.0])
            }
        });
        let points = KeyPointSet::new(SamplingMethod::Orb, 1, 2).sample(&plane);
        assert!(!points.is_empty());
        assert!(points.len() <= MAX_DETECTED);
        // Flat images have no corners.
        assert!(KeyPointSet::new(SamplingMethod::Sift, 1, 2).sample(&Plane::new(32, 32)).is_empty());
    }

    #[test]
    fn test_kaze_descriptor_coerces_sampling() {
        assert_eq!(
            validate_sampling(SamplingMethod::Dense, &[spec("kaze")]),
            SamplingMethod::Kaze
        );
        assert_eq!(
            validate_sampling(SamplingMethod::Akaze, &[spec("kaze")]),
            SamplingMethod::Akaze
        );
    }

    #[test]
    fn test_sift_sampling_requires_sift_descriptor() {
        assert_eq!(
            validate_sampling(SamplingMethod::Sift, &[spec("hsv-hog")]),
            SamplingMethod::Kaze
        );
        assert_eq!(
            validate_sampling(SamplingMethod::Sift, &[spec("gray-sift")]),
            SamplingMethod::Sift
        );
        assert_eq!(
            validate_sampling(SamplingMethod::Dense, &[spec("lbp")]),
            SamplingMethod::Dense
        );
    }

    #[test]
    fn test_unknown_method_rejected() {
        assert!(matches!(
            "surf".parse::<SamplingMethod>(),
            Err(MlError::UnknownSamplingMethod(_))
        ));
    }
}
