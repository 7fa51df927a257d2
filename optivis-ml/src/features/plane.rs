//! Single-channel float planes and their gradients.

use image::{DynamicImage, ImageBuffer, Luma};

/// One image channel with values in `[0, 1]`.
pub type Plane = ImageBuffer<Luma<f32>, Vec<f32>>;

/// Colour space a descriptor is computed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColorSpace {
    Gray,
    Hsv,
    Rgb,
}

impl ColorSpace {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Gray => "gray",
            Self::Hsv => "hsv",
            Self::Rgb => "rgb",
        }
    }
}

/// Split `image` into the planes of `space`.
pub fn planes(image: &DynamicImage, space: ColorSpace) -> Vec<Plane> {
    match space {
        ColorSpace::Gray => vec![gray(image)],
        ColorSpace::Rgb => {
            let rgb = image.to_rgb32f();
            (0..3)
                .map(|c| Plane::from_fn(rgb.width(), rgb.height(), |x, y| Luma([rgb.get_pixel(x, y)[c]])))
                .collect()
        }
        ColorSpace::Hsv => {
            let rgb = image.to_rgb32f();
            let (w, h) = rgb.dimensions();
            let mut hue = Plane::new(w, h);
            let mut sat = Plane::new(w, h);
            let mut val = Plane::new(w, h);
            for (x, y, p) in rgb.enumerate_pixels() {
                let [hh, ss, vv] = rgb_to_hsv(p[0], p[1], p[2]);
                hue.put_pixel(x, y, Luma([hh]));
                sat.put_pixel(x, y, Luma([ss]));
                val.put_pixel(x, y, Luma([vv]));
            }
            vec![hue, sat, val]
        }
    }
}

/// Luminance plane.
pub fn gray(image: &DynamicImage) -> Plane {
    image.to_luma32f()
}

/// HSV with every component scaled to `[0, 1]`.
fn rgb_to_hsv(r: f32, g: f32, b: f32) -> [f32; 3] {
    let max = r.max(g).max(b);
    let min = r.min(g).min(b);
    let delta = max - min;
    let hue = if delta <= f32::EPSILON {
        0.0
    } else if max == r {
        ((g - b) / delta).rem_euclid(6.0) / 6.0
    } else if max == g {
        ((b - r) / delta + 2.0) / 6.0
    } else {
        ((r - g) / delta + 4.0) / 6.0
    };
    let sat = if max <= f32::EPSILON { 0.0 } else { delta / max };
    [hue, sat, max]
}

/// Gaussian smoothing; `sigma <= 0` returns a copy.
pub fn blurred(plane: &Plane, sigma: f32) -> Plane {
    if sigma <= 0.0 {
        return plane.clone();
    }
    image::imageops::blur(plane, sigma)
}

/// Central-difference gradients `(dx, dy)` with clamped borders.
pub fn gradients(plane: &Plane) -> (Plane, Plane) {
    let (w, h) = plane.dimensions();
    let at = |x: i64, y: i64| -> f32 {
        let x = x.clamp(0, w as i64 - 1) as u32;
        let y = y.clamp(0, h as i64 - 1) as u32;
        plane.get_pixel(x, y)[0]
    };
    let dx = Plane::from_fn(w, h, |x, y| {
        let (x, y) = (x as i64, y as i64);
        Luma([(at(x + 1, y) - at(x - 1, y)) * 0.5])
    });
    let dy = Plane::from_fn(w, h, |x, y| {
        let (x, y) = (x as i64, y as i64);
        Luma([(at(x, y + 1) - at(x, y - 1)) * 0.5])
    });
    (dx, dy)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    #[test]
    fn test_hsv_of_primaries() {
        assert_eq!(rgb_to_hsv(1.0, 0.0, 0.0), [0.0, 1.0, 1.0]);
        let [h, s, v] = rgb_to_hsv(0.0, 0.0, 1.0);
        assert!((h - 4.0 / 6.0).abs() < 1e-6);
        assert_eq!((s, v), (1.0, 1.0));
        assert_eq!(rgb_to_hsv(0.0, 0.0, 0.0), [0.0, 0.0, 0.0]);
    }

    #[test]
    fn test_planes_per_space() {
        let image = DynamicImage::ImageRgb8(RgbImage::from_pixel(3, 2, Rgb([255, 0, 0])));
        assert_eq!(planes(&image, ColorSpace::Gray).len(), 1);
        let rgb = planes(&image, ColorSpace::Rgb);
        assert_eq!(rgb.len(), 3);
        assert_eq!(rgb[0].get_pixel(1, 1)[0], 1.0);
        assert_eq!(rgb[1].get_pixel(1, 1)[0], 0.0);
    }

    #[test]
    fn test_gradient_of_horizontal_ramp() {
        let plane = Plane::from_fn(5, 3, |x, _| Luma([x as f32 * 0.1]));
        let (dx, dy) = gradients(&plane);
        assert!((dx.get_pixel(2, 1)[0] - 0.1).abs() < 1e-6);
        assert_eq!(dy.get_pixel(2, 1)[0], 0.0);
    }
}
