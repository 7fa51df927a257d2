//! Target image size handling.

use image::DynamicImage;
use image::imageops::FilterType;
use serde::{Deserialize, Serialize};

/// Requested output size.
///
/// Each dimension is an absolute pixel count when `>= 1`, a scale factor of
/// the original when `< 1`, or inferred from the other dimension's scale
/// (keeping the aspect ratio) when unset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ImageSize {
    #[serde(default)]
    pub height: Option<f64>,
    #[serde(default)]
    pub width: Option<f64>,
}

impl ImageSize {
    pub fn new(height: Option<f64>, width: Option<f64>) -> Self {
        Self { height, width }
    }

    /// Output `(width, height)` for an input of `(width, height)`, or `None`
    /// when the image is left untouched.
    pub fn target(&self, original: (u32, u32)) -> Option<(u32, u32)> {
        let (o_width, o_height) = (original.0 as f64, original.1 as f64);
        let resolve = |value: f64, original: f64| {
            if value < 1.0 {
                original * value
            } else {
                value
            }
        };
        let (width, height) = match (self.width, self.height) {
            (None, None) => return None,
            (Some(w), Some(h)) => (resolve(w, o_width), resolve(h, o_height)),
            (Some(w), None) => {
                let width = resolve(w, o_width);
                (width, o_height * width / o_width)
            }
            (None, Some(h)) => {
                let height = resolve(h, o_height);
                (o_width * height / o_height, height)
            }
        };
        Some(((width as u32).max(1), (height as u32).max(1)))
    }

    /// Resize with cubic interpolation.
    pub fn apply(&self, image: &DynamicImage) -> DynamicImage {
        match self.target((image.width(), image.height())) {
            Some((w, h)) if (w, h) != (image.width(), image.height()) => {
                image.resize_exact(w, h, FilterType::CatmullRom)
            }
            _ => image.clone(),
        }
    }

    pub fn describe(&self) -> String {
        let fmt = |v: Option<f64>| v.map(|v| v.to_string()).unwrap_or_else(|| "-".into());
        format!("{}/{}", fmt(self.height), fmt(self.width))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::RgbImage;

    #[test]
    fn test_absolute_dimensions() {
        let size = ImageSize::new(Some(32.0), Some(64.0));
        assert_eq!(size.target((200, 100)), Some((64, 32)));
    }

    #[test]
    fn test_fractional_scaling() {
        let size = ImageSize::new(Some(0.5), Some(0.25));
        assert_eq!(size.target((200, 100)), Some((50, 50)));
    }

    #[test]
    fn test_aspect_inferred_from_one_dimension() {
        assert_eq!(
            ImageSize::new(None, Some(100.0)).target((200, 100)),
            Some((100, 50))
        );
        assert_eq!(
            ImageSize::new(Some(0.5), None).target((200, 100)),
            Some((100, 50))
        );
    }

    #[test]
    fn test_unset_keeps_image() {
        let image = DynamicImage::ImageRgb8(RgbImage::new(7, 5));
        let out = ImageSize::default().apply(&image);
        assert_eq!((out.width(), out.height()), (7, 5));
        let out = ImageSize::new(Some(10.0), Some(14.0)).apply(&image);
        assert_eq!((out.width(), out.height()), (14, 10));
    }
}
