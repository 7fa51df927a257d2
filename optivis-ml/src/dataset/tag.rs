//! The tag contract: one labeled unit of dataset content.

use crate::error::MlError;
use image::DynamicImage;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// One labeled image or bounding-box region.
///
/// Tags are owned by the dataset; the search only holds shared handles.
pub trait Tag: Send + Sync {
    /// Stable identifier, used for cache keys and export file names.
    fn id(&self) -> String;

    /// Decode the raw pixels of this tag.
    fn load_data(&self) -> Result<DynamicImage, MlError>;

    /// Ground-truth label id (or the outlier sentinel).
    fn load_y(&self) -> i64;

    /// Write the tag's region into `dir` for failure inspection.
    fn export_box(&self, dir: &Path) -> Result<(), MlError> {
        std::fs::create_dir_all(dir)?;
        let image = self.load_data()?;
        image.save(export_path(dir, &self.id()))?;
        Ok(())
    }
}

/// Shared handle to a tag.
pub type TagRef = Arc<dyn Tag>;

/// File name used by [`Tag::export_box`] for a tag id.
pub fn export_path(dir: &Path, id: &str) -> PathBuf {
    let stem: String = id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .collect();
    dir.join(format!("{stem}.png"))
}

/// A tag backed by an already decoded image.
#[derive(Debug, Clone)]
pub struct MemoryTag {
    id: String,
    image: DynamicImage,
    label: i64,
}

impl MemoryTag {
    pub fn new(id: impl Into<String>, image: DynamicImage, label: i64) -> Self {
        Self {
            id: id.into(),
            image,
            label,
        }
    }

    pub fn into_ref(self) -> TagRef {
        Arc::new(self)
    }
}

impl Tag for MemoryTag {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn load_data(&self) -> Result<DynamicImage, MlError> {
        Ok(self.image.clone())
    }

    fn load_y(&self) -> i64 {
        self.label
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::RgbImage;
    use tempfile::TempDir;

    #[test]
    fn test_export_path_sanitizes_id() {
        let path = export_path(Path::new("/out"), "cats/img 01.jpg#box2");
        assert_eq!(path, PathBuf::from("/out/cats_img_01_jpg_box2.png"));
    }

    #[test]
    fn test_memory_tag_export_box() {
        let dir = TempDir::new().unwrap();
        let tag = MemoryTag::new("t-1", DynamicImage::ImageRgb8(RgbImage::new(4, 4)), 0);
        tag.export_box(dir.path()).unwrap();
        assert!(dir.path().join("t-1.png").exists());
        assert_eq!(tag.load_y(), 0);
    }
}
