//! Image-folder datasets.
//!
//! Two annotation layouts are supported:
//! - `cls`: `<root>/<class_name>/<image>`, one tag per image.
//! - `box`: images anywhere below `<root>`, each with a sidecar `<stem>.json`
//!   holding `[{"label", "x", "y", "width", "height"}, ...]`; one tag per box.

use super::class_mapping::{ClassMapping, OUTLIER_LABEL};
use super::tag::{Tag, TagRef};
use crate::error::MlError;
use image::DynamicImage;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use walkdir::WalkDir;

const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "bmp", "tif", "tiff", "webp"];

/// Dataset annotation mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TagType {
    /// One label per image, given by its class folder.
    #[default]
    Cls,
    /// Bounding boxes from sidecar annotation files.
    Box,
}

impl FromStr for TagType {
    type Err = MlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cls" => Ok(Self::Cls),
            "box" => Ok(Self::Box),
            other => Err(MlError::dataset(format!(
                "unknown dataset type '{other}' (expected cls or box)"
            ))),
        }
    }
}

/// Which classes a dataset keeps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClassFilter {
    /// Only classes present in the mapping.
    Known,
    /// Everything; classes missing from the mapping get the outlier label.
    All,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
struct Region {
    x: u32,
    y: u32,
    width: u32,
    height: u32,
}

#[derive(Debug, Deserialize)]
struct BoxAnnotation {
    label: String,
    x: u32,
    y: u32,
    width: u32,
    height: u32,
}

/// A tag read lazily from an image file, optionally cropped to a box.
#[derive(Debug, Clone)]
pub struct ImageTag {
    id: String,
    path: PathBuf,
    label: i64,
    region: Option<Region>,
}

impl Tag for ImageTag {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn load_data(&self) -> Result<DynamicImage, MlError> {
        let image = image::open(&self.path)?;
        let Some(region) = self.region else {
            return Ok(image);
        };
        let x = region.x.min(image.width().saturating_sub(1));
        let y = region.y.min(image.height().saturating_sub(1));
        let width = region.width.min(image.width() - x).max(1);
        let height = region.height.min(image.height() - y).max(1);
        Ok(image.crop_imm(x, y, width, height))
    }

    fn load_y(&self) -> i64 {
        self.label
    }
}

/// Tags discovered below a dataset root.
pub struct ImageFolderDataset {
    root: PathBuf,
    tags: Vec<TagRef>,
}

impl ImageFolderDataset {
    /// Scan `root` in `tag_type` layout, labeling through `mapping`.
    pub fn open(
        root: &Path,
        tag_type: TagType,
        mapping: &ClassMapping,
        filter: ClassFilter,
    ) -> Result<Self, MlError> {
        if !root.is_dir() {
            return Err(MlError::dataset(format!(
                "dataset folder {} does not exist",
                root.display()
            )));
        }
        let tags = match tag_type {
            TagType::Cls => scan_class_folders(root, mapping, filter)?,
            TagType::Box => scan_box_annotations(root, mapping, filter)?,
        };
        tracing::info!(root = %root.display(), tags = tags.len(), "Loaded dataset");
        Ok(Self {
            root: root.to_path_buf(),
            tags,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn tags(&self) -> Vec<TagRef> {
        self.tags.clone()
    }

    pub fn len(&self) -> usize {
        self.tags.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }
}

fn resolve_label(mapping: &ClassMapping, class: &str, filter: ClassFilter) -> Option<i64> {
    match (mapping.id(class), filter) {
        (Some(id), _) => Some(id),
        (None, ClassFilter::All) => Some(OUTLIER_LABEL),
        (None, ClassFilter::Known) => None,
    }
}

fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

fn relative_id(root: &Path, path: &Path) -> String {
    path.strip_prefix(root)
        .unwrap_or(path)
        .to_string_lossy()
        .replace('\\', "/")
}

fn scan_class_folders(
    root: &Path,
    mapping: &ClassMapping,
    filter: ClassFilter,
) -> Result<Vec<TagRef>, MlError> {
    let mut tags: Vec<TagRef> = Vec::new();
    for class_dir in WalkDir::new(root)
        .min_depth(1)
        .max_depth(1)
        .sort_by_file_name()
    {
        let class_dir = class_dir.map_err(|e| MlError::dataset(e.to_string()))?;
        if !class_dir.file_type().is_dir() {
            continue;
        }
        let class = class_dir.file_name().to_string_lossy().into_owned();
        let Some(label) = resolve_label(mapping, &class, filter) else {
            tracing::debug!(class = %class, "Skipping class not in mapping");
            continue;
        };
        for entry in WalkDir::new(class_dir.path()).sort_by_file_name() {
            let entry = entry.map_err(|e| MlError::dataset(e.to_string()))?;
            if entry.file_type().is_file() && is_image(entry.path()) {
                tags.push(Arc::new(ImageTag {
                    id: relative_id(root, entry.path()),
                    path: entry.path().to_path_buf(),
                    label,
                    region: None,
                }));
            }
        }
    }
    Ok(tags)
}

fn scan_box_annotations(
    root: &Path,
    mapping: &ClassMapping,
    filter: ClassFilter,
) -> Result<Vec<TagRef>, MlError> {
    let mut tags: Vec<TagRef> = Vec::new();
    for entry in WalkDir::new(root).sort_by_file_name() {
        let entry = entry.map_err(|e| MlError::dataset(e.to_string()))?;
        if !entry.file_type().is_file() || !is_image(entry.path()) {
            continue;
        }
        let sidecar = entry.path().with_extension("json");
        if !sidecar.exists() {
            continue;
        }
        let content = std::fs::read_to_string(&sidecar)?;
        let boxes: Vec<BoxAnnotation> = serde_json::from_str(&content)?;
        let base_id = relative_id(root, entry.path());
        for (i, annotation) in boxes.into_iter().enumerate() {
            let Some(label) = resolve_label(mapping, &annotation.label, filter) else {
                continue;
            };
            tags.push(Arc::new(ImageTag {
                id: format!("{base_id}#box{i}"),
                path: entry.path().to_path_buf(),
                label,
                region: Some(Region {
                    x: annotation.x,
                    y: annotation.y,
                    width: annotation.width,
                    height: annotation.height,
                }),
            }));
        }
    }
    Ok(tags)
}
