//! Dataset collaborators: tags, class mappings, image folders and the
//! train/test split policy.

pub mod class_mapping;
pub mod folder;
pub mod split;
pub mod tag;

pub use class_mapping::{ClassMapping, OUTLIER_LABEL};
pub use folder::{ClassFilter, ImageFolderDataset, TagType};
pub use split::{SplitMode, SplitPolicy, split_tags};
pub use tag::{MemoryTag, Tag, TagRef};
