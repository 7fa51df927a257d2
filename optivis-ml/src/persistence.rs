//! Artifact persistence: atomic file writes, JSON load/save, and atomic
//! replacement of whole model folders.
//!
//! Every artifact a search produces goes through these helpers so that a
//! reader never observes a half-written file or a folder mixing two
//! candidate versions.

use crate::error::MlError;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Atomically write JSON data to a file.
///
/// Serializes `data` to pretty-printed JSON, writes to a `.tmp` sibling file,
/// then renames to the target path. Creates parent directories if needed.
pub fn atomic_write_json<T: serde::Serialize>(path: &Path, data: &T) -> io::Result<()> {
    let json = serde_json::to_string_pretty(data).map_err(io::Error::other)?;
    atomic_write(path, json.as_bytes())
}

/// Atomically write raw bytes to a file.
pub fn atomic_write(path: &Path, data: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, data)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

/// Load and deserialize JSON from a file.
///
/// Returns `Ok(None)` if the file doesn't exist.
pub fn load_json<T: serde::de::DeserializeOwned>(path: &Path) -> io::Result<Option<T>> {
    if !path.exists() {
        return Ok(None);
    }
    let data = fs::read_to_string(path)?;
    let value =
        serde_json::from_str(&data).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    Ok(Some(value))
}

/// Load a JSON file that must exist.
pub fn require_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, MlError> {
    load_json(path)?.ok_or_else(|| {
        MlError::Io(io::Error::new(
            io::ErrorKind::NotFound,
            format!("missing artifact {}", path.display()),
        ))
    })
}

/// Create `path` as an empty directory, removing anything already there.
pub fn reset_dir(path: &Path) -> io::Result<()> {
    if path.exists() {
        fs::remove_dir_all(path)?;
    }
    fs::create_dir_all(path)
}

/// Write a folder of artifacts and swap it into place at `target`.
///
/// `write` fills a fresh staging directory next to `target`. Only after it
/// succeeds is the previous content of `target` moved aside and the staging
/// directory renamed over it, so `target` always holds one complete version.
pub fn replace_dir_atomically<F>(target: &Path, write: F) -> Result<(), MlError>
where
    F: FnOnce(&Path) -> Result<(), MlError>,
{
    let staging = sibling_path(target, "staging");
    reset_dir(&staging)?;
    if let Err(e) = write(&staging) {
        let _ = fs::remove_dir_all(&staging);
        return Err(e);
    }

    if target.exists() {
        let retired = sibling_path(target, "retired");
        fs::rename(target, &retired)?;
        fs::rename(&staging, target)?;
        fs::remove_dir_all(&retired)?;
    } else {
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::rename(&staging, target)?;
    }
    Ok(())
}

/// Copy every regular file of `from` into `to` (non-recursive).
///
/// Returns the number of files copied.
pub fn copy_files(from: &Path, to: &Path) -> io::Result<usize> {
    fs::create_dir_all(to)?;
    let mut copied = 0;
    for entry in fs::read_dir(from)? {
        let entry = entry?;
        if entry.file_type()?.is_file() {
            fs::copy(entry.path(), to.join(entry.file_name()))?;
            copied += 1;
        }
    }
    Ok(copied)
}

fn sibling_path(target: &Path, role: &str) -> PathBuf {
    let name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "model".to_string());
    let unique = format!(".{name}.{role}-{}", uuid::Uuid::new_v4().simple());
    match target.parent() {
        Some(parent) => parent.join(unique),
        None => PathBuf::from(unique),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};
    use tempfile::TempDir;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct TestData {
        name: String,
        count: u32,
    }

    #[test]
    fn test_atomic_write_json_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("test.json");

        let data = TestData {
            name: "hello".into(),
            count: 42,
        };

        atomic_write_json(&path, &data).unwrap();
        let loaded: Option<TestData> = load_json(&path).unwrap();
        assert_eq!(loaded, Some(data));
    }

    #[test]
    fn test_atomic_write_no_tmp_leftover() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("clean.json");

        atomic_write_json(&path, &"test").unwrap();

        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn test_load_json_nonexistent() {
        let result: io::Result<Option<TestData>> = load_json(Path::new("/nonexistent/file.json"));
        assert!(result.unwrap().is_none());
    }

    #[test]
    fn test_require_json_missing_is_io_error() {
        let result: Result<TestData, MlError> = require_json(Path::new("/nonexistent/file.json"));
        assert!(matches!(result, Err(MlError::Io(_))));
    }

    #[test]
    fn test_replace_dir_removes_stale_files() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("model");
        fs::create_dir_all(&target).unwrap();
        fs::write(target.join("stale.json"), "{}").unwrap();

        replace_dir_atomically(&target, |staging| {
            fs::write(staging.join("fresh.json"), "{}")?;
            Ok(())
        })
        .unwrap();

        assert!(target.join("fresh.json").exists());
        assert!(!target.join("stale.json").exists());
        // Only the target itself remains in the parent.
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn test_replace_dir_keeps_previous_on_failure() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("model");
        fs::create_dir_all(&target).unwrap();
        fs::write(target.join("keep.json"), "{}").unwrap();

        let result = replace_dir_atomically(&target, |_| Err(MlError::search("boom")));

        assert!(result.is_err());
        assert!(target.join("keep.json").exists());
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn test_copy_files_skips_directories() {
        let dir = TempDir::new().unwrap();
        let from = dir.path().join("from");
        let to = dir.path().join("to");
        fs::create_dir_all(from.join("nested")).unwrap();
        fs::write(from.join("a.json"), "1").unwrap();
        fs::write(from.join("b.json"), "2").unwrap();

        let copied = copy_files(&from, &to).unwrap();

        assert_eq!(copied, 2);
        assert!(to.join("a.json").exists());
        assert!(!to.join("nested").exists());
    }
}
