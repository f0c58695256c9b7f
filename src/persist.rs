//! Persistence helpers for the on-disk caches
//!
//! All engine caches are JSON files written atomically: content goes to a
//! temporary file in the same directory which then replaces the target, so
//! a crash mid-write can never corrupt the previous good file.

use crate::error::{HeliographError, Result};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::path::Path;

/// Load a JSON file into a typed value.
///
/// Returns `Ok(None)` when the file does not exist. A file that exists but
/// fails to parse is a hard error; callers decide whether to fail closed or
/// start fresh.
pub fn load_json<T: DeserializeOwned, P: AsRef<Path>>(path: P) -> Result<Option<T>> {
    let path = path.as_ref();
    if !path.exists() {
        return Ok(None);
    }
    let contents = std::fs::read_to_string(path)?;
    let value = serde_json::from_str(&contents).map_err(|e| {
        HeliographError::validation(
            "cache",
            &format!("Malformed cache file {}: {}", path.display(), e),
        )
    })?;
    Ok(Some(value))
}

/// Serialize a value to JSON and atomically replace the target file.
pub fn save_json_atomic<T: Serialize, P: AsRef<Path>>(path: P, value: &T) -> Result<()> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let contents = serde_json::to_string(value)?;
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, contents)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

/// Remove a cache file if it exists
pub fn remove_if_exists<P: AsRef<Path>>(path: P) -> Result<()> {
    let path = path.as_ref();
    if path.exists() {
        std::fs::remove_file(path)?;
    }
    Ok(())
}
