//! A module responsible for the file system operations.
use itertools::Itertools;
use serde::Serialize;

use std::io::prelude::*;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::Result;

/// Convert a string to a sanitized filename with the given suffix.
pub fn name_to_file(name: &str, suffix: &str) -> String {
    let name = name.split_whitespace().join("-");
    let name = name + suffix;
    sanitize_filename::sanitize(name)
}

/// Seconds since the Unix epoch.
pub fn timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_secs())
        .unwrap_or_default()
}

/// Hidden temporary file next to `path`, so that renaming stays on the same file system.
fn temporary_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(".{}.tmp", name))
}

/// Let `write` create a temporary file and move it over `path` once it's complete.
/// Readers never observe a partially written file.
pub fn replace_atomically<F>(path: &Path, write: F) -> Result<()>
where
    F: FnOnce(&Path) -> Result<()>,
{
    let tmp = temporary_path(path);
    if let Err(error) = write(&tmp) {
        // The temporary file may not exist at all.
        let _ = std::fs::remove_file(&tmp);
        return Err(error);
    }
    std::fs::rename(&tmp, path)?;
    Ok(())
}

/// Write the given bytes to `path` atomically.
pub fn write_atomic(path: &Path, content: &[u8]) -> Result<()> {
    replace_atomically(path, |tmp| {
        let mut file = std::fs::File::create(tmp)?;
        file.write_all(content)?;
        file.sync_all()?;
        Ok(())
    })
}

/// Save a value as a human-readable (pretty) JSON file.
pub fn write_json_pretty<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let content = serde_json::to_string_pretty(value)?;
    write_atomic(path, content.as_bytes())
}

/// List the files in `dir` whose names start with `prefix` and end with `suffix`, sorted by name.
pub fn list_files(dir: &Path, prefix: &str, suffix: &str) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if !path.is_file() {
            continue;
        }
        let matches = path
            .file_name()
            .and_then(|name| name.to_str())
            .map_or(false, |name| name.starts_with(prefix) && name.ends_with(suffix));
        if matches {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}
