//! Atomic JSON persistence shared by the state document and metadata sidecars.

use std::io::Write;
use std::path::Path;

use serde::Serialize;
use tempfile::NamedTempFile;

use crate::error::{Result, StoreError};

/// Serialize `value` as pretty, key-sorted JSON.
///
/// Going through [`serde_json::Value`] sorts keys at every depth, since its
/// map is ordered by key.
pub fn to_sorted_json<T: Serialize>(value: &T, path: &Path) -> Result<Vec<u8>> {
    let encode_err = |e: serde_json::Error| StoreError::Write {
        path: path.to_path_buf(),
        source: std::io::Error::new(std::io::ErrorKind::InvalidData, e),
    };
    let tree = serde_json::to_value(value).map_err(encode_err)?;
    let mut bytes = serde_json::to_vec_pretty(&tree).map_err(encode_err)?;
    bytes.push(b'\n');
    Ok(bytes)
}

/// Replace `path` with `bytes` in one step.
///
/// Writes a temp file in the same directory, fsyncs it, then renames it over
/// the destination. Readers see either the old or the new content, never a
/// partial file.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(parent).map_err(|e| StoreError::from_write(parent, e))?;

    let mut tmp = NamedTempFile::new_in(parent).map_err(|e| StoreError::from_write(path, e))?;
    tmp.write_all(bytes)
        .map_err(|e| StoreError::from_write(tmp.path(), e))?;
    tmp.as_file()
        .sync_all()
        .map_err(|e| StoreError::from_write(tmp.path(), e))?;
    tmp.persist(path)
        .map_err(|e| StoreError::from_write(path, e.error))?;

    #[cfg(unix)]
    {
        if let Ok(dir) = std::fs::File::open(parent) {
            let _ = dir.sync_all();
        }
    }
    Ok(())
}

/// [`to_sorted_json`] followed by [`write_atomic`].
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let bytes = to_sorted_json(value, path)?;
    write_atomic(path, &bytes)
}
