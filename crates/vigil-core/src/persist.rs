//! Atomic whole-file persistence
//!
//! Derived state files (Merkle state, token state, key lineage, reports) are
//! replaced wholesale: write to a sibling temp file, sync, rename over the
//! target. A crash leaves either the old file or the new one, never a mix.

use crate::errors::{Result, VigilError};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::Path;

/// Replace `path` with `data` atomically
pub fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    write_atomic_with_mode(path, data, None)
}

/// Replace `path` atomically, owner read/write only on unix
pub fn write_atomic_private(path: &Path, data: &[u8]) -> Result<()> {
    write_atomic_with_mode(path, data, Some(0o600))
}

fn write_atomic_with_mode(path: &Path, data: &[u8], mode: Option<u32>) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let temp_path = path.with_extension("tmp");
    {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&temp_path)
            .map_err(|e| {
                VigilError::storage(format!("failed to create {}: {e}", temp_path.display()))
            })?;
        set_mode(&file, mode)?;
        file.write_all(data)?;
        file.sync_all()?;
    }
    fs::rename(&temp_path, path).map_err(|e| {
        VigilError::storage(format!("failed to rename into {}: {e}", path.display()))
    })?;
    sync_parent(path);
    Ok(())
}

/// Read a file, `None` if it does not exist
pub fn read_optional(path: &Path) -> Result<Option<Vec<u8>>> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(VigilError::storage(format!(
            "failed to read {}: {e}",
            path.display()
        ))),
    }
}

#[cfg(unix)]
fn set_mode(file: &File, mode: Option<u32>) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    if let Some(mode) = mode {
        file.set_permissions(fs::Permissions::from_mode(mode))?;
    }
    Ok(())
}

#[cfg(not(unix))]
fn set_mode(_file: &File, _mode: Option<u32>) -> Result<()> {
    Ok(())
}

// Best effort: makes the rename itself durable on filesystems that need it.
fn sync_parent(path: &Path) {
    #[cfg(unix)]
    if let Some(parent) = path.parent() {
        if let Ok(dir) = File::open(parent) {
            let _ = dir.sync_all();
        }
    }
    #[cfg(not(unix))]
    let _ = path;
}
