//! Atomic write-then-rename for small state files.

use std::io::Write;
use std::path::Path;
use tracing::debug;

use crate::error::PersistenceError;

/// Replace `path` with `contents` so a reader sees either the old or the new
/// file, never a partial one.
pub(crate) fn write_atomic(path: &Path, contents: &[u8]) -> Result<(), PersistenceError> {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(parent).map_err(|e| PersistenceError::io(parent, e))?;

    let mut temp_file =
        tempfile::NamedTempFile::new_in(parent).map_err(|e| PersistenceError::io(parent, e))?;
    temp_file
        .write_all(contents)
        .map_err(|e| PersistenceError::io(temp_file.path(), e))?;
    temp_file
        .flush()
        .map_err(|e| PersistenceError::io(temp_file.path(), e))?;
    temp_file
        .as_file()
        .sync_all()
        .map_err(|e| PersistenceError::io(temp_file.path(), e))?;

    temp_file
        .persist(path)
        .map_err(|e| PersistenceError::io(path, e.error))?;

    // Make the rename itself durable
    if let Ok(dir) = std::fs::File::open(parent) {
        let _ = dir.sync_all();
    }

    debug!(path = %path.display(), bytes = contents.len(), "State file written");
    Ok(())
}
