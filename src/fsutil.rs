//! Filesystem helpers shared by the persistence paths.

use std::fs;
use std::io;
use std::path::Path;

/// Write `data` to `path` atomically: temp file in the same directory,
/// then rename over the target. A failed write never corrupts the
/// canonical file.
pub(crate) fn atomic_write(path: &Path, data: &[u8]) -> io::Result<()> {
    let dir = path.parent().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("path {:?} has no parent directory", path),
        )
    })?;
    let temp = tempfile::NamedTempFile::new_in(dir)?;
    fs::write(temp.path(), data)?;

    // Windows rename does not replace an existing target.
    if cfg!(windows) && path.exists() {
        fs::remove_file(path)?;
    }

    temp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// Create `path` as a directory if missing; reject plain files in the way.
pub(crate) fn ensure_dir(path: &Path) -> io::Result<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) => {
            if !meta.is_dir() {
                return Err(io::Error::new(
                    io::ErrorKind::AlreadyExists,
                    format!("expected directory at {:?}", path),
                ));
            }
            Ok(())
        }
        Err(err) if err.kind() == io::ErrorKind::NotFound => fs::create_dir_all(path),
        Err(err) => Err(err),
    }
}
