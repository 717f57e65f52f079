//! Converting a destination between plain and encfs-encrypted storage.
//!
//! Both directions run as a phase machine inside one background task.
//! Everything before the finish phase can be cancelled and is undone by the
//! cleanup phase; the finish phase always runs to the end.

use std::fs;
use std::io;
use std::path::Path;

use tracing::{debug, warn};

use crate::error::{Result, VaultError};

pub mod decrypt;
pub mod encrypt;
pub mod probe;
pub mod rsync;

/// Replaces the contents of `root` with the contents of `root/<staged>`.
/// Works on mount roots, which cannot be renamed.
fn swap_in(root: &Path, staged: &str) -> Result<()> {
    let staged_dir = root.join(staged);
    for entry in fs::read_dir(root)? {
        let entry = entry?;
        if entry.file_name() == staged {
            continue;
        }
        remove_entry(&entry.path())?;
    }
    for entry in fs::read_dir(&staged_dir)? {
        let entry = entry?;
        let dest = root.join(entry.file_name());
        fs::rename(entry.path(), &dest).map_err(|e| {
            VaultError::message(format!(
                "move {} to {}: {}; the remaining data is in {}",
                entry.path().display(),
                dest.display(),
                e,
                staged_dir.display()
            ))
        })?;
    }
    fs::remove_dir(&staged_dir)?;
    debug!("swapped {} into {}", staged_dir.display(), root.display());
    Ok(())
}

fn remove_entry(path: &Path) -> io::Result<()> {
    let meta = fs::symlink_metadata(path)?;
    if meta.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    }
}

/// Removes a staging directory, tolerating its absence.
fn remove_staging(path: &Path) {
    match fs::remove_dir_all(path) {
        Ok(()) => debug!("removed {}", path.display()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => warn!("cleanup: remove {}: {}", path.display(), err),
    }
}

/// Creates a fresh, empty staging directory.
fn fresh_dir(path: &Path) -> Result<()> {
    if path.exists() {
        warn!("removing leftover {}", path.display());
        fs::remove_dir_all(path)?;
    }
    fs::create_dir_all(path)?;
    Ok(())
}
