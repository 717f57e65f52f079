use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Component, Path, PathBuf};

use crate::error::{Result, VaultError};

pub fn path_has_parent_dir(path: &Path) -> bool {
    path.components().any(|c| matches!(c, Component::ParentDir))
}

/// Lexical check: `child` lies strictly below `parent`.
pub fn is_sub_path(parent: &Path, child: &Path) -> bool {
    let parent = normalize(parent);
    let child = normalize(child);
    child != parent && child.starts_with(&parent)
}

/// Drops `.` components and trailing separators without touching the disk.
pub fn normalize(path: &Path) -> PathBuf {
    path.components()
        .filter(|c| !matches!(c, Component::CurDir))
        .collect()
}

/// Sibling path `<parent>/.<name>.<suffix>` used for staging directories.
pub fn staging_sibling(path: &Path, suffix: &str) -> Result<PathBuf> {
    let parent = path.parent().ok_or_else(|| {
        VaultError::precondition(format!("{} has no parent directory", path.display()))
    })?;
    let name = path
        .file_name()
        .ok_or_else(|| VaultError::precondition(format!("{} has no file name", path.display())))?;
    Ok(parent.join(format!(".{}.{}", name.to_string_lossy(), suffix)))
}

pub fn state_dir() -> PathBuf {
    dirs::state_dir()
        .or_else(dirs::data_local_dir)
        .unwrap_or_else(std::env::temp_dir)
        .join("rdiffvault")
}

pub fn lock_path() -> PathBuf {
    state_dir().join("rdiffvault.pid")
}

pub struct LockGuard {
    path: PathBuf,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let _ = unlock_file(&self.path);
    }
}

/// Takes the per-user pid lock so two processes never drive the same
/// destination at once.
pub fn acquire_lock(path: &Path) -> Result<LockGuard> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| VaultError::message(format!("create {}: {}", parent.display(), e)))?;
    }
    match lock_file(path) {
        Ok(true) => Ok(LockGuard {
            path: path.to_path_buf(),
        }),
        Ok(false) => Err(VaultError::Busy),
        Err(e) => Err(VaultError::message(format!(
            "failed to lock {}: {}",
            path.display(),
            e
        ))),
    }
}

fn lock_file(path: &Path) -> io::Result<bool> {
    for _ in 0..3 {
        match OpenOptions::new().write(true).create_new(true).open(path) {
            Ok(mut f) => {
                writeln!(f, "{}", std::process::id())?;
                return Ok(true);
            }
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                let pid = match fs::read_to_string(path) {
                    Ok(text) => text.trim().parse::<u32>().ok(),
                    Err(err) if err.kind() == io::ErrorKind::NotFound => continue,
                    Err(err) => return Err(err),
                };
                if let Some(pid) = pid {
                    if process_alive(pid) {
                        return Ok(false);
                    }
                }
                match fs::remove_file(path) {
                    Ok(()) => continue,
                    Err(err) if err.kind() == io::ErrorKind::NotFound => continue,
                    Err(err) => return Err(err),
                }
            }
            Err(err) => return Err(err),
        }
    }
    Ok(false)
}

fn unlock_file(path: &Path) -> io::Result<()> {
    if let Ok(pid) = fs::read_to_string(path) {
        if pid.trim() == std::process::id().to_string() {
            fs::remove_file(path)?;
        }
    }
    Ok(())
}

fn process_alive(pid: u32) -> bool {
    if cfg!(target_os = "linux") {
        Path::new("/proc").join(pid.to_string()).exists()
    } else {
        // Without procfs a recorded pid is trusted.
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sub_path_is_lexical_and_strict() {
        assert!(is_sub_path(Path::new("/home/ann"), Path::new("/home/ann/backup")));
        assert!(is_sub_path(Path::new("/home/ann/"), Path::new("/home/ann/./backup/")));
        assert!(!is_sub_path(Path::new("/home/ann"), Path::new("/home/ann")));
        assert!(!is_sub_path(Path::new("/home/ann"), Path::new("/home/anna/backup")));
        assert!(!is_sub_path(Path::new("/home/ann/backup"), Path::new("/home/ann")));
    }

    #[test]
    fn staging_sibling_is_hidden_next_to_path() {
        let staged = staging_sibling(Path::new("/media/usb/backup"), "encfs-cipher").expect("sibling");
        assert_eq!(staged, PathBuf::from("/media/usb/.backup.encfs-cipher"));
        assert!(staging_sibling(Path::new("/"), "x").is_err());
    }

    #[test]
    fn lock_is_exclusive_and_released_on_drop() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("vault.pid");
        let guard = acquire_lock(&path).expect("first lock");
        if cfg!(target_os = "linux") {
            assert!(matches!(acquire_lock(&path), Err(VaultError::Busy)));
        }
        drop(guard);
        assert!(!path.exists());
        let _again = acquire_lock(&path).expect("relock");
    }

    #[test]
    fn stale_lock_is_reclaimed() {
        if !cfg!(target_os = "linux") {
            return;
        }
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("vault.pid");
        fs::write(&path, "999999999\n").expect("write stale pid");
        let _guard = acquire_lock(&path).expect("reclaim");
        let pid = fs::read_to_string(&path).expect("read");
        assert_eq!(pid.trim(), std::process::id().to_string());
    }
}
