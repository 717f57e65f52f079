//! Stat-based checks run before every operation that touches a path.
//! Nothing here is cached.

use std::fs;
use std::path::Path;

use crate::error::{Result, VaultError};
use crate::util::paths::normalize;

fn require_dir(role: &str, path: &Path) -> Result<()> {
    let meta = fs::metadata(path).map_err(|e| {
        VaultError::precondition(format!("{} {} is not accessible: {}", role, path.display(), e))
    })?;
    if !meta.is_dir() {
        return Err(VaultError::precondition(format!(
            "{} {} is not a directory",
            role,
            path.display()
        )));
    }
    fs::read_dir(path).map_err(|e| {
        VaultError::precondition(format!("{} {} is not readable: {}", role, path.display(), e))
    })?;
    Ok(())
}

fn require_writable(role: &str, path: &Path) -> Result<()> {
    tempfile::Builder::new()
        .prefix(".rdiffvault-probe-")
        .tempfile_in(path)
        .map(drop)
        .map_err(|e| {
            VaultError::precondition(format!("{} {} is not writable: {}", role, path.display(), e))
        })
}

pub fn validate_source(source: &Path) -> Result<()> {
    require_dir("source", source)
}

/// Exists, is a directory, is readable and writable by us, and is not the
/// source itself.
pub fn validate_destination(dest: &Path, source: &Path) -> Result<()> {
    require_dir("destination", dest)?;
    require_writable("destination", dest)?;
    let same = match (dest.canonicalize(), source.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => normalize(dest) == normalize(source),
    };
    if same {
        return Err(VaultError::precondition(
            "destination and source are the same directory",
        ));
    }
    Ok(())
}

pub fn validate_temp_dir(dir: &Path) -> Result<()> {
    require_dir("temp dir", dir)?;
    require_writable("temp dir", dir)
}

/// Restore target; created when missing.
pub fn prepare_restore_dir(dir: &Path) -> Result<()> {
    if !dir.exists() {
        fs::create_dir_all(dir).map_err(|e| {
            VaultError::precondition(format!("cannot create {}: {}", dir.display(), e))
        })?;
    }
    require_dir("restore dir", dir)?;
    require_writable("restore dir", dir)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn destination_checks() {
        let src = tempfile::tempdir().expect("src");
        let dest = tempfile::tempdir().expect("dest");
        validate_destination(dest.path(), src.path()).expect("valid");

        assert!(matches!(
            validate_destination(src.path(), src.path()),
            Err(VaultError::Precondition(_))
        ));
        assert!(validate_destination(&dest.path().join("missing"), src.path()).is_err());

        let file = dest.path().join("file");
        fs::write(&file, "x").expect("write");
        assert!(validate_destination(&file, src.path()).is_err());
    }

    #[cfg(unix)]
    #[test]
    fn read_only_destination_is_rejected() {
        use std::os::unix::fs::PermissionsExt;

        let src = tempfile::tempdir().expect("src");
        let dest = tempfile::tempdir().expect("dest");
        fs::set_permissions(dest.path(), fs::Permissions::from_mode(0o555)).expect("chmod");
        // Permission bits do not bind root.
        if fs::write(dest.path().join("root-check"), "x").is_ok() {
            fs::set_permissions(dest.path(), fs::Permissions::from_mode(0o755)).expect("restore");
            return;
        }
        let result = validate_destination(dest.path(), src.path());
        fs::set_permissions(dest.path(), fs::Permissions::from_mode(0o755)).expect("restore");
        assert!(result.is_err());
    }

    #[test]
    fn restore_dir_is_created() {
        let root = tempfile::tempdir().expect("root");
        let dir = root.path().join("a/b");
        prepare_restore_dir(&dir).expect("prepare");
        assert!(dir.is_dir());
    }
}
