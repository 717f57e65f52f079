use std::path::Path;

use tracing::{info, warn};

use crate::error::{Result, VaultError};
use crate::platform::Platform;
use crate::types::Secret;
use crate::util::command::{Invocation, Shell};

/// encfs keeps its volume configuration in this file inside the cipher dir.
pub const ENCFS_CONFIG: &str = ".encfs6.xml";

#[derive(Debug, Clone)]
pub struct SshTarget {
    pub user: String,
    pub host: String,
    pub port: u16,
    pub remote_dir: String,
}

impl SshTarget {
    pub fn sshfs_source(&self) -> String {
        format!("{}@{}:{}", self.user, self.host, self.remote_dir)
    }
}

pub fn sshfs_mount(target: &SshTarget, mountpoint: &Path, password: Option<Secret>) -> Invocation {
    let inv = Invocation::new("sshfs")
        .arg(target.sshfs_source())
        .arg(mountpoint)
        .arg("-p")
        .arg(target.port.to_string())
        .args(["-o", "reconnect"]);
    match password {
        Some(password) => inv.args(["-o", "password_stdin"]).stdin(password),
        None => inv.args(["-o", "BatchMode=yes"]),
    }
}

/// Mounts an existing encfs volume, or creates one with the standard
/// parameters when `cipher_dir` holds no volume configuration.
pub fn encfs_mount(cipher_dir: &Path, mountpoint: &Path, password: Secret) -> Invocation {
    Invocation::new("encfs")
        .args(["--standard", "--stdinpass"])
        .arg(cipher_dir)
        .arg(mountpoint)
        .stdin(password)
}

pub fn encfs_change_password(cipher_dir: &Path, old: &Secret, new: &Secret) -> Invocation {
    let payload = Secret::new(format!("{}\n{}", old.expose(), new.expose()));
    Invocation::new("encfsctl")
        .arg("autopasswd")
        .arg(cipher_dir)
        .stdin(payload)
}

pub fn is_encfs_volume(cipher_dir: &Path) -> bool {
    cipher_dir.join(ENCFS_CONFIG).is_file()
}

pub fn mount_with(shell: &dyn Shell, inv: &Invocation) -> Result<()> {
    let out = shell.run(inv)?;
    out.check(inv).map(|_| ())
}

/// Unmounts a FUSE mountpoint. The unmount tools rarely say why they
/// fail, so the error stays generic.
pub fn fuse_unmount(shell: &dyn Shell, platform: &dyn Platform, mountpoint: &Path) -> Result<()> {
    let inv = platform.fuse_unmount(mountpoint);
    let out = shell.run(&inv)?;
    if !out.success() {
        warn!("unmount {} failed with exit code {}", mountpoint.display(), out.code);
        return Err(VaultError::message(format!(
            "could not unmount {}",
            mountpoint.display()
        )));
    }
    info!("unmounted {}", mountpoint.display());
    Ok(())
}
