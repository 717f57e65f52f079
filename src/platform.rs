//! Operating-system specific commands, chosen once at startup.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use crate::error::{Result, VaultError};
use crate::mount::inspect::{parse_bsd_mounts, parse_proc_mounts, MountEntry};
use crate::rdiff::quote::PathStyle;
use crate::types::Secret;
use crate::util::command::{Invocation, Shell};

#[derive(Debug, Clone)]
pub struct SmbShare {
    pub server: String,
    pub share: String,
    pub user: String,
    pub domain: Option<String>,
}

pub trait Platform: Send + Sync {
    fn name(&self) -> &'static str;

    fn path_style(&self) -> PathStyle {
        PathStyle::Posix
    }

    fn fuse_unmount(&self, mountpoint: &Path) -> Invocation;

    fn smb_mount(&self, share: &SmbShare, mountpoint: &Path, password: Secret) -> Invocation;

    fn smb_unmount(&self, mountpoint: &Path) -> Invocation;

    fn shutdown(&self) -> Invocation;

    fn mount_table(&self, shell: &dyn Shell) -> Result<Vec<MountEntry>>;
}

pub struct Linux;
pub struct MacOs;
pub struct Windows;

impl Platform for Linux {
    fn name(&self) -> &'static str {
        "linux"
    }

    fn fuse_unmount(&self, mountpoint: &Path) -> Invocation {
        Invocation::new("fusermount").arg("-u").arg(mountpoint)
    }

    fn smb_mount(&self, share: &SmbShare, mountpoint: &Path, password: Secret) -> Invocation {
        let mut options = format!("username={}", share.user);
        if let Some(domain) = &share.domain {
            options.push_str(&format!(",domain={}", domain));
        }
        // mount.cifs picks the password up from PASSWD.
        Invocation::new("sudo")
            .args(["-E", "mount", "-t", "cifs"])
            .arg(format!("//{}/{}", share.server, share.share))
            .arg(mountpoint)
            .arg("-o")
            .arg(options)
            .secret_env("PASSWD", password)
    }

    fn smb_unmount(&self, mountpoint: &Path) -> Invocation {
        Invocation::new("sudo").arg("umount").arg(mountpoint)
    }

    fn shutdown(&self) -> Invocation {
        Invocation::new("sudo").args(["shutdown", "-h", "now"])
    }

    fn mount_table(&self, _shell: &dyn Shell) -> Result<Vec<MountEntry>> {
        let contents = fs::read_to_string("/proc/self/mounts")
            .map_err(|e| VaultError::message(format!("read /proc/self/mounts: {}", e)))?;
        Ok(parse_proc_mounts(&contents))
    }
}

impl Platform for MacOs {
    fn name(&self) -> &'static str {
        "macos"
    }

    fn fuse_unmount(&self, mountpoint: &Path) -> Invocation {
        Invocation::new("umount").arg(mountpoint)
    }

    fn smb_mount(&self, share: &SmbShare, mountpoint: &Path, password: Secret) -> Invocation {
        let user = match &share.domain {
            Some(domain) => format!("{};{}", domain, share.user),
            None => share.user.clone(),
        };
        let url = format!(
            "//{}:{}@{}/{}",
            user,
            password.expose(),
            share.server,
            share.share
        );
        Invocation::new("mount_smbfs")
            .arg(url)
            .arg(mountpoint)
            .sensitive()
    }

    fn smb_unmount(&self, mountpoint: &Path) -> Invocation {
        Invocation::new("umount").arg(mountpoint)
    }

    fn shutdown(&self) -> Invocation {
        Invocation::new("osascript").args(["-e", "tell app \"System Events\" to shut down"])
    }

    fn mount_table(&self, shell: &dyn Shell) -> Result<Vec<MountEntry>> {
        let inv = Invocation::new("mount");
        let out = shell.run(&inv)?.check(&inv)?;
        Ok(parse_bsd_mounts(&out.stdout))
    }
}

impl Platform for Windows {
    fn name(&self) -> &'static str {
        "windows"
    }

    fn path_style(&self) -> PathStyle {
        PathStyle::Windows
    }

    fn fuse_unmount(&self, mountpoint: &Path) -> Invocation {
        Invocation::new("net").args(["use"]).arg(mountpoint).arg("/delete")
    }

    fn smb_mount(&self, share: &SmbShare, mountpoint: &Path, password: Secret) -> Invocation {
        let user = match &share.domain {
            Some(domain) => format!("{}\\{}", domain, share.user),
            None => share.user.clone(),
        };
        Invocation::new("net")
            .arg("use")
            .arg(mountpoint)
            .arg(format!("\\\\{}\\{}", share.server, share.share))
            .arg(password.expose())
            .arg(format!("/user:{}", user))
            .sensitive()
    }

    fn smb_unmount(&self, mountpoint: &Path) -> Invocation {
        Invocation::new("net").arg("use").arg(mountpoint).arg("/delete")
    }

    fn shutdown(&self) -> Invocation {
        Invocation::new("shutdown").args(["/s", "/t", "0"])
    }

    fn mount_table(&self, _shell: &dyn Shell) -> Result<Vec<MountEntry>> {
        // Drive mappings are checked by path existence instead.
        Ok(Vec::new())
    }
}

pub fn detect() -> Arc<dyn Platform> {
    if cfg!(target_os = "macos") {
        Arc::new(MacOs)
    } else if cfg!(windows) {
        Arc::new(Windows)
    } else {
        Arc::new(Linux)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn share() -> SmbShare {
        SmbShare {
            server: "nas".into(),
            share: "backup".into(),
            user: "ann".into(),
            domain: Some("HOME".into()),
        }
    }

    #[test]
    fn linux_smb_mount_keeps_password_out_of_arguments() {
        let inv = Linux.smb_mount(&share(), Path::new("/mnt/smb"), Secret::new("s3cret"));
        assert!(inv.sensitive);
        assert!(!inv.arg_strings().iter().any(|a| a.contains("s3cret")));
        assert_eq!(inv.env[0].0, "PASSWD");
        assert!(inv.arg_strings().contains(&"username=ann,domain=HOME".to_string()));
        assert!(inv.arg_strings().contains(&"//nas/backup".to_string()));
    }

    #[test]
    fn macos_smb_mount_is_redacted() {
        let inv = MacOs.smb_mount(&share(), Path::new("/Volumes/smb"), Secret::new("pw"));
        assert!(inv.sensitive);
        assert_eq!(inv.display(), "mount_smbfs <redacted>");
    }

    #[test]
    fn windows_uses_windows_path_style() {
        assert_eq!(Windows.path_style(), PathStyle::Windows);
        assert_eq!(Linux.path_style(), PathStyle::Posix);
    }
}
