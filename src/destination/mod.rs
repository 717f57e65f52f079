//! The backup destination: what it is, whether it can be used right now,
//! and the coordinator that moves it between states.

use std::path::{Path, PathBuf};

use crate::config::model::DestinationSettings;
use crate::error::{Result, VaultError};
use crate::mount::inspect::{mountpoint_is_mounted, MountEntry};
use crate::mount::ops::is_encfs_volume;
use crate::rdiff::command::{RemoteSpec, Target};

pub mod coordinator;
pub mod validate;

pub use coordinator::{Coordinator, PasswordPrompt};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DestinationKind {
    Local,
    SshRemote,
    SmbRemote,
    /// rdiff-backup talks to the remote host itself; nothing is mounted.
    SshDirect,
}

impl DestinationKind {
    pub fn needs_mount(self) -> bool {
        matches!(self, DestinationKind::SshRemote | DestinationKind::SmbRemote)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountStatus {
    Unmounted,
    Mounted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockStatus {
    Locked,
    Unlocked(PathBuf),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Encryption {
    Plain,
    Encrypted(LockStatus),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DestinationState {
    pub kind: DestinationKind,
    pub mount: MountStatus,
    pub encryption: Encryption,
    /// Physical root, ciphertext when encrypted. Empty for direct targets.
    pub raw_path: PathBuf,
    pub remote: Option<RemoteSpec>,
}

impl DestinationState {
    /// Builds the startup state from settings and the live mount table.
    pub fn detect(
        settings: &DestinationSettings,
        encfs_mountpoint: &Path,
        mounts: &[MountEntry],
    ) -> Self {
        let (kind, raw_path, remote) = match settings {
            DestinationSettings::Local { path } => (DestinationKind::Local, path.clone(), None),
            DestinationSettings::Ssh {
                target,
                direct: true,
                ..
            } => (
                DestinationKind::SshDirect,
                PathBuf::new(),
                Some(RemoteSpec {
                    user: target.user.clone(),
                    host: target.host.clone(),
                    port: target.port,
                    dir: target.remote_dir.clone(),
                }),
            ),
            DestinationSettings::Ssh { mountpoint, .. } => (
                DestinationKind::SshRemote,
                mountpoint.clone().unwrap_or_default(),
                None,
            ),
            DestinationSettings::Smb { mountpoint, .. } => {
                (DestinationKind::SmbRemote, mountpoint.clone(), None)
            }
        };
        let mount = if kind.needs_mount() && !mountpoint_is_mounted(mounts, &raw_path) {
            MountStatus::Unmounted
        } else {
            MountStatus::Mounted
        };
        let mut state = Self {
            kind,
            mount,
            encryption: Encryption::Plain,
            raw_path,
            remote,
        };
        state.encryption = state.probe_encryption(encfs_mountpoint, mounts);
        state
    }

    /// Reads the encryption status off the disk. An unmounted remote looks
    /// plain until it is mounted.
    pub fn probe_encryption(&self, encfs_mountpoint: &Path, mounts: &[MountEntry]) -> Encryption {
        if self.kind == DestinationKind::SshDirect
            || self.mount == MountStatus::Unmounted
            || !is_encfs_volume(&self.raw_path)
        {
            return Encryption::Plain;
        }
        if mountpoint_is_mounted(mounts, encfs_mountpoint) {
            Encryption::Encrypted(LockStatus::Unlocked(encfs_mountpoint.to_path_buf()))
        } else {
            Encryption::Encrypted(LockStatus::Locked)
        }
    }

    pub fn is_encrypted(&self) -> bool {
        matches!(self.encryption, Encryption::Encrypted(_))
    }

    pub fn is_mounted(&self) -> bool {
        self.mount == MountStatus::Mounted
    }

    /// Path backups read and write. Only valid while the destination is
    /// reachable and not locked.
    pub fn effective_path(&self) -> Result<PathBuf> {
        if self.kind == DestinationKind::SshDirect {
            return Err(VaultError::precondition(
                "direct ssh destinations have no local path",
            ));
        }
        if self.kind.needs_mount() && self.mount == MountStatus::Unmounted {
            return Err(VaultError::precondition(format!(
                "{} is not mounted; log in first",
                self.raw_path.display()
            )));
        }
        match &self.encryption {
            Encryption::Plain => Ok(self.raw_path.clone()),
            Encryption::Encrypted(LockStatus::Locked) => Err(VaultError::precondition(
                "destination is encrypted and locked; unlock it first",
            )),
            Encryption::Encrypted(LockStatus::Unlocked(path)) => Ok(path.clone()),
        }
    }

    pub fn effective_target(&self) -> Result<Target> {
        match &self.remote {
            Some(remote) => Ok(Target::Remote(remote.clone())),
            None => self.effective_path().map(Target::Local),
        }
    }

    pub fn describe(&self) -> String {
        let place = match &self.remote {
            Some(remote) => remote.rdiff_target(),
            None => self.raw_path.display().to_string(),
        };
        let mount = match (self.kind.needs_mount(), self.mount) {
            (false, _) => "",
            (true, MountStatus::Mounted) => ", mounted",
            (true, MountStatus::Unmounted) => ", not mounted",
        };
        let encryption = match &self.encryption {
            Encryption::Plain => String::from(", plain"),
            Encryption::Encrypted(LockStatus::Locked) => String::from(", encrypted (locked)"),
            Encryption::Encrypted(LockStatus::Unlocked(path)) => {
                format!(", encrypted (unlocked at {})", path.display())
            }
        };
        format!("{:?} {}{}{}", self.kind, place, mount, encryption)
    }
}
