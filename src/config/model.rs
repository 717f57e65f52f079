use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::mount::ops::SshTarget;
use crate::platform::SmbShare;
use crate::rdiff::command::Exclusions;
use crate::retention::RetentionPolicy;
use crate::types::{AgeUnit, ByteSize, SizeUnit};

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct Config {
    pub source: String,
    pub destination: DestinationConfig,
    #[serde(default)]
    pub encfs: EncfsConfig,
    #[serde(default)]
    pub filters: FilterConfig,
    #[serde(default = "default_true")]
    pub compression: bool,
    #[serde(default, rename = "tempDir", skip_serializing_if = "Option::is_none")]
    pub temp_dir: Option<String>,
    #[serde(default)]
    pub retention: RetentionConfig,
    #[serde(default, rename = "lastBackup", skip_serializing_if = "Option::is_none")]
    pub last_backup: Option<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum DestinationConfig {
    Local { path: String },
    Ssh(SshConfig),
    Smb(SmbConfig),
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub enum SshAuth {
    #[default]
    Password,
    PublicKey,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct SshConfig {
    pub user: String,
    pub host: String,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    #[serde(rename = "remoteDir")]
    pub remote_dir: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mountpoint: Option<String>,
    #[serde(default)]
    pub auth: SshAuth,
    #[serde(default)]
    pub direct: bool,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct SmbConfig {
    pub server: String,
    pub share: String,
    pub user: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    pub mountpoint: String,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct EncfsConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mountpoint: Option<String>,
    #[serde(default = "default_unlock_attempts", rename = "unlockAttempts")]
    pub unlock_attempts: u32,
}

impl Default for EncfsConfig {
    fn default() -> Self {
        Self {
            mountpoint: None,
            unlock_attempts: default_unlock_attempts(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct FilterConfig {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub includes: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub excludes: Vec<String>,
    #[serde(default)]
    pub exclude_device_files: bool,
    #[serde(default)]
    pub exclude_fifos: bool,
    #[serde(default)]
    pub exclude_other_filesystems: bool,
    #[serde(default)]
    pub exclude_sockets: bool,
    #[serde(default)]
    pub exclude_symlinks: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_file_size: Option<ByteSize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_file_size: Option<ByteSize>,
}

impl FilterConfig {
    pub fn exclusions(&self) -> Exclusions {
        Exclusions {
            device_files: self.exclude_device_files,
            fifos: self.exclude_fifos,
            other_filesystems: self.exclude_other_filesystems,
            sockets: self.exclude_sockets,
            symlinks: self.exclude_symlinks,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct RetentionConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_count: Option<CountRule>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_age: Option<AgeRule>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_space: Option<SpaceRule>,
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
pub struct CountRule {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub value: usize,
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
pub struct AgeRule {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub value: u32,
    pub unit: AgeUnit,
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
pub struct SpaceRule {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub value: u64,
    pub unit: SizeUnit,
}

/// Where backups go, checked and resolved to paths.
#[derive(Debug, Clone)]
pub enum DestinationSettings {
    Local {
        path: PathBuf,
    },
    Ssh {
        target: SshTarget,
        mountpoint: Option<PathBuf>,
        auth: SshAuth,
        direct: bool,
    },
    Smb {
        share: SmbShare,
        mountpoint: PathBuf,
    },
}

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub source: PathBuf,
    pub destination: DestinationSettings,
    pub encfs_mountpoint: PathBuf,
    pub unlock_attempts: u32,
    pub includes: Vec<String>,
    pub excludes: Vec<String>,
    pub exclusions: Exclusions,
    pub min_file_size: Option<u64>,
    pub max_file_size: Option<u64>,
    pub compression: bool,
    pub temp_dir: Option<PathBuf>,
    pub retention: RetentionPolicy,
    /// The document as loaded, written back when `lastBackup` changes.
    pub document: Config,
}

fn default_true() -> bool {
    true
}

fn default_ssh_port() -> u16 {
    22
}

fn default_unlock_attempts() -> u32 {
    3
}
