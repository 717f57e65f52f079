use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use crate::config::model::{
    Config, DestinationConfig, DestinationSettings, RetentionConfig, RuntimeConfig,
};
use crate::error::{ConfigError, Result, VaultError};
use crate::mount::ops::SshTarget;
use crate::platform::SmbShare;
use crate::retention::RetentionPolicy;
use crate::types::{Age, ByteSize};
use crate::util::paths::{path_has_parent_dir, state_dir};

const CONFIG_DIR: &str = "rdiffvault";
const CONFIG_NAME: &str = "config.yaml";

pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(CONFIG_DIR)
        .join(CONFIG_NAME)
}

pub fn load_config(path: &Path) -> Result<RuntimeConfig> {
    let mut contents = String::new();
    File::open(path)
        .map_err(|e| VaultError::message(format!("open config {}: {}", path.display(), e)))?
        .read_to_string(&mut contents)?;
    let cfg: Config =
        serde_yaml::from_str(&contents).map_err(|e| ConfigError::Parse(e.to_string()))?;
    parse_runtime(cfg)
}

fn invalid(msg: impl Into<String>) -> VaultError {
    ConfigError::Invalid(msg.into()).into()
}

fn absolute(field: &str, value: &str) -> Result<PathBuf> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(invalid(format!("{} is empty", field)));
    }
    let path = PathBuf::from(trimmed);
    if !path.is_absolute() {
        return Err(invalid(format!("{} must be an absolute path", field)));
    }
    if path_has_parent_dir(&path) {
        return Err(invalid(format!("{} must not contain '..'", field)));
    }
    Ok(path)
}

fn required(field: &str, value: &str) -> Result<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(invalid(format!("{} is required", field)));
    }
    Ok(trimmed.to_string())
}

fn parse_destination(cfg: &DestinationConfig) -> Result<DestinationSettings> {
    match cfg {
        DestinationConfig::Local { path } => Ok(DestinationSettings::Local {
            path: absolute("destination.path", path)?,
        }),
        DestinationConfig::Ssh(ssh) => {
            if ssh.port == 0 {
                return Err(invalid("destination.port must not be 0"));
            }
            let target = SshTarget {
                user: required("destination.user", &ssh.user)?,
                host: required("destination.host", &ssh.host)?,
                port: ssh.port,
                remote_dir: required("destination.remoteDir", &ssh.remote_dir)?,
            };
            let mountpoint = match (&ssh.mountpoint, ssh.direct) {
                (Some(mp), _) => Some(absolute("destination.mountpoint", mp)?),
                (None, true) => None,
                (None, false) => {
                    return Err(invalid(
                        "destination.mountpoint is required unless direct is set",
                    ))
                }
            };
            Ok(DestinationSettings::Ssh {
                target,
                mountpoint,
                auth: ssh.auth,
                direct: ssh.direct,
            })
        }
        DestinationConfig::Smb(smb) => Ok(DestinationSettings::Smb {
            share: SmbShare {
                server: required("destination.server", &smb.server)?,
                share: required("destination.share", &smb.share)?,
                user: required("destination.user", &smb.user)?,
                domain: smb
                    .domain
                    .as_deref()
                    .map(str::trim)
                    .filter(|d| !d.is_empty())
                    .map(str::to_string),
            },
            mountpoint: absolute("destination.mountpoint", &smb.mountpoint)?,
        }),
    }
}

fn parse_retention(cfg: &RetentionConfig) -> Result<RetentionPolicy> {
    let mut policy = RetentionPolicy::default();
    if let Some(rule) = cfg.max_count.filter(|r| r.enabled) {
        if rule.value == 0 {
            return Err(invalid("retention.maxCount must be greater than 0"));
        }
        policy.max_count = Some(rule.value);
    }
    if let Some(rule) = cfg.max_age.filter(|r| r.enabled) {
        if rule.value == 0 {
            return Err(invalid("retention.maxAge must be greater than 0"));
        }
        policy.max_age = Some(Age::new(rule.value, rule.unit));
    }
    if let Some(rule) = cfg.max_space.filter(|r| r.enabled) {
        if rule.value == 0 {
            return Err(invalid("retention.maxSpace must be greater than 0"));
        }
        policy.max_space = Some(ByteSize::new(rule.value, rule.unit));
    }
    Ok(policy)
}

fn parse_runtime(cfg: Config) -> Result<RuntimeConfig> {
    let source = absolute("source", &cfg.source)?;
    let destination = parse_destination(&cfg.destination)?;
    if let DestinationSettings::Local { path } = &destination {
        if path == &source {
            return Err(invalid("destination.path must differ from source"));
        }
    }

    let min_file_size = cfg.filters.min_file_size.map(|s| s.bytes());
    let max_file_size = cfg.filters.max_file_size.map(|s| s.bytes());
    if let (Some(min), Some(max)) = (min_file_size, max_file_size) {
        if min > max {
            return Err(invalid("filters.minFileSize exceeds filters.maxFileSize"));
        }
    }
    if cfg.encfs.unlock_attempts == 0 {
        return Err(invalid("encfs.unlockAttempts must be at least 1"));
    }
    let encfs_mountpoint = match &cfg.encfs.mountpoint {
        Some(mp) => absolute("encfs.mountpoint", mp)?,
        None => state_dir().join("plain"),
    };
    let temp_dir = match &cfg.temp_dir {
        Some(dir) if !dir.trim().is_empty() => Some(absolute("tempDir", dir)?),
        _ => None,
    };
    let retention = parse_retention(&cfg.retention)?;

    Ok(RuntimeConfig {
        source,
        destination,
        encfs_mountpoint,
        unlock_attempts: cfg.encfs.unlock_attempts,
        includes: cfg.filters.includes.clone(),
        excludes: cfg.filters.excludes.clone(),
        exclusions: cfg.filters.exclusions(),
        min_file_size,
        max_file_size,
        compression: cfg.compression,
        temp_dir,
        retention,
        document: cfg,
    })
}
