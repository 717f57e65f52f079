use std::fs::{self, File};
use std::io::Write;
use std::path::Path;

use chrono::{DateTime, Local};

use crate::config::model::Config;
use crate::error::{Result, VaultError};

pub fn save_config(path: &Path, cfg: &Config) -> Result<()> {
    let data = serde_yaml::to_string(cfg)
        .map_err(|e| VaultError::message(format!("encode config: {}", e)))?;
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut file = File::create(path)
        .map_err(|e| VaultError::message(format!("write config {}: {}", path.display(), e)))?;
    file.write_all(data.as_bytes())
        .map_err(|e| VaultError::message(format!("write config {}: {}", path.display(), e)))?;
    Ok(())
}

/// Stamps `lastBackup` and writes the document back.
pub fn record_last_backup(path: &Path, cfg: &mut Config, at: DateTime<Local>) -> Result<()> {
    cfg.last_backup = Some(at.to_rfc3339());
    save_config(path, cfg)
}
