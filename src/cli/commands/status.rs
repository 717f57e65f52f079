use std::path::Path;

use anyhow::Result;

use crate::cli::commands::open_coordinator;
use crate::error::VaultError;
use crate::types::RunMode;

pub fn run_status(config_path: &Path, run_mode: RunMode) -> Result<()> {
    let coordinator = open_coordinator(config_path, run_mode)?;
    let config = coordinator.config();
    println!("config: {}", config_path.display());
    println!("source: {}", config.source.display());
    println!("destination: {}", coordinator.state().describe());
    if coordinator.is_destination_encrypted() {
        println!("encrypted with encfs; plaintext view at {}", config.encfs_mountpoint.display());
    }
    match coordinator.effective_path() {
        Ok(path) => println!("backups go to: {}", path.display()),
        Err(err) => println!("not usable: {}", err),
    }
    let last = config.document.last_backup.as_deref().unwrap_or("never");
    println!("last backup: {}", last);
    if !config.retention.is_empty() {
        let policy = &config.retention;
        if let Some(count) = policy.max_count {
            println!("  keep at most {} increment(s)", count);
        }
        if let Some(age) = &policy.max_age {
            println!("  remove increments older than {}", age.token());
        }
        if let Some(space) = &policy.max_space {
            println!("  keep increments within {}", space);
        }
    }
    Ok(())
}

pub fn run_check_tools(config_path: &Path, run_mode: RunMode) -> Result<()> {
    let coordinator = open_coordinator(config_path, run_mode)?;
    let mut missing = Vec::new();
    for check in coordinator.check_tools() {
        match (&check.version, &check.error) {
            (_, Some(err)) => {
                println!("{}: unavailable ({})", check.program, err);
                missing.push(check.program.clone());
            }
            (Some(version), None) => println!("{}: {}", check.program, version),
            (None, None) => println!("{}: installed", check.program),
        }
    }
    if !missing.is_empty() {
        return Err(VaultError::precondition(format!("missing tools: {}", missing.join(", "))).into());
    }
    Ok(())
}
