//! Short interactive operations on the destination.

use std::path::Path;

use anyhow::Result;

use crate::cli::commands::{lock_destination, new_password, open_coordinator, TerminalPrompt};
use crate::config::model::{DestinationSettings, SshAuth};
use crate::destination::PasswordPrompt;
use crate::error::VaultError;
use crate::types::RunMode;

fn login_needs_password(settings: &DestinationSettings) -> bool {
    match settings {
        DestinationSettings::Ssh {
            auth: SshAuth::Password,
            direct: false,
            ..
        } => true,
        DestinationSettings::Smb { .. } => true,
        _ => false,
    }
}

pub fn run_login(config_path: &Path, run_mode: RunMode) -> Result<()> {
    let _lock = lock_destination()?;
    let mut coordinator = open_coordinator(config_path, run_mode)?;
    let password = if login_needs_password(&coordinator.config().destination) && !coordinator.is_mounted() {
        let prompt = format!("Password for {}: ", coordinator.state().describe());
        Some(TerminalPrompt.password(&prompt).ok_or(VaultError::Cancelled)?)
    } else {
        None
    };
    coordinator.login(password)?;
    println!("destination: {}", coordinator.state().describe());
    Ok(())
}

pub fn run_logout(config_path: &Path, run_mode: RunMode) -> Result<()> {
    let _lock = lock_destination()?;
    let mut coordinator = open_coordinator(config_path, run_mode)?;
    coordinator.logout()?;
    println!("destination: {}", coordinator.state().describe());
    Ok(())
}

pub fn run_unlock(config_path: &Path, run_mode: RunMode) -> Result<()> {
    let _lock = lock_destination()?;
    let mut coordinator = open_coordinator(config_path, run_mode)?;
    coordinator.unlock(&mut TerminalPrompt)?;
    println!("destination: {}", coordinator.state().describe());
    Ok(())
}

pub fn run_lock(config_path: &Path, run_mode: RunMode) -> Result<()> {
    let _lock = lock_destination()?;
    let mut coordinator = open_coordinator(config_path, run_mode)?;
    coordinator.lock()?;
    println!("destination: {}", coordinator.state().describe());
    Ok(())
}

pub fn run_passwd(config_path: &Path, run_mode: RunMode) -> Result<()> {
    let _lock = lock_destination()?;
    let mut coordinator = open_coordinator(config_path, run_mode)?;
    let mut prompt = TerminalPrompt;
    let old = prompt
        .password("Current password: ")
        .ok_or(VaultError::Cancelled)?;
    let new = new_password(&mut prompt, "password")?;
    coordinator.change_password(&old, &new)?;
    println!("password changed");
    Ok(())
}
