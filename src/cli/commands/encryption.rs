use std::path::Path;

use anyhow::Result;

use crate::cli::commands::{drive, lock_destination, new_password, open_coordinator, TerminalPrompt};
use crate::types::RunMode;

pub fn run_encrypt_command(config_path: &Path, run_mode: RunMode) -> Result<()> {
    let _lock = lock_destination()?;
    let mut coordinator = open_coordinator(config_path, run_mode)?;
    println!("encrypting {}", coordinator.state().describe());
    let password = new_password(&mut TerminalPrompt, "encryption password")?;
    let handle = coordinator.start_encrypt(password)?;
    let outcome = drive(handle)?;
    coordinator.finish_encrypt(&outcome);
    let report = outcome.into_result()?;
    println!(
        "encrypted {} byte(s); longest file name allowed is {} bytes",
        report.bytes, report.max_name
    );
    println!("unlocked at {}", report.mountpoint.display());
    Ok(())
}

pub fn run_decrypt_command(config_path: &Path, run_mode: RunMode) -> Result<()> {
    let _lock = lock_destination()?;
    let mut coordinator = open_coordinator(config_path, run_mode)?;
    println!("decrypting {}", coordinator.state().describe());
    let handle = coordinator.start_decrypt()?;
    let outcome = drive(handle)?;
    coordinator.finish_decrypt(&outcome);
    let report = outcome.into_result()?;
    println!("decrypted {} byte(s)", report.bytes);
    Ok(())
}
