pub mod backup;
pub mod encryption;
pub mod session;
pub mod status;

use std::io::{self, Write};
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::config::load_config;
use crate::destination::{Coordinator, PasswordPrompt};
use crate::error::VaultError;
use crate::platform;
use crate::signal_handler::SignalWatch;
use crate::task::{TaskHandle, TaskOutcome, Tick};
use crate::types::{RunMode, Secret};
use crate::util::command::SystemShell;
use crate::util::paths::{acquire_lock, lock_path, LockGuard};

const TICK: Duration = Duration::from_secs(1);

pub fn exit_code(err: &VaultError) -> i32 {
    match err {
        VaultError::Precondition(_) | VaultError::Config(_) => 2,
        VaultError::Busy => 3,
        VaultError::Authentication(_) => 12,
        VaultError::Cancelled => 130,
        VaultError::Tool { .. } | VaultError::Message(_) | VaultError::Io(_) => 1,
    }
}

pub fn exit_for_error(err: &anyhow::Error) -> ! {
    println!("{:#}", err);
    let code = err.downcast_ref::<VaultError>().map(exit_code).unwrap_or(1);
    std::process::exit(code);
}

pub(crate) fn open_coordinator(config_path: &Path, run_mode: RunMode) -> Result<Coordinator> {
    let config = load_config(config_path)
        .with_context(|| format!("load config {}", config_path.display()))?;
    let shell = std::sync::Arc::new(SystemShell::new(run_mode));
    let coordinator = Coordinator::new(config, shell, platform::detect())?;
    Ok(coordinator)
}

/// One rdiffvault process at a time may change the destination.
pub(crate) fn lock_destination() -> Result<LockGuard> {
    let path = lock_path();
    acquire_lock(&path).with_context(|| format!("lock {}", path.display()))
}

/// Polls the task once a second, printing its progress, until it ends.
/// SIGINT and SIGTERM cancel it meanwhile.
pub(crate) fn drive<T>(mut handle: TaskHandle<T>) -> Result<TaskOutcome<T>> {
    let _signals = SignalWatch::cancel_on_signal(handle.cancel_token())?;
    let name = handle.name().to_string();
    loop {
        match handle.tick(TICK) {
            Tick::Running { elapsed, snapshot } => {
                print!("\r{} [{}s] {}", name, elapsed.as_secs(), snapshot.summary());
                let _ = io::stdout().flush();
            }
            Tick::Finished(outcome) => {
                println!();
                return Ok(outcome);
            }
        }
    }
}

/// Reads passwords from the terminal; an empty answer gives up.
pub struct TerminalPrompt;

impl PasswordPrompt for TerminalPrompt {
    fn password(&mut self, prompt: &str) -> Option<Secret> {
        match rpassword::prompt_password(prompt) {
            Ok(answer) if !answer.is_empty() => Some(Secret::new(answer)),
            Ok(_) => None,
            Err(err) => {
                println!("cannot read password: {}", err);
                None
            }
        }
    }
}

/// Asks twice and insists both answers match.
pub(crate) fn new_password(prompt: &mut dyn PasswordPrompt, what: &str) -> Result<Secret> {
    let first = prompt
        .password(&format!("New {}: ", what))
        .ok_or(VaultError::Cancelled)?;
    let second = prompt
        .password(&format!("Repeat {}: ", what))
        .ok_or(VaultError::Cancelled)?;
    if first.expose() != second.expose() {
        return Err(VaultError::precondition("the passwords do not match").into());
    }
    Ok(first)
}
