//! Owns the live [`DestinationState`] and every transition of it.
//!
//! Short operations (login, logout, unlock, lock, passwd) run on the calling
//! thread while holding the task slot. Long ones are spawned on the
//! [`TaskRunner`]; the caller polls the handle and hands the outcome back to
//! the matching `finish_*` method, which is the only place their effect on
//! the state is applied.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::backup::{run_backup, run_restore, BackupReport, RestoreReport};
use crate::config::model::{DestinationSettings, RuntimeConfig, SshAuth};
use crate::destination::validate::{
    prepare_restore_dir, validate_destination, validate_source, validate_temp_dir,
};
use crate::destination::{DestinationKind, DestinationState, Encryption, LockStatus};
use crate::encryption::decrypt::{run_decrypt, DecryptJob, DecryptReport};
use crate::encryption::encrypt::{run_encrypt, EncryptJob, EncryptReport};
use crate::encryption::probe::{system_capacity, CapacityFn};
use crate::error::{Result, VaultError};
use crate::mount::ops::{encfs_change_password, encfs_mount, fuse_unmount, sshfs_mount};
use crate::platform::Platform;
use crate::rdiff::command::{
    test_server_command, version_command, BackupJobSpec, RestoreRequest, Target,
    SSH_FAILURE_CODE,
};
use crate::rdiff::increments::{Increment, IncrementCatalog, IncrementReader, RemoteListReader};
use crate::task::{TaskHandle, TaskOutcome, TaskRunner};
use crate::types::Secret;
use crate::util::command::{Invocation, Output, Shell};
use crate::util::paths::is_sub_path;

/// Asks the user for a password; `None` means they gave up.
pub trait PasswordPrompt {
    fn password(&mut self, prompt: &str) -> Option<Secret>;
}

const AUTH_FAILURES: &[&str] = &[
    "Permission denied",
    "Host key verification failed",
    "Authentication failed",
    "Login incorrect",
];

/// Turns a failed login-type command into `Authentication` when the tool
/// says the credentials were refused.
fn check_login(inv: &Invocation, out: Output) -> Result<()> {
    if out.success() {
        return Ok(());
    }
    let refused = AUTH_FAILURES.iter().any(|m| out.stderr.contains(m));
    if refused || (out.code == SSH_FAILURE_CODE && inv.program != "sshfs") {
        let reason = out.stderr.trim();
        return Err(VaultError::Authentication(if reason.is_empty() {
            format!("{} rejected the credentials", inv.program)
        } else {
            reason.to_string()
        }));
    }
    out.check(inv).map(|_| ())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolCheck {
    pub program: String,
    pub version: Option<String>,
    pub error: Option<String>,
}

pub struct Coordinator {
    config: RuntimeConfig,
    shell: Arc<dyn Shell>,
    platform: Arc<dyn Platform>,
    runner: TaskRunner,
    capacity: CapacityFn,
    state: DestinationState,
    catalog: Option<IncrementCatalog>,
}

impl Coordinator {
    /// Reads the destination state off the running system.
    pub fn new(config: RuntimeConfig, shell: Arc<dyn Shell>, platform: Arc<dyn Platform>) -> Result<Self> {
        let mounts = platform.mount_table(shell.as_ref())?;
        let state = DestinationState::detect(&config.destination, &config.encfs_mountpoint, &mounts);
        info!("destination: {}", state.describe());
        Ok(Self {
            config,
            shell,
            platform,
            runner: TaskRunner::new(),
            capacity: system_capacity(),
            state,
            catalog: None,
        })
    }

    pub fn with_capacity(mut self, capacity: CapacityFn) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn state(&self) -> &DestinationState {
        &self.state
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn runner(&self) -> &TaskRunner {
        &self.runner
    }

    pub fn is_destination_encrypted(&self) -> bool {
        self.state.is_encrypted()
    }

    pub fn is_mounted(&self) -> bool {
        self.state.is_mounted()
    }

    pub fn effective_path(&self) -> Result<PathBuf> {
        self.state.effective_path()
    }

    fn refresh(&mut self) -> Result<()> {
        let mounts = self.platform.mount_table(self.shell.as_ref())?;
        self.state = DestinationState::detect(
            &self.config.destination,
            &self.config.encfs_mountpoint,
            &mounts,
        );
        debug!("destination now {}", self.state.describe());
        Ok(())
    }

    fn refresh_or_warn(&mut self) {
        if let Err(err) = self.refresh() {
            warn!("cannot re-read destination state: {}", err);
        }
    }

    /// Re-reads the state after a background transition and checks the
    /// new effective path.
    fn revalidate(&mut self) {
        self.refresh_or_warn();
        if let Err(err) = self.usable_target() {
            warn!("destination {} is not usable: {}", self.state.describe(), err);
        }
    }

    fn close_catalog(&mut self) {
        if let Some(catalog) = self.catalog.take() {
            catalog.close();
        }
    }

    /// Effective target, with a local path checked right now.
    fn usable_target(&self) -> Result<Target> {
        let target = self.state.effective_target()?;
        if let Some(path) = target.as_local() {
            validate_destination(path, &self.config.source)?;
        }
        Ok(target)
    }

    fn validated_temp_dir(&self) -> Result<Option<PathBuf>> {
        if let Some(dir) = &self.config.temp_dir {
            validate_temp_dir(dir)?;
        }
        Ok(self.config.temp_dir.clone())
    }

    /// Mounts a remote destination, or checks that a direct one answers.
    /// Direct targets authenticate with keys only; `password` is ignored.
    pub fn login(&mut self, password: Option<Secret>) -> Result<()> {
        let _claim = self.runner.claim("login")?;
        if self.state.kind == DestinationKind::Local {
            info!("local destination; nothing to log in to");
            return Ok(());
        }
        if let (DestinationKind::SshDirect, Some(remote)) = (self.state.kind, &self.state.remote) {
            let inv = test_server_command(remote);
            let out = self.shell.run(&inv)?;
            check_login(&inv, out)?;
            info!("{} answers", remote.rdiff_target());
            return Ok(());
        }
        if self.state.is_mounted() {
            info!("{} is already mounted", self.state.raw_path.display());
            return Ok(());
        }

        let mountpoint = self.state.raw_path.clone();
        fs::create_dir_all(&mountpoint)?;
        let inv = match &self.config.destination {
            DestinationSettings::Ssh { target, auth, .. } => {
                let password = match auth {
                    SshAuth::PublicKey => None,
                    SshAuth::Password => Some(password.ok_or_else(|| {
                        VaultError::precondition("a password is required for this ssh login")
                    })?),
                };
                sshfs_mount(target, &mountpoint, password)
            }
            DestinationSettings::Smb { share, .. } => {
                let password = password.ok_or_else(|| {
                    VaultError::precondition("a password is required for this share")
                })?;
                self.platform.smb_mount(share, &mountpoint, password)
            }
            DestinationSettings::Local { .. } => {
                return Err(VaultError::message("local destination cannot be mounted"))
            }
        };
        let out = self.shell.run(&inv)?;
        check_login(&inv, out)?;
        self.refresh()?;
        if !self.state.is_mounted() {
            return Err(VaultError::message(format!(
                "{} reported success but {} is not mounted",
                inv.program,
                mountpoint.display()
            )));
        }
        info!("mounted {}", mountpoint.display());
        validate_destination(&self.state.raw_path, &self.config.source)
    }

    /// Unmounts a remote destination, locking it first when unlocked.
    pub fn logout(&mut self) -> Result<()> {
        let _claim = self.runner.claim("logout")?;
        if !self.state.kind.needs_mount() || !self.state.is_mounted() {
            debug!("nothing mounted");
            return Ok(());
        }
        self.close_catalog();
        if let Encryption::Encrypted(LockStatus::Unlocked(_)) = self.state.encryption {
            self.lock_unclaimed()?;
        }
        let mountpoint = self.state.raw_path.clone();
        let unmounted = match self.state.kind {
            DestinationKind::SmbRemote => {
                let inv = self.platform.smb_unmount(&mountpoint);
                self.shell.run(&inv).and_then(|out| out.check(&inv)).map(|_| ())
            }
            _ => fuse_unmount(self.shell.as_ref(), self.platform.as_ref(), &mountpoint),
        };
        if let Err(err) = unmounted {
            // Locking may already have happened.
            self.refresh_or_warn();
            warn!(
                "logout of {} failed; destination is now {}",
                mountpoint.display(),
                self.state.describe()
            );
            return Err(err);
        }
        self.refresh()?;
        info!("logged out of {}", mountpoint.display());
        Ok(())
    }

    /// Mounts the plaintext view, asking for the password up to
    /// `unlock_attempts` times.
    pub fn unlock(&mut self, prompt: &mut dyn PasswordPrompt) -> Result<()> {
        let _claim = self.runner.claim("unlock")?;
        match &self.state.encryption {
            Encryption::Plain => {
                return Err(VaultError::precondition("destination is not encrypted"))
            }
            Encryption::Encrypted(LockStatus::Unlocked(path)) => {
                info!("already unlocked at {}", path.display());
                return Ok(());
            }
            Encryption::Encrypted(LockStatus::Locked) => {}
        }
        let raw = self.state.raw_path.clone();
        let mountpoint = self.config.encfs_mountpoint.clone();
        fs::create_dir_all(&mountpoint)?;
        let attempts = self.config.unlock_attempts;
        for attempt in 1..=attempts {
            let question = format!(
                "Password for {} (attempt {}/{}): ",
                raw.display(),
                attempt,
                attempts
            );
            let password = prompt.password(&question).ok_or(VaultError::Cancelled)?;
            let inv = encfs_mount(&raw, &mountpoint, password);
            let out = self.shell.run(&inv)?;
            if out.success() {
                self.refresh()?;
                info!("unlocked {} at {}", raw.display(), mountpoint.display());
                let path = self.state.effective_path()?;
                return validate_destination(&path, &self.config.source);
            }
            if !out.stderr.to_lowercase().contains("password") {
                return out.check(&inv).map(|_| ());
            }
            warn!("wrong password for {} (attempt {}/{})", raw.display(), attempt, attempts);
        }
        Err(VaultError::Authentication(format!(
            "no valid password after {} attempt(s)",
            attempts
        )))
    }

    pub fn lock(&mut self) -> Result<()> {
        let _claim = self.runner.claim("lock")?;
        self.lock_unclaimed()
    }

    fn lock_unclaimed(&mut self) -> Result<()> {
        let mountpoint = match &self.state.encryption {
            Encryption::Plain => {
                return Err(VaultError::precondition("destination is not encrypted"))
            }
            Encryption::Encrypted(LockStatus::Locked) => return Ok(()),
            Encryption::Encrypted(LockStatus::Unlocked(path)) => path.clone(),
        };
        self.close_catalog();
        fuse_unmount(self.shell.as_ref(), self.platform.as_ref(), &mountpoint)?;
        self.refresh()?;
        info!("locked {}", self.state.raw_path.display());
        Ok(())
    }

    pub fn change_password(&mut self, old: &Secret, new: &Secret) -> Result<()> {
        let _claim = self.runner.claim("passwd")?;
        if !self.state.is_encrypted() {
            return Err(VaultError::precondition("destination is not encrypted"));
        }
        if new.is_empty() {
            return Err(VaultError::precondition("the new password is empty"));
        }
        let inv = encfs_change_password(&self.state.raw_path, old, new);
        let out = self.shell.run(&inv)?;
        if !out.success() {
            warn!("encfsctl exited with {}", out.code);
            return Err(VaultError::Authentication(
                "encfsctl did not accept the current password".to_string(),
            ));
        }
        info!("password of {} changed", self.state.raw_path.display());
        Ok(())
    }

    /// Opens the increment catalog of the effective path, reusing the open
    /// one while it still points there.
    pub fn catalog(&mut self) -> Result<&IncrementCatalog> {
        let path = self.state.effective_path()?;
        let stale = self.catalog.as_ref().map_or(true, |c| c.repo() != path.as_path());
        if stale {
            self.close_catalog();
            self.catalog = Some(IncrementCatalog::open(&path)?);
        }
        self.catalog
            .as_ref()
            .ok_or_else(|| VaultError::message("increment catalog is not open"))
    }

    /// Increments newest first, from the catalog or over ssh.
    pub fn increments(&mut self) -> Result<Vec<Increment>> {
        match self.state.effective_target()? {
            target @ Target::Remote(_) => {
                RemoteListReader::new(Arc::clone(&self.shell), target).read()
            }
            Target::Local(_) => Ok(self.catalog()?.increments().to_vec()),
        }
    }

    fn backup_spec(&self, target: Target, temp_dir: Option<PathBuf>) -> BackupJobSpec {
        let mut excludes = self.config.excludes.clone();
        // An encrypted repository may be mounted elsewhere while its
        // ciphertext still sits inside the source.
        let raw = &self.state.raw_path;
        if !raw.as_os_str().is_empty() && is_sub_path(&self.config.source, raw) {
            let raw = raw.display().to_string();
            if !excludes.contains(&raw) {
                debug!("raw destination {} is inside the source; excluding it", raw);
                excludes.push(raw);
            }
        }
        BackupJobSpec {
            source: self.config.source.clone(),
            target,
            temp_dir,
            includes: self.config.includes.clone(),
            excludes,
            exclusions: self.config.exclusions,
            min_file_size: self.config.min_file_size,
            max_file_size: self.config.max_file_size,
            compression: self.config.compression,
        }
    }

    /// `interactive` is false for unattended runs, which keep retention
    /// warnings out of the report.
    pub fn start_backup(&mut self, interactive: bool) -> Result<TaskHandle<BackupReport>> {
        if self.runner.is_busy() {
            return Err(VaultError::Busy);
        }
        validate_source(&self.config.source)?;
        let target = self.usable_target()?;
        let temp_dir = self.validated_temp_dir()?;
        let spec = self.backup_spec(target, temp_dir);
        let style = self.platform.path_style();
        let policy = self.config.retention.clone();
        let shell = Arc::clone(&self.shell);
        self.close_catalog();
        self.runner.spawn("backup", move |ctx| {
            run_backup(shell, &spec, style, &policy, interactive, ctx)
        })
    }

    pub fn finish_backup(&mut self, outcome: &TaskOutcome<BackupReport>) {
        match outcome {
            TaskOutcome::Succeeded(report) => {
                self.close_catalog();
                for failure in report.retention.failures() {
                    warn!(
                        "retention left increments older than {} in place",
                        failure.token
                    );
                }
            }
            TaskOutcome::Failed(msg) => warn!("backup failed: {}", msg),
            TaskOutcome::Cancelled => info!("backup cancelled"),
        }
    }

    pub fn start_restore(&mut self, request: RestoreRequest) -> Result<TaskHandle<RestoreReport>> {
        if self.runner.is_busy() {
            return Err(VaultError::Busy);
        }
        let target = self.usable_target()?;
        prepare_restore_dir(&request.restore_dir)?;
        let temp_dir = self.validated_temp_dir()?;
        let style = self.platform.path_style();
        let shell = Arc::clone(&self.shell);
        self.runner.spawn("restore", move |ctx| {
            run_restore(shell.as_ref(), &target, &request, temp_dir.as_deref(), style, ctx)
        })
    }

    pub fn finish_restore(&mut self, outcome: &TaskOutcome<RestoreReport>) {
        match outcome {
            TaskOutcome::Succeeded(report) => {
                info!("restore into {} finished", report.restore_dir.display())
            }
            TaskOutcome::Failed(msg) => warn!("restore failed: {}", msg),
            TaskOutcome::Cancelled => info!("restore cancelled"),
        }
    }

    pub fn start_encrypt(&mut self, password: Secret) -> Result<TaskHandle<EncryptReport>> {
        if self.runner.is_busy() {
            return Err(VaultError::Busy);
        }
        if self.state.kind == DestinationKind::SshDirect {
            return Err(VaultError::precondition(
                "direct ssh destinations cannot be encrypted",
            ));
        }
        if self.state.kind.needs_mount() && !self.state.is_mounted() {
            return Err(VaultError::precondition("destination is not mounted; log in first"));
        }
        if self.state.is_encrypted() {
            return Err(VaultError::precondition("destination is already encrypted"));
        }
        if password.is_empty() {
            return Err(VaultError::precondition("the password is empty"));
        }
        validate_destination(&self.state.raw_path, &self.config.source)?;
        self.close_catalog();
        let job = EncryptJob {
            raw: self.state.raw_path.clone(),
            mountpoint: self.config.encfs_mountpoint.clone(),
            password,
            shell: Arc::clone(&self.shell),
            platform: Arc::clone(&self.platform),
            capacity: Arc::clone(&self.capacity),
        };
        self.runner.spawn("encrypt", move |ctx| run_encrypt(&job, ctx))
    }

    pub fn finish_encrypt(&mut self, outcome: &TaskOutcome<EncryptReport>) {
        match outcome {
            TaskOutcome::Succeeded(report) => {
                self.close_catalog();
                info!("encrypted; unlocked at {}", report.mountpoint.display());
                self.revalidate();
            }
            TaskOutcome::Failed(msg) => {
                warn!("encryption failed: {}", msg);
                self.refresh_or_warn();
            }
            TaskOutcome::Cancelled => {
                info!("encryption cancelled");
                self.refresh_or_warn();
            }
        }
    }

    pub fn start_decrypt(&mut self) -> Result<TaskHandle<DecryptReport>> {
        if self.runner.is_busy() {
            return Err(VaultError::Busy);
        }
        let mountpoint = match &self.state.encryption {
            Encryption::Plain => {
                return Err(VaultError::precondition("destination is not encrypted"))
            }
            Encryption::Encrypted(LockStatus::Locked) => {
                return Err(VaultError::precondition(
                    "destination is locked; unlock it first",
                ))
            }
            Encryption::Encrypted(LockStatus::Unlocked(path)) => path.clone(),
        };
        self.close_catalog();
        let job = DecryptJob {
            raw: self.state.raw_path.clone(),
            mountpoint,
            shell: Arc::clone(&self.shell),
            platform: Arc::clone(&self.platform),
            capacity: Arc::clone(&self.capacity),
        };
        self.runner.spawn("decrypt", move |ctx| run_decrypt(&job, ctx))
    }

    pub fn finish_decrypt(&mut self, outcome: &TaskOutcome<DecryptReport>) {
        match outcome {
            TaskOutcome::Succeeded(_) => {
                info!("decrypted {}", self.state.raw_path.display());
                self.revalidate();
            }
            TaskOutcome::Failed(msg) => {
                warn!("decryption failed: {}", msg);
                self.refresh_or_warn();
            }
            TaskOutcome::Cancelled => {
                info!("decryption cancelled");
                self.refresh_or_warn();
            }
        }
    }

    /// Version of every external tool this destination needs.
    pub fn check_tools(&self) -> Vec<ToolCheck> {
        let mut invocations = vec![
            version_command(),
            Invocation::new("rsync").arg("--version"),
            Invocation::new("encfs").arg("--version"),
        ];
        if self.state.kind == DestinationKind::SshRemote {
            invocations.push(Invocation::new("sshfs").arg("--version"));
        }
        invocations
            .iter()
            .map(|inv| {
                let (version, error) = match self.shell.run(inv) {
                    Ok(out) if out.success() => (first_line(&out), None),
                    Ok(out) => (None, Some(format!("exit code {}", out.code))),
                    Err(err) => (None, Some(err.to_string())),
                };
                ToolCheck {
                    program: inv.program.clone(),
                    version,
                    error,
                }
            })
            .collect()
    }

    pub fn shutdown(&self) -> Result<()> {
        let inv = self.platform.shutdown();
        info!("shutting down: {}", inv.display());
        self.shell.run(&inv)?.check(&inv)?;
        Ok(())
    }
}

/// Some tools print their version on stderr.
fn first_line(out: &Output) -> Option<String> {
    out.stdout
        .lines()
        .chain(out.stderr.lines())
        .map(str::trim)
        .find(|line| !line.is_empty())
        .map(str::to_string)
}
