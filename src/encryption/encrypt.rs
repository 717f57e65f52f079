use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::encryption::probe::{
    check_capacity, probe_max_filename_length, survey, CapacityFn, DirProbe,
};
use crate::encryption::rsync::{copy_command, run_copy};
use crate::encryption::{fresh_dir, remove_staging, swap_in};
use crate::error::{Result, VaultError};
use crate::mount::guard::MountGuard;
use crate::mount::ops::{encfs_mount, is_encfs_volume, mount_with};
use crate::platform::Platform;
use crate::task::TaskContext;
use crate::types::Secret;
use crate::util::command::Shell;
use crate::util::paths::staging_sibling;

/// Ciphertext is built here, inside the destination, before the swap.
pub const CIPHER_STAGING: &str = ".rdiffvault-cipher";
const SMOKE_FILE: &str = ".rdiffvault-smoke";

pub struct EncryptJob {
    pub raw: PathBuf,
    /// Where the plaintext view is mounted once encryption is done.
    pub mountpoint: PathBuf,
    pub password: Secret,
    pub shell: Arc<dyn Shell>,
    pub platform: Arc<dyn Platform>,
    pub capacity: CapacityFn,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptReport {
    pub mountpoint: PathBuf,
    pub max_name: usize,
    pub bytes: u64,
}

#[derive(Debug)]
pub enum EncryptPhase {
    Prepare,
    Probe,
    Survey { max_name: usize },
    CheckSpace { max_name: usize, required: u64 },
    Copy { max_name: usize, required: u64 },
    Finish { max_name: usize, required: u64 },
    Cleanup(VaultError),
    Done(EncryptReport),
}

struct Staging {
    cipher: PathBuf,
    plain: PathBuf,
    mount: Option<MountGuard>,
    committed: bool,
}

impl Staging {
    fn cleanup(&mut self) {
        if let Some(guard) = self.mount.take() {
            if let Err(err) = guard.release() {
                warn!("cleanup: {}", err);
            }
        }
        if !self.committed {
            remove_staging(&self.cipher);
        }
        if let Err(err) = fs::remove_dir(&self.plain) {
            debug!("cleanup: remove {}: {}", self.plain.display(), err);
        }
    }
}

fn step(job: &EncryptJob, staging: &mut Staging, phase: EncryptPhase, ctx: &TaskContext) -> Result<EncryptPhase> {
    match phase {
        EncryptPhase::Prepare => {
            fresh_dir(&staging.cipher)?;
            fresh_dir(&staging.plain)?;
            let inv = encfs_mount(&staging.cipher, &staging.plain, job.password.clone());
            mount_with(job.shell.as_ref(), &inv)?;
            staging.mount = Some(MountGuard::new(
                staging.plain.clone(),
                Arc::clone(&job.shell),
                Arc::clone(&job.platform),
            ));
            if !is_encfs_volume(&staging.cipher) {
                return Err(VaultError::message("encfs did not create a volume"));
            }
            let smoke = staging.plain.join(SMOKE_FILE);
            fs::write(&smoke, b"rdiffvault")?;
            let readback = fs::read(&smoke)?;
            fs::remove_file(&smoke)?;
            if readback != b"rdiffvault" {
                return Err(VaultError::message("encrypted test mount returned wrong data"));
            }
            Ok(EncryptPhase::Probe)
        }
        EncryptPhase::Probe => {
            let max_name = probe_max_filename_length(&mut DirProbe::new(&staging.plain));
            Ok(EncryptPhase::Survey { max_name })
        }
        EncryptPhase::Survey { max_name } => {
            let found = survey(&job.raw, max_name, &[CIPHER_STAGING], ctx.cancel_token())?;
            if let Some(path) = found.too_long {
                return Err(VaultError::precondition(format!(
                    "{} has a name longer than the {} bytes encrypted storage allows",
                    path.display(),
                    max_name
                )));
            }
            Ok(EncryptPhase::CheckSpace {
                max_name,
                required: found.total_bytes,
            })
        }
        EncryptPhase::CheckSpace { max_name, required } => {
            let capacity = (job.capacity)(&job.raw)?;
            check_capacity(required, capacity)?;
            Ok(EncryptPhase::Copy { max_name, required })
        }
        EncryptPhase::Copy { max_name, required } => {
            let exclude = format!("/{}", CIPHER_STAGING);
            let inv = copy_command(&job.raw, &staging.plain, &[exclude.as_str()]);
            run_copy(job.shell.as_ref(), &inv, ctx)?;
            Ok(EncryptPhase::Finish { max_name, required })
        }
        EncryptPhase::Finish { max_name, required } => {
            if let Some(guard) = staging.mount.take() {
                guard.release()?;
            }
            if let Err(err) = fs::remove_dir(&staging.plain) {
                debug!("remove {}: {}", staging.plain.display(), err);
            }
            staging.committed = true;
            swap_in(&job.raw, CIPHER_STAGING)?;
            fs::create_dir_all(&job.mountpoint)?;
            let inv = encfs_mount(&job.raw, &job.mountpoint, job.password.clone());
            mount_with(job.shell.as_ref(), &inv)?;
            Ok(EncryptPhase::Done(EncryptReport {
                mountpoint: job.mountpoint.clone(),
                max_name,
                bytes: required,
            }))
        }
        EncryptPhase::Cleanup(err) => Err(err),
        EncryptPhase::Done(report) => Ok(EncryptPhase::Done(report)),
    }
}

/// Encrypts `job.raw` in place and leaves it unlocked at `job.mountpoint`.
/// Not resumable: a failed or cancelled run is undone and starts over next
/// time.
pub fn run_encrypt(job: &EncryptJob, ctx: &TaskContext) -> Result<EncryptReport> {
    let mut staging = Staging {
        cipher: job.raw.join(CIPHER_STAGING),
        plain: staging_sibling(&job.mountpoint, "staging")?,
        mount: None,
        committed: false,
    };
    let mut phase = EncryptPhase::Prepare;
    loop {
        debug!("encrypt {}: {:?}", job.raw.display(), phase);
        phase = match phase {
            EncryptPhase::Done(report) => {
                info!("{} is now encrypted", job.raw.display());
                return Ok(report);
            }
            EncryptPhase::Cleanup(err) => {
                staging.cleanup();
                return Err(err);
            }
            EncryptPhase::Finish { .. } => {
                step(job, &mut staging, phase, ctx).unwrap_or_else(EncryptPhase::Cleanup)
            }
            other => match ctx.check_cancelled() {
                Err(err) => EncryptPhase::Cleanup(err),
                Ok(()) => step(job, &mut staging, other, ctx).unwrap_or_else(EncryptPhase::Cleanup),
            },
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encryption::probe::Capacity;
    use crate::mount::ops::ENCFS_CONFIG;
    use crate::task::{TaskOutcome, TaskRunner};
    use crate::testing::{copying_rsync, fake_encfs, FakePlatform, ScriptedShell};
    use std::time::Duration;

    struct Fixture {
        _root: tempfile::TempDir,
        raw: PathBuf,
        mountpoint: PathBuf,
        shell: Arc<ScriptedShell>,
        platform: Arc<FakePlatform>,
    }

    fn fixture() -> Fixture {
        let root = tempfile::tempdir().expect("tempdir");
        let raw = root.path().join("backup");
        fs::create_dir_all(raw.join("rdiff-backup-data")).expect("mkdir");
        fs::write(raw.join("a.txt"), "hello").expect("write");
        let shell = ScriptedShell::new();
        let platform = FakePlatform::new();
        fake_encfs(&shell, &platform);
        copying_rsync(&shell, &platform);
        Fixture {
            mountpoint: root.path().join("run/plain"),
            raw,
            _root: root,
            shell,
            platform,
        }
    }

    fn job(f: &Fixture, capacity: Capacity) -> EncryptJob {
        EncryptJob {
            raw: f.raw.clone(),
            mountpoint: f.mountpoint.clone(),
            password: Secret::new("pw"),
            shell: f.shell.clone(),
            platform: f.platform.clone(),
            capacity: Arc::new(move |_| Ok(capacity)),
        }
    }

    fn roomy() -> Capacity {
        Capacity {
            total: 1 << 30,
            available: 1 << 29,
        }
    }

    fn names(dir: &std::path::Path) -> Vec<String> {
        let mut out: Vec<String> = fs::read_dir(dir)
            .expect("list")
            .map(|e| e.expect("entry").file_name().to_string_lossy().to_string())
            .collect();
        out.sort();
        out
    }

    #[test]
    fn encrypts_and_mounts_plaintext_view() {
        let f = fixture();
        let (ctx, _events) = TaskContext::detached();
        let report = run_encrypt(&job(&f, roomy()), &ctx).expect("encrypt");
        assert_eq!(report.mountpoint, f.mountpoint);
        assert_eq!(report.bytes, 5);
        assert!(report.max_name > 0);
        assert_eq!(names(&f.raw), vec![".encfs6.xml", "a.txt", "rdiff-backup-data"]);
        assert!(f.platform.is_mounted(&f.mountpoint));
        assert_eq!(
            f.shell.programs(),
            vec!["encfs", "rsync", "fusermount", "encfs"]
        );
        let staging = staging_sibling(&f.mountpoint, "staging").expect("staging");
        assert!(!staging.exists());
    }

    #[test]
    fn failed_copy_restores_plain_destination() {
        let f = fixture();
        f.shell.fail("rsync", None, 23, "partial transfer");
        let (ctx, _events) = TaskContext::detached();
        assert!(run_encrypt(&job(&f, roomy()), &ctx).is_err());
        assert_eq!(names(&f.raw), vec!["a.txt", "rdiff-backup-data"]);
        assert!(!f.raw.join(ENCFS_CONFIG).exists());
        assert!(!f.platform.is_mounted(&f.mountpoint));
        assert_eq!(f.shell.programs(), vec!["encfs", "rsync", "fusermount"]);
    }

    #[test]
    fn insufficient_space_aborts_before_copy() {
        let f = fixture();
        let full = Capacity {
            total: 1000,
            available: 40,
        };
        let (ctx, _events) = TaskContext::detached();
        let err = run_encrypt(&job(&f, full), &ctx).expect_err("no space");
        assert!(matches!(err, VaultError::Precondition(_)));
        assert!(!f.shell.programs().contains(&"rsync".to_string()));
        assert_eq!(names(&f.raw), vec!["a.txt", "rdiff-backup-data"]);
    }

    #[test]
    fn cancelling_the_copy_cleans_up() {
        let f = fixture();
        f.shell.block("rsync");
        let job = job(&f, roomy());
        let runner = TaskRunner::new();
        let handle = runner
            .spawn("encrypt", move |ctx| run_encrypt(&job, ctx))
            .expect("spawn");
        while !f.shell.programs().contains(&"rsync".to_string()) {
            std::thread::sleep(Duration::from_millis(5));
        }
        handle.cancel();
        assert_eq!(handle.wait(), TaskOutcome::Cancelled);
        assert_eq!(names(&f.raw), vec!["a.txt", "rdiff-backup-data"]);
        assert!(!f.platform.is_mounted(&f.mountpoint));
    }
}
