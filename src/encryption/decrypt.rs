use std::path::PathBuf;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::encryption::probe::{check_capacity, survey, CapacityFn, MAX_PROBE_LENGTH};
use crate::encryption::rsync::{copy_command, run_copy};
use crate::encryption::{fresh_dir, remove_staging, swap_in};
use crate::error::{Result, VaultError};
use crate::mount::ops::fuse_unmount;
use crate::platform::Platform;
use crate::task::TaskContext;
use crate::util::command::Shell;

/// Plaintext is rebuilt here, inside the ciphertext directory, before the
/// swap. encfs does not show it in the plaintext view.
pub const PLAIN_STAGING: &str = ".rdiffvault-plain";

pub struct DecryptJob {
    pub raw: PathBuf,
    /// The unlocked plaintext view of `raw`.
    pub mountpoint: PathBuf,
    pub shell: Arc<dyn Shell>,
    pub platform: Arc<dyn Platform>,
    pub capacity: CapacityFn,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecryptReport {
    pub bytes: u64,
}

#[derive(Debug)]
pub enum DecryptPhase {
    Prepare,
    CheckSpace,
    Copy { required: u64 },
    /// Runs even after a failed copy: the view is unmounted either way and
    /// the swap only happens when the copy succeeded.
    Finish {
        required: u64,
        copy_error: Option<VaultError>,
    },
    Cleanup(VaultError),
    Done(DecryptReport),
}

fn step(job: &DecryptJob, phase: DecryptPhase, ctx: &TaskContext) -> Result<DecryptPhase> {
    let staging = job.raw.join(PLAIN_STAGING);
    match phase {
        DecryptPhase::Prepare => {
            fresh_dir(&staging)?;
            Ok(DecryptPhase::CheckSpace)
        }
        DecryptPhase::CheckSpace => {
            let found = survey(&job.mountpoint, MAX_PROBE_LENGTH, &[], ctx.cancel_token())?;
            let capacity = (job.capacity)(&job.raw)?;
            check_capacity(found.total_bytes, capacity)?;
            Ok(DecryptPhase::Copy {
                required: found.total_bytes,
            })
        }
        DecryptPhase::Copy { required } => {
            let inv = copy_command(&job.mountpoint, &staging, &[]);
            match run_copy(job.shell.as_ref(), &inv, ctx) {
                Ok(()) => Ok(DecryptPhase::Finish {
                    required,
                    copy_error: None,
                }),
                Err(err) if err.is_cancelled() => Err(err),
                Err(err) => {
                    warn!("copy out of {} failed: {}", job.mountpoint.display(), err);
                    Ok(DecryptPhase::Finish {
                        required,
                        copy_error: Some(err),
                    })
                }
            }
        }
        DecryptPhase::Finish {
            required,
            copy_error,
        } => {
            fuse_unmount(job.shell.as_ref(), job.platform.as_ref(), &job.mountpoint)?;
            if let Some(err) = copy_error {
                return Err(err);
            }
            swap_in(&job.raw, PLAIN_STAGING)?;
            Ok(DecryptPhase::Done(DecryptReport { bytes: required }))
        }
        DecryptPhase::Cleanup(err) => Err(err),
        DecryptPhase::Done(report) => Ok(DecryptPhase::Done(report)),
    }
}

/// Turns the unlocked encrypted destination back into plain storage.
pub fn run_decrypt(job: &DecryptJob, ctx: &TaskContext) -> Result<DecryptReport> {
    let staging = job.raw.join(PLAIN_STAGING);
    let mut phase = DecryptPhase::Prepare;
    loop {
        debug!("decrypt {}: {:?}", job.raw.display(), phase);
        phase = match phase {
            DecryptPhase::Done(report) => {
                info!("{} is now plain", job.raw.display());
                return Ok(report);
            }
            DecryptPhase::Cleanup(err) => {
                remove_staging(&staging);
                return Err(err);
            }
            DecryptPhase::Finish { .. } => {
                step(job, phase, ctx).unwrap_or_else(DecryptPhase::Cleanup)
            }
            other => match ctx.check_cancelled() {
                Err(err) => DecryptPhase::Cleanup(err),
                Ok(()) => step(job, other, ctx).unwrap_or_else(DecryptPhase::Cleanup),
            },
        };
    }
}
