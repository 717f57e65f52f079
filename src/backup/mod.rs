//! The two rdiff-backup jobs that run in the background: backing up the
//! source and restoring from an increment.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::error::Result;
use crate::progress::{Grammar, OutputParser};
use crate::rdiff::command::{backup_command, restore_command, BackupJobSpec, RestoreRequest, Target};
use crate::rdiff::increments::{IncrementReader, MetadataReader, RemoteListReader};
use crate::rdiff::quote::PathStyle;
use crate::retention::{apply_retention, RetentionPolicy, RetentionReport, ShellPruner};
use crate::task::TaskContext;
use crate::util::command::{Exit, Invocation, Shell};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackupReport {
    pub files: u64,
    pub retention: RetentionReport,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoreReport {
    pub files: u64,
    pub restore_dir: PathBuf,
}

pub fn log_job_details(spec: &BackupJobSpec) {
    let excludes = spec.effective_excludes();
    debug!("source: {}", spec.source.display());
    debug!("destination: {}", spec.target.describe());
    debug!("includes: {}", list_or_none(&spec.includes));
    debug!("excludes: {}", list_or_none(&excludes));
    if let Some(dir) = &spec.temp_dir {
        debug!("temp dir: {}", dir.display());
    }
    debug!("compression: {}", spec.compression);
}

fn list_or_none(items: &[String]) -> String {
    if items.is_empty() {
        "<none>".to_string()
    } else {
        items.join(", ")
    }
}

/// Streams one rdiff-backup invocation into the task's progress channel and
/// returns its exit together with the number of files it reported.
fn stream_rdiff(shell: &dyn Shell, inv: &Invocation, ctx: &TaskContext) -> Result<(Exit, u64)> {
    let mut parser = OutputParser::new(Grammar::RdiffBackup);
    let exit = shell.stream(
        inv,
        &mut |line| {
            for event in parser.parse_line(line) {
                ctx.report(event);
            }
        },
        ctx.cancel_token(),
    )?;
    Ok((exit, parser.file_count()))
}

fn increment_reader(shell: &Arc<dyn Shell>, target: &Target) -> Box<dyn IncrementReader> {
    match target {
        Target::Local(path) => Box::new(MetadataReader::new(path.clone())),
        Target::Remote(_) => Box::new(RemoteListReader::new(Arc::clone(shell), target.clone())),
    }
}

/// Backs up `spec.source` and, once that succeeded, applies retention to
/// the same repository. The include/exclude lists are removed whatever the
/// outcome.
pub fn run_backup(
    shell: Arc<dyn Shell>,
    spec: &BackupJobSpec,
    style: PathStyle,
    policy: &RetentionPolicy,
    interactive: bool,
    ctx: &TaskContext,
) -> Result<BackupReport> {
    log_job_details(spec);
    let prepared = backup_command(spec, style)?;
    let inv = prepared.invocation.clone();
    let streamed = stream_rdiff(shell.as_ref(), &inv, ctx);
    prepared.discard_lists();
    let (exit, files) = streamed?;
    exit.into_result(&inv)?;
    info!("backup of {} finished, {} changed file(s)", spec.source.display(), files);

    if policy.is_empty() {
        return Ok(BackupReport {
            files,
            retention: RetentionReport::default(),
        });
    }
    let reader = increment_reader(&shell, &spec.target);
    let pruner = ShellPruner::new(Arc::clone(&shell), spec.target.clone());
    let retention = apply_retention(policy, reader.as_ref(), &pruner, interactive);
    Ok(BackupReport { files, retention })
}

/// Restores `request.selection` from `request.increment`. Failed runs keep
/// their include/exclude lists on disk for inspection.
pub fn run_restore(
    shell: &dyn Shell,
    backup: &Target,
    request: &RestoreRequest,
    temp_dir: Option<&Path>,
    style: PathStyle,
    ctx: &TaskContext,
) -> Result<RestoreReport> {
    let prepared = restore_command(backup, request, temp_dir, style)?;
    let inv = prepared.invocation.clone();
    let result = stream_rdiff(shell, &inv, ctx).and_then(|(exit, files)| {
        exit.into_result(&inv)?;
        Ok(files)
    });
    match result {
        Ok(files) => {
            prepared.discard_lists();
            info!(
                "restored {} into {}",
                request.increment,
                request.restore_dir.display()
            );
            Ok(RestoreReport {
                files,
                restore_dir: request.restore_dir.clone(),
            })
        }
        Err(err) => {
            for path in prepared.retain_lists() {
                warn!("restore failed; kept file list {}", path.display());
            }
            Err(err)
        }
    }
}
