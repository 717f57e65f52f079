use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::Result;
use crate::rdiff::filelist::FileList;
use crate::rdiff::quote::{quote, PathStyle};
use crate::util::command::Invocation;
use crate::util::paths::is_sub_path;

pub const RDIFF_BACKUP: &str = "rdiff-backup";

/// Exit status ssh reserves for its own failures, including rejected keys.
pub const SSH_FAILURE_CODE: i32 = 255;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteSpec {
    pub user: String,
    pub host: String,
    pub port: u16,
    pub dir: String,
}

impl RemoteSpec {
    pub fn rdiff_target(&self) -> String {
        format!("{}@{}::{}", self.user, self.host, self.dir)
    }

    pub fn remote_schema(&self) -> String {
        format!(
            "ssh -o BatchMode=yes -p {} -C %s rdiff-backup --server",
            self.port
        )
    }
}

/// Where rdiff-backup reads or writes the repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    Local(PathBuf),
    Remote(RemoteSpec),
}

impl Target {
    pub fn as_local(&self) -> Option<&Path> {
        match self {
            Target::Local(path) => Some(path),
            Target::Remote(_) => None,
        }
    }

    fn push(&self, inv: Invocation) -> Invocation {
        match self {
            Target::Local(path) => inv.arg(path),
            Target::Remote(remote) => inv.arg(remote.rdiff_target()),
        }
    }

    fn schema(&self, inv: Invocation) -> Invocation {
        match self {
            Target::Local(_) => inv,
            Target::Remote(remote) => inv.arg("--remote-schema").arg(remote.remote_schema()),
        }
    }

    pub fn describe(&self) -> String {
        match self {
            Target::Local(path) => path.display().to_string(),
            Target::Remote(remote) => remote.rdiff_target(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Exclusions {
    pub device_files: bool,
    pub fifos: bool,
    pub other_filesystems: bool,
    pub sockets: bool,
    pub symlinks: bool,
}

impl Exclusions {
    fn flags(&self) -> Vec<&'static str> {
        let table = [
            (self.device_files, "--exclude-device-files"),
            (self.fifos, "--exclude-fifos"),
            (self.other_filesystems, "--exclude-other-filesystems"),
            (self.sockets, "--exclude-sockets"),
            (self.symlinks, "--exclude-symbolic-links"),
        ];
        table
            .iter()
            .filter(|(on, _)| *on)
            .map(|(_, flag)| *flag)
            .collect()
    }
}

/// Everything one backup run needs, built fresh right before it starts.
#[derive(Debug, Clone)]
pub struct BackupJobSpec {
    pub source: PathBuf,
    pub target: Target,
    pub temp_dir: Option<PathBuf>,
    pub includes: Vec<String>,
    pub excludes: Vec<String>,
    pub exclusions: Exclusions,
    pub min_file_size: Option<u64>,
    pub max_file_size: Option<u64>,
    pub compression: bool,
}

impl BackupJobSpec {
    /// Exclude list with the destination added when it lives inside the
    /// source tree.
    pub fn effective_excludes(&self) -> Vec<String> {
        let mut excludes = self.excludes.clone();
        if let Target::Local(dest) = &self.target {
            if is_sub_path(&self.source, dest) {
                let dest = dest.display().to_string();
                if !excludes.contains(&dest) {
                    debug!("destination {} is inside the source; excluding it", dest);
                    excludes.push(dest);
                }
            }
        }
        excludes
    }
}

/// An invocation plus the temporary file lists it references.
#[derive(Debug)]
pub struct PreparedCommand {
    pub invocation: Invocation,
    pub lists: Vec<FileList>,
}

impl PreparedCommand {
    pub fn discard_lists(self) {
        for list in self.lists {
            list.discard();
        }
    }

    pub fn retain_lists(self) -> Vec<PathBuf> {
        self.lists.into_iter().filter_map(FileList::retain).collect()
    }
}

fn base_invocation(temp_dir: Option<&Path>) -> Invocation {
    let inv = Invocation::new(RDIFF_BACKUP).arg("-v5");
    match temp_dir {
        Some(dir) => inv.arg("--tempdir").arg(dir),
        None => inv,
    }
}

pub fn backup_command(spec: &BackupJobSpec, style: PathStyle) -> Result<PreparedCommand> {
    let base = spec.source.display().to_string();
    let mut inv = spec.target.schema(base_invocation(spec.temp_dir.as_deref()));
    let mut lists = Vec::new();

    // Include list first: rdiff-backup takes the first matching selection.
    if !spec.includes.is_empty() {
        let quoted = spec.includes.iter().map(|p| quote(style, &base, p));
        let list = FileList::write("rdiffvault-include-", quoted)?;
        inv = inv.arg("--include-globbing-filelist").arg(list.path());
        lists.push(list);
    }
    let excludes = spec.effective_excludes();
    if !excludes.is_empty() {
        let quoted = excludes.iter().map(|p| quote(style, &base, p));
        let list = FileList::write("rdiffvault-exclude-", quoted)?;
        inv = inv.arg("--exclude-globbing-filelist").arg(list.path());
        lists.push(list);
    }

    inv = inv.args(spec.exclusions.flags());
    if let Some(min) = spec.min_file_size {
        inv = inv.arg("--min-file-size").arg(min.to_string());
    }
    if let Some(max) = spec.max_file_size {
        inv = inv.arg("--max-file-size").arg(max.to_string());
    }
    if !spec.compression {
        inv = inv.arg("--no-compression");
    }
    inv = inv.arg(&spec.source);
    inv = spec.target.push(inv);
    Ok(PreparedCommand {
        invocation: inv,
        lists,
    })
}

#[derive(Debug, Clone)]
pub struct RestoreRequest {
    /// rdiff-backup time token, `now` for the current mirror.
    pub increment: String,
    /// Paths relative to the repository root; empty restores everything.
    pub selection: Vec<PathBuf>,
    pub restore_dir: PathBuf,
}

impl RestoreRequest {
    pub fn is_entire_backup(&self) -> bool {
        self.selection.is_empty()
            || self.selection.iter().any(|p| {
                p.as_os_str().is_empty() || p == Path::new(".") || p == Path::new("/")
            })
    }
}

pub fn restore_command(
    backup: &Target,
    request: &RestoreRequest,
    temp_dir: Option<&Path>,
    style: PathStyle,
) -> Result<PreparedCommand> {
    let mut inv = backup
        .schema(base_invocation(temp_dir))
        .arg("--force")
        .arg("-r")
        .arg(&request.increment);
    let mut lists = Vec::new();

    if !request.is_entire_backup() {
        let base = request.restore_dir.display().to_string();
        let includes: Vec<String> = request
            .selection
            .iter()
            .map(|rel| {
                let rel = rel.strip_prefix("/").unwrap_or(rel);
                quote(style, &base, &request.restore_dir.join(rel).display().to_string())
            })
            .collect();
        let catch_all = quote(style, &base, &format!("{}/**", base.trim_end_matches('/')));
        let include_list = FileList::write("rdiffvault-restore-include-", &includes)?;
        let exclude_list = FileList::write("rdiffvault-restore-exclude-", [catch_all])?;
        inv = inv
            .arg("--include-globbing-filelist")
            .arg(include_list.path())
            .arg("--exclude-globbing-filelist")
            .arg(exclude_list.path());
        lists.push(include_list);
        lists.push(exclude_list);
    }

    inv = backup.push(inv).arg(&request.restore_dir);
    Ok(PreparedCommand {
        invocation: inv,
        lists,
    })
}

pub fn prune_command(target: &Target, token: &str) -> Invocation {
    let inv = target
        .schema(Invocation::new(RDIFF_BACKUP))
        .arg("--force")
        .arg("--remove-older-than")
        .arg(token);
    target.push(inv)
}

pub fn version_command() -> Invocation {
    Invocation::new(RDIFF_BACKUP).arg("--version")
}

pub fn test_server_command(remote: &RemoteSpec) -> Invocation {
    Invocation::new(RDIFF_BACKUP)
        .arg("--remote-schema")
        .arg(remote.remote_schema())
        .arg("--test-server")
        .arg(remote.rdiff_target())
}

pub fn list_increments_command(target: &Target) -> Invocation {
    let inv = target
        .schema(Invocation::new(RDIFF_BACKUP))
        .arg("--parsable-output")
        .arg("--list-increments");
    target.push(inv)
}
