//! Increment history of an rdiff-backup repository.

use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::{Result, VaultError};
use crate::rdiff::command::{list_increments_command, Target};
use crate::util::command::Shell;

pub const DATA_DIR: &str = "rdiff-backup-data";
const SESSION_PREFIX: &str = "session_statistics.";
const MIRROR_PREFIX: &str = "current_mirror.";
const DATA_SUFFIX: &str = ".data";

/// One restorable point in time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Increment {
    /// Time string exactly as rdiff-backup accepts it back.
    pub timestamp: String,
    pub start_time: i64,
    pub size: u64,
    /// Timestamp of the next younger increment; `None` for the current
    /// mirror.
    pub younger: Option<String>,
}

pub trait IncrementReader: Send + Sync {
    /// Increments newest first; index 0 is the current mirror.
    fn read(&self) -> Result<Vec<Increment>>;
}

#[derive(Debug, Clone, PartialEq)]
struct Session {
    timestamp: String,
    start_time: i64,
    mirror_size: u64,
    increment_size: u64,
}

/// Links sessions sorted newest first into increments. A session's
/// increment files hold the reverse diff to the previous snapshot, so every
/// older snapshot is sized by the session that superseded it.
fn link_sessions(mut sessions: Vec<Session>) -> Vec<Increment> {
    sessions.sort_by(|a, b| b.start_time.cmp(&a.start_time));
    let mut out: Vec<Increment> = Vec::with_capacity(sessions.len());
    for (index, session) in sessions.iter().enumerate() {
        let size = if index == 0 {
            session.mirror_size
        } else {
            sessions[index - 1].increment_size
        };
        out.push(Increment {
            timestamp: session.timestamp.clone(),
            start_time: session.start_time,
            size,
            younger: out.last().map(|younger| younger.timestamp.clone()),
        });
    }
    out
}

fn parse_session(timestamp: &str, contents: &str) -> Option<Session> {
    let mut start_time = None;
    let mut mirror_size = 0;
    let mut increment_size = 0;
    for line in contents.lines() {
        let mut fields = line.split_whitespace();
        let key = fields.next().unwrap_or("");
        let value = fields.next().unwrap_or("");
        match key {
            "StartTime" => start_time = value.parse::<f64>().ok().map(|v| v as i64),
            "MirrorFileSize" => mirror_size = value.parse().unwrap_or(0),
            "IncrementFileSize" => increment_size = value.parse().unwrap_or(0),
            _ => {}
        }
    }
    Some(Session {
        timestamp: timestamp.to_string(),
        start_time: start_time?,
        mirror_size,
        increment_size,
    })
}

/// Reads `rdiff-backup-data/session_statistics.*.data` of a local repository.
#[derive(Debug, Clone)]
pub struct MetadataReader {
    repo: PathBuf,
}

impl MetadataReader {
    pub fn new(repo: impl Into<PathBuf>) -> Self {
        Self { repo: repo.into() }
    }

    fn sessions(&self) -> Result<Vec<Session>> {
        let data_dir = self.repo.join(DATA_DIR);
        let entries = fs::read_dir(&data_dir).map_err(|e| {
            VaultError::message(format!("read {}: {}", data_dir.display(), e))
        })?;
        let mut sessions = Vec::new();
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            let Some(timestamp) = name
                .strip_prefix(SESSION_PREFIX)
                .and_then(|rest| rest.strip_suffix(DATA_SUFFIX))
            else {
                continue;
            };
            let contents = fs::read_to_string(entry.path())?;
            match parse_session(timestamp, &contents) {
                Some(session) => sessions.push(session),
                None => warn!("skipping {}: no StartTime", name),
            }
        }
        Ok(sessions)
    }
}

impl IncrementReader for MetadataReader {
    fn read(&self) -> Result<Vec<Increment>> {
        let increments = link_sessions(self.sessions()?);
        debug!(
            "{} increment(s) in {}",
            increments.len(),
            self.repo.display()
        );
        Ok(increments)
    }
}

/// Asks a remote rdiff-backup for its increment times. Sizes are unknown
/// over this channel and reported as zero.
pub struct RemoteListReader {
    shell: Arc<dyn Shell>,
    target: Target,
}

impl RemoteListReader {
    pub fn new(shell: Arc<dyn Shell>, target: Target) -> Self {
        Self { shell, target }
    }
}

impl IncrementReader for RemoteListReader {
    fn read(&self) -> Result<Vec<Increment>> {
        let inv = list_increments_command(&self.target);
        let out = self.shell.run(&inv)?.check(&inv)?;
        Ok(parse_parsable_listing(&out.stdout))
    }
}

/// Parses `--parsable-output --list-increments`: `<epoch> <type>` per line,
/// oldest first, the last line being the mirror.
pub fn parse_parsable_listing(text: &str) -> Vec<Increment> {
    let sessions = text
        .lines()
        .filter_map(|line| {
            let epoch = line.split_whitespace().next()?.parse::<i64>().ok()?;
            Some(Session {
                timestamp: epoch.to_string(),
                start_time: epoch,
                mirror_size: 0,
                increment_size: 0,
            })
        })
        .collect();
    link_sessions(sessions)
}

/// Open view on a repository's metadata, kept for browsing restore points.
/// Holds a handle inside the repository, so it must be closed before the
/// filesystem underneath is unmounted.
#[derive(Debug)]
pub struct IncrementCatalog {
    repo: PathBuf,
    increments: Vec<Increment>,
    _handle: Option<File>,
}

impl IncrementCatalog {
    pub fn open(repo: &Path) -> Result<Self> {
        let increments = MetadataReader::new(repo).read()?;
        let handle = current_mirror_marker(repo).and_then(|path| File::open(path).ok());
        Ok(Self {
            repo: repo.to_path_buf(),
            increments,
            _handle: handle,
        })
    }

    pub fn repo(&self) -> &Path {
        &self.repo
    }

    pub fn increments(&self) -> &[Increment] {
        &self.increments
    }

    pub fn close(self) {
        debug!("closing catalog for {}", self.repo.display());
    }
}

fn current_mirror_marker(repo: &Path) -> Option<PathBuf> {
    let data_dir = repo.join(DATA_DIR);
    fs::read_dir(&data_dir)
        .ok()?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .find(|path| {
            path.file_name()
                .map(|n| n.to_string_lossy().starts_with(MIRROR_PREFIX))
                .unwrap_or(false)
        })
}
