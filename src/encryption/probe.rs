use std::fs::{self, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info};
use walkdir::WalkDir;

use crate::error::{Result, VaultError};
use crate::util::command::CancelToken;

/// Upper bound for the file name length search; always assumed to fail.
pub const MAX_PROBE_LENGTH: usize = 32768;

/// Share of the filesystem that may be in use once the copy is done.
pub const USAGE_LIMIT_PERCENT: u64 = 95;

pub trait NameProbe {
    /// Whether a file name of `len` bytes can be created.
    fn try_length(&mut self, len: usize) -> bool;
}

/// Probes by creating and removing files in a directory.
pub struct DirProbe {
    dir: PathBuf,
}

impl DirProbe {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

impl NameProbe for DirProbe {
    fn try_length(&mut self, len: usize) -> bool {
        if len == 0 {
            return true;
        }
        let path = self.dir.join("x".repeat(len));
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(_) => {
                let _ = fs::remove_file(&path);
                true
            }
            Err(_) => false,
        }
    }
}

/// Bisects between a length that works (0) and one that does not
/// (`MAX_PROBE_LENGTH`) until they are adjacent.
pub fn probe_max_filename_length(probe: &mut dyn NameProbe) -> usize {
    let mut good = 0;
    let mut bad = MAX_PROBE_LENGTH;
    while bad - good > 1 {
        let mid = good + (bad - good) / 2;
        if probe.try_length(mid) {
            good = mid;
        } else {
            bad = mid;
        }
    }
    debug!("maximum file name length is {}", good);
    good
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Survey {
    pub total_bytes: u64,
    pub files: u64,
    /// First entry whose name is longer than the probed limit.
    pub too_long: Option<PathBuf>,
}

/// Walks `root` summing file sizes. Entries named in `skip` (directly below
/// `root`) are left out.
pub fn survey(root: &Path, max_name: usize, skip: &[&str], cancel: &CancelToken) -> Result<Survey> {
    let mut out = Survey::default();
    let walker = WalkDir::new(root).min_depth(1).into_iter().filter_entry(|entry| {
        !(entry.depth() == 1
            && skip
                .iter()
                .any(|name| entry.file_name().to_string_lossy() == *name))
    });
    for entry in walker {
        cancel.check()?;
        let entry = entry.map_err(|e| VaultError::message(format!("survey {}: {}", root.display(), e)))?;
        if out.too_long.is_none() && entry.file_name().len() > max_name {
            out.too_long = Some(entry.path().to_path_buf());
        }
        if entry.file_type().is_file() {
            let meta = entry
                .metadata()
                .map_err(|e| VaultError::message(format!("stat {}: {}", entry.path().display(), e)))?;
            out.total_bytes = out.total_bytes.saturating_add(meta.len());
            out.files += 1;
        }
    }
    info!(
        "{}: {} file(s), {} byte(s)",
        root.display(),
        out.files,
        out.total_bytes
    );
    Ok(out)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capacity {
    pub total: u64,
    pub available: u64,
}

pub type CapacityFn = Arc<dyn Fn(&Path) -> io::Result<Capacity> + Send + Sync>;

pub fn fs_capacity(path: &Path) -> io::Result<Capacity> {
    Ok(Capacity {
        total: fs2::total_space(path)?,
        available: fs2::available_space(path)?,
    })
}

pub fn system_capacity() -> CapacityFn {
    Arc::new(fs_capacity)
}

/// Fails when writing `required` more bytes would push usage past
/// `USAGE_LIMIT_PERCENT` of the filesystem.
pub fn check_capacity(required: u64, capacity: Capacity) -> Result<()> {
    let used = capacity.total.saturating_sub(capacity.available);
    let projected = used.saturating_add(required);
    let limit = capacity.total / 100 * USAGE_LIMIT_PERCENT;
    if projected > limit {
        return Err(VaultError::precondition(format!(
            "not enough space: {} byte(s) needed, {} of {} byte(s) in use, limit {}",
            required, used, capacity.total, limit
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    struct LimitProbe {
        limit: usize,
        calls: usize,
        reported_failure: Vec<usize>,
    }

    impl NameProbe for LimitProbe {
        fn try_length(&mut self, len: usize) -> bool {
            self.calls += 1;
            let ok = len <= self.limit;
            if !ok {
                self.reported_failure.push(len);
            }
            ok
        }
    }

    #[test]
    fn bisection_converges_on_the_limit() {
        for limit in [1, 143, 255, 1024, MAX_PROBE_LENGTH - 1] {
            let mut probe = LimitProbe {
                limit,
                calls: 0,
                reported_failure: Vec::new(),
            };
            let found = probe_max_filename_length(&mut probe);
            assert_eq!(found, limit);
            assert!(probe.calls <= 15, "{} calls for {}", probe.calls, limit);
            assert!(probe.reported_failure.iter().all(|len| *len > found));
        }
    }

    #[test]
    fn dir_probe_finds_a_real_limit() {
        let dir = tempfile::tempdir().expect("tempdir");
        let found = probe_max_filename_length(&mut DirProbe::new(dir.path()));
        assert!(found > 0 && found < MAX_PROBE_LENGTH);
        assert!(DirProbe::new(dir.path()).try_length(found));
        assert!(!DirProbe::new(dir.path()).try_length(found + 1));
        assert_eq!(fs::read_dir(dir.path()).expect("list").count(), 0);
    }

    #[test]
    fn survey_sums_sizes_and_flags_long_names() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::create_dir_all(dir.path().join("docs")).expect("mkdir");
        fs::write(dir.path().join("docs/a.txt"), vec![0u8; 100]).expect("write");
        fs::write(dir.path().join("a-rather-long-name.bin"), vec![0u8; 50]).expect("write");
        fs::create_dir_all(dir.path().join(".staging")).expect("mkdir");
        fs::write(dir.path().join(".staging/ignored"), vec![0u8; 999]).expect("write");

        let result = survey(dir.path(), 10, &[".staging"], &CancelToken::new()).expect("survey");
        assert_eq!(result.total_bytes, 150);
        assert_eq!(result.files, 2);
        assert_eq!(
            result.too_long,
            Some(dir.path().join("a-rather-long-name.bin"))
        );
    }

    #[test]
    fn survey_stops_when_cancelled() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(dir.path().join("a"), "x").expect("write");
        let cancel = CancelToken::new();
        cancel.cancel();
        assert!(matches!(
            survey(dir.path(), 255, &[], &cancel),
            Err(VaultError::Cancelled)
        ));
    }

    #[test]
    fn capacity_margin_is_enforced() {
        let cap = Capacity {
            total: 1000,
            available: 500,
        };
        assert!(check_capacity(450, cap).is_ok());
        assert!(check_capacity(451, cap).is_err());
    }
}
