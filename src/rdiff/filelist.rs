use std::io::Write;
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;
use tracing::{debug, warn};

use crate::error::Result;

/// A pattern list written to a fresh temporary file for one invocation.
#[derive(Debug)]
pub struct FileList {
    file: NamedTempFile,
}

impl FileList {
    pub fn write<I, S>(prefix: &str, patterns: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut file = tempfile::Builder::new()
            .prefix(prefix)
            .suffix(".list")
            .tempfile()?;
        for pattern in patterns {
            writeln!(file, "{}", pattern.as_ref())?;
        }
        file.flush()?;
        debug!("wrote file list {}", file.path().display());
        Ok(Self { file })
    }

    pub fn path(&self) -> &Path {
        self.file.path()
    }

    pub fn discard(self) {
        let path = self.file.path().to_path_buf();
        if let Err(err) = self.file.close() {
            warn!("remove {}: {}", path.display(), err);
        }
    }

    /// Keeps the file on disk and returns where it lives.
    pub fn retain(self) -> Option<PathBuf> {
        match self.file.keep() {
            Ok((_, path)) => Some(path),
            Err(err) => {
                warn!("keep file list: {}", err);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn writes_one_pattern_per_line() {
        let list = FileList::write("rdiffvault-include-", ["/home/ann/a", "/home/ann/b/**"])
            .expect("write");
        let text = fs::read_to_string(list.path()).expect("read");
        assert_eq!(text, "/home/ann/a\n/home/ann/b/**\n");
        let path = list.path().to_path_buf();
        list.discard();
        assert!(!path.exists());
    }

    #[test]
    fn retained_lists_survive() {
        let list = FileList::write("rdiffvault-exclude-", ["x"]).expect("write");
        let path = list.retain().expect("kept");
        assert!(path.exists());
        fs::remove_file(path).expect("cleanup");
    }
}
