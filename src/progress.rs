//! Turns the stdout of rdiff-backup and rsync into progress events.
//!
//! Lines are parsed one at a time in arrival order; nothing is buffered
//! beyond the running file counter.

use std::sync::OnceLock;

use regex::Regex;
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgressEvent {
    CurrentFile(String),
    FileCount(u64),
    OverallPercent(u8),
    FileBytesPercent(u8),
    Counting(u64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Grammar {
    RdiffBackup,
    Rsync,
}

const RDIFF_CHANGED: &str = "Processing changed file ";
const RDIFF_PATCH: &str = "Applying patch ";

const RSYNC_SUPPRESSED: &[&str] = &[
    "sent ",
    "total size is ",
    "rsync error: received",
    "sending incremental file list",
    "receiving incremental file list",
    "building file list",
];

fn overall_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"to-ch(?:ec)?k=(\d+)/(\d+)\)$").expect("valid regex"))
}

fn file_percent_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\s(\d+)%\s+\S+/s\s+\S+").expect("valid regex"))
}

fn counting_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^\s*(\d+) files(?: to consider|\.\.\.)").expect("valid regex")
    })
}

/// Stateful line parser; the only state is the file counter.
#[derive(Debug, Clone)]
pub struct OutputParser {
    grammar: Grammar,
    files: u64,
}

impl OutputParser {
    pub fn new(grammar: Grammar) -> Self {
        Self { grammar, files: 0 }
    }

    pub fn file_count(&self) -> u64 {
        self.files
    }

    pub fn parse_line(&mut self, line: &str) -> Vec<ProgressEvent> {
        match self.grammar {
            Grammar::RdiffBackup => self.parse_rdiff(line),
            // rsync redraws its progress line with carriage returns.
            Grammar::Rsync => line
                .split('\r')
                .filter(|segment| !segment.trim().is_empty())
                .flat_map(|segment| self.parse_rsync(segment))
                .collect(),
        }
    }

    fn next_file(&mut self, name: &str) -> Vec<ProgressEvent> {
        self.files += 1;
        vec![
            ProgressEvent::CurrentFile(name.to_string()),
            ProgressEvent::FileCount(self.files),
        ]
    }

    fn parse_rdiff(&mut self, line: &str) -> Vec<ProgressEvent> {
        if let Some(rest) = line.strip_prefix(RDIFF_CHANGED) {
            return self.next_file(rest);
        }
        if let Some(rest) = line.strip_prefix(RDIFF_PATCH) {
            return vec![ProgressEvent::CurrentFile(rest.to_string())];
        }
        Vec::new()
    }

    fn parse_rsync(&mut self, line: &str) -> Vec<ProgressEvent> {
        let trimmed = line.trim_start();
        if RSYNC_SUPPRESSED.iter().any(|p| trimmed.starts_with(p)) {
            return Vec::new();
        }
        if let Some(caps) = overall_re().captures(line.trim_end()) {
            let todo = parse_number(&caps[1]);
            let total = parse_number(&caps[2]);
            return match (todo, total) {
                (Some(todo), Some(total)) if total > 0 && todo <= total => {
                    let percent = (total - todo) * 100 / total;
                    vec![ProgressEvent::OverallPercent(percent as u8)]
                }
                _ => {
                    warn!("ignoring rsync progress line: {}", line.trim());
                    Vec::new()
                }
            };
        }
        if let Some(caps) = file_percent_re().captures(line) {
            return match parse_number(&caps[1]).filter(|p| *p <= 100) {
                Some(percent) => vec![ProgressEvent::FileBytesPercent(percent as u8)],
                None => {
                    warn!("ignoring rsync percentage: {}", line.trim());
                    Vec::new()
                }
            };
        }
        if let Some(caps) = counting_re().captures(line) {
            return parse_number(&caps[1])
                .map(|n| vec![ProgressEvent::Counting(n)])
                .unwrap_or_default();
        }
        self.next_file(line.trim_end())
    }
}

fn parse_number(text: &str) -> Option<u64> {
    match text.parse() {
        Ok(n) => Some(n),
        Err(err) => {
            warn!("malformed number {:?} in tool output: {}", text, err);
            None
        }
    }
}

/// Latest known values, sampled by whoever renders progress.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProgressSnapshot {
    pub current_file: Option<String>,
    pub file_count: u64,
    pub overall_percent: Option<u8>,
    pub file_percent: Option<u8>,
    pub counting: Option<u64>,
}

impl ProgressSnapshot {
    pub fn apply(&mut self, event: ProgressEvent) {
        match event {
            ProgressEvent::CurrentFile(name) => {
                self.current_file = Some(name);
                self.file_percent = None;
            }
            ProgressEvent::FileCount(n) => self.file_count = n,
            ProgressEvent::OverallPercent(p) => self.overall_percent = Some(p),
            ProgressEvent::FileBytesPercent(p) => self.file_percent = Some(p),
            ProgressEvent::Counting(n) => self.counting = Some(n),
        }
    }

    pub fn summary(&self) -> String {
        let mut parts = vec![format!("{} file(s)", self.file_count)];
        if let Some(p) = self.overall_percent {
            parts.push(format!("{}%", p));
        }
        if let Some(name) = &self.current_file {
            match self.file_percent {
                Some(p) => parts.push(format!("{} ({}%)", name, p)),
                None => parts.push(name.clone()),
            }
        }
        parts.join(" | ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rdiff_changed_files_increment_counter() {
        let mut parser = OutputParser::new(Grammar::RdiffBackup);
        assert_eq!(
            parser.parse_line("Processing changed file docs/a.txt"),
            vec![
                ProgressEvent::CurrentFile("docs/a.txt".into()),
                ProgressEvent::FileCount(1)
            ]
        );
        assert_eq!(
            parser.parse_line("Applying patch docs/b.txt"),
            vec![ProgressEvent::CurrentFile("docs/b.txt".into())]
        );
        assert!(parser.parse_line("Starting increment operation").is_empty());
        parser.parse_line("Processing changed file docs/c.txt");
        assert_eq!(parser.file_count(), 2);
    }

    #[test]
    fn rsync_summary_lines_are_suppressed() {
        let mut parser = OutputParser::new(Grammar::Rsync);
        for line in [
            "sent 1,234 bytes  received 56 bytes  2,580.00 bytes/sec",
            "total size is 1,178  speedup is 0.91",
            "rsync error: received SIGINT, SIGTERM, or SIGHUP (code 20)",
            "sending incremental file list",
            "",
        ] {
            assert!(parser.parse_line(line).is_empty(), "{line}");
        }
        assert_eq!(parser.file_count(), 0);
    }

    #[test]
    fn rsync_overall_progress_accepts_both_spellings() {
        let mut parser = OutputParser::new(Grammar::Rsync);
        assert_eq!(
            parser.parse_line("      1,024 100%  1.00MB/s    0:00:00 (xfer#3, to-check=25/100)"),
            vec![ProgressEvent::OverallPercent(75)]
        );
        assert_eq!(
            parser.parse_line("      1,024 100%  1.00MB/s    0:00:00 (xfr#3, to-chk=0/4)"),
            vec![ProgressEvent::OverallPercent(100)]
        );
    }

    #[test]
    fn rsync_zero_total_is_dropped() {
        let mut parser = OutputParser::new(Grammar::Rsync);
        assert!(parser.parse_line(" 0 100% 0.00kB/s 0:00:00 (xfr#0, to-chk=0/0)").is_empty());
    }

    #[test]
    fn rsync_file_percent_and_names() {
        let mut parser = OutputParser::new(Grammar::Rsync);
        assert_eq!(
            parser.parse_line("photos/2009/img_001.jpg"),
            vec![
                ProgressEvent::CurrentFile("photos/2009/img_001.jpg".into()),
                ProgressEvent::FileCount(1)
            ]
        );
        assert_eq!(
            parser.parse_line("     32,768  42%   31.25MB/s    0:00:03"),
            vec![ProgressEvent::FileBytesPercent(42)]
        );
    }

    #[test]
    fn rsync_carriage_return_updates_are_split() {
        let mut parser = OutputParser::new(Grammar::Rsync);
        let events =
            parser.parse_line("  1,024  10%  1.00MB/s  0:00:09\r  5,120  50%  1.00MB/s  0:00:05");
        assert_eq!(
            events,
            vec![
                ProgressEvent::FileBytesPercent(10),
                ProgressEvent::FileBytesPercent(50)
            ]
        );
    }

    #[test]
    fn rsync_counting_lines() {
        let mut parser = OutputParser::new(Grammar::Rsync);
        assert_eq!(
            parser.parse_line("     1200 files..."),
            vec![ProgressEvent::Counting(1200)]
        );
        assert_eq!(parser.file_count(), 0);
    }

    #[test]
    fn malformed_numbers_are_dropped() {
        let mut parser = OutputParser::new(Grammar::Rsync);
        let huge = "99999999999999999999999";
        let line = format!(" 1 100% 1.00MB/s 0:00:00 (xfr#1, to-chk={huge}/{huge})");
        assert!(parser.parse_line(&line).is_empty());
    }

    #[test]
    fn snapshot_keeps_latest_values() {
        let mut snapshot = ProgressSnapshot::default();
        snapshot.apply(ProgressEvent::CurrentFile("a".into()));
        snapshot.apply(ProgressEvent::FileBytesPercent(30));
        snapshot.apply(ProgressEvent::FileCount(1));
        snapshot.apply(ProgressEvent::OverallPercent(5));
        assert_eq!(snapshot.summary(), "1 file(s) | 5% | a (30%)");
        snapshot.apply(ProgressEvent::CurrentFile("b".into()));
        assert_eq!(snapshot.file_percent, None);
    }
}
