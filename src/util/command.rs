use std::cell::Cell;
use std::collections::VecDeque;
use std::ffi::OsString;
use std::io::{BufRead, BufReader, Read, Write};
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{unbounded, RecvTimeoutError};
use tracing::{debug, info};

use crate::error::{Result, VaultError};
use crate::types::{RunMode, Secret};

const STDERR_TAIL_BYTES: usize = 16 * 1024;
const CANCEL_POLL: Duration = Duration::from_millis(100);

thread_local! {
    static REDACT_DEPTH: Cell<u32> = const { Cell::new(0) };
}

/// Suppresses argument and stderr logging on the current thread while alive.
pub struct RedactGuard {
    _private: (),
}

impl RedactGuard {
    pub fn new() -> Self {
        REDACT_DEPTH.with(|depth| depth.set(depth.get() + 1));
        Self { _private: () }
    }

    fn optional(enabled: bool) -> Option<Self> {
        if enabled {
            Some(Self::new())
        } else {
            None
        }
    }
}

impl Default for RedactGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for RedactGuard {
    fn drop(&mut self) {
        REDACT_DEPTH.with(|depth| depth.set(depth.get().saturating_sub(1)));
    }
}

pub fn redacting() -> bool {
    REDACT_DEPTH.with(|depth| depth.get() > 0)
}

/// A fully described external command.
#[derive(Debug, Clone, Default)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<OsString>,
    pub env: Vec<(String, Secret)>,
    pub stdin: Option<Secret>,
    pub sensitive: bool,
}

impl Invocation {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Self::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Secret environment variables mark the invocation sensitive.
    pub fn secret_env(mut self, key: impl Into<String>, value: Secret) -> Self {
        self.env.push((key.into(), value));
        self.sensitive = true;
        self
    }

    /// Secret stdin marks the invocation sensitive.
    pub fn stdin(mut self, input: Secret) -> Self {
        self.stdin = Some(input);
        self.sensitive = true;
        self
    }

    pub fn sensitive(mut self) -> Self {
        self.sensitive = true;
        self
    }

    pub fn arg_strings(&self) -> Vec<String> {
        self.args
            .iter()
            .map(|a| a.to_string_lossy().to_string())
            .collect()
    }

    /// Command line as it may appear in logs.
    pub fn display(&self) -> String {
        if self.sensitive || redacting() {
            return format!("{} <redacted>", self.program);
        }
        let args = self.arg_strings();
        if args.is_empty() {
            self.program.clone()
        } else {
            format!("{} {}", self.program, args.join(" "))
        }
    }

    fn to_command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        for (key, value) in &self.env {
            cmd.env(key, value.expose());
        }
        cmd
    }
}

#[derive(Debug, Clone, Default)]
pub struct Output {
    pub code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl Output {
    pub fn success(&self) -> bool {
        self.code == 0
    }

    /// Converts a non-zero exit into a tool error carrying stderr.
    pub fn check(self, inv: &Invocation) -> Result<Output> {
        if self.success() {
            return Ok(self);
        }
        let stderr = if inv.sensitive || self.stderr.trim().is_empty() {
            None
        } else {
            Some(self.stderr.clone())
        };
        Err(VaultError::tool(&inv.program, self.code, stderr))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Exit {
    Code { code: i32, stderr: String },
    Cancelled,
}

impl Exit {
    pub fn success(&self) -> bool {
        matches!(self, Exit::Code { code: 0, .. })
    }

    pub fn into_result(self, inv: &Invocation) -> Result<()> {
        match self {
            Exit::Code { code: 0, .. } => Ok(()),
            Exit::Code { code, stderr } => {
                let stderr = if inv.sensitive || stderr.trim().is_empty() {
                    None
                } else {
                    Some(stderr)
                };
                Err(VaultError::tool(&inv.program, code, stderr))
            }
            Exit::Cancelled => Err(VaultError::Cancelled),
        }
    }
}

/// Shared cancellation flag for one background task.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(VaultError::Cancelled)
        } else {
            Ok(())
        }
    }
}

pub trait Shell: Send + Sync {
    /// Runs a short command to completion and captures its output.
    fn run(&self, inv: &Invocation) -> Result<Output>;

    /// Runs a long command, handing each stdout line to `sink` in arrival
    /// order. Kills the child once `cancel` is set.
    fn stream(
        &self,
        inv: &Invocation,
        sink: &mut dyn FnMut(&str),
        cancel: &CancelToken,
    ) -> Result<Exit>;
}

/// Runs commands on the host with `std::process`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemShell {
    pub run_mode: RunMode,
}

impl SystemShell {
    pub fn new(run_mode: RunMode) -> Self {
        Self { run_mode }
    }

    fn announce(&self, inv: &Invocation) {
        if self.run_mode.dry_run {
            println!("dry-run: {}", inv.display());
        } else if self.run_mode.verbose {
            info!("exec: {}", inv.display());
        } else {
            debug!("exec: {}", inv.display());
        }
    }

    fn spawn(&self, inv: &Invocation, stdout: Stdio) -> Result<Child> {
        let mut cmd = inv.to_command();
        cmd.stdout(stdout).stderr(Stdio::piped());
        cmd.stdin(if inv.stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });
        let mut child = cmd
            .spawn()
            .map_err(|e| VaultError::message(format!("{}: {}", inv.program, e)))?;
        if let Some(input) = &inv.stdin {
            if let Some(mut pipe) = child.stdin.take() {
                let mut payload = input.expose().to_string();
                if !payload.ends_with('\n') {
                    payload.push('\n');
                }
                let written = pipe.write_all(payload.as_bytes());
                zeroize::Zeroize::zeroize(&mut payload);
                written?;
            }
        }
        Ok(child)
    }
}

impl Shell for SystemShell {
    fn run(&self, inv: &Invocation) -> Result<Output> {
        let _redact = RedactGuard::optional(inv.sensitive);
        self.announce(inv);
        if self.run_mode.dry_run {
            return Ok(Output::default());
        }
        let child = self.spawn(inv, Stdio::piped())?;
        let output = child.wait_with_output()?;
        let out = Output {
            code: output.status.code().unwrap_or(1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        };
        if !out.success() && !redacting() {
            debug!("{} stderr: {}", inv.program, out.stderr.trim());
        }
        Ok(out)
    }

    fn stream(
        &self,
        inv: &Invocation,
        sink: &mut dyn FnMut(&str),
        cancel: &CancelToken,
    ) -> Result<Exit> {
        let _redact = RedactGuard::optional(inv.sensitive);
        self.announce(inv);
        if self.run_mode.dry_run {
            return Ok(Exit::Code {
                code: 0,
                stderr: String::new(),
            });
        }
        let mut child = self.spawn(inv, Stdio::piped())?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| VaultError::message(format!("{}: no stdout pipe", inv.program)))?;
        let stderr = child.stderr.take();

        let (line_tx, line_rx) = unbounded::<String>();
        let reader = thread::spawn(move || {
            // Drain to EOF even once nobody listens; a closed pipe would
            // kill the child with SIGPIPE.
            let mut listening = true;
            let drained = for_each_record(stdout, |record| {
                if listening && line_tx.send(record).is_err() {
                    listening = false;
                }
            });
            if let Err(err) = drained {
                debug!("stdout reader stopped: {}", err);
            }
        });
        let stderr_reader = thread::spawn(move || stderr.map(read_tail).unwrap_or_default());

        let mut drained = false;
        let status = loop {
            if drained {
                if let Some(status) = child.try_wait()? {
                    break status;
                }
                thread::sleep(CANCEL_POLL);
            } else {
                match line_rx.recv_timeout(CANCEL_POLL) {
                    Ok(line) => sink(&line),
                    Err(RecvTimeoutError::Timeout) => {}
                    Err(RecvTimeoutError::Disconnected) => drained = true,
                }
            }
            if cancel.is_cancelled() {
                info!("cancelling {}", inv.program);
                let _ = child.kill();
                // Grandchildren may still hold the pipes; the reader threads
                // are left to finish on their own.
                let _ = child.wait();
                return Ok(Exit::Cancelled);
            }
        };
        let _ = reader.join();
        let stderr = stderr_reader.join().unwrap_or_default();
        let code = status.code().unwrap_or(1);
        if code != 0 && !redacting() {
            debug!("{} stderr: {}", inv.program, stderr.trim());
        }
        Ok(Exit::Code { code, stderr })
    }
}

/// Splits a byte stream on `\n` or `\r` and hands each non-empty record
/// over as lossy UTF-8. rsync redraws its progress line with `\r`, so a
/// bare carriage return ends a record too.
fn for_each_record<R: Read>(reader: R, mut emit: impl FnMut(String)) -> std::io::Result<()> {
    let mut reader = BufReader::new(reader);
    let mut record = Vec::new();
    loop {
        let buf = match reader.fill_buf() {
            Ok(buf) => buf,
            Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        };
        if buf.is_empty() {
            break;
        }
        for &byte in buf {
            if byte == b'\n' || byte == b'\r' {
                if !record.is_empty() {
                    emit(String::from_utf8_lossy(&record).into_owned());
                    record.clear();
                }
            } else {
                record.push(byte);
            }
        }
        let len = buf.len();
        reader.consume(len);
    }
    if !record.is_empty() {
        emit(String::from_utf8_lossy(&record).into_owned());
    }
    Ok(())
}

/// Keeps only the last `STDERR_TAIL_BYTES` of a stream.
fn read_tail<R: Read>(reader: R) -> String {
    let mut tail: VecDeque<u8> = VecDeque::with_capacity(STDERR_TAIL_BYTES);
    for byte in BufReader::new(reader).bytes() {
        let Ok(byte) = byte else { break };
        if tail.len() == STDERR_TAIL_BYTES {
            tail.pop_front();
        }
        tail.push_back(byte);
    }
    let bytes: Vec<u8> = tail.into_iter().collect();
    String::from_utf8_lossy(&bytes).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sensitive_invocations_hide_arguments() {
        let inv = Invocation::new("sshfs")
            .arg("user@host:/srv")
            .stdin(Secret::new("pw"));
        assert_eq!(inv.display(), "sshfs <redacted>");

        let plain = Invocation::new("rsync").args(["-a", "/a/", "/b/"]);
        assert_eq!(plain.display(), "rsync -a /a/ /b/");
    }

    #[test]
    fn redact_guard_is_scoped() {
        let plain = Invocation::new("umount").arg("/mnt/x");
        {
            let _guard = RedactGuard::new();
            assert!(redacting());
            assert_eq!(plain.display(), "umount <redacted>");
        }
        assert!(!redacting());
        assert_eq!(plain.display(), "umount /mnt/x");
    }

    #[test]
    fn redact_guard_does_not_leak_across_threads() {
        let _guard = RedactGuard::new();
        let other = thread::spawn(redacting).join().expect("join");
        assert!(!other);
    }

    #[test]
    fn failed_sensitive_output_drops_stderr() {
        let inv = Invocation::new("encfs").stdin(Secret::new("pw"));
        let out = Output {
            code: 1,
            stdout: String::new(),
            stderr: "Error decoding volume key, password incorrect".into(),
        };
        match out.check(&inv) {
            Err(VaultError::Tool { stderr, .. }) => assert!(stderr.is_none()),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn read_tail_keeps_last_bytes() {
        let data = vec![b'x'; STDERR_TAIL_BYTES + 10];
        let mut with_end = data.clone();
        with_end.extend_from_slice(b"END");
        let tail = read_tail(&with_end[..]);
        assert_eq!(tail.len(), STDERR_TAIL_BYTES);
        assert!(tail.ends_with("END"));
    }

    #[cfg(unix)]
    #[test]
    fn stream_delivers_lines_in_order() {
        let shell = SystemShell::default();
        let inv = Invocation::new("sh").args(["-c", "printf 'a\\nb\\nc\\n'"]);
        let mut seen = Vec::new();
        let exit = shell
            .stream(&inv, &mut |line| seen.push(line.to_string()), &CancelToken::new())
            .expect("stream");
        assert!(exit.success());
        assert_eq!(seen, vec!["a", "b", "c"]);
    }

    #[test]
    fn records_split_on_carriage_returns_and_newlines() {
        let mut seen = Vec::new();
        for_each_record(&b"big.iso\n  10%\r  55%\r\n caf\xe9\nlast"[..], |r| seen.push(r))
            .expect("read");
        assert_eq!(seen, vec!["big.iso", "  10%", "  55%", " caf\u{fffd}", "last"]);
    }

    #[cfg(unix)]
    #[test]
    fn stream_survives_undecodable_file_names() {
        let shell = SystemShell::default();
        let script = "printf 'Processing changed file caf\\351\\n'; \
                      i=0; while [ $i -lt 20000 ]; do echo line$i; i=$((i+1)); done";
        let inv = Invocation::new("sh").args(["-c", script]);
        let mut seen = Vec::new();
        let exit = shell
            .stream(&inv, &mut |line| seen.push(line.to_string()), &CancelToken::new())
            .expect("stream");
        assert!(exit.success());
        assert_eq!(seen.len(), 20001);
        assert_eq!(seen[0], "Processing changed file caf\u{fffd}");
        assert_eq!(seen[20000], "line19999");
    }

    #[cfg(unix)]
    #[test]
    fn stream_delivers_progress_redraws_as_they_happen() {
        let shell = SystemShell::default();
        let script = "printf 'big.iso\\n  1,024  10%% 1.00MB/s 0:00:09\\r'; sleep 2; \
                      printf '  9,999 100%% 2.00MB/s 0:00:00 (xfr#1, to-chk=0/1)\\n'";
        let inv = Invocation::new("sh").args(["-c", script]);
        let started = std::time::Instant::now();
        let mut seen = Vec::new();
        let exit = shell
            .stream(
                &inv,
                &mut |line| seen.push((started.elapsed(), line.to_string())),
                &CancelToken::new(),
            )
            .expect("stream");
        assert!(exit.success());
        assert_eq!(seen.len(), 3);
        assert!(seen[1].1.contains("10%"));
        assert!(seen[1].0 < Duration::from_millis(1500));
        assert!(seen[2].1.contains("to-chk=0/1"));
    }

    #[cfg(unix)]
    #[test]
    fn stream_cancels_child_that_closed_stdout() {
        let shell = SystemShell::default();
        let inv = Invocation::new("sh").args(["-c", "exec >&-; exec sleep 30"]);
        let cancel = CancelToken::new();
        let trigger = cancel.clone();
        let canceller = thread::spawn(move || {
            thread::sleep(Duration::from_millis(300));
            trigger.cancel();
        });
        let started = std::time::Instant::now();
        let exit = shell.stream(&inv, &mut |_| {}, &cancel).expect("stream");
        canceller.join().expect("join");
        assert_eq!(exit, Exit::Cancelled);
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[cfg(unix)]
    #[test]
    fn stream_kills_child_on_cancel() {
        let shell = SystemShell::default();
        let inv = Invocation::new("sh").args(["-c", "echo started; exec sleep 30"]);
        let cancel = CancelToken::new();
        let trigger = cancel.clone();
        let exit = shell
            .stream(&inv, &mut |_| trigger.cancel(), &cancel)
            .expect("stream");
        assert_eq!(exit, Exit::Cancelled);
    }
}
