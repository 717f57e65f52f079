use std::ffi::OsString;
use std::path::Path;

use crate::error::Result;
use crate::progress::{Grammar, OutputParser};
use crate::task::TaskContext;
use crate::util::command::{Invocation, Shell};

/// `rsync -a --progress <from>/ <to>/`; the trailing slashes copy the
/// contents rather than the directory itself.
pub fn copy_command(from: &Path, to: &Path, excludes: &[&str]) -> Invocation {
    let mut inv = Invocation::new("rsync").args(["-a", "--progress"]);
    for pattern in excludes {
        inv = inv.arg("--exclude").arg(*pattern);
    }
    inv.arg(with_slash(from)).arg(with_slash(to))
}

fn with_slash(path: &Path) -> OsString {
    let mut s = path.as_os_str().to_os_string();
    if !s.to_string_lossy().ends_with('/') {
        s.push("/");
    }
    s
}

/// Runs the copy, feeding rsync's progress to the task.
pub fn run_copy(shell: &dyn Shell, inv: &Invocation, ctx: &TaskContext) -> Result<()> {
    let mut parser = OutputParser::new(Grammar::Rsync);
    let exit = shell.stream(
        inv,
        &mut |line| {
            for event in parser.parse_line(line) {
                ctx.report(event);
            }
        },
        ctx.cancel_token(),
    )?;
    exit.into_result(inv)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::ProgressEvent;
    use crate::testing::ScriptedShell;
    use std::path::PathBuf;

    #[test]
    fn copy_command_copies_contents() {
        let inv = copy_command(
            &PathBuf::from("/media/usb/backup"),
            &PathBuf::from("/run/plain/"),
            &["/.staging"],
        );
        assert_eq!(
            inv.arg_strings(),
            vec![
                "-a",
                "--progress",
                "--exclude",
                "/.staging",
                "/media/usb/backup/",
                "/run/plain/"
            ]
        );
    }

    #[test]
    fn copy_reports_progress_and_fails_on_exit_code() {
        let shell = ScriptedShell::new();
        shell.stdout("rsync", None, "docs/a.txt\n   10 100% 1.00MB/s 0:00:00 (xfr#1, to-chk=1/2)\n");
        let (ctx, events) = TaskContext::detached();
        let inv = copy_command(Path::new("/a"), Path::new("/b"), &[]);
        run_copy(shell.as_ref(), &inv, &ctx).expect("copy");
        let seen: Vec<ProgressEvent> = events.try_iter().collect();
        assert_eq!(
            seen,
            vec![
                ProgressEvent::CurrentFile("docs/a.txt".into()),
                ProgressEvent::FileCount(1),
                ProgressEvent::OverallPercent(50),
            ]
        );

        shell.fail("rsync", None, 23, "some files vanished");
        assert!(run_copy(shell.as_ref(), &inv, &ctx).is_err());
    }
}
