//! Scripted stand-ins for external tools and the host platform.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use walkdir::WalkDir;

use crate::error::Result;
use crate::mount::inspect::MountEntry;
use crate::mount::ops::ENCFS_CONFIG;
use crate::platform::{Linux, Platform, SmbShare};
use crate::types::Secret;
use crate::util::command::{CancelToken, Exit, Invocation, Output, Shell};

type Hook = Arc<dyn Fn(&Invocation) + Send + Sync>;

#[derive(Clone)]
struct Rule {
    program: String,
    needle: Option<String>,
    code: i32,
    stdout: String,
    stderr: String,
    block: bool,
    hook: Option<Hook>,
}

impl Rule {
    fn matches(&self, inv: &Invocation) -> bool {
        inv.program == self.program
            && self
                .needle
                .as_ref()
                .map(|n| inv.arg_strings().iter().any(|a| a.contains(n.as_str())))
                .unwrap_or(true)
    }
}

/// Answers invocations from a rule list; unmatched commands succeed quietly.
#[derive(Default)]
pub struct ScriptedShell {
    rules: Mutex<Vec<Rule>>,
    calls: Mutex<Vec<Invocation>>,
}

impl ScriptedShell {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn push(&self, rule: Rule) {
        // Later rules win.
        self.rules.lock().expect("rules").insert(0, rule);
    }

    fn rule(program: &str, needle: Option<&str>) -> Rule {
        Rule {
            program: program.to_string(),
            needle: needle.map(str::to_string),
            code: 0,
            stdout: String::new(),
            stderr: String::new(),
            block: false,
            hook: None,
        }
    }

    pub fn fail(&self, program: &str, needle: Option<&str>, code: i32, stderr: &str) {
        let mut rule = Self::rule(program, needle);
        rule.code = code;
        rule.stderr = stderr.to_string();
        self.push(rule);
    }

    pub fn stdout(&self, program: &str, needle: Option<&str>, stdout: &str) {
        let mut rule = Self::rule(program, needle);
        rule.stdout = stdout.to_string();
        self.push(rule);
    }

    /// Streams never finish until cancelled.
    pub fn block(&self, program: &str) {
        let mut rule = Self::rule(program, None);
        rule.block = true;
        self.push(rule);
    }

    pub fn hook(
        &self,
        program: &str,
        needle: Option<&str>,
        hook: impl Fn(&Invocation) + Send + Sync + 'static,
    ) {
        let mut rule = Self::rule(program, needle);
        rule.hook = Some(Arc::new(hook));
        self.push(rule);
    }

    pub fn calls(&self) -> Vec<Invocation> {
        self.calls.lock().expect("calls").clone()
    }

    pub fn programs(&self) -> Vec<String> {
        self.calls().into_iter().map(|c| c.program).collect()
    }

    pub fn calls_to(&self, program: &str) -> Vec<Vec<String>> {
        self.calls()
            .into_iter()
            .filter(|c| c.program == program)
            .map(|c| c.arg_strings())
            .collect()
    }

    fn answer(&self, inv: &Invocation) -> Rule {
        self.calls.lock().expect("calls").push(inv.clone());
        let rule = self
            .rules
            .lock()
            .expect("rules")
            .iter()
            .find(|r| r.matches(inv))
            .cloned()
            .unwrap_or_else(|| Self::rule(&inv.program, None));
        if let Some(hook) = &rule.hook {
            hook(inv);
        }
        rule
    }
}

impl Shell for ScriptedShell {
    fn run(&self, inv: &Invocation) -> Result<Output> {
        let rule = self.answer(inv);
        Ok(Output {
            code: rule.code,
            stdout: rule.stdout,
            stderr: rule.stderr,
        })
    }

    fn stream(
        &self,
        inv: &Invocation,
        sink: &mut dyn FnMut(&str),
        cancel: &CancelToken,
    ) -> Result<Exit> {
        let rule = self.answer(inv);
        for line in rule.stdout.lines() {
            sink(line);
        }
        if rule.block {
            while !cancel.is_cancelled() {
                thread::sleep(Duration::from_millis(5));
            }
            return Ok(Exit::Cancelled);
        }
        Ok(Exit::Code {
            code: rule.code,
            stderr: rule.stderr,
        })
    }
}

/// A mount table kept in memory. FUSE mounts may name a backing directory
/// that stands in for the filesystem the mountpoint would show.
#[derive(Default)]
pub struct FakePlatform {
    mounts: Mutex<HashMap<PathBuf, Option<PathBuf>>>,
}

impl FakePlatform {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn mount(&self, mountpoint: &Path, backing: Option<&Path>) {
        self.mounts
            .lock()
            .expect("mounts")
            .insert(mountpoint.to_path_buf(), backing.map(Path::to_path_buf));
    }

    pub fn unmount(&self, mountpoint: &Path) {
        self.mounts.lock().expect("mounts").remove(mountpoint);
    }

    pub fn is_mounted(&self, mountpoint: &Path) -> bool {
        self.mounts.lock().expect("mounts").contains_key(mountpoint)
    }

    pub fn backing(&self, mountpoint: &Path) -> Option<PathBuf> {
        self.mounts
            .lock()
            .expect("mounts")
            .get(mountpoint)
            .cloned()
            .flatten()
    }
}

impl Platform for FakePlatform {
    fn name(&self) -> &'static str {
        "fake"
    }

    fn fuse_unmount(&self, mountpoint: &Path) -> Invocation {
        Linux.fuse_unmount(mountpoint)
    }

    fn smb_mount(&self, share: &SmbShare, mountpoint: &Path, password: Secret) -> Invocation {
        Linux.smb_mount(share, mountpoint, password)
    }

    fn smb_unmount(&self, mountpoint: &Path) -> Invocation {
        Linux.smb_unmount(mountpoint)
    }

    fn shutdown(&self) -> Invocation {
        Linux.shutdown()
    }

    fn mount_table(&self, _shell: &dyn Shell) -> Result<Vec<MountEntry>> {
        Ok(self
            .mounts
            .lock()
            .expect("mounts")
            .keys()
            .map(|mountpoint| MountEntry {
                source: "fake".into(),
                mountpoint: mountpoint.clone(),
                fs_type: "fuse".into(),
                options: vec!["rw".into()],
            })
            .collect())
    }
}

fn last_args(inv: &Invocation, n: usize) -> Vec<PathBuf> {
    let args = inv.arg_strings();
    args[args.len().saturating_sub(n)..]
        .iter()
        .map(PathBuf::from)
        .collect()
}

/// encfs creates its volume file and "mounts" the cipher dir as backing;
/// fusermount and sudo umount drop mounts again.
pub fn fake_encfs(shell: &ScriptedShell, platform: &Arc<FakePlatform>) {
    let p = Arc::clone(platform);
    shell.hook("encfs", None, move |inv| {
        let paths = last_args(inv, 2);
        if paths.len() < 2 {
            return;
        }
        let config = paths[0].join(ENCFS_CONFIG);
        if !config.exists() {
            fs::write(&config, "<encfs/>").expect("encfs config");
        }
        p.mount(&paths[1], Some(&paths[0]));
    });
    let p = Arc::clone(platform);
    shell.hook("fusermount", None, move |inv| p.unmount(&last_args(inv, 1)[0]));
}

/// sshfs and cifs mounts register their mountpoint.
pub fn fake_remote_mounts(shell: &ScriptedShell, platform: &Arc<FakePlatform>) {
    let p = Arc::clone(platform);
    shell.hook("sshfs", None, move |inv| {
        p.mount(&PathBuf::from(&inv.arg_strings()[1]), None)
    });
    let p = Arc::clone(platform);
    shell.hook("sudo", Some("cifs"), move |inv| {
        let args = inv.arg_strings();
        let at = args.iter().position(|a| a.starts_with("//")).expect("share");
        p.mount(&PathBuf::from(&args[at + 1]), None);
    });
    let p = Arc::clone(platform);
    shell.hook("sudo", Some("umount"), move |inv| {
        p.unmount(&last_args(inv, 1)[0])
    });
}

/// rsync copies for real, resolving fake FUSE mounts to their backing
/// directories and honouring top-level `--exclude /name` options. Reading
/// through an encfs mount hides the volume file, as the real view does.
pub fn copying_rsync(shell: &ScriptedShell, platform: &Arc<FakePlatform>) {
    let p = Arc::clone(platform);
    shell.hook("rsync", None, move |inv| {
        let args = inv.arg_strings();
        if args.len() < 2 {
            return;
        }
        let mut excluded: Vec<String> = args
            .windows(2)
            .filter(|w| w[0] == "--exclude")
            .map(|w| w[1].trim_start_matches('/').to_string())
            .collect();
        let paths = last_args(inv, 2);
        let from = match p.backing(&paths[0]) {
            Some(backing) => {
                excluded.push(ENCFS_CONFIG.to_string());
                backing
            }
            None => paths[0].clone(),
        };
        let to = p.backing(&paths[1]).unwrap_or_else(|| paths[1].clone());
        copy_tree(&from, &to, &excluded);
    });
}

fn copy_tree(from: &Path, to: &Path, excluded: &[String]) {
    let walker = WalkDir::new(from).min_depth(1).into_iter().filter_entry(|e| {
        let skipped = e.depth() == 1
            && excluded.iter().any(|x| e.file_name().to_string_lossy() == x.as_str());
        !skipped && e.path() != to
    });
    for entry in walker {
        let entry = entry.expect("walk");
        let rel = entry.path().strip_prefix(from).expect("relative");
        let dest = to.join(rel);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&dest).expect("mkdir");
        } else {
            fs::copy(entry.path(), &dest).expect("copy");
        }
    }
}
