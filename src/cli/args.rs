use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(
    name = "rdiffvault",
    version,
    about = "Incremental backups with rdiff-backup to local, remote and encrypted destinations"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    #[arg(long, global = true)]
    pub dry_run: bool,
    #[arg(long, short = 'v', global = true)]
    pub verbose: bool,

    /// Config file path
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Show the destination state
    Status,
    /// Back up the source to the destination
    Backup(BackupArgs),
    /// Restore files from an increment
    Restore(RestoreArgs),
    /// List the increments in the destination
    Increments,
    /// Mount a remote destination
    Login,
    /// Unmount a remote destination, locking it first
    Logout,
    /// Mount the plaintext view of an encrypted destination
    Unlock,
    /// Unmount the plaintext view
    Lock,
    /// Encrypt a plain destination in place
    Encrypt,
    /// Turn an unlocked encrypted destination back into plain storage
    Decrypt,
    /// Change the encryption password
    Passwd,
    /// Check that the external tools are installed
    CheckTools,
}

#[derive(Args, Debug, Clone, Default)]
pub struct BackupArgs {
    /// Shut the machine down after a successful backup
    #[arg(long)]
    pub shutdown: bool,
}

#[derive(Args, Debug, Clone)]
pub struct RestoreArgs {
    /// Increment time as listed by `increments`, or `now`
    #[arg(long, default_value = "now")]
    pub at: String,
    /// Path relative to the backup root; repeatable, none restores everything
    #[arg(long = "path")]
    pub paths: Vec<PathBuf>,
    /// Restore into this directory instead of the source
    #[arg(long)]
    pub to: Option<PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_restore_with_repeated_paths() {
        let cli = Cli::try_parse_from([
            "rdiffvault",
            "--config",
            "/etc/rdiffvault.yaml",
            "restore",
            "--at",
            "2009-03-10T12:00:00+01:00",
            "--path",
            "docs/a.txt",
            "--path",
            "music",
            "--to",
            "/tmp/out",
        ])
        .expect("parse");
        assert_eq!(cli.config, Some(PathBuf::from("/etc/rdiffvault.yaml")));
        match cli.command {
            Command::Restore(args) => {
                assert_eq!(args.at, "2009-03-10T12:00:00+01:00");
                assert_eq!(args.paths.len(), 2);
                assert_eq!(args.to, Some(PathBuf::from("/tmp/out")));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn global_flags_after_subcommand() {
        let cli = Cli::try_parse_from(["rdiffvault", "backup", "--shutdown", "-v", "--dry-run"])
            .expect("parse");
        assert!(cli.verbose);
        assert!(cli.dry_run);
        assert!(matches!(cli.command, Command::Backup(BackupArgs { shutdown: true })));
    }

    #[test]
    fn restore_defaults_to_current_mirror() {
        let cli = Cli::try_parse_from(["rdiffvault", "restore"]).expect("parse");
        match cli.command {
            Command::Restore(args) => {
                assert_eq!(args.at, "now");
                assert!(args.paths.is_empty());
                assert!(args.to.is_none());
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
