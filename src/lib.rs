//! rdiffvault drives rdiff-backup, rsync, sshfs, mount.cifs and encfs to keep
//! incremental backups on local, remote and encrypted destinations.

pub mod backup;
pub mod cli;
pub mod config;
pub mod destination;
pub mod encryption;
pub mod error;
pub mod mount;
pub mod platform;
pub mod progress;
pub mod rdiff;
pub mod retention;
pub mod signal_handler;
pub mod task;
pub mod types;
pub mod util;

#[cfg(test)]
pub(crate) mod testing;
