use anyhow::Result;
use clap::error::ErrorKind;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use crate::cli::args::{Cli, Command};
use crate::cli::commands::{backup, encryption, exit_for_error, session, status};
use crate::config::default_config_path;
use crate::types::RunMode;

const VERSION: &str = env!("CARGO_PKG_VERSION");

pub mod args;
pub mod commands;

pub fn run() -> Result<()> {
    let cli = parse_cli();
    init_tracing(cli.verbose);
    print_banner();

    let config_path = cli.config.clone().unwrap_or_else(default_config_path);
    let run_mode = RunMode {
        dry_run: cli.dry_run,
        verbose: cli.verbose,
    };

    let result = match cli.command {
        Command::Status => status::run_status(&config_path, run_mode),
        Command::CheckTools => status::run_check_tools(&config_path, run_mode),
        Command::Increments => backup::run_increments(&config_path, run_mode),
        Command::Backup(args) => backup::run_backup_command(&config_path, run_mode, args.shutdown),
        Command::Restore(args) => backup::run_restore_command(&config_path, run_mode, args),
        Command::Login => session::run_login(&config_path, run_mode),
        Command::Logout => session::run_logout(&config_path, run_mode),
        Command::Unlock => session::run_unlock(&config_path, run_mode),
        Command::Lock => session::run_lock(&config_path, run_mode),
        Command::Passwd => session::run_passwd(&config_path, run_mode),
        Command::Encrypt => encryption::run_encrypt_command(&config_path, run_mode),
        Command::Decrypt => encryption::run_decrypt_command(&config_path, run_mode),
    };
    if let Err(err) = result {
        exit_for_error(&err);
    }
    Ok(())
}

fn parse_cli() -> Cli {
    match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            if matches!(err.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) {
                err.exit();
            }
            println!("{}", err);
            std::process::exit(2);
        }
    }
}

fn print_banner() {
    println!("rdiffvault {}", VERSION);
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
