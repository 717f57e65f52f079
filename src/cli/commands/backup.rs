use std::path::Path;

use anyhow::{Context, Result};
use chrono::{Local, TimeZone};

use crate::cli::args::RestoreArgs;
use crate::cli::commands::{drive, lock_destination, open_coordinator};
use crate::config::save::record_last_backup;
use crate::rdiff::command::RestoreRequest;
use crate::rdiff::increments::Increment;
use crate::types::RunMode;

pub fn run_backup_command(config_path: &Path, run_mode: RunMode, shutdown: bool) -> Result<()> {
    println!("{}", Local::now().format("%d-%m-%Y %H:%M"));
    let _lock = lock_destination()?;
    let mut coordinator = open_coordinator(config_path, run_mode)?;
    println!("destination: {}", coordinator.state().describe());

    // Unattended runs keep retention warnings out of the way.
    let handle = coordinator.start_backup(!shutdown)?;
    let outcome = drive(handle)?;
    coordinator.finish_backup(&outcome);
    let report = outcome.into_result()?;

    println!("backup finished: {} changed file(s)", report.files);
    for warning in &report.retention.warnings {
        println!("warning: {}", warning);
    }
    for record in &report.retention.pruned {
        match &record.error {
            None => println!(
                "{:?} rule: removed increments older than {}",
                record.rule, record.token
            ),
            Some(err) => println!(
                "{:?} rule: could not remove increments older than {}: {}",
                record.rule, record.token, err
            ),
        }
    }

    if !run_mode.dry_run {
        let mut document = coordinator.config().document.clone();
        record_last_backup(config_path, &mut document, Local::now())
            .with_context(|| format!("record last backup in {}", config_path.display()))?;
    }
    if shutdown {
        coordinator.shutdown()?;
    }
    Ok(())
}

pub fn run_restore_command(config_path: &Path, run_mode: RunMode, args: RestoreArgs) -> Result<()> {
    let _lock = lock_destination()?;
    let mut coordinator = open_coordinator(config_path, run_mode)?;
    let restore_dir = args
        .to
        .unwrap_or_else(|| coordinator.config().source.clone());
    let request = RestoreRequest {
        increment: args.at,
        selection: args.paths,
        restore_dir,
    };
    println!(
        "restoring {} from {} into {}",
        if request.is_entire_backup() {
            "everything".to_string()
        } else {
            format!("{} path(s)", request.selection.len())
        },
        request.increment,
        request.restore_dir.display()
    );
    let handle = coordinator.start_restore(request)?;
    let outcome = drive(handle)?;
    coordinator.finish_restore(&outcome);
    let report = outcome.into_result()?;
    println!("restore finished into {}", report.restore_dir.display());
    Ok(())
}

pub fn run_increments(config_path: &Path, run_mode: RunMode) -> Result<()> {
    let mut coordinator = open_coordinator(config_path, run_mode)?;
    let increments = coordinator.increments()?;
    if increments.is_empty() {
        println!("no increments");
        return Ok(());
    }
    for (index, increment) in increments.iter().enumerate() {
        println!("{}", format_increment(index, increment));
    }
    Ok(())
}

fn format_increment(index: usize, increment: &Increment) -> String {
    let when = Local
        .timestamp_opt(increment.start_time, 0)
        .single()
        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| increment.start_time.to_string());
    let label = if index == 0 { " (current mirror)" } else { "" };
    format!(
        "{}  {}  {} bytes{}",
        increment.timestamp, when, increment.size, label
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn current_mirror_is_labelled() {
        let increment = Increment {
            timestamp: "2009-03-10T12:00:00+01:00".into(),
            start_time: 1_236_682_800,
            size: 4096,
            younger: None,
        };
        let line = format_increment(0, &increment);
        assert!(line.starts_with("2009-03-10T12:00:00+01:00  "));
        assert!(line.ends_with("4096 bytes (current mirror)"));
        assert!(!format_increment(1, &increment).contains("current mirror"));
    }
}
