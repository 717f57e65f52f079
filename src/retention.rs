//! Post-backup pruning of old increments.
//!
//! Each enabled rule is evaluated on a freshly read increment list and
//! issues at most one `rdiff-backup --remove-older-than` call. Rules run in
//! a fixed order: count, age, space.

use std::sync::Arc;

use tracing::{info, warn};

use crate::error::Result;
use crate::rdiff::command::{prune_command, Target};
use crate::rdiff::increments::{Increment, IncrementReader};
use crate::types::{Age, ByteSize};
use crate::util::command::Shell;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetentionPolicy {
    pub max_count: Option<usize>,
    pub max_age: Option<Age>,
    pub max_space: Option<ByteSize>,
}

impl RetentionPolicy {
    pub fn is_empty(&self) -> bool {
        self.max_count.is_none() && self.max_age.is_none() && self.max_space.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rule {
    Count,
    Age,
    Space,
}

/// Removal point chosen by the space rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpaceCut {
    pub token: String,
    /// The current mirror alone exceeds the limit.
    pub mirror_exceeds: bool,
}

/// Keeps the newest `max_count` increments.
pub fn count_boundary(increments: &[Increment], max_count: usize) -> Option<String> {
    if max_count == 0 || increments.len() <= max_count {
        return None;
    }
    Some(increments[max_count - 1].timestamp.clone())
}

pub fn age_boundary(age: &Age) -> String {
    age.token()
}

/// Walks from the current mirror towards older increments accumulating
/// sizes. The increment that crosses `limit` and everything older goes.
pub fn space_boundary(increments: &[Increment], limit: u64) -> Option<SpaceCut> {
    let mut total: u64 = 0;
    for (index, increment) in increments.iter().enumerate() {
        total = total.saturating_add(increment.size);
        if total <= limit {
            continue;
        }
        if index == 0 {
            return Some(SpaceCut {
                token: increment.timestamp.clone(),
                mirror_exceeds: true,
            });
        }
        return increment.younger.clone().map(|token| SpaceCut {
            token,
            mirror_exceeds: false,
        });
    }
    None
}

pub trait Pruner {
    fn prune(&self, token: &str) -> Result<()>;
}

/// Prunes through rdiff-backup.
pub struct ShellPruner {
    shell: Arc<dyn Shell>,
    target: Target,
}

impl ShellPruner {
    pub fn new(shell: Arc<dyn Shell>, target: Target) -> Self {
        Self { shell, target }
    }
}

impl Pruner for ShellPruner {
    fn prune(&self, token: &str) -> Result<()> {
        let inv = prune_command(&self.target, token);
        self.shell.run(&inv)?.check(&inv)?;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PruneRecord {
    pub rule: Rule,
    pub token: String,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetentionReport {
    pub pruned: Vec<PruneRecord>,
    pub warnings: Vec<String>,
}

impl RetentionReport {
    pub fn failures(&self) -> impl Iterator<Item = &PruneRecord> {
        self.pruned.iter().filter(|r| r.error.is_some())
    }
}

fn read_list(reader: &dyn IncrementReader, rule: Rule) -> Option<Vec<Increment>> {
    match reader.read() {
        Ok(list) => Some(list),
        Err(err) => {
            warn!("{:?} retention skipped, cannot list increments: {}", rule, err);
            None
        }
    }
}

fn prune(pruner: &dyn Pruner, rule: Rule, token: String, report: &mut RetentionReport) {
    info!("{:?} retention: removing increments older than {}", rule, token);
    let error = match pruner.prune(&token) {
        Ok(()) => None,
        Err(err) => {
            warn!("{:?} retention prune failed: {}", rule, err);
            Some(err.to_string())
        }
    };
    report.pruned.push(PruneRecord { rule, token, error });
}

/// Applies every enabled rule. Prune failures end up in the report; the
/// backup that preceded retention stays successful.
pub fn apply_retention(
    policy: &RetentionPolicy,
    reader: &dyn IncrementReader,
    pruner: &dyn Pruner,
    interactive: bool,
) -> RetentionReport {
    let mut report = RetentionReport::default();

    if let Some(max_count) = policy.max_count {
        if let Some(list) = read_list(reader, Rule::Count) {
            if let Some(token) = count_boundary(&list, max_count) {
                prune(pruner, Rule::Count, token, &mut report);
            }
        }
    }

    if let Some(age) = &policy.max_age {
        prune(pruner, Rule::Age, age_boundary(age), &mut report);
    }

    if let Some(limit) = &policy.max_space {
        if let Some(list) = read_list(reader, Rule::Space) {
            if let Some(cut) = space_boundary(&list, limit.bytes()) {
                if cut.mirror_exceeds {
                    let message = format!(
                        "the current mirror alone exceeds the space limit of {}; all older increments will be removed",
                        limit
                    );
                    if interactive {
                        warn!("{}", message);
                        report.warnings.push(message);
                    } else {
                        info!("{}", message);
                    }
                }
                prune(pruner, Rule::Space, cut.token, &mut report);
            }
        }
    }

    report
}
