//! Top up every ensemble member to the requested number of runs.

use crate::entry_names;
use crate::paths::is_cycle_entry;
use crate::runner::{Dispatch, ExperimentRunner};
use serde::Serialize;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

#[derive(Debug, Clone, Serialize)]
pub struct ReconcileReport {
    pub member: PathBuf,
    /// `-1` when the archive holds no output cycle yet.
    pub done_runs: i64,
    pub remaining: i64,
    pub dispatch: Option<Dispatch>,
    /// Scheduler failure, logged and otherwise ignored.
    pub error: Option<String>,
}

/// Completed runs of `member`: archived `output###*` entries minus the seed cycle.
///
/// A member with no output yet reports `-1`, so topping it up also produces
/// the seed cycle.
pub fn completed_runs(member: &Path) -> io::Result<i64> {
    let archive = member.join("archive");
    let names = match entry_names(&archive) {
        Ok(names) => names,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(-1),
        Err(e) => return Err(e),
    };
    let outputs = names.iter().filter(|n| is_cycle_entry(n, "output")).count() as i64;
    Ok(outputs - 1)
}

pub struct RunReconciler<'a> {
    runner: &'a dyn ExperimentRunner,
    n_runs: u64,
}

impl<'a> RunReconciler<'a> {
    pub fn new(runner: &'a dyn ExperimentRunner, n_runs: u64) -> Self {
        Self { runner, n_runs }
    }

    pub fn reconcile(&self, members: &[PathBuf]) -> Vec<ReconcileReport> {
        members.iter().map(|m| self.reconcile_member(m)).collect()
    }

    fn reconcile_member(&self, member: &Path) -> ReconcileReport {
        let mut report = ReconcileReport {
            member: member.to_path_buf(),
            done_runs: 0,
            remaining: 0,
            dispatch: None,
            error: None,
        };
        match completed_runs(member) {
            Ok(done) => report.done_runs = done,
            Err(e) => {
                warn!("cannot count runs of {}: {}", member.display(), e);
                report.error = Some(e.to_string());
                return report;
            }
        }
        report.remaining = self.n_runs as i64 - report.done_runs;
        if report.remaining <= 0 {
            info!(
                "{} has already completed {} runs",
                member.display(),
                report.done_runs
            );
            return report;
        }
        match self.runner.dispatch_runs(member, report.remaining as u64) {
            Ok(dispatch) => report.dispatch = Some(dispatch),
            Err(e) => {
                warn!("run dispatch for {} failed: {}", member.display(), e);
                report.error = Some(e.to_string());
            }
        }
        report
    }
}
