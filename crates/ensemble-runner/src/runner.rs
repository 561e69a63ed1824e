//! Job-environment collaborators: staging a variant for its first run and
//! submitting further simulation cycles.

use crate::error::ExternalToolError;
use crate::paths::archive_path_from_work;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use tracing::{info, warn};

/// A run request handed to the scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Dispatch {
    /// Shell form of the request, for logs and reports.
    pub command: String,
    /// False when the request was only constructed (dry run).
    pub executed: bool,
}

pub trait ExperimentRunner {
    /// Prepare the run-staging area of `experiment` and return the resolved
    /// work directory. As a side effect the archive directory reachable via
    /// [`archive_path_from_work`] exists afterwards.
    fn prepare_staging(&self, experiment: &Path, name: &str) -> Result<PathBuf, ExternalToolError>;

    /// Request `runs` further cycles of `experiment`.
    fn dispatch_runs(&self, experiment: &Path, runs: u64) -> Result<Dispatch, ExternalToolError>;
}

/// Fails only if `program` cannot be launched at all.
pub fn check_launchable(program: &str) -> Result<(), ExternalToolError> {
    Command::new(program)
        .arg("--help")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|_| ())
        .map_err(|source| ExternalToolError::Launch {
            command: program.to_string(),
            source,
        })
}

fn run_command(cmd: &mut Command, shown: &str) -> Result<(), ExternalToolError> {
    let status = cmd
        .stdin(Stdio::null())
        .status()
        .map_err(|source| ExternalToolError::Launch {
            command: shown.to_string(),
            source,
        })?;
    if status.success() {
        Ok(())
    } else {
        Err(ExternalToolError::Failed {
            command: shown.to_string(),
            status: status
                .code()
                .map(|c| c.to_string())
                .unwrap_or_else(|| "signal".to_string()),
        })
    }
}

/// Drives the `payu` workflow manager.
#[derive(Debug, Clone)]
pub struct PayuRunner {
    program: String,
}

impl Default for PayuRunner {
    fn default() -> Self {
        Self {
            program: "payu".to_string(),
        }
    }
}

impl PayuRunner {
    pub fn program(&self) -> &str {
        &self.program
    }

    fn payu(&self, experiment: &Path, args: &[&str]) -> Result<(), ExternalToolError> {
        let shown = format!(
            "cd {} && {} {}",
            experiment.display(),
            self.program,
            args.join(" ")
        );
        info!("{}", shown);
        run_command(
            Command::new(&self.program).args(args).current_dir(experiment),
            &shown,
        )
    }
}

impl ExperimentRunner for PayuRunner {
    fn prepare_staging(&self, experiment: &Path, _name: &str) -> Result<PathBuf, ExternalToolError> {
        // Setup failures are tolerated here; a missing work link is not.
        if let Err(e) = self
            .payu(experiment, &["sweep"])
            .and_then(|_| self.payu(experiment, &["setup"]))
        {
            warn!("{}", e);
        }
        let link = experiment.join("work");
        let work = fs::canonicalize(&link).map_err(|_| ExternalToolError::MissingStaging(link))?;
        self.payu(experiment, &["sweep"])?;
        Ok(work)
    }

    fn dispatch_runs(&self, experiment: &Path, runs: u64) -> Result<Dispatch, ExternalToolError> {
        let n = runs.to_string();
        let command = format!(
            "cd {} && {} run -n {}",
            experiment.display(),
            self.program,
            n
        );
        self.payu(experiment, &["run", "-n", &n])?;
        Ok(Dispatch {
            command,
            executed: true,
        })
    }
}

/// Dry-run stand-in for the setup tool and scheduler.
///
/// Staging reports `<root>/work/<name>` as the work directory but only
/// creates `<root>/archive/<name>`. Dispatch builds the command, comments it
/// out and does not execute it.
#[derive(Debug, Clone)]
pub struct SimulatedRunner {
    root: PathBuf,
}

impl SimulatedRunner {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl ExperimentRunner for SimulatedRunner {
    fn prepare_staging(&self, _experiment: &Path, name: &str) -> Result<PathBuf, ExternalToolError> {
        let io_err = |path: &Path, source| ExternalToolError::Launch {
            command: format!("simulated setup of {}", path.display()),
            source,
        };
        fs::create_dir_all(self.root.join("work")).map_err(|e| io_err(&self.root, e))?;
        let root = fs::canonicalize(&self.root).map_err(|e| io_err(&self.root, e))?;
        let work = root.join("work").join(name);
        let archive = archive_path_from_work(&work);
        fs::create_dir_all(&archive).map_err(|e| io_err(&archive, e))?;
        info!(work = %work.display(), archive = %archive.display(), "simulated setup");
        Ok(work)
    }

    fn dispatch_runs(&self, experiment: &Path, runs: u64) -> Result<Dispatch, ExternalToolError> {
        let command = format!("# cd {} && payu run -n {}", experiment.display(), runs);
        info!("{}", command);
        Ok(Dispatch {
            command,
            executed: false,
        })
    }
}
