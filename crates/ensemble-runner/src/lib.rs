//! Generate a one-parameter-at-a-time ensemble of model experiments from a
//! template experiment, then top each member up to the requested run count.

pub mod builder;
pub mod config;
pub mod error;
pub mod metadata;
pub mod namelist;
pub mod patch;
pub mod paths;
pub mod reconcile;
pub mod runner;
pub mod vcs;

#[cfg(test)]
mod testing;

pub use builder::{VariantBuilder, VariantOutcome, VariantReport};
pub use config::{load_spec, parse_spec, EnsembleSpec, ParameterAxis, Scalar, StartFrom};
pub use error::{ConfigError, EnsembleError, ExternalToolError, PatchError, Result, VcsError};
pub use reconcile::{completed_runs, ReconcileReport, RunReconciler};
pub use runner::{check_launchable, Dispatch, ExperimentRunner, PayuRunner, SimulatedRunner};
pub use vcs::{GitCli, Repo, VersionControl};

use paths::VariantPaths;
use serde::Serialize;
use std::io;
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Debug, Clone, Serialize)]
pub struct EnsembleReport {
    pub variants: Vec<VariantReport>,
    pub runs: Vec<ReconcileReport>,
}

impl EnsembleReport {
    /// Directories taking part in run reconciliation, in generation order.
    pub fn members(&self) -> Vec<PathBuf> {
        members(&self.variants)
    }
}

fn members(variants: &[VariantReport]) -> Vec<PathBuf> {
    variants
        .iter()
        .filter(|v| v.outcome.is_member())
        .map(|v| v.paths.dir.clone())
        .collect()
}

/// One planned variant, as listed by `describe`.
#[derive(Debug, Clone, Serialize)]
pub struct PlannedVariant {
    pub field: String,
    pub value: Scalar,
    pub paths: VariantPaths,
    pub exists: bool,
}

pub fn describe_ensemble(spec: &EnsembleSpec, base_dir: &Path) -> Vec<PlannedVariant> {
    spec.planned()
        .map(|(axis, value)| {
            let paths = VariantPaths::resolve(base_dir, &spec.template, axis, value);
            PlannedVariant {
                field: axis.field_path(),
                value: value.clone(),
                exists: paths.dir.exists(),
                paths,
            }
        })
        .collect()
}

/// Sequential driver: one variant at a time, then reconciliation.
pub struct Ensemble<'a> {
    spec: &'a EnsembleSpec,
    base_dir: &'a Path,
    vcs: &'a dyn VersionControl,
    runner: &'a dyn ExperimentRunner,
}

impl<'a> Ensemble<'a> {
    pub fn new(
        spec: &'a EnsembleSpec,
        base_dir: &'a Path,
        vcs: &'a dyn VersionControl,
        runner: &'a dyn ExperimentRunner,
    ) -> Self {
        Self {
            spec,
            base_dir,
            vcs,
            runner,
        }
    }

    /// Build every planned variant. Stops at the first failure; variants
    /// committed before it stay in place.
    pub fn generate(&self) -> Result<Vec<VariantReport>> {
        let builder = VariantBuilder::new(
            self.vcs,
            self.runner,
            self.base_dir,
            &self.spec.template,
            &self.spec.start_from,
        )?;
        info!(
            template = %builder.template_dir().display(),
            startfrom = %self.spec.start_from,
            "generating ensemble"
        );
        self.spec
            .planned()
            .map(|(axis, value)| builder.build(axis, value))
            .collect()
    }

    pub fn reconcile(&self, members: &[PathBuf]) -> Vec<ReconcileReport> {
        if self.spec.n_runs == 0 {
            return Vec::new();
        }
        RunReconciler::new(self.runner, self.spec.n_runs).reconcile(members)
    }

    pub fn run(&self) -> Result<EnsembleReport> {
        let variants = self.generate()?;
        let runs = self.reconcile(&members(&variants));
        Ok(EnsembleReport { variants, runs })
    }
}

/// Names of the entries directly inside `dir`; a symlinked `dir` is followed.
pub(crate) fn entry_names(dir: &Path) -> io::Result<Vec<String>> {
    let mut names = Vec::new();
    for entry in walkdir::WalkDir::new(dir).min_depth(1).max_depth(1) {
        let entry = entry.map_err(|e| {
            let kind = e.io_error().map(|io| io.kind()).unwrap_or(io::ErrorKind::Other);
            io::Error::new(kind, e.to_string())
        })?;
        names.push(entry.file_name().to_string_lossy().to_string());
    }
    names.sort();
    Ok(names)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{write, Fixture, ORIGIN};
    use crate::vcs::fake::FakeVcs;

    const SPEC: &str = r#"
template: control
startfrom: rest
nruns: 3
namelists:
  ice/cice_in.nml:
    dynamics_nml:
      turning_angle: [0, 30]
  ocean/input.nml:
    ocean_vert_kpp_mom4_nml:
      ricr: [0.3, 0.5]
"#;

    #[test]
    fn run_builds_members_and_tops_them_up() {
        let fx = Fixture::new();
        let spec = parse_spec(SPEC).expect("spec");
        let vcs = FakeVcs::new(ORIGIN);
        let runner = SimulatedRunner::new(fx.base.join("test"));
        let report = Ensemble::new(&spec, &fx.base, &vcs, &runner)
            .run()
            .expect("run");

        let outcomes: Vec<VariantOutcome> = report.variants.iter().map(|v| v.outcome).collect();
        assert_eq!(
            outcomes,
            vec![
                VariantOutcome::IdenticalToTemplate,
                VariantOutcome::Committed,
                VariantOutcome::IdenticalToTemplate,
                VariantOutcome::Committed,
            ]
        );
        let members = report.members();
        assert_eq!(
            members,
            vec![
                fx.base.join("control_turning_angle_30"),
                fx.base.join("control_ricr_0.5"),
            ]
        );
        assert_eq!(vcs.commits.borrow().len(), 2);

        assert_eq!(report.runs.len(), 2);
        for (run, member) in report.runs.iter().zip(&members) {
            assert_eq!(run.done_runs, -1);
            assert_eq!(run.remaining, 4);
            let dispatch = run.dispatch.as_ref().expect("dispatch");
            assert_eq!(dispatch.command, format!("# cd {} && payu run -n 4", member.display()));
        }
    }

    #[test]
    fn rerun_keeps_existing_members() {
        let fx = Fixture::new();
        write(
            &fx.template.join("ice/cice_in.nml"),
            "&dynamics_nml\n    cosw = 0.5\n    sinw = 0.5\n/\n",
        );
        let spec = parse_spec(SPEC).expect("spec");
        let vcs = FakeVcs::new(ORIGIN);
        let runner = SimulatedRunner::new(fx.base.join("test"));
        let ensemble = Ensemble::new(&spec, &fx.base, &vcs, &runner);

        let first = ensemble.generate().expect("first");
        assert_eq!(
            first.iter().filter(|v| v.outcome == VariantOutcome::Committed).count(),
            3
        );
        let clones = vcs.clone_count();

        let second = ensemble.run().expect("second");
        let outcomes: Vec<VariantOutcome> = second.variants.iter().map(|v| v.outcome).collect();
        assert_eq!(
            outcomes,
            vec![
                VariantOutcome::AlreadyExists,
                VariantOutcome::AlreadyExists,
                VariantOutcome::IdenticalToTemplate,
                VariantOutcome::AlreadyExists,
            ]
        );
        assert_eq!(vcs.clone_count(), clones);
        assert_eq!(second.runs.len(), 3);
    }

    #[test]
    fn zero_runs_skips_reconciliation() {
        let fx = Fixture::new();
        let spec = parse_spec(&SPEC.replace("nruns: 3\n", "")).expect("spec");
        assert_eq!(spec.n_runs, 0);
        let vcs = FakeVcs::new(ORIGIN);
        let runner = SimulatedRunner::new(fx.base.join("test"));
        let report = Ensemble::new(&spec, &fx.base, &vcs, &runner)
            .run()
            .expect("run");
        assert_eq!(report.members().len(), 2);
        assert!(report.runs.is_empty());
    }

    #[test]
    fn missing_template_fails_before_any_variant() {
        let fx = Fixture::new();
        let spec = parse_spec(&SPEC.replace("template: control", "template: absent")).expect("spec");
        let vcs = FakeVcs::new(ORIGIN);
        let runner = SimulatedRunner::new(fx.base.join("test"));
        let err = Ensemble::new(&spec, &fx.base, &vcs, &runner)
            .run()
            .err()
            .expect("no template");
        assert!(matches!(err, EnsembleError::VersionControl(VcsError::NotARepository(_))));
        assert_eq!(vcs.clone_count(), 0);
        assert!(!fx.base.join("absent_ricr_0.5").exists());
    }

    #[test]
    fn describe_lists_every_planned_variant() {
        let fx = Fixture::new();
        std::fs::create_dir_all(fx.base.join("control_ricr_0.3")).expect("mkdir");
        let spec = parse_spec(SPEC).expect("spec");
        let planned = describe_ensemble(&spec, &fx.base);
        let names: Vec<&str> = planned.iter().map(|p| p.paths.name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "control_turning_angle_0",
                "control_turning_angle_30",
                "control_ricr_0.3",
                "control_ricr_0.5",
            ]
        );
        assert_eq!(planned[0].field, "ice/cice_in.nml -> dynamics_nml -> turning_angle");
        let exists: Vec<bool> = planned.iter().map(|p| p.exists).collect();
        assert_eq!(exists, vec![false, false, true, false]);
    }

    #[test]
    fn entry_names_are_sorted_and_shallow() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::create_dir_all(dir.path().join("b/nested")).expect("mkdir");
        std::fs::write(dir.path().join("a"), "").expect("write");
        assert_eq!(entry_names(dir.path()).expect("names"), vec!["a", "b"]);
        let missing = entry_names(&dir.path().join("missing")).expect_err("missing");
        assert_eq!(missing.kind(), io::ErrorKind::NotFound);
    }
}
