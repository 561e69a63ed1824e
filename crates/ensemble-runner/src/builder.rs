//! Derivation of one ensemble member from the template.
//!
//! [`VariantBuilder::build`] walks a fixed sequence of steps for a single
//! (axis, value) pair. Each step either advances, ends the attempt with an
//! expected [`VariantOutcome`], or fails with an error. Discarded attempts
//! remove the variant directory; failed ones leave it for the operator.

use crate::config::{ParameterAxis, Scalar, StartFrom};
use crate::entry_names;
use crate::error::{ConfigError, EnsembleError, Result};
use crate::metadata::{perturbation_description, MetadataRecord};
use crate::namelist::{patch_namelist_in_place, Namelist, NmlValue};
use crate::patch::patch_line_prefixed;
use crate::paths::{
    self, archive_path_from_work, is_run_summary, output_ice_namelist_source, restart_link_target,
    sync_destination, VariantPaths, ICE_NAMELIST, JOBNAME_PREFIX, METADATA_FILE, RUN_CONFIG,
    SYNC_PREFIX, SYNC_SCRIPT,
};
use crate::runner::ExperimentRunner;
use crate::vcs::{Repo, VersionControl};
use serde::Serialize;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VariantOutcome {
    AlreadyExists,
    IdenticalToTemplate,
    Committed,
    DiscardedDuplicate,
    DiscardedSyncConflict,
    DiscardedArchiveConflict,
}

impl VariantOutcome {
    /// Whether the variant belongs to the ensemble for run reconciliation.
    pub fn is_member(self) -> bool {
        matches!(self, VariantOutcome::AlreadyExists | VariantOutcome::Committed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            VariantOutcome::AlreadyExists => "already_exists",
            VariantOutcome::IdenticalToTemplate => "identical_to_template",
            VariantOutcome::Committed => "committed",
            VariantOutcome::DiscardedDuplicate => "discarded_duplicate",
            VariantOutcome::DiscardedSyncConflict => "discarded_sync_conflict",
            VariantOutcome::DiscardedArchiveConflict => "discarded_archive_conflict",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct VariantReport {
    pub field: String,
    pub value: Scalar,
    pub paths: VariantPaths,
    pub outcome: VariantOutcome,
    /// Conflicting path for the discard outcomes that have one.
    pub detail: Option<PathBuf>,
}

/// Values to write for one (axis, value) pair.
#[derive(Debug, Clone, PartialEq)]
enum PatchPlan {
    Single(NmlValue),
    TurningAngle { cosw: f64, sinw: f64 },
}

impl PatchPlan {
    fn for_axis(axis: &ParameterAxis, value: &Scalar) -> Result<Self> {
        if !axis.is_turning_angle() {
            return Ok(PatchPlan::Single(NmlValue::from(value)));
        }
        let degrees = value.as_f64().ok_or_else(|| {
            EnsembleError::Config(ConfigError::InvalidValue {
                key: axis.field_path(),
                reason: format!("turning angle '{}' is not numeric", value),
            })
        })?;
        let radians = degrees * std::f64::consts::PI / 180.0;
        Ok(PatchPlan::TurningAngle {
            cosw: radians.cos(),
            sinw: radians.sin(),
        })
    }

    fn matches(&self, nml: &Namelist, axis: &ParameterAxis, value: &Scalar) -> bool {
        let same = |name: &str, want: &Scalar| {
            nml.get(&axis.group, name)
                .map(|cur| cur.matches(want))
                .unwrap_or(false)
        };
        match self {
            PatchPlan::Single(_) => same(&axis.name, value),
            PatchPlan::TurningAngle { cosw, sinw } => {
                same("cosw", &Scalar::Float(*cosw)) && same("sinw", &Scalar::Float(*sinw))
            }
        }
    }

    /// One stage per patch; cosw is written before sinw.
    fn stages(&self, axis: &ParameterAxis) -> Vec<Vec<(String, NmlValue)>> {
        match self {
            PatchPlan::Single(v) => vec![vec![(axis.name.clone(), v.clone())]],
            PatchPlan::TurningAngle { cosw, sinw } => vec![
                vec![("cosw".to_string(), NmlValue::Real(*cosw))],
                vec![("sinw".to_string(), NmlValue::Real(*sinw))],
            ],
        }
    }
}

pub struct VariantBuilder<'a> {
    vcs: &'a dyn VersionControl,
    runner: &'a dyn ExperimentRunner,
    base_dir: &'a Path,
    template: &'a str,
    template_dir: PathBuf,
    template_origin: String,
    start_from: &'a StartFrom,
}

impl<'a> VariantBuilder<'a> {
    /// Fails if the template is not a working directory with an `origin` remote.
    pub fn new(
        vcs: &'a dyn VersionControl,
        runner: &'a dyn ExperimentRunner,
        base_dir: &'a Path,
        template: &'a str,
        start_from: &'a StartFrom,
    ) -> Result<Self> {
        let template_dir = base_dir.join(template);
        let template_origin = vcs.origin_url(&template_dir)?;
        Ok(Self {
            vcs,
            runner,
            base_dir,
            template,
            template_dir,
            template_origin,
            start_from,
        })
    }

    pub fn template_dir(&self) -> &Path {
        &self.template_dir
    }

    pub fn build(&self, axis: &ParameterAxis, value: &Scalar) -> Result<VariantReport> {
        let paths = VariantPaths::resolve(self.base_dir, self.template, axis, value);
        let report = |outcome: VariantOutcome, detail: Option<PathBuf>| VariantReport {
            field: axis.field_path(),
            value: value.clone(),
            paths: paths.clone(),
            outcome,
            detail,
        };

        if paths.dir.exists() {
            info!("not creating {} - already exists", paths.relative.display());
            return Ok(report(VariantOutcome::AlreadyExists, None));
        }

        let plan = PatchPlan::for_axis(axis, value)?;
        let template_nml = Namelist::read(&self.template_dir.join(&axis.file))?;
        if plan.matches(&template_nml, axis, value) {
            info!(
                "not creating {} - parameters are identical to {}",
                paths.relative.display(),
                self.template
            );
            return Ok(report(VariantOutcome::IdenticalToTemplate, None));
        }

        info!("creating {}", paths.relative.display());
        let repo = self.clone_template(&paths)?;

        patch_namelist_in_place(&paths.dir.join(&axis.file), &axis.group, &plan.stages(axis))?;
        if !self.vcs.is_dirty(&repo)? {
            self.discard(&paths, "parameters are identical to the template after patching")?;
            return Ok(report(VariantOutcome::DiscardedDuplicate, None));
        }

        if let Some(sync_dir) = self.configure_sync(&paths)? {
            if sync_dir.exists() {
                self.discard(&paths, &format!("SYNCDIR {} already exists", sync_dir.display()))?;
                return Ok(report(VariantOutcome::DiscardedSyncConflict, Some(sync_dir)));
            }
        }

        let restart = match self.start_from {
            StartFrom::Rest => None,
            StartFrom::Cycle(_) => match self.link_restart(&paths)? {
                Linkage::Linked(restart) => Some(restart),
                Linkage::ArchiveInUse(archive) => {
                    self.discard(
                        &paths,
                        &format!(
                            "archive {} already contains restarts and/or outputs",
                            archive.display()
                        ),
                    )?;
                    return Ok(report(VariantOutcome::DiscardedArchiveConflict, Some(archive)));
                }
            },
        };

        self.set_job_name(&paths, axis, value)?;
        self.update_metadata(&paths, restart.as_deref(), axis, value)?;

        for name in entry_names(&paths.dir).map_err(|e| io_ctx("listing", &paths.dir, e))? {
            if is_run_summary(&name) {
                self.vcs.remove_tracked_file(&repo, Path::new(&name))?;
            }
        }
        self.vcs
            .commit_all(&repo, &format!("set up {}", paths.name))?;
        Ok(report(VariantOutcome::Committed, None))
    }

    /// Clone, move the template's remote aside, point `origin` at the
    /// template's own upstream and switch to a branch named after the variant.
    fn clone_template(&self, paths: &VariantPaths) -> Result<Repo> {
        let repo = self.vcs.clone_repo(&self.template_dir, &paths.dir)?;
        self.vcs.rename_remote(&repo, "origin", "template")?;
        self.vcs.add_remote(&repo, "origin", &self.template_origin)?;
        self.vcs.checkout_new_branch(&repo, &paths.name)?;
        Ok(repo)
    }

    fn discard(&self, paths: &VariantPaths, reason: &str) -> Result<()> {
        warn!("deleting {} - {}", paths.relative.display(), reason);
        fs::remove_dir_all(&paths.dir).map_err(|e| io_ctx("removing", &paths.dir, e))
    }

    /// Rewrite `SYNCDIR=` and return the new destination, if the script has one.
    fn configure_sync(&self, paths: &VariantPaths) -> Result<Option<PathBuf>> {
        let script = paths.dir.join(SYNC_SCRIPT);
        if !script.exists() {
            warn!("{} has no {}; sync destination left unset", paths.relative.display(), SYNC_SCRIPT);
            return Ok(None);
        }
        let mut dest = None;
        patch_line_prefixed(&script, SYNC_PREFIX, |line| {
            let new = sync_destination(&line[SYNC_PREFIX.len()..], &paths.name);
            let rewritten = format!("{}{}", SYNC_PREFIX, new.display());
            dest = Some(new);
            rewritten
        })?;
        if dest.is_none() {
            warn!("{} has no {} line", script.display(), SYNC_PREFIX);
        }
        Ok(dest)
    }

    fn link_restart(&self, paths: &VariantPaths) -> Result<Linkage> {
        let work = self.runner.prepare_staging(&paths.dir, &paths.name)?;
        let archive = archive_path_from_work(&work);
        let in_use = match entry_names(&archive) {
            Ok(names) => names
                .iter()
                .any(|n| n.starts_with("output") || n.starts_with("restart")),
            Err(e) if e.kind() == io::ErrorKind::NotFound => false,
            Err(e) => return Err(io_ctx("listing", &archive, e)),
        };
        if in_use {
            return Ok(Linkage::ArchiveInUse(archive));
        }
        let link = paths.archive();
        make_symlink(&archive, &link).map_err(|e| io_ctx("linking", &link, e))?;

        let template_restart = restart_link_target(&self.template_dir, self.start_from);
        let restart = fs::canonicalize(&template_restart)
            .map_err(|e| io_ctx("resolving", &template_restart, e))?;
        let restart_link = link.join(paths::restart_dir_name(self.start_from));
        make_symlink(&restart, &restart_link).map_err(|e| io_ctx("linking", &restart_link, e))?;

        let ice_src = output_ice_namelist_source(&self.template_dir, self.start_from);
        let ice_dir = link.join(paths::output_dir_name(self.start_from)).join("ice");
        fs::create_dir_all(&ice_dir).map_err(|e| io_ctx("creating", &ice_dir, e))?;
        fs::copy(&ice_src, ice_dir.join(ICE_NAMELIST)).map_err(|e| io_ctx("copying", &ice_src, e))?;
        Ok(Linkage::Linked(restart))
    }

    fn set_job_name(&self, paths: &VariantPaths, axis: &ParameterAxis, value: &Scalar) -> Result<()> {
        let config = paths.dir.join(RUN_CONFIG);
        if !config.exists() {
            warn!("{} has no {}; job name left unchanged", paths.relative.display(), RUN_CONFIG);
            return Ok(());
        }
        let job = paths::job_name(axis, value);
        patch_line_prefixed(&config, JOBNAME_PREFIX, |_| format!("{} {}", JOBNAME_PREFIX, job))?;
        Ok(())
    }

    fn update_metadata(
        &self,
        paths: &VariantPaths,
        restart: Option<&Path>,
        axis: &ParameterAxis,
        value: &Scalar,
    ) -> Result<()> {
        let path = paths.dir.join(METADATA_FILE);
        if !path.exists() {
            warn!("{} has no {}; metadata left unchanged", paths.relative.display(), METADATA_FILE);
            return Ok(());
        }
        let mut record = MetadataRecord::read(&path)?;
        let desc = perturbation_description(
            record.text("description").unwrap_or_default(),
            &self.template_dir,
            restart,
            axis,
            value,
        );
        record.set_text("description", desc);
        record.mark_literal("description");
        record.mark_literal("notes");
        record.append_keywords(["perturbation", axis.name.as_str()]);
        if axis.is_turning_angle() {
            record.append_keywords(["cosw", "sinw"]);
        }
        record.write(&path)
    }
}

enum Linkage {
    Linked(PathBuf),
    ArchiveInUse(PathBuf),
}

fn io_ctx(action: &str, path: &Path, source: io::Error) -> EnsembleError {
    EnsembleError::io(format!("{} {}", action, path.display()), source)
}

#[cfg(unix)]
fn make_symlink(target: &Path, link: &Path) -> io::Result<()> {
    std::os::unix::fs::symlink(target, link)
}

#[cfg(windows)]
fn make_symlink(target: &Path, link: &Path) -> io::Result<()> {
    std::os::windows::fs::symlink_dir(target, link)
}
