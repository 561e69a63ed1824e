//! Deterministic names and locations for ensemble members.

use crate::config::{ParameterAxis, Scalar, StartFrom};
use serde::Serialize;
use std::path::{Path, PathBuf};

/// Ice model namelist copied from the template's start-from output cycle.
pub const ICE_NAMELIST: &str = "cice_in.nml";
pub const SYNC_SCRIPT: &str = "sync_data.sh";
pub const SYNC_PREFIX: &str = "SYNCDIR=";
pub const RUN_CONFIG: &str = "config.yaml";
pub const JOBNAME_PREFIX: &str = "jobname:";
pub const METADATA_FILE: &str = "metadata.yaml";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VariantPaths {
    /// Basename; also the branch name and the job-environment name.
    pub name: String,
    /// Absolute variant directory.
    pub dir: PathBuf,
    /// `dir` relative to the base directory, for messages.
    pub relative: PathBuf,
}

impl VariantPaths {
    pub fn resolve(base_dir: &Path, template: &str, axis: &ParameterAxis, value: &Scalar) -> Self {
        let dir = variant_directory(base_dir, template, &axis.name, value);
        let relative = dir.strip_prefix(base_dir).unwrap_or(&dir).to_path_buf();
        let name = dir
            .file_name()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_default();
        Self {
            name,
            dir,
            relative,
        }
    }

    pub fn archive(&self) -> PathBuf {
        self.dir.join("archive")
    }
}

/// `<base>/<template>_<name>_<value>`.
pub fn variant_directory(base_dir: &Path, template: &str, name: &str, value: &Scalar) -> PathBuf {
    base_dir.join(format!("{}_{}_{}", template, name, value))
}

/// The setup tool creates the archive next to the work directory but does not
/// report it, so it is inferred by swapping the `/work/` path segment.
pub fn archive_path_from_work(work: &Path) -> PathBuf {
    PathBuf::from(work.to_string_lossy().replace("/work/", "/archive/"))
}

pub fn restart_dir_name(start_from: &StartFrom) -> String {
    format!("restart{}", start_from.as_str())
}

pub fn output_dir_name(start_from: &StartFrom) -> String {
    format!("output{}", start_from.as_str())
}

/// `<template>/archive/restart<startfrom>`.
pub fn restart_link_target(template: &Path, start_from: &StartFrom) -> PathBuf {
    template.join("archive").join(restart_dir_name(start_from))
}

/// `<template>/archive/output<startfrom>/ice/cice_in.nml`.
pub fn output_ice_namelist_source(template: &Path, start_from: &StartFrom) -> PathBuf {
    template
        .join("archive")
        .join(output_dir_name(start_from))
        .join("ice")
        .join(ICE_NAMELIST)
}

pub fn job_name(axis: &ParameterAxis, value: &Scalar) -> String {
    format!("{}_{}", axis.name, value)
}

/// Keep the parent of the old sync destination and give each variant its own leaf.
///
/// The parent is everything before the last `/` of the raw value, so a
/// trailing slash keeps the whole directory.
pub fn sync_destination(old_value: &str, variant_name: &str) -> PathBuf {
    let old = old_value.trim_end_matches(['\n', '\r']);
    match old.rfind('/') {
        Some(i) => {
            let head = &old[..=i];
            let parent = match head.trim_end_matches('/') {
                "" => head,
                trimmed => trimmed,
            };
            Path::new(parent).join(variant_name)
        }
        None => PathBuf::from(variant_name),
    }
}

/// `output000`, `output012_extra`: prefix followed by at least three digits.
pub fn is_cycle_entry(name: &str, prefix: &str) -> bool {
    name.strip_prefix(prefix)
        .map(|rest| rest.len() >= 3 && rest.as_bytes()[..3].iter().all(u8::is_ascii_digit))
        .unwrap_or(false)
}

pub fn is_run_summary(name: &str) -> bool {
    name.starts_with("run_summary_") && name.ends_with(".csv")
}
