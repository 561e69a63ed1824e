//! Version-control primitives used to derive variants from the template.

use crate::error::VcsError;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::debug;

/// A working copy produced by [`VersionControl::clone_repo`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Repo {
    pub path: PathBuf,
}

pub trait VersionControl {
    /// URL of the `origin` remote; fails if `path` is not a working directory.
    fn origin_url(&self, path: &Path) -> Result<String, VcsError>;
    fn clone_repo(&self, src: &Path, dst: &Path) -> Result<Repo, VcsError>;
    fn rename_remote(&self, repo: &Repo, old: &str, new: &str) -> Result<(), VcsError>;
    fn add_remote(&self, repo: &Repo, name: &str, url: &str) -> Result<(), VcsError>;
    /// Create `branch` at the current HEAD and switch to it.
    fn checkout_new_branch(&self, repo: &Repo, branch: &str) -> Result<(), VcsError>;
    /// Uncommitted changes to tracked files; untracked files do not count.
    fn is_dirty(&self, repo: &Repo) -> Result<bool, VcsError>;
    fn remove_tracked_file(&self, repo: &Repo, relative: &Path) -> Result<(), VcsError>;
    /// Commit every change to tracked files.
    fn commit_all(&self, repo: &Repo, message: &str) -> Result<(), VcsError>;
}

/// [`VersionControl`] backed by the `git` executable.
#[derive(Debug, Clone)]
pub struct GitCli {
    program: PathBuf,
}

impl Default for GitCli {
    fn default() -> Self {
        Self {
            program: PathBuf::from("git"),
        }
    }
}

impl GitCli {
    /// Fails if the executable cannot be launched.
    pub fn check_available(&self) -> Result<String, VcsError> {
        let out = Command::new(&self.program)
            .arg("--version")
            .output()
            .map_err(VcsError::Launch)?;
        Ok(String::from_utf8_lossy(&out.stdout).trim().to_string())
    }

    fn git(&self, dir: &Path, args: &[&str]) -> Result<String, VcsError> {
        debug!(dir = %dir.display(), "git {}", args.join(" "));
        let out = Command::new(&self.program)
            .args(args)
            .current_dir(dir)
            .output()
            .map_err(VcsError::Launch)?;
        if !out.status.success() {
            let stderr = String::from_utf8_lossy(&out.stderr);
            return Err(VcsError::Command {
                args: args.join(" "),
                dir: dir.to_path_buf(),
                stderr: stderr
                    .lines()
                    .rev()
                    .find(|l| !l.trim().is_empty())
                    .unwrap_or("no output")
                    .trim()
                    .to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&out.stdout).trim_end().to_string())
    }
}

impl VersionControl for GitCli {
    fn origin_url(&self, path: &Path) -> Result<String, VcsError> {
        if !path.is_dir() {
            return Err(VcsError::NotARepository(path.to_path_buf()));
        }
        match self.git(path, &["rev-parse", "--is-inside-work-tree"]) {
            Ok(flag) if flag.trim() == "true" => {}
            Ok(_) | Err(VcsError::Command { .. }) => {
                return Err(VcsError::NotARepository(path.to_path_buf()));
            }
            Err(e) => return Err(e),
        }
        self.git(path, &["remote", "get-url", "origin"])
            .map_err(|_| VcsError::MissingRemote {
                remote: "origin".to_string(),
                dir: path.to_path_buf(),
            })
    }

    fn clone_repo(&self, src: &Path, dst: &Path) -> Result<Repo, VcsError> {
        let src_s = src.to_string_lossy();
        let dst_s = dst.to_string_lossy();
        self.git(src, &["clone", "--quiet", "--", &src_s, &dst_s])?;
        Ok(Repo {
            path: dst.to_path_buf(),
        })
    }

    fn rename_remote(&self, repo: &Repo, old: &str, new: &str) -> Result<(), VcsError> {
        self.git(&repo.path, &["remote", "rename", old, new]).map(|_| ())
    }

    fn add_remote(&self, repo: &Repo, name: &str, url: &str) -> Result<(), VcsError> {
        self.git(&repo.path, &["remote", "add", name, url]).map(|_| ())
    }

    fn checkout_new_branch(&self, repo: &Repo, branch: &str) -> Result<(), VcsError> {
        self.git(&repo.path, &["checkout", "--quiet", "-b", branch, "HEAD"])
            .map(|_| ())
    }

    fn is_dirty(&self, repo: &Repo) -> Result<bool, VcsError> {
        let status = self.git(&repo.path, &["status", "--porcelain", "--untracked-files=no"])?;
        Ok(!status.trim().is_empty())
    }

    fn remove_tracked_file(&self, repo: &Repo, relative: &Path) -> Result<(), VcsError> {
        let rel = relative.to_string_lossy();
        self.git(&repo.path, &["rm", "--quiet", "--", &rel]).map(|_| ())
    }

    fn commit_all(&self, repo: &Repo, message: &str) -> Result<(), VcsError> {
        self.git(&repo.path, &["commit", "--quiet", "-a", "-m", message])
            .map(|_| ())
    }
}
