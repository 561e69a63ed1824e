//! Line-oriented patching and atomic file replacement.
//!
//! Used for files whose comments must survive (`config.yaml`, `sync_data.sh`),
//! where a structured round-trip would drop them.

use crate::error::PatchError;
use chrono::Utc;
use std::fs;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

/// `path` with `suffix` appended to its file name: `a/b.nml` + `_tmp` -> `a/b.nml_tmp`.
pub fn suffixed(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.file_name().map(|s| s.to_os_string()).unwrap_or_default();
    name.push(suffix);
    path.with_file_name(name)
}

/// Files removed when the guard is dropped, if they still exist.
#[derive(Debug, Default)]
pub struct ScratchFiles {
    paths: Vec<PathBuf>,
}

impl ScratchFiles {
    pub fn track(&mut self, path: PathBuf) {
        self.paths.push(path);
    }
}

impl Drop for ScratchFiles {
    fn drop(&mut self) {
        for path in &self.paths {
            if path.exists() {
                let _ = fs::remove_file(path);
            }
        }
    }
}

pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), PatchError> {
    let io_err = |source| PatchError::Io {
        path: path.to_path_buf(),
        source,
    };
    let tmp = scratch_path(path);
    let mut scratch = ScratchFiles::default();
    scratch.track(tmp.clone());
    let mut file = fs::File::create(&tmp).map_err(io_err)?;
    file.write_all(bytes).map_err(io_err)?;
    file.sync_all().map_err(io_err)?;
    if let Ok(meta) = fs::metadata(path) {
        fs::set_permissions(&tmp, meta.permissions()).map_err(io_err)?;
    }
    fs::rename(&tmp, path).map_err(io_err)?;
    if let Some(parent) = path.parent() {
        if let Ok(dir) = fs::File::open(parent) {
            let _ = dir.sync_all();
        }
    }
    Ok(())
}

fn scratch_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("tmpfile");
    path.with_file_name(format!(
        ".{}.tmp.{}.{}",
        name,
        std::process::id(),
        Utc::now().timestamp_micros()
    ))
}

/// Replace every line of `path` that starts with `prefix` by
/// `rewrite(line)`, streaming into a temporary file that is renamed over the
/// original only once fully written.
///
/// `rewrite` receives the line without its terminator; the original
/// terminator is kept. Returns the number of lines replaced.
pub fn patch_line_prefixed<F>(path: &Path, prefix: &str, mut rewrite: F) -> Result<usize, PatchError>
where
    F: FnMut(&str) -> String,
{
    let io_err = |source| PatchError::Io {
        path: path.to_path_buf(),
        source,
    };
    let tmp = suffixed(path, "_tmp");
    let mut scratch = ScratchFiles::default();
    scratch.track(tmp.clone());

    let reader = BufReader::new(fs::File::open(path).map_err(io_err)?);
    let mut writer = BufWriter::new(fs::File::create(&tmp).map_err(io_err)?);
    let mut replaced = 0;
    for line in split_inclusive_lines(reader) {
        let line = line.map_err(io_err)?;
        if line.starts_with(prefix) {
            let body = line.trim_end_matches(['\n', '\r']);
            let terminator = &line[body.len()..];
            writer
                .write_all(rewrite(body).as_bytes())
                .map_err(io_err)?;
            writer.write_all(terminator.as_bytes()).map_err(io_err)?;
            replaced += 1;
        } else {
            writer.write_all(line.as_bytes()).map_err(io_err)?;
        }
    }
    let file = writer.into_inner().map_err(|e| io_err(e.into_error()))?;
    file.sync_all().map_err(io_err)?;
    drop(file);

    let perms = fs::metadata(path).map_err(io_err)?.permissions();
    fs::set_permissions(&tmp, perms).map_err(io_err)?;
    fs::rename(&tmp, path).map_err(io_err)?;
    Ok(replaced)
}

/// Lines including their terminators, so untouched lines pass through byte for byte.
fn split_inclusive_lines<R: BufRead>(mut reader: R) -> impl Iterator<Item = std::io::Result<String>> {
    std::iter::from_fn(move || {
        let mut buf = String::new();
        match reader.read_line(&mut buf) {
            Ok(0) => None,
            Ok(_) => Some(Ok(buf)),
            Err(e) => Some(Err(e)),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replaces_prefixed_lines_and_keeps_comments() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.yaml");
        let original = "# PBS configuration\njobname: 1deg_jra55_iaf\nqueue: normal # comment\n";
        fs::write(&path, original).expect("write");

        let n = patch_line_prefixed(&path, "jobname:", |_| "jobname: turning_angle_30".to_string())
            .expect("patch");
        assert_eq!(n, 1);
        assert_eq!(
            fs::read_to_string(&path).expect("read"),
            "# PBS configuration\njobname: turning_angle_30\nqueue: normal # comment\n"
        );
        assert!(!suffixed(&path, "_tmp").exists());
    }

    #[test]
    fn rewrite_sees_line_without_terminator() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("sync_data.sh");
        fs::write(&path, "#!/bin/bash\r\nSYNCDIR=/g/data/x/run\r\nrsync\n").expect("write");
        let mut seen = Vec::new();
        patch_line_prefixed(&path, "SYNCDIR=", |line| {
            seen.push(line.to_string());
            "SYNCDIR=/g/data/x/new".to_string()
        })
        .expect("patch");
        assert_eq!(seen, vec!["SYNCDIR=/g/data/x/run".to_string()]);
        assert_eq!(
            fs::read_to_string(&path).expect("read"),
            "#!/bin/bash\r\nSYNCDIR=/g/data/x/new\r\nrsync\n"
        );
    }

    #[test]
    fn missing_file_leaves_no_scratch() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("absent.sh");
        let err = patch_line_prefixed(&path, "X=", |l| l.to_string()).expect_err("missing");
        assert!(matches!(err, PatchError::Io { .. }));
        assert_eq!(fs::read_dir(dir.path()).expect("read_dir").count(), 0);
    }

    #[cfg(unix)]
    #[test]
    fn keeps_executable_bit() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("sync_data.sh");
        fs::write(&path, "SYNCDIR=/a/b\n").expect("write");
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).expect("chmod");
        patch_line_prefixed(&path, "SYNCDIR=", |_| "SYNCDIR=/a/c".to_string()).expect("patch");
        let mode = fs::metadata(&path).expect("meta").permissions().mode();
        assert_eq!(mode & 0o777, 0o755);
    }

    #[test]
    fn write_atomic_replaces_contents() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("out.txt");
        write_atomic(&path, b"one").expect("first");
        write_atomic(&path, b"two").expect("second");
        assert_eq!(fs::read_to_string(&path).expect("read"), "two");
        assert_eq!(fs::read_dir(dir.path()).expect("read_dir").count(), 1);
    }
}
