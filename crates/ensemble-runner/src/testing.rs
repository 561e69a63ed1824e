//! Template experiment laid out on disk for engine tests.

use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

pub const TEMPLATE: &str = "control";
pub const ORIGIN: &str = "https://github.com/COSIMA/control.git";

pub const CICE_IN: &str = "\
&setup_nml
    days_per_year = 365
/
&dynamics_nml
    kdyn = 1
    cosw = 1.0 ! cos(turning angle)
    sinw = 0.0
/
";

pub const INPUT_NML: &str = "\
&ocean_vert_kpp_mom4_nml
    ricr = 0.3
    smooth_ri_kmax_eq_kmu = .true.
/
";

pub struct Fixture {
    _dir: TempDir,
    pub base: PathBuf,
    pub template: PathBuf,
}

impl Fixture {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let base = fs::canonicalize(dir.path()).expect("canonical base");
        let template = base.join(TEMPLATE);
        write(&template.join("ice/cice_in.nml"), CICE_IN);
        write(&template.join("ocean/input.nml"), INPUT_NML);
        write(
            &template.join("sync_data.sh"),
            &format!(
                "#!/bin/bash\nSYNCDIR={}\nrsync -a archive/ $SYNCDIR\n",
                base.join("sync").join(TEMPLATE).display()
            ),
        );
        write(
            &template.join("config.yaml"),
            "# PBS configuration\njobname: control\nqueue: normal  # keep\n",
        );
        write(
            &template.join("metadata.yaml"),
            "description: Control run\nnotes: Spun up from rest\nkeywords:\n- control\n",
        );
        write(&template.join("run_summary_control.csv"), "cycle,walltime\n");

        let archive = template.join("archive");
        fs::create_dir_all(archive.join("restart003")).expect("restart003");
        write(
            &archive.join("output003/ice/cice_in.nml"),
            CICE_IN,
        );
        Self {
            _dir: dir,
            base,
            template,
        }
    }

    pub fn read(&self, path: impl AsRef<Path>) -> String {
        fs::read_to_string(self.base.join(path)).expect("read fixture file")
    }
}

pub fn write(path: &Path, contents: &str) {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).expect("parent dir");
    }
    fs::write(path, contents).expect("write fixture file");
}
