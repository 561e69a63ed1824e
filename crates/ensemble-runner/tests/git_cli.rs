use ensemble_runner::{
    parse_spec, Ensemble, GitCli, SimulatedRunner, VariantOutcome, VersionControl,
};
use std::fs;
use std::path::Path;
use std::process::Command;

const ORIGIN: &str = "https://github.com/COSIMA/control.git";

fn git_available() -> bool {
    GitCli::default().check_available().is_ok()
}

fn identity() {
    for (key, value) in [
        ("GIT_AUTHOR_NAME", "Ensemble Test"),
        ("GIT_AUTHOR_EMAIL", "ensemble@example.invalid"),
        ("GIT_COMMITTER_NAME", "Ensemble Test"),
        ("GIT_COMMITTER_EMAIL", "ensemble@example.invalid"),
    ] {
        std::env::set_var(key, value);
    }
}

fn git(dir: &Path, args: &[&str]) -> String {
    let out = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .expect("launch git");
    assert!(
        out.status.success(),
        "git {:?} failed: {}",
        args,
        String::from_utf8_lossy(&out.stderr)
    );
    String::from_utf8_lossy(&out.stdout).trim().to_string()
}

fn write(path: &Path, contents: &str) {
    fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
    fs::write(path, contents).expect("write");
}

fn template_repo(base: &Path) -> std::path::PathBuf {
    let template = base.join("control");
    write(
        &template.join("ocean/input.nml"),
        "&ocean_vert_kpp_mom4_nml\n    ricr = 0.3\n/\n",
    );
    write(
        &template.join("sync_data.sh"),
        &format!("SYNCDIR={}\n", base.join("sync/control").display()),
    );
    write(&template.join("config.yaml"), "jobname: control\n");
    write(
        &template.join("metadata.yaml"),
        "description: Control run\nkeywords:\n- control\n",
    );
    write(&template.join("run_summary_control.csv"), "cycle\n");
    git(&template, &["init", "--quiet"]);
    git(&template, &["add", "-A"]);
    git(&template, &["commit", "--quiet", "-m", "control"]);
    git(&template, &["remote", "add", "origin", ORIGIN]);
    template
}

#[test]
fn git_cli_reports_origin_and_rejects_plain_directories() {
    if !git_available() {
        return;
    }
    identity();
    let dir = tempfile::tempdir().expect("tempdir");
    let base = fs::canonicalize(dir.path()).expect("canonical");
    let template = template_repo(&base);
    let vcs = GitCli::default();
    assert_eq!(vcs.origin_url(&template).expect("origin"), ORIGIN);

    let plain = base.join("plain");
    fs::create_dir_all(&plain).expect("mkdir");
    assert!(vcs.origin_url(&plain).is_err());
}

#[test]
fn ensemble_member_is_committed_on_its_own_branch() {
    if !git_available() {
        return;
    }
    identity();
    let dir = tempfile::tempdir().expect("tempdir");
    let base = fs::canonicalize(dir.path()).expect("canonical");
    let template = template_repo(&base);
    let spec = parse_spec(
        "template: control\nstartfrom: rest\nnamelists:\n  ocean/input.nml:\n    ocean_vert_kpp_mom4_nml:\n      ricr: [0.3, 0.5]\n",
    )
    .expect("spec");
    let vcs = GitCli::default();
    let runner = SimulatedRunner::new(base.join("test"));
    let report = Ensemble::new(&spec, &base, &vcs, &runner)
        .run()
        .expect("run");

    let outcomes: Vec<VariantOutcome> = report.variants.iter().map(|v| v.outcome).collect();
    assert_eq!(
        outcomes,
        vec![VariantOutcome::IdenticalToTemplate, VariantOutcome::Committed]
    );
    assert!(report.runs.is_empty());

    let member = base.join("control_ricr_0.5");
    assert_eq!(
        git(&member, &["rev-parse", "--abbrev-ref", "HEAD"]),
        "control_ricr_0.5"
    );
    assert_eq!(git(&member, &["remote", "get-url", "origin"]), ORIGIN);
    assert_eq!(
        git(&member, &["remote", "get-url", "template"]),
        template.display().to_string()
    );
    assert_eq!(git(&member, &["log", "-1", "--format=%s"]), "set up control_ricr_0.5");
    assert_eq!(git(&member, &["status", "--porcelain"]), "");
    assert!(!member.join("run_summary_control.csv").exists());
    assert!(fs::read_to_string(member.join("ocean/input.nml"))
        .expect("namelist")
        .contains("ricr = 0.5"));
    assert_eq!(
        fs::read_to_string(member.join("config.yaml")).expect("config"),
        "jobname: ricr_0.5\n"
    );
}
