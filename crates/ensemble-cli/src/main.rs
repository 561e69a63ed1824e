use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use ensemble_runner::{
    EnsembleReport, EnsembleSpec, ExperimentRunner, GitCli, PayuRunner, PlannedVariant,
    SimulatedRunner,
};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser)]
#[command(
    name = "ensemble",
    version,
    about = "Generate and run one-at-a-time perturbation ensembles of payu experiments"
)]
struct Cli {
    /// Debug logging unless RUST_LOG is set.
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create missing ensemble members and top each up to `nruns`.
    Run {
        #[arg(default_value = "ensemble.yaml")]
        spec: PathBuf,
        /// Simulate payu: stage under <base-dir>/test and only print run commands.
        #[arg(long)]
        test: bool,
        #[arg(long)]
        base_dir: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },
    /// List planned members without touching the filesystem.
    Describe {
        #[arg(default_value = "ensemble.yaml")]
        spec: PathBuf,
        #[arg(long)]
        base_dir: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    let json_mode = command_json_mode(&cli.command);
    let result = run_command(cli.command);
    match result {
        Ok(Some(payload)) => {
            emit_json(&payload);
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(err) => {
            if json_mode {
                emit_json(&json_error("command_failed", format!("{:#}", err), json!({})));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn run_command(command: Commands) -> Result<Option<Value>> {
    match command {
        Commands::Run {
            spec,
            test,
            base_dir,
            json,
        } => {
            let base = resolve_base_dir(base_dir)?;
            let spec = load(&spec)?;
            let vcs = GitCli::default();
            preflight(&vcs, test)?;

            let payu = PayuRunner::default();
            let simulated = SimulatedRunner::new(base.join("test"));
            let runner: &dyn ExperimentRunner = if test { &simulated } else { &payu };
            let report = ensemble_runner::Ensemble::new(&spec, &base, &vcs, runner).run()?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "run",
                    "base_dir": base.display().to_string(),
                    "test": test,
                    "report": report_to_json(&report)?
                })));
            }
            print_report(&report);
        }
        Commands::Describe {
            spec,
            base_dir,
            json,
        } => {
            let base = resolve_base_dir(base_dir)?;
            let spec = load(&spec)?;
            let planned = ensemble_runner::describe_ensemble(&spec, &base);
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "describe",
                    "summary": summary_to_json(&spec, &base),
                    "variants": serde_json::to_value(&planned)?
                })));
            }
            print_summary(&spec, &base);
            print_planned(&planned);
        }
    }
    Ok(None)
}

fn resolve_base_dir(base_dir: Option<PathBuf>) -> Result<PathBuf> {
    let dir = match base_dir {
        Some(dir) => dir,
        None => std::env::current_dir().context("resolving current directory")?,
    };
    std::fs::canonicalize(&dir).with_context(|| format!("resolving base directory {}", dir.display()))
}

fn load(path: &Path) -> Result<EnsembleSpec> {
    ensemble_runner::load_spec(path)
        .with_context(|| format!("loading ensemble specification {}", path.display()))
}

fn preflight(vcs: &GitCli, test: bool) -> Result<()> {
    let version = vcs
        .check_available()
        .context("git is required to clone the template experiment")?;
    tracing::debug!("using {}", version);
    if !test {
        let payu = PayuRunner::default();
        ensemble_runner::check_launchable(payu.program())
            .context("payu is required to set up and run ensemble members (use --test to simulate)")?;
    }
    Ok(())
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\",\"details\":{{}}}}}}"
        ),
    }
}

fn json_error(code: &str, message: String, details: Value) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
            "details": details
        }
    })
}

fn command_json_mode(command: &Commands) -> bool {
    match command {
        Commands::Run { json, .. } | Commands::Describe { json, .. } => *json,
    }
}

fn summary_to_json(spec: &EnsembleSpec, base: &Path) -> Value {
    json!({
        "template": spec.template,
        "template_dir": base.join(&spec.template).display().to_string(),
        "startfrom": spec.start_from.as_str(),
        "nruns": spec.n_runs,
        "axes": spec.axes.iter().map(|a| json!({
            "field": a.field_path(),
            "values": a.values.len()
        })).collect::<Vec<_>>()
    })
}

fn report_to_json(report: &EnsembleReport) -> Result<Value> {
    Ok(json!({
        "variants": serde_json::to_value(&report.variants)?,
        "runs": serde_json::to_value(&report.runs)?,
        "members": report.members().iter().map(|m| m.display().to_string()).collect::<Vec<_>>()
    }))
}

fn print_summary(spec: &EnsembleSpec, base: &Path) {
    println!("template: {}", base.join(&spec.template).display());
    println!("startfrom: {}", spec.start_from);
    println!("nruns: {}", spec.n_runs);
}

fn print_planned(planned: &[PlannedVariant]) {
    for p in planned {
        let state = if p.exists { "exists" } else { "planned" };
        println!("{}: {} = {} ({})", state, p.field, p.value, p.paths.relative.display());
    }
}

fn print_report(report: &EnsembleReport) {
    for v in &report.variants {
        match &v.detail {
            Some(detail) => println!(
                "{}: {} ({})",
                v.outcome.as_str(),
                v.paths.relative.display(),
                detail.display()
            ),
            None => println!("{}: {}", v.outcome.as_str(), v.paths.relative.display()),
        }
    }
    for r in &report.runs {
        match (&r.dispatch, &r.error) {
            (_, Some(err)) => println!("run_failed: {} ({})", r.member.display(), err),
            (Some(d), None) => println!("{}", d.command),
            (None, None) => println!(
                "complete: {} ({} runs)",
                r.member.display(),
                r.done_runs
            ),
        }
    }
    println!("members: {}", report.members().len());
}
