use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;

use craftboot::config::{Config, Provision};
use craftboot::election::{self, Role};
use craftboot::install;
use craftboot::launch;
use craftboot::report::{write_json_stdout, Reporter};
use craftboot::storage::{self, Storage};
use craftboot::{discover, workers};

const DEFAULT_CONFIG_PATH: &str = "craftboot.json";
const DEFAULT_SEARCH_DIR: &str = "/usr/lib/jvm";
const DEFAULT_PORT: u16 = 8090;

const INSTALL_SCHEMA_VERSION: &str = "craftboot.install.report@0.1.0";
const DISCOVER_SCHEMA_VERSION: &str = "craftboot.discover.report@0.1.0";
const PLAN_SCHEMA_VERSION: &str = "craftboot.plan@0.1.0";
const DOCTOR_SCHEMA_VERSION: &str = "craftboot.doctor.report@0.1.0";

#[derive(Debug, Parser)]
#[command(name = "craftboot")]
#[command(about = "Server startup orchestrator.", long_about = None)]
struct Cli {
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[arg(long, global = true)]
    storage: Option<PathBuf>,

    #[arg(long, global = true)]
    json: bool,

    #[arg(long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Run(RunArgs),
    Install,
    Discover,
    Which { id: String },
    Doctor,
}

#[derive(Debug, Args)]
struct RunArgs {
    #[arg(long)]
    port: Option<u16>,

    #[arg(long)]
    bind: Option<String>,

    #[arg(long)]
    local: bool,

    #[arg(long)]
    dry_run: bool,
}

fn main() -> std::process::ExitCode {
    match try_main() {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{err:#}");
            std::process::ExitCode::from(2)
        }
    }
}

fn try_main() -> Result<std::process::ExitCode> {
    let cli = Cli::parse();
    let reporter = Reporter {
        json: cli.json,
        quiet: cli.quiet,
    };
    let cfg = Config::load(&cli.config)?;
    let candidates = storage_candidates(cli.storage);

    match cli.cmd {
        Command::Run(args) => cmd_run(&cfg, &candidates, args, &reporter),
        Command::Install => cmd_install(&cfg, &candidates, &reporter),
        Command::Discover => cmd_discover(&cfg, &candidates, &reporter),
        Command::Which { id } => cmd_which(&cfg, &candidates, &id, &reporter),
        Command::Doctor => cmd_doctor(&cfg, &candidates, &reporter),
    }
}

/// An explicit `--storage` override is tried first; the built-in preference
/// order stays behind it as fallback.
fn storage_candidates(override_path: Option<PathBuf>) -> Vec<PathBuf> {
    let mut out = Vec::new();
    if let Some(p) = override_path {
        out.push(p);
    }
    out.extend(storage::default_candidates());
    out
}

fn effective_port(cli_port: Option<u16>) -> Result<u16> {
    if let Some(p) = cli_port {
        return Ok(p);
    }
    if let Ok(v) = std::env::var("PORT") {
        if !v.is_empty() {
            return v.parse::<u16>().with_context(|| format!("parse PORT={v}"));
        }
    }
    Ok(DEFAULT_PORT)
}

fn provision_runtimes(cfg: &Config, st: &Storage, reporter: &Reporter) -> install::InstallSummary {
    match cfg.provision {
        Provision::Download => install::ensure_all(st, &cfg.runtimes, reporter),
        Provision::Preinstalled => {
            let search_dir = cfg
                .search_dir
                .clone()
                .unwrap_or_else(|| PathBuf::from(DEFAULT_SEARCH_DIR));
            let mut outcomes = Vec::new();
            for spec in &cfg.runtimes {
                let outcome =
                    match discover::alias_runtime(&st.root, &search_dir, &spec.id, reporter) {
                        Ok(Some(path)) => install::InstallOutcome {
                            id: spec.id.clone(),
                            status: install::InstallStatus::Installed,
                            path: Some(path.display().to_string()),
                            error: None,
                        },
                        Ok(None) => install::InstallOutcome {
                            id: spec.id.clone(),
                            status: install::InstallStatus::Failed,
                            path: None,
                            error: Some("no unambiguous pre-installed match".to_string()),
                        },
                        Err(err) => install::InstallOutcome {
                            id: spec.id.clone(),
                            status: install::InstallStatus::Failed,
                            path: None,
                            error: Some(format!("{err:#}")),
                        },
                    };
                outcomes.push(outcome);
            }
            let had_errors = outcomes
                .iter()
                .any(|o| o.status == install::InstallStatus::Failed);
            install::InstallSummary {
                outcomes,
                had_errors,
            }
        }
    }
}

fn warn_failed_outcomes(summary: &install::InstallSummary, reporter: &Reporter) {
    for o in &summary.outcomes {
        if o.status == install::InstallStatus::Failed {
            reporter.warn(&format!(
                "runtime {}: {}",
                o.id,
                o.error.as_deref().unwrap_or("install failed")
            ));
        }
    }
}

fn cmd_run(
    cfg: &Config,
    candidates: &[PathBuf],
    args: RunArgs,
    reporter: &Reporter,
) -> Result<std::process::ExitCode> {
    let st = storage::resolve(candidates)?;
    reporter.progress(&format!("storage base: {}", st.root.display()));

    let summary = provision_runtimes(cfg, &st, reporter);
    warn_failed_outcomes(&summary, reporter);
    if summary.had_errors {
        // Per-identifier failures never abort startup; the server degrades
        // on its own when a runtime it needs is missing.
        reporter.warn("one or more runtimes failed to provision; continuing");
    }

    let role = if args.local {
        Role::Primary
    } else {
        election::elect(&election::default_lock_path())?
    };
    if role.is_primary() {
        let installed = install::list_installed(&st.root)?;
        reporter.progress(&format!(
            "elected primary; runtimes installed: {}",
            if installed.is_empty() {
                "none".to_string()
            } else {
                installed.join(", ")
            }
        ));
    }

    let worker_count = workers::worker_count(workers::detected_cores());
    let port = effective_port(args.port)?;
    let bind_host = match args.bind {
        Some(host) => host,
        None if args.local => "127.0.0.1".to_string(),
        None => "0.0.0.0".to_string(),
    };

    let plan = launch::plan(&cfg.server, &bind_host, port, worker_count, role);

    if args.dry_run {
        if reporter.json {
            write_json_stdout(&PlanReport {
                schema_version: PLAN_SCHEMA_VERSION,
                ok: true,
                role: role_name(role),
                workers: worker_count,
                plan,
            })?;
        } else {
            println!("{}", plan.command_line());
            for var in &plan.env {
                println!("  {}={}", var.name, var.value);
            }
        }
        return Ok(std::process::ExitCode::SUCCESS);
    }

    reporter.progress(&format!("exec: {}", plan.command_line()));
    launch::exec(&plan)
}

fn role_name(role: Role) -> &'static str {
    if role.is_primary() {
        "primary"
    } else {
        "secondary"
    }
}

#[derive(Debug, Serialize)]
struct PlanReport {
    schema_version: &'static str,
    ok: bool,
    role: &'static str,
    workers: usize,
    plan: launch::LaunchPlan,
}

#[derive(Debug, Serialize)]
struct InstallReport {
    schema_version: &'static str,
    ok: bool,
    root: String,
    outcomes: Vec<install::InstallOutcome>,
    had_errors: bool,
}

fn cmd_install(
    cfg: &Config,
    candidates: &[PathBuf],
    reporter: &Reporter,
) -> Result<std::process::ExitCode> {
    let st = storage::resolve(candidates)?;
    let summary = install::ensure_all(&st, &cfg.runtimes, reporter);
    let had_errors = summary.had_errors;

    if reporter.json {
        write_json_stdout(&InstallReport {
            schema_version: INSTALL_SCHEMA_VERSION,
            ok: !had_errors,
            root: st.root.display().to_string(),
            outcomes: summary.outcomes,
            had_errors,
        })?;
    } else {
        for o in &summary.outcomes {
            match o.status {
                install::InstallStatus::Installed => println!("ok: installed {}", o.id),
                install::InstallStatus::AlreadyInstalled => {
                    println!("ok: {} already installed", o.id)
                }
                install::InstallStatus::Failed => println!(
                    "error: {}: {}",
                    o.id,
                    o.error.as_deref().unwrap_or("install failed")
                ),
            }
        }
    }

    Ok(if had_errors {
        std::process::ExitCode::from(1)
    } else {
        std::process::ExitCode::SUCCESS
    })
}

#[derive(Debug, Serialize)]
struct DiscoverReport {
    schema_version: &'static str,
    ok: bool,
    root: String,
    resolved: Vec<ResolvedAlias>,
    unresolved: Vec<String>,
}

#[derive(Debug, Serialize)]
struct ResolvedAlias {
    id: String,
    path: String,
}

fn cmd_discover(
    cfg: &Config,
    candidates: &[PathBuf],
    reporter: &Reporter,
) -> Result<std::process::ExitCode> {
    let st = storage::resolve(candidates)?;
    let search_dir = cfg
        .search_dir
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_SEARCH_DIR));

    let mut resolved = Vec::new();
    let mut unresolved = Vec::new();
    for spec in &cfg.runtimes {
        match discover::alias_runtime(&st.root, &search_dir, &spec.id, reporter)? {
            Some(path) => resolved.push(ResolvedAlias {
                id: spec.id.clone(),
                path: path.display().to_string(),
            }),
            None => unresolved.push(spec.id.clone()),
        }
    }

    if reporter.json {
        write_json_stdout(&DiscoverReport {
            schema_version: DISCOVER_SCHEMA_VERSION,
            ok: true,
            root: st.root.display().to_string(),
            resolved,
            unresolved,
        })?;
    } else {
        for alias in &resolved {
            println!("ok: {} -> {}", alias.id, alias.path);
        }
        for id in &unresolved {
            println!("unresolved: {id}");
        }
    }
    Ok(std::process::ExitCode::SUCCESS)
}

fn cmd_which(
    cfg: &Config,
    candidates: &[PathBuf],
    id: &str,
    reporter: &Reporter,
) -> Result<std::process::ExitCode> {
    let st = storage::resolve(candidates)?;

    if install::is_installed(&st.root, id) {
        println!("{}", install::marker_path(&st.root, id).display());
        return Ok(std::process::ExitCode::SUCCESS);
    }

    for fallback in cfg.fallback_order() {
        if fallback == id {
            continue;
        }
        if install::is_installed(&st.root, &fallback) {
            reporter.warn(&format!("runtime {id} not installed; falling back to {fallback}"));
            println!("{}", install::marker_path(&st.root, &fallback).display());
            return Ok(std::process::ExitCode::SUCCESS);
        }
    }

    println!("error: no installed runtime for {id} (including fallbacks)");
    Ok(std::process::ExitCode::from(1))
}

#[derive(Debug, Serialize)]
struct DoctorReport {
    schema_version: &'static str,
    ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    root: Option<String>,
    checks: Vec<DoctorCheck>,
}

#[derive(Debug, Serialize)]
struct DoctorCheck {
    name: String,
    ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<String>,
}

fn cmd_doctor(
    cfg: &Config,
    candidates: &[PathBuf],
    reporter: &Reporter,
) -> Result<std::process::ExitCode> {
    let mut checks: Vec<DoctorCheck> = Vec::new();

    let st = match storage::resolve(candidates) {
        Ok(st) => {
            checks.push(DoctorCheck {
                name: "storage".to_string(),
                ok: true,
                detail: Some(st.root.display().to_string()),
            });
            Some(st)
        }
        Err(err) => {
            checks.push(DoctorCheck {
                name: "storage".to_string(),
                ok: false,
                detail: Some(format!("{err:#}")),
            });
            None
        }
    };

    if let Some(st) = &st {
        for spec in &cfg.runtimes {
            let marker = install::marker_path(&st.root, &spec.id);
            checks.push(DoctorCheck {
                name: format!("runtime:{}", spec.id),
                ok: install::is_installed(&st.root, &spec.id),
                detail: Some(marker.display().to_string()),
            });
        }
    }

    let lock_path = election::default_lock_path();
    checks.push(DoctorCheck {
        name: "election_lock".to_string(),
        ok: true,
        detail: Some(format!(
            "{} ({})",
            if lock_path.exists() { "held" } else { "free" },
            lock_path.display()
        )),
    });

    let cores = workers::detected_cores();
    checks.push(DoctorCheck {
        name: "workers".to_string(),
        ok: true,
        detail: Some(format!(
            "cores={cores} workers={}",
            workers::worker_count(cores)
        )),
    });

    let ok = checks.iter().all(|c| c.ok);
    if reporter.json {
        write_json_stdout(&DoctorReport {
            schema_version: DOCTOR_SCHEMA_VERSION,
            ok,
            root: st.as_ref().map(|s| s.root.display().to_string()),
            checks,
        })?;
    } else if ok {
        println!("ok: craftboot doctor");
    } else {
        println!("error: craftboot doctor found problems");
        for c in checks.iter().filter(|c| !c.ok) {
            println!("  {}: {}", c.name, c.detail.as_deref().unwrap_or(""));
        }
    }
    Ok(if ok {
        std::process::ExitCode::SUCCESS
    } else {
        std::process::ExitCode::from(1)
    })
}
