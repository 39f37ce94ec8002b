use anyhow::{anyhow, Result};
use std::sync::Arc;

use watchsync::backend::registry::http_client;
use watchsync::config::{apply_env, env};
use watchsync::storage::{RedbStore, StateStore};
use watchsync::{backup, logging, BackendRegistry, Config, Orchestrator, RunMode};

const USAGE: &str = "\
Usage: watchsync <command> [--dry-run] [-v]

Commands:
  import    Import play state from every backend
  export    Push canonical play state to every backend
  sync      Import, then export
  backup    Write per-backend backups
  prune     Remove stale backend records
  indexes   Rebuild indexes and compact the state database
  tasks     List scheduled tasks
  env       List environment overrides
  config    Print an example config file";

struct Args {
    command: String,
    dry_run: bool,
    verbose: bool,
}

fn parse_args() -> Result<Args> {
    let mut command = None;
    let mut dry_run = false;
    let mut verbose = false;

    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--dry-run" => dry_run = true,
            "-v" | "--verbose" => verbose = true,
            "-h" | "--help" => command = Some("help".to_string()),
            _ if arg.starts_with('-') => return Err(anyhow!("Unknown option: {}\n\n{}", arg, USAGE)),
            _ if command.is_none() => command = Some(arg),
            _ => return Err(anyhow!("Unexpected argument: {}\n\n{}", arg, USAGE)),
        }
    }

    Ok(Args {
        command: command.unwrap_or_else(|| "help".to_string()),
        dry_run,
        verbose,
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = parse_args()?;

    match args.command.as_str() {
        "help" => {
            println!("{}", USAGE);
            return Ok(());
        }
        "config" => {
            println!("{}", Config::example_config());
            return Ok(());
        }
        "env" => {
            for option in env::options() {
                println!("{:<28} {:<24} {:<7} {}", option.env, option.key, option.kind, option.description);
            }
            return Ok(());
        }
        _ => {}
    }

    let mut config = Config::load()?;
    let env_errors = apply_env(&mut config, std::env::vars());
    if args.dry_run {
        config.dry_run = true;
    }

    logging::init(&config.logs.level, args.verbose);
    for error in env_errors.iter().chain(config.validate().iter()) {
        tracing::warn!(error = %error, "Configuration value rejected");
    }

    if args.command == "tasks" {
        for task in config.tasks().into_iter().filter(|t| !t.hidden) {
            println!(
                "{:<8} {:<8} {:<16} {:<6} {}",
                task.name,
                if task.enabled { "enabled" } else { "disabled" },
                task.timer,
                task.args,
                task.name.description()
            );
        }
        return Ok(());
    }

    let config = Arc::new(config);
    let registry = BackendRegistry::from_config(&config, http_client()?);
    let store: Box<dyn StateStore> = Box::new(RedbStore::new()?);
    let mut orchestrator = Orchestrator::new(config, registry, store);

    match args.command.as_str() {
        "import" | "export" | "sync" => {
            let mode: RunMode = args.command.parse()?;
            let report = orchestrator.run(mode).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        "backup" => {
            let dir = backup::backup_dir()?;
            for path in orchestrator.backup(&dir).await? {
                println!("{}", path.display());
            }
        }
        "prune" => {
            let report = orchestrator.prune().await?;
            println!(
                "Removed {} backend records and {} entities",
                report.records_removed, report.entities_removed
            );
        }
        "indexes" => {
            let report = orchestrator.reindex().await?;
            println!(
                "Indexed {} entities ({} guid pairs), compacted: {}",
                report.entities, report.guid_pairs, report.compacted
            );
        }
        other => return Err(anyhow!("Unknown command: {}\n\n{}", other, USAGE)),
    }

    Ok(())
}
