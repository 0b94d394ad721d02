//! `rcy` command line driver
//!
//! Runs solver and recovery stages for a model described in TOML and
//! maintains its result archive.

use anyhow::{bail, Context, Result};
use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use rcy_archive::{ResultArchive, SubTask};
use rcy_core::prelude::*;
use rcy_core::PartId;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

fn cli() -> Command {
    Command::new("rcy")
        .version(rcy_core::VERSION)
        .about("FEDEM solver and recovery orchestration")
        .arg_required_else_help(true)
        .subcommand_required(true)
        .arg(
            Arg::new("model")
                .long("model")
                .short('m')
                .global(true)
                .value_parser(value_parser!(PathBuf))
                .help("Model description (TOML)"),
        )
        .arg(
            Arg::new("config")
                .long("config")
                .short('c')
                .global(true)
                .value_parser(value_parser!(PathBuf))
                .help("Orchestration settings (TOML)"),
        )
        .subcommand(
            Command::new("recover")
                .about("Run one solver kind for a set of scenarios")
                .arg(
                    Arg::new("stage")
                        .required(true)
                        .value_parser(value_parser!(StageKind))
                        .help("solver, stress, gage, modes, strain-coat or fe-fatigue"),
                )
                .arg(
                    Arg::new("scenario")
                        .long("scenario")
                        .short('s')
                        .action(ArgAction::Append)
                        .help("Scenario to run: 'master' or an event number (default: master)"),
                )
                .arg(
                    Arg::new("all-events")
                        .long("all-events")
                        .action(ArgAction::SetTrue)
                        .help("Run every event declared in the model"),
                )
                .arg(
                    Arg::new("part")
                        .long("part")
                        .short('p')
                        .action(ArgAction::Append)
                        .help("FE part to recover (default: all parts)"),
                )
                .arg(
                    Arg::new("jobs")
                        .long("jobs")
                        .short('j')
                        .value_parser(value_parser!(usize))
                        .help("Maximum number of concurrent solver processes"),
                )
                .arg(
                    Arg::new("discard")
                        .long("discard")
                        .action(ArgAction::SetTrue)
                        .help("Close the archive without saving the new results"),
                ),
        )
        .subcommand(
            Command::new("inspect")
                .about("Print the result archive of every scenario")
                .arg(
                    Arg::new("json")
                        .long("json")
                        .action(ArgAction::SetTrue)
                        .help("Output as JSON"),
                ),
        )
        .subcommand(
            Command::new("save")
                .about("Commit the archive on disk, removing superseded result versions")
                .arg(
                    Arg::new("keep-empty-dirs")
                        .long("keep-empty-dirs")
                        .action(ArgAction::SetTrue)
                        .help("Leave empty sub-task directories in place"),
                ),
        )
        .subcommand(
            Command::new("reset")
                .about("Start a new task version, deleting all existing results")
                .arg(
                    Arg::new("include-master")
                        .long("include-master")
                        .action(ArgAction::SetTrue)
                        .help("Reset the master scenario as well as the events"),
                )
                .arg(
                    Arg::new("force")
                        .long("force")
                        .required(true)
                        .action(ArgAction::SetTrue)
                        .help("Confirm the deletion"),
                ),
        )
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let matches = cli().get_matches();
    let session = Session::load(&matches)?;

    match matches.subcommand() {
        Some(("recover", args)) => {
            let failures = recover(session, args).await?;
            if failures > 0 {
                std::process::exit(1);
            }
        }
        Some(("inspect", args)) => inspect(&session, args.get_flag("json"))?,
        Some(("save", args)) => {
            session.open_all()?;
            session.archives.save(!args.get_flag("keep-empty-dirs"))?;
            println!("Saved {}", session.archives.rdb_root().display());
        }
        Some(("reset", args)) => {
            session.open_all()?;
            session.archives.increment(args.get_flag("include-master"))?;
            session.archives.save(true)?;
            println!("Reset {}", session.archives.rdb_root().display());
        }
        _ => bail!("a subcommand is required"),
    }
    Ok(())
}

/// Model, settings and archives for one invocation
struct Session {
    model: StaticModel,
    config: RecoveryConfig,
    fs: Arc<dyn FileSystem>,
    archives: Arc<ResultArchiveManager>,
}

impl Session {
    fn load(matches: &ArgMatches) -> Result<Self> {
        let model_file = matches
            .get_one::<PathBuf>("model")
            .context("--model is required")?;
        let model = StaticModel::load(model_file)
            .with_context(|| format!("loading model {}", model_file.display()))?;

        let mut config = match matches.get_one::<PathBuf>("config") {
            Some(path) => RecoveryConfig::load(path)
                .with_context(|| format!("loading settings {}", path.display()))?,
            None => RecoveryConfig::new(),
        };
        if config.archive.rdb_root.is_relative() {
            config.archive.rdb_root = model.model_dir.join(&config.archive.rdb_root);
        }

        let fs: Arc<dyn FileSystem> = Arc::new(LocalFileSystem);
        let archives = Arc::new(ResultArchiveManager::new(
            config.archive.clone(),
            Arc::clone(&fs),
        ));
        for event in &model.events {
            archives.add_scenario(ScenarioId::Event(event.id), event.probability)?;
        }
        Ok(Self {
            model,
            config,
            fs,
            archives,
        })
    }

    /// Load every scenario's archive from disk
    fn open_all(&self) -> Result<Vec<(ScenarioId, ResultArchive)>> {
        self.archives
            .scenarios()
            .into_iter()
            .map(|scenario| -> Result<(ScenarioId, ResultArchive)> {
                let archive = self.archives.open(scenario.id)?;
                Ok((scenario.id, archive))
            })
            .collect()
    }
}

fn parse_scenario(text: &str) -> Result<ScenarioId> {
    if text.eq_ignore_ascii_case("master") {
        return Ok(ScenarioId::Master);
    }
    let id = text
        .trim_start_matches("event_")
        .parse::<u32>()
        .with_context(|| format!("'{text}' is neither 'master' nor an event number"))?;
    Ok(ScenarioId::Event(id))
}

fn build_batch(
    kind: StageKind,
    scenarios: &[ScenarioId],
    parts: &[PartId],
    model: &StaticModel,
) -> Result<RecoveryBatch> {
    let batch = match kind {
        StageKind::Solver => RecoveryBatch::dynamics(scenarios),
        StageKind::Stress => RecoveryBatch::stress_recovery(scenarios, parts, &model.stress),
        StageKind::Modes => RecoveryBatch::mode_expansion(scenarios, parts, &model.modes),
        other => match RecoveryBatch::per_part(other, scenarios, parts) {
            Some(batch) => batch,
            None => bail!("{other} cannot be run per part"),
        },
    };
    Ok(batch)
}

#[derive(Debug, Default)]
struct Tally {
    finished: usize,
    failed: usize,
    skipped: usize,
    cancelled: usize,
}

impl Tally {
    fn record(&mut self, event: &StageEvent) {
        match event {
            StageEvent::Finished { exit_code: 0, .. } => self.finished += 1,
            StageEvent::Finished { .. } | StageEvent::Failed { .. } => self.failed += 1,
            StageEvent::Skipped { .. } => self.skipped += 1,
            StageEvent::Cancelled { .. } => self.cancelled += 1,
            _ => {}
        }
    }
}

async fn recover(session: Session, args: &ArgMatches) -> Result<usize> {
    let kind = *args
        .get_one::<StageKind>("stage")
        .context("stage kind is required")?;

    let mut scenarios = args
        .get_many::<String>("scenario")
        .into_iter()
        .flatten()
        .map(|s| parse_scenario(s))
        .collect::<Result<Vec<_>>>()?;
    if args.get_flag("all-events") {
        scenarios.extend(session.model.events.iter().map(|e| ScenarioId::Event(e.id)));
    }
    if scenarios.is_empty() {
        scenarios.push(ScenarioId::Master);
    }

    let parts = match args.get_many::<String>("part") {
        Some(names) => names.map(|n| PartId::new(n)).collect(),
        None => session.model.parts.iter().map(|p| p.id.clone()).collect::<Vec<_>>(),
    };

    let mut config = session.config.clone();
    if let Some(jobs) = args.get_one::<usize>("jobs") {
        config = config.with_max_concurrent_processes(*jobs);
    }
    config.validate()?;

    for scenario in &scenarios {
        session
            .archives
            .open(*scenario)
            .with_context(|| format!("opening the archive of {scenario}"))?;
    }

    let batch = build_batch(kind, &scenarios, &parts, &session.model)?;
    let manager = ProcessGroupManager::new(
        config,
        Arc::new(TokioLauncher),
        Arc::clone(&session.archives),
        Arc::new(session.model.clone()),
        Arc::new(TracingProgress),
        Arc::clone(&session.fs),
    );
    let mut events = manager.subscribe();
    let tickets = manager.submit_batch(batch)?;
    info!(stages = tickets.len(), kind = %kind, "Recovery submitted");

    let mut tally = Tally::default();
    let mut interrupted = false;
    let idle = manager.wait_idle();
    tokio::pin!(idle);
    loop {
        tokio::select! {
            () = &mut idle => break,
            event = events.recv() => match event {
                Ok(event) => tally.record(&event),
                Err(RecvError::Lagged(missed)) => warn!(missed, "Stage events were dropped"),
                Err(RecvError::Closed) => break,
            },
            signal = tokio::signal::ctrl_c(), if !interrupted => {
                interrupted = true;
                if let Err(e) = signal {
                    warn!("Could not listen for interrupts: {e}");
                    continue;
                }
                let killed = manager.kill_all(KillScope::All, true);
                warn!(killed, "Interrupted, terminating all solver processes");
            }
        }
    }
    while let Ok(event) = events.try_recv() {
        tally.record(&event);
    }

    if args.get_flag("discard") || interrupted {
        session.archives.close(true)?;
        info!("New results discarded");
    } else {
        session.archives.save(true)?;
    }

    println!(
        "{kind}: {} done, {} failed, {} skipped, {} cancelled",
        tally.finished, tally.failed, tally.skipped, tally.cancelled
    );
    Ok(tally.failed)
}

fn inspect(session: &Session, json: bool) -> Result<()> {
    let archives = session.open_all()?;
    if json {
        let value = archives
            .iter()
            .map(|(id, archive)| {
                serde_json::json!({
                    "scenario": id.to_string(),
                    "archive": archive,
                })
            })
            .collect::<Vec<_>>();
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(());
    }

    for (id, archive) in &archives {
        println!("{id}: {}", display_root(archive.root_path(), &session.model.model_dir));
        if archive.is_empty() {
            println!("  (no results)");
            continue;
        }
        print_sub_task(archive.root(), 1);
    }
    Ok(())
}

fn display_root(root: &Path, model_dir: &Path) -> String {
    root.strip_prefix(model_dir)
        .unwrap_or(root)
        .display()
        .to_string()
}

fn print_sub_task(node: &SubTask, depth: usize) {
    let indent = "  ".repeat(depth);
    println!("{indent}{}/", node.dir_name());
    for category in node.categories() {
        let files = node.files(category).collect::<Vec<_>>();
        println!("{indent}  [{category}] {}", files.join(", "));
    }
    for child in node.children() {
        print_sub_task(child, depth + 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scenario_arguments() {
        assert_eq!(parse_scenario("master").unwrap(), ScenarioId::Master);
        assert_eq!(parse_scenario("3").unwrap(), ScenarioId::Event(3));
        assert_eq!(parse_scenario("event_012").unwrap(), ScenarioId::Event(12));
        assert!(parse_scenario("storm").is_err());
    }

    #[test]
    fn command_line_is_consistent() {
        cli().debug_assert();
    }

    #[test]
    fn gage_runs_per_part() {
        let model = StaticModel::default();
        let parts = [PartId::new("a"), PartId::new("b")];
        let batch = build_batch(StageKind::Gage, &[ScenarioId::Master], &parts, &model).unwrap();
        assert_eq!(batch.len(), 2);
        let batch = build_batch(StageKind::Solver, &[ScenarioId::Master], &parts, &model).unwrap();
        assert_eq!(batch.len(), 1);
    }
}
