//! Autonomous task-execution engine CLI.
//!
//! Turns an objective into a plan of tool calls and executes it in the
//! current workspace. State lives under `.autopilot/` so an interrupted run
//! can be resumed.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use autopilot::engine::{Engine, EngineEvent};
use autopilot::exit_codes;
use autopilot::io::StatePaths;
use autopilot::io::config::load_config;
use autopilot::io::init::{InitOptions, init_workspace};
use autopilot::io::interaction::{Interaction, default_interaction};
use autopilot::io::llm::build_llm;
use autopilot::io::plan_store::PlanStore;
use autopilot::io::run_log::render_entries;
use autopilot::logging;
use autopilot::orchestrator::{Orchestrator, RunOutcome};
use clap::{Parser, Subcommand};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Parser)]
#[command(
    name = "autopilot",
    version,
    about = "Plan and execute an objective with LLM-chosen tools"
)]
struct Cli {
    /// Workspace root (defaults to the current directory).
    #[arg(short = 'C', long, global = true)]
    workspace: Option<PathBuf>,

    /// Debug logging for autopilot modules (`RUST_LOG` overrides).
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create `.autopilot/` with a default config.
    Init {
        /// Overwrite existing files.
        #[arg(short, long)]
        force: bool,
    },
    /// Plan and execute an objective.
    Run {
        /// The objective, in plain words.
        #[arg(required = true, num_args = 1..)]
        objective: Vec<String>,
        /// Keep reading follow-up messages after the run finishes.
        #[arg(short, long)]
        interactive: bool,
    },
    /// Continue the saved plan.
    Resume,
    /// Print the saved plan.
    Show,
    /// Print recent tool calls from the run log.
    Log {
        /// Only failed calls.
        #[arg(long)]
        failures: bool,
        #[arg(short = 'n', long, default_value_t = 20)]
        limit: usize,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    logging::init(cli.verbose);
    let code = match run(cli).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{err:#}");
            exit_codes::INVALID
        }
    };
    std::process::exit(code);
}

async fn run(cli: Cli) -> Result<i32> {
    let workspace = match cli.workspace {
        Some(dir) => dir,
        None => std::env::current_dir().context("resolve current directory")?,
    };
    match cli.command {
        Command::Init { force } => {
            let paths = init_workspace(&workspace, &InitOptions { force })?;
            println!("initialized {}", paths.dir.display());
            Ok(exit_codes::OK)
        }
        Command::Run {
            objective,
            interactive,
        } => cmd_run(&workspace, &objective.join(" "), interactive).await,
        Command::Resume => cmd_resume(&workspace).await,
        Command::Show => cmd_show(&workspace),
        Command::Log { failures, limit } => cmd_log(&workspace, failures, limit),
    }
}

async fn cmd_run(workspace: &Path, objective: &str, interactive: bool) -> Result<i32> {
    let (engine, interaction) = build_engine(workspace)?;
    if let Some(notice) = replaced_plan_notice(&engine.store) {
        println!("{notice}");
    }
    // `run` always starts a new objective; `resume` continues the saved plan.
    let mut orchestrator = Orchestrator::new(engine);
    let mut message = objective.to_string();
    loop {
        let (cancel, watcher) = cancel_on_interrupt();
        let result = orchestrator.handle_message(&message, &cancel).await;
        watcher.abort();
        let outcome = result?;
        println!("{outcome}");
        if !interactive || outcome == RunOutcome::Cancelled {
            return Ok(exit_codes::for_outcome(&outcome));
        }
        match interaction.ask("Next message (empty to quit)").await? {
            Some(next) => message = next,
            None => return Ok(exit_codes::for_outcome(&outcome)),
        }
    }
}

async fn cmd_resume(workspace: &Path) -> Result<i32> {
    let (engine, _) = build_engine(workspace)?;
    let mut orchestrator = Orchestrator::load(engine)?;
    let (cancel, watcher) = cancel_on_interrupt();
    let result = orchestrator.resume(&cancel).await;
    watcher.abort();
    let outcome = result?;
    println!("{outcome}");
    Ok(exit_codes::for_outcome(&outcome))
}

fn cmd_show(workspace: &Path) -> Result<i32> {
    let paths = StatePaths::new(workspace);
    let store = PlanStore::new(paths.plan);
    let Some(plan) = store.load()? else {
        bail!("no saved plan in {}", paths.dir.display());
    };
    println!("objective: {}", plan.objective);
    println!("{}", plan.summary(usize::MAX));
    if !plan.attempts.is_empty() {
        println!("\n{} archived attempt(s)", plan.attempts.len());
    }
    let notes = plan.scratchpad.trim();
    if !notes.is_empty() {
        println!("\nscratchpad:\n{notes}");
    }
    Ok(exit_codes::OK)
}

fn cmd_log(workspace: &Path, failures: bool, limit: usize) -> Result<i32> {
    let paths = StatePaths::new(workspace);
    let log = autopilot::io::run_log::RunLog::new(paths.run_log);
    let entries = log.tail(limit, failures)?;
    if entries.is_empty() {
        println!("(no entries)");
    } else {
        print!("{}", render_entries(&entries));
    }
    Ok(exit_codes::OK)
}

/// Warning printed when `run` is about to replace a plan that still has work.
fn replaced_plan_notice(store: &PlanStore) -> Option<String> {
    match store.load() {
        Ok(Some(saved)) if saved.has_pending_work() => Some(format!(
            "replacing the unfinished plan for \"{}\" (use `autopilot resume` to continue it instead)",
            saved.objective
        )),
        _ => None,
    }
}

fn build_engine(workspace: &Path) -> Result<(Engine, Arc<dyn Interaction>)> {
    let paths = StatePaths::new(workspace);
    let config = load_config(&paths.config)?;
    let llm = build_llm(&config.llm, workspace.to_path_buf())?;
    let interaction: Arc<dyn Interaction> = Arc::from(default_interaction());
    let engine = Engine::with_builtin_tools(workspace, config, llm, Arc::clone(&interaction))?
        .with_events(Arc::new(|event: &EngineEvent| println!("{event}")));
    Ok((engine, interaction))
}

/// Token that Ctrl-C cancels while the returned watcher runs.
fn cancel_on_interrupt() -> (CancellationToken, JoinHandle<()>) {
    let cancel = CancellationToken::new();
    let watcher = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                debug!("interrupt received");
                cancel.cancel();
            }
        })
    };
    (cancel, watcher)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_init_force() {
        let cli = Cli::parse_from(["autopilot", "init", "--force"]);
        assert!(matches!(cli.command, Command::Init { force: true }));
    }

    #[test]
    fn parse_run_joins_words() {
        let cli = Cli::parse_from(["autopilot", "-v", "run", "list", "the", "files"]);
        assert!(cli.verbose);
        match cli.command {
            Command::Run {
                objective,
                interactive,
            } => {
                assert_eq!(objective.join(" "), "list the files");
                assert!(!interactive);
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn run_requires_an_objective() {
        assert!(Cli::try_parse_from(["autopilot", "run"]).is_err());
    }

    #[test]
    fn parse_log_flags() {
        let cli = Cli::parse_from(["autopilot", "log", "--failures", "-n", "5"]);
        assert!(matches!(
            cli.command,
            Command::Log {
                failures: true,
                limit: 5
            }
        ));
    }

    #[test]
    fn run_warns_before_replacing_an_unfinished_plan() {
        use autopilot::core::plan::Plan;
        use autopilot::core::types::TaskDraft;
        use std::collections::BTreeSet;

        let temp = tempfile::tempdir().expect("tempdir");
        let store = PlanStore::new(StatePaths::new(temp.path()).plan);
        assert_eq!(replaced_plan_notice(&store), None);

        let draft: TaskDraft =
            serde_json::from_str(r#"{"action": "list_files"}"#).expect("draft");
        let enabled: BTreeSet<String> = ["list_files".to_string()].into_iter().collect();
        let mut plan = Plan::initialize("old objective", vec![draft], &enabled).expect("plan");
        store.save(&plan).expect("save");
        let notice = replaced_plan_notice(&store).expect("notice");
        assert!(notice.contains("old objective"));

        plan.tasks[0].status = autopilot::core::types::TaskStatus::Completed;
        store.save(&plan).expect("save");
        assert_eq!(replaced_plan_notice(&store), None);
    }

    #[test]
    fn show_without_plan_fails() {
        let temp = tempfile::tempdir().expect("tempdir");
        assert!(cmd_show(temp.path()).is_err());
    }
}
