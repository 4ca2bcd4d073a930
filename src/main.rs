use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};

use overseer::capability::{CapabilityAdapter, ProcessAdapter};
use overseer::config::Config;
use overseer::engine::{Engine, EngineConfig};
use overseer::store::TaskStore;
use overseer::supervisor::AgentSupervisor;
use overseer::task::{CapabilitySelection, TaskId};
use overseer::worktree::WorktreeManager;
use overseer::{Error, Result};

/// Overseer - task workflow engine for autonomous coding agents
#[derive(Parser, Debug)]
#[command(name = "overseer")]
#[command(version, about, long_about = None)]
#[command(after_help = "ENVIRONMENT:\n    OVERSEER_DEBUG=1     Enable debug logging (alternative to --debug)")]
pub struct Cli {
    /// Enable debug logging (writes to ~/.overseer/overseer.log)
    #[arg(short = 'd', long)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Show all tasks and their workflow state
    Status,

    /// Create a new task in the planning phase
    Create {
        /// Short task title
        title: String,

        /// What the task should accomplish
        description: String,
    },

    /// Run the planning agent for a task and wait for its plan
    Plan {
        /// Task id (full UUID)
        task_id: String,
    },

    /// Approve a task's plan
    Approve {
        /// Task id (full UUID)
        task_id: String,

        /// Start development immediately after approval
        #[arg(long)]
        start: bool,
    },

    /// Stop a task's running agent (the task becomes blocked)
    Stop {
        /// Task id (full UUID)
        task_id: String,
    },

    /// Delete a task, its agent session, and its worktree
    Delete {
        /// Task id (full UUID)
        task_id: String,

        /// Also delete the task's branch
        #[arg(long)]
        branch: bool,
    },

    /// Report orphaned worktrees (worktrees without a task record)
    Cleanup {
        /// Actually delete orphans (default: just report)
        #[arg(long)]
        delete: bool,
    },

    /// Remove all managed worktrees
    Reset {
        /// Delete worktrees even if they have uncommitted changes
        #[arg(long)]
        force: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    overseer::log::init_with_debug(cli.debug);
    Config::ensure_dirs()?;

    match cli.command {
        Some(Command::Create { title, description }) => run_create(&title, &description),
        Some(Command::Plan { task_id }) => run_plan(&task_id),
        Some(Command::Approve { task_id, start }) => run_approve(&task_id, start),
        Some(Command::Stop { task_id }) => run_stop(&task_id),
        Some(Command::Delete { task_id, branch }) => run_delete(&task_id, branch),
        Some(Command::Cleanup { delete }) => run_cleanup(delete),
        Some(Command::Reset { force }) => run_reset(force),
        Some(Command::Status) | None => run_status(),
    }
}

fn parse_task_id(raw: &str) -> Result<TaskId> {
    raw.parse()
        .map_err(|_| Error::Validation(format!("not a task id: {}", raw)))
}

/// Wire the engine against the repository in the current directory.
fn build_engine() -> Result<Engine> {
    let config = Config::load()?;
    let mut command = config.effective_command().split_whitespace();
    let binary = command.next().unwrap_or("claude");
    let extra_args: Vec<String> = command.map(String::from).collect();

    let adapter = ProcessAdapter::new(binary)?;
    if !extra_args.is_empty() {
        adapter.initialize(&serde_json::json!({ "args": extra_args }))?;
    }

    let store = TaskStore::new(Config::tasks_dir()?)?;
    let worktrees = WorktreeManager::new(&std::env::current_dir()?, &Config::worktrees_dir()?)?;
    let supervisor = AgentSupervisor::new(Arc::new(adapter), Some(Config::runs_dir()?));
    Ok(Engine::new(
        store,
        worktrees,
        supervisor,
        EngineConfig {
            subtask_timeout: config.subtask_timeout(),
        },
    ))
}

fn run_status() -> Result<()> {
    let store = TaskStore::new(Config::tasks_dir()?)?;
    let tasks = store.list()?;
    if tasks.is_empty() {
        println!("No tasks.");
        return Ok(());
    }
    for task in tasks {
        let agent = task
            .assigned_agent
            .map(|t| t.short())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{}  {:<12} {:<9} agent={}  {}",
            task.id.short(),
            task.phase.to_string(),
            task.status.to_string(),
            agent,
            task.title
        );
    }
    Ok(())
}

fn run_create(title: &str, description: &str) -> Result<()> {
    let store = TaskStore::new(Config::tasks_dir()?)?;
    let mut task = overseer::Task::new(title, description, CapabilitySelection::default());
    store.save(&mut task)?;
    println!("{}", task.id);
    Ok(())
}

fn run_plan(task_id: &str) -> Result<()> {
    let id = parse_task_id(task_id)?;
    let runtime = tokio::runtime::Runtime::new().map_err(Error::Io)?;
    runtime.block_on(async {
        let engine = build_engine()?;
        let thread = engine.start_planning(id)?;
        println!("planning started (thread {})", thread.short());

        loop {
            tokio::time::sleep(Duration::from_secs(1)).await;
            let Some(report) = engine.supervisor().get_agent_status(thread) else {
                break;
            };
            if report.status.is_terminal() {
                println!("planning finished: {}", report.status);
                if let Some(error) = report.error {
                    eprintln!("error: {}", error);
                }
                break;
            }
        }

        let task = engine.store().load(id)?;
        if let Some(plan) = task.plan_content {
            println!("\n{}", plan);
            for subtask in &task.subtasks {
                println!("  [{}] {} - {}", subtask.kind, subtask.label, subtask.content);
            }
        }
        Ok(())
    })
}

fn run_approve(task_id: &str, start: bool) -> Result<()> {
    let id = parse_task_id(task_id)?;
    let runtime = tokio::runtime::Runtime::new().map_err(Error::Io)?;
    runtime.block_on(async {
        let engine = build_engine()?;
        let task = engine.approve_plan(id, start)?;
        println!("approved; phase is now {}", task.phase);
        if start {
            // Keep the process alive while the sequencer drives the task.
            loop {
                tokio::time::sleep(Duration::from_secs(2)).await;
                let task = engine.store().load(id)?;
                if !task.is_active() || task.phase > overseer::TaskPhase::AiReview {
                    println!("task is now {}/{}", task.phase, task.status);
                    break;
                }
            }
        }
        Ok(())
    })
}

fn run_stop(task_id: &str) -> Result<()> {
    let id = parse_task_id(task_id)?;
    let runtime = tokio::runtime::Runtime::new().map_err(Error::Io)?;
    runtime.block_on(async {
        let engine = build_engine()?;
        match engine.stop_agent(id)? {
            Some(thread) => println!("stopped agent {}", thread.short()),
            None => println!("no agent running for {}", id),
        }
        Ok(())
    })
}

fn run_delete(task_id: &str, branch: bool) -> Result<()> {
    let id = parse_task_id(task_id)?;
    let runtime = tokio::runtime::Runtime::new().map_err(Error::Io)?;
    runtime.block_on(async {
        let engine = build_engine()?;
        let warnings = engine.delete_task(id, branch)?;
        for warning in warnings {
            eprintln!("warning: {}", warning);
        }
        println!("deleted {}", id);
        Ok(())
    })
}

fn run_cleanup(delete: bool) -> Result<()> {
    let manager = worktree_manager()?;
    let store = TaskStore::new(Config::tasks_dir()?)?;
    let known: HashSet<TaskId> = store.list()?.iter().map(|t| t.id).collect();

    let orphans: Vec<_> = manager
        .list_worktrees_enriched()?
        .into_iter()
        .filter(|w| !known.contains(&w.task_id))
        .collect();

    if orphans.is_empty() {
        println!("No orphaned worktrees.");
        return Ok(());
    }

    for orphan in &orphans {
        println!(
            "orphan: {} ({} bytes{})",
            orphan.path.display(),
            orphan.disk_usage_bytes,
            if orphan.is_dirty { ", dirty" } else { "" }
        );
    }

    if delete {
        for orphan in &orphans {
            match manager.delete_worktree(orphan.task_id, true, false) {
                Ok(()) => println!("deleted: {}", orphan.path.display()),
                Err(e) => eprintln!("failed to delete {}: {}", orphan.path.display(), e),
            }
        }
    } else {
        println!("Run with --delete to remove them.");
    }
    Ok(())
}

fn run_reset(force: bool) -> Result<()> {
    let manager = worktree_manager()?;
    let report = manager.cleanup_all_worktrees(force)?;
    println!("Removed {} worktrees.", report.removed.len());
    for (path, error) in &report.failed {
        eprintln!("failed to remove {}: {}", path.display(), error);
    }
    Ok(())
}

fn worktree_manager() -> Result<WorktreeManager> {
    let cwd = std::env::current_dir()?;
    WorktreeManager::new(&cwd, &Config::worktrees_dir()?)
}
