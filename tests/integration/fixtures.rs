//! Test fixtures for integration tests.
//!
//! Provides helpers for:
//! - Creating temporary git repositories
//! - Building an engine wired to the scripted capability adapter
//! - Waiting on persisted task state

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use git2::Signature;
use tempfile::TempDir;

use overseer::capability::{ScriptedAdapter, ScriptedRun};
use overseer::engine::{Engine, EngineConfig};
use overseer::store::TaskStore;
use overseer::supervisor::AgentSupervisor;
use overseer::task::{CapabilitySelection, Task, TaskId};
use overseer::worktree::WorktreeManager;

/// A test repository with a temporary directory and initialized git.
pub struct TestRepo {
    /// The temporary directory containing the repo.
    pub temp_dir: TempDir,
    /// Path to the repository root.
    pub path: PathBuf,
}

impl TestRepo {
    /// Create a new test repository with an initial commit.
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let path = temp_dir.path().join("repo");
        std::fs::create_dir_all(&path).expect("Failed to create repo dir");

        let repo = git2::Repository::init(&path).expect("Failed to init repo");
        let sig = Signature::now("Test", "test@example.com").expect("Failed to create signature");
        std::fs::write(path.join("README.md"), "# Test Repository\n")
            .expect("Failed to write README");
        let mut index = repo.index().expect("Failed to open index");
        index
            .add_all(["."].iter(), git2::IndexAddOption::DEFAULT, None)
            .expect("Failed to stage files");
        index.write().expect("Failed to write index");
        let tree_id = index.write_tree().expect("Failed to write tree");
        let tree = repo.find_tree(tree_id).expect("Failed to find tree");
        repo.commit(Some("HEAD"), &sig, &sig, "Initial commit", &tree, &[])
            .expect("Failed to create initial commit");

        Self { temp_dir, path }
    }
}

/// An engine under test plus its collaborators.
pub struct TestContext {
    pub repo: TestRepo,
    pub engine: Engine,
    pub adapter: Arc<ScriptedAdapter>,
}

/// Build an engine over a fresh repo, wired to a scripted adapter.
pub fn build_engine(runs: Vec<ScriptedRun>) -> TestContext {
    build_engine_with_timeout(runs, Duration::from_secs(10))
}

/// Same as [`build_engine`] with an explicit subtask wait ceiling.
pub fn build_engine_with_timeout(runs: Vec<ScriptedRun>, timeout: Duration) -> TestContext {
    let repo = TestRepo::new();
    let store = TaskStore::new(repo.temp_dir.path().join("tasks")).expect("store");
    let worktrees = WorktreeManager::new(&repo.path, &repo.temp_dir.path().join("worktrees"))
        .expect("worktree manager");
    let adapter = Arc::new(ScriptedAdapter::new(runs));
    let supervisor = AgentSupervisor::new(adapter.clone(), None);
    let engine = Engine::new(
        store,
        worktrees,
        supervisor,
        EngineConfig {
            subtask_timeout: timeout,
        },
    );
    TestContext {
        repo,
        engine,
        adapter,
    }
}

/// A structured plan with two dev subtasks and one qa subtask.
pub fn plan_two_dev_one_qa() -> serde_json::Value {
    serde_json::json!({
        "plan": "1. implement the feature\n2. wire it up\n3. verify",
        "subtasks": [
            { "content": "implement the feature", "label": "implement", "kind": "dev" },
            { "content": "wire the feature up", "label": "wire-up", "kind": "dev" },
            { "content": "verify the feature works", "label": "verify", "kind": "qa" }
        ]
    })
}

/// A structured plan with one dev subtask and one qa subtask.
pub fn plan_one_dev_one_qa() -> serde_json::Value {
    serde_json::json!({
        "plan": "1. implement\n2. verify",
        "subtasks": [
            { "content": "implement it", "label": "implement", "kind": "dev" },
            { "content": "verify it", "label": "verify", "kind": "qa" }
        ]
    })
}

/// Create a task and run planning to completion against the adapter's
/// first scripted run.
pub async fn create_planned_task(ctx: &TestContext) -> Task {
    let task = ctx
        .engine
        .create_task("test feature", "Build the test feature", CapabilitySelection::default())
        .expect("create task");
    ctx.engine.start_planning(task.id).expect("start planning");
    wait_for(&ctx.engine, task.id, |t| t.plan_content.is_some()).await
}

/// Poll persisted state until the predicate holds (bounded).
pub async fn wait_for<F>(engine: &Engine, task_id: TaskId, pred: F) -> Task
where
    F: Fn(&Task) -> bool,
{
    for _ in 0..300 {
        let task = engine.store().load(task_id).expect("task disappeared");
        if pred(&task) {
            return task;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition never satisfied before the wait limit");
}
