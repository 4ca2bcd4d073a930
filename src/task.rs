//! Task and subtask data model.
//!
//! A task is the unit of work routed through the five-phase workflow.
//! Subtasks are its atomic, sequentially-executed units of development
//! and verification work.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

use crate::supervisor::ThreadId;

/// Unique identifier for a task.
///
/// Uses UUID v4 for generation and provides a short form display
/// for human-readable output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub Uuid);

impl TaskId {
    /// Create a new unique task identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Return first 8 characters of the UUID for display.
    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for TaskId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Phases of the task workflow.
///
/// Tasks move strictly forward: planning -> in_progress -> ai_review ->
/// human_review -> done. Backward movement only happens through explicit
/// human actions, never automatically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskPhase {
    /// Plan generation and approval.
    Planning,
    /// Development subtasks executing.
    InProgress,
    /// QA subtasks executing.
    AiReview,
    /// Awaiting human sign-off.
    HumanReview,
    /// All work finished.
    Done,
}

impl std::fmt::Display for TaskPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskPhase::Planning => write!(f, "planning"),
            TaskPhase::InProgress => write!(f, "in_progress"),
            TaskPhase::AiReview => write!(f, "ai_review"),
            TaskPhase::HumanReview => write!(f, "human_review"),
            TaskPhase::Done => write!(f, "done"),
        }
    }
}

/// Lateral status orthogonal to the phase.
///
/// `Blocked` marks a task needing human intervention after an execution
/// failure; it is reachable from any active phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Task is progressing normally.
    #[default]
    Active,
    /// Execution failed; waiting for a human.
    Blocked,
    /// Workflow finished.
    Completed,
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Active => write!(f, "active"),
            TaskStatus::Blocked => write!(f, "blocked"),
            TaskStatus::Completed => write!(f, "completed"),
        }
    }
}

/// Kind of work a subtask represents. Dev subtasks always execute
/// before qa subtasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubtaskKind {
    Dev,
    Qa,
}

impl std::fmt::Display for SubtaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SubtaskKind::Dev => write!(f, "dev"),
            SubtaskKind::Qa => write!(f, "qa"),
        }
    }
}

/// Execution status of a single subtask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SubtaskStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
}

impl std::fmt::Display for SubtaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SubtaskStatus::Pending => write!(f, "pending"),
            SubtaskStatus::InProgress => write!(f, "in_progress"),
            SubtaskStatus::Completed => write!(f, "completed"),
        }
    }
}

/// An atomic unit of a task's development or verification work.
///
/// Ids are allocated from the owning task's monotonic counter and are
/// never reused after removal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subtask {
    pub id: u32,
    pub content: String,
    pub label: String,
    pub kind: SubtaskKind,
    pub status: SubtaskStatus,
}

/// Which capability tool runs this task's agents, and with what config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapabilitySelection {
    pub tool_id: String,
    #[serde(default)]
    pub config: serde_json::Value,
}

impl Default for CapabilitySelection {
    fn default() -> Self {
        Self {
            tool_id: "claude".to_string(),
            config: serde_json::Value::Null,
        }
    }
}

/// A unit of work routed through the five-phase workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Unique, immutable identifier.
    pub id: TaskId,
    pub title: String,
    pub description: String,
    pub phase: TaskPhase,
    pub status: TaskStatus,
    /// Ordered subtasks; dev entries precede qa entries.
    pub subtasks: Vec<Subtask>,
    /// Monotonic allocator for subtask ids. Never decremented, so an
    /// id is never reused after a subtask is removed.
    #[serde(default)]
    pub next_subtask_id: u32,
    pub capability: CapabilitySelection,
    #[serde(default)]
    pub requires_human_review: bool,
    #[serde(default)]
    pub plan_approved: bool,
    pub plan_content: Option<String>,
    /// Lookup reference to the running agent session, if any. The
    /// supervisor owns the session; this is only a weak handle.
    pub assigned_agent: Option<ThreadId>,
    pub worktree_path: Option<PathBuf>,
    pub branch_name: Option<String>,
    /// Record version for optimistic concurrency at save time.
    #[serde(default)]
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// Create a new task in the planning phase.
    pub fn new(title: &str, description: &str, capability: CapabilitySelection) -> Self {
        let now = Utc::now();
        Self {
            id: TaskId::new(),
            title: title.to_string(),
            description: description.to_string(),
            phase: TaskPhase::Planning,
            status: TaskStatus::Active,
            subtasks: Vec::new(),
            next_subtask_id: 0,
            capability,
            requires_human_review: true,
            plan_approved: false,
            plan_content: None,
            assigned_agent: None,
            worktree_path: None,
            branch_name: None,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Append a subtask, allocating the next id from the monotonic counter.
    pub fn add_subtask(&mut self, content: &str, label: &str, kind: SubtaskKind) -> u32 {
        let id = self.next_subtask_id;
        self.next_subtask_id += 1;
        self.subtasks.push(Subtask {
            id,
            content: content.to_string(),
            label: label.to_string(),
            kind,
            status: SubtaskStatus::Pending,
        });
        id
    }

    pub fn subtask(&self, id: u32) -> Option<&Subtask> {
        self.subtasks.iter().find(|s| s.id == id)
    }

    pub fn subtask_mut(&mut self, id: u32) -> Option<&mut Subtask> {
        self.subtasks.iter_mut().find(|s| s.id == id)
    }

    /// Remove a subtask by id. Returns the removed record if it existed.
    /// The id is not reusable afterwards.
    pub fn remove_subtask(&mut self, id: u32) -> Option<Subtask> {
        let idx = self.subtasks.iter().position(|s| s.id == id)?;
        Some(self.subtasks.remove(idx))
    }

    /// The next subtask of the given kind that has not completed, in
    /// declaration order. Dev-before-qa ordering falls out of the phase:
    /// dev subtasks run while in_progress, qa while ai_review.
    pub fn next_incomplete(&self, kind: SubtaskKind) -> Option<&Subtask> {
        self.subtasks
            .iter()
            .find(|s| s.kind == kind && s.status != SubtaskStatus::Completed)
    }

    /// True when every subtask of the given kind has completed (vacuously
    /// true for an empty set).
    pub fn all_completed(&self, kind: SubtaskKind) -> bool {
        self.subtasks
            .iter()
            .filter(|s| s.kind == kind)
            .all(|s| s.status == SubtaskStatus::Completed)
    }

    /// True while the task can still run agents (not done, not blocked).
    pub fn is_active(&self) -> bool {
        self.status == TaskStatus::Active && self.phase != TaskPhase::Done
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}
