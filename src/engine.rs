//! Task workflow engine.
//!
//! The engine is the composition root: it wires the store, worktree
//! manager, and agent supervisor together and exposes the human actions
//! (approve, skip, delete, stop). Phase advancement is centralized in
//! [`EngineCore::check_completion`], whose no-regression gating makes
//! repeated triggers advance a task exactly once.
//!
//! All collaborators are injected; the engine holds no global state.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::capability::PlanOutput;
use crate::config::DEFAULT_SUBTASK_TIMEOUT_SECS;
use crate::error::{Error, Result};
use crate::phase::{self, Applied, Transition};
use crate::sequencer;
use crate::store::TaskStore;
use crate::supervisor::{AgentOutcome, AgentSupervisor, StartOptions, ThreadId};
use crate::task::{CapabilitySelection, Subtask, SubtaskStatus, Task, TaskId, TaskPhase};
use crate::worktree::{WorktreeInfo, WorktreeManager};
use crate::{olog, olog_debug, olog_error, olog_warn};

/// Engine tuning knobs.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// The single bounded-wait ceiling applied uniformly at every
    /// subtask wait site.
    pub subtask_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            subtask_timeout: Duration::from_secs(DEFAULT_SUBTASK_TIMEOUT_SECS),
        }
    }
}

pub(crate) struct EngineCore {
    pub(crate) store: TaskStore,
    pub(crate) worktrees: WorktreeManager,
    pub(crate) supervisor: AgentSupervisor,
    pub(crate) config: EngineConfig,
    /// Tasks with a live sequencer flow; guards against double-spawn.
    sequencers: Mutex<HashSet<TaskId>>,
}

/// Public handle to the workflow engine. Cheap to clone.
#[derive(Clone)]
pub struct Engine {
    core: Arc<EngineCore>,
}

impl Engine {
    pub fn new(
        store: TaskStore,
        worktrees: WorktreeManager,
        supervisor: AgentSupervisor,
        config: EngineConfig,
    ) -> Self {
        Self {
            core: Arc::new(EngineCore {
                store,
                worktrees,
                supervisor,
                config,
                sequencers: Mutex::new(HashSet::new()),
            }),
        }
    }

    pub fn store(&self) -> &TaskStore {
        &self.core.store
    }

    pub fn worktrees(&self) -> &WorktreeManager {
        &self.core.worktrees
    }

    pub fn supervisor(&self) -> &AgentSupervisor {
        &self.core.supervisor
    }

    /// Create and persist a new task in the planning phase.
    pub fn create_task(
        &self,
        title: &str,
        description: &str,
        capability: CapabilitySelection,
    ) -> Result<Task> {
        let mut task = Task::new(title, description, capability);
        self.core.store.save(&mut task)?;
        olog!("Task created: {} '{}'", task.id.short(), title);
        Ok(task)
    }

    /// Start the planning agent for a task.
    ///
    /// The worktree is created (idempotently) first; the agent's
    /// structured output is parsed into the plan and its subtasks on
    /// completion. Failures and malformed output resolve to blocked.
    pub fn start_planning(&self, task_id: TaskId) -> Result<ThreadId> {
        let task = self.core.store.load(task_id)?;
        if task.phase != TaskPhase::Planning {
            return Err(Error::InvalidPhaseTransition {
                from: format!("{}/{}", task.phase, task.status),
                to: "planning agent start".to_string(),
            });
        }

        self.core
            .supervisor
            .adapter()
            .initialize(&task.capability.config)?;
        let info = self.core.worktrees.create_worktree(task_id)?;
        let prompt = planning_prompt(&task);

        let core = self.core.clone();
        let thread = self.core.supervisor.start_agent(
            task_id,
            &prompt,
            StartOptions {
                working_dir: info.path.clone(),
                on_complete: Some(Box::new(move |outcome| {
                    core.on_plan_complete(task_id, &outcome);
                })),
            },
        )?;

        self.core
            .record_agent_start(task_id, thread, &info)?;
        Ok(thread)
    }

    /// Approve the plan; optionally start development immediately.
    pub fn approve_plan(&self, task_id: TaskId, start_development: bool) -> Result<Task> {
        let task = self.core.store.update(task_id, |t| {
            phase::apply(t, Transition::Approve { start_development })?;
            Ok(())
        })?;

        if start_development && task.phase == TaskPhase::InProgress {
            EngineCore::ensure_sequencer(&self.core, task_id);
        }
        Ok(task)
    }

    /// Mark a subtask completed without running an agent.
    ///
    /// Triggers the same completion check as a successful run; skipping
    /// the active subtask stops its agent so the next one can start.
    pub fn skip_subtask(&self, task_id: TaskId, subtask_id: u32) -> Result<Task> {
        let task = self.core.store.load(task_id)?;
        let subtask = task
            .subtask(subtask_id)
            .ok_or(Error::SubtaskNotFound {
                task_id,
                subtask_id,
            })?;

        if subtask.status == SubtaskStatus::InProgress {
            self.core.stop_running_agent(task_id);
        }

        let updated = self.core.store.update(task_id, |t| {
            if let Some(s) = t.subtask_mut(subtask_id) {
                s.status = SubtaskStatus::Completed;
                t.touch();
            }
            Ok(())
        })?;
        olog!(
            "Subtask {} of task {} skipped",
            subtask_id,
            task_id.short()
        );

        EngineCore::check_completion(&self.core, task_id)?;
        Ok(self.core.store.load(task_id).unwrap_or(updated))
    }

    /// Remove a subtask. Stops its agent if it was the active one, then
    /// re-evaluates completion with the remaining set.
    pub fn delete_subtask(&self, task_id: TaskId, subtask_id: u32) -> Result<Task> {
        let task = self.core.store.load(task_id)?;
        let subtask = task
            .subtask(subtask_id)
            .ok_or(Error::SubtaskNotFound {
                task_id,
                subtask_id,
            })?;

        if subtask.status == SubtaskStatus::InProgress {
            self.core.stop_running_agent(task_id);
        }

        let updated = self.core.store.update(task_id, |t| {
            t.remove_subtask(subtask_id);
            t.assigned_agent = None;
            t.touch();
            Ok(())
        })?;
        olog!(
            "Subtask {} of task {} deleted",
            subtask_id,
            task_id.short()
        );

        EngineCore::check_completion(&self.core, task_id)?;
        Ok(self.core.store.load(task_id).unwrap_or(updated))
    }

    /// Stop the task's running agent, clear the assignment, and block
    /// the task for human attention. Returns the stopped thread id, or
    /// `None` when no agent was running.
    pub fn stop_agent(&self, task_id: TaskId) -> Result<Option<ThreadId>> {
        let Some(thread) = self.core.supervisor.running_session_for(task_id) else {
            return Ok(None);
        };
        self.core.supervisor.stop_agent(thread)?;

        self.core.store.update(task_id, |t| {
            t.assigned_agent = None;
            if let Err(e) = phase::apply(
                t,
                Transition::Block {
                    reason: "agent stopped by user".to_string(),
                },
            ) {
                olog_warn!("Could not block task {}: {}", task_id.short(), e);
            }
            Ok(())
        })?;
        Ok(Some(thread))
    }

    /// Human sign-off: human_review -> done.
    pub fn approve_review(&self, task_id: TaskId) -> Result<Task> {
        self.core.store.update(task_id, |t| {
            phase::apply(t, Transition::ReviewApproved)?;
            Ok(())
        })
    }

    /// Clear a blocked status after human intervention.
    pub fn unblock(&self, task_id: TaskId) -> Result<Task> {
        self.core.store.update(task_id, |t| {
            phase::apply(t, Transition::Unblock)?;
            Ok(())
        })
    }

    /// Delete a task and cascade to its agent session and worktree.
    ///
    /// Partial-failure tolerant: agent-stop and worktree-delete failures
    /// are collected as warnings and never block record deletion. An
    /// orphaned worktree is preferred over a stuck record.
    pub fn delete_task(&self, task_id: TaskId, delete_branch: bool) -> Result<Vec<String>> {
        let mut warnings = Vec::new();

        if let Some(thread) = self.core.supervisor.running_session_for(task_id) {
            if let Err(e) = self.core.supervisor.stop_agent(thread) {
                warnings.push(format!("failed to stop agent {}: {}", thread.short(), e));
            }
        }

        if let Err(e) = self
            .core
            .worktrees
            .delete_worktree(task_id, true, delete_branch)
        {
            warnings.push(format!("failed to delete worktree: {}", e));
        }

        self.core.store.delete(task_id)?;
        olog!(
            "Task {} deleted ({} warnings)",
            task_id.short(),
            warnings.len()
        );
        for w in &warnings {
            olog_warn!("delete_task {}: {}", task_id.short(), w);
        }
        Ok(warnings)
    }

    /// Worktrees with no matching task record.
    pub fn orphaned_worktrees(&self) -> Result<Vec<WorktreeInfo>> {
        let known: HashSet<TaskId> = self.core.store.list()?.iter().map(|t| t.id).collect();
        Ok(self
            .core
            .worktrees
            .list_worktrees_enriched()?
            .into_iter()
            .filter(|w| !known.contains(&w.task_id))
            .collect())
    }

}

impl EngineCore {
    /// Record the freshly started agent on the task, unless the session
    /// already finished (its completion callback clears the field; both
    /// orders must converge on the same record).
    pub(crate) fn record_agent_start(
        &self,
        task_id: TaskId,
        thread: ThreadId,
        info: &WorktreeInfo,
    ) -> Result<()> {
        let path = info.path.clone();
        let branch = info.branch_name.clone();
        self.store.update(task_id, |t| {
            t.worktree_path = Some(path.clone());
            t.branch_name = Some(branch.clone());
            t.assigned_agent = if self.supervisor.running_session_for(task_id) == Some(thread) {
                Some(thread)
            } else {
                None
            };
            t.touch();
            Ok(())
        })?;
        Ok(())
    }

    fn on_plan_complete(&self, task_id: TaskId, outcome: &AgentOutcome) {
        if outcome.stopped {
            // Whoever stopped the agent decides whether the task blocks;
            // only release the assignment here.
            match self.store.update(task_id, |t| {
                t.assigned_agent = None;
                Ok(())
            }) {
                Ok(_) | Err(Error::TaskNotFound(_)) => {}
                Err(e) => olog_error!(
                    "Failed to release planning agent on {}: {}",
                    task_id.short(),
                    e
                ),
            }
            return;
        }

        let transition = if outcome.success {
            match outcome
                .output
                .as_ref()
                .ok_or_else(|| Error::Validation("planning agent produced no output".to_string()))
                .and_then(PlanOutput::from_value)
            {
                Ok(plan) => Transition::PlanParsed {
                    plan: plan.plan,
                    subtasks: plan.subtasks,
                },
                Err(e) => {
                    olog_error!("Plan output rejected for {}: {}", task_id.short(), e);
                    Transition::Block {
                        reason: format!("plan output rejected: {}", e),
                    }
                }
            }
        } else {
            Transition::Block {
                reason: outcome
                    .error
                    .clone()
                    .unwrap_or_else(|| "plan generation failed".to_string()),
            }
        };

        let result = self.store.update(task_id, |t| {
            t.assigned_agent = None;
            if let Err(e) = phase::apply(t, transition.clone()) {
                olog_warn!("Plan transition rejected for {}: {}", task_id.short(), e);
            }
            Ok(())
        });
        match result {
            Ok(_) | Err(Error::TaskNotFound(_)) => {}
            Err(e) => {
                olog_error!("Failed to record plan outcome for {}: {}", task_id.short(), e);
            }
        }
    }

    /// Stop the running agent for a task, tolerating every failure.
    pub(crate) fn stop_running_agent(&self, task_id: TaskId) {
        if let Some(thread) = self.supervisor.running_session_for(task_id) {
            if let Err(e) = self.supervisor.stop_agent(thread) {
                olog_warn!(
                    "Failed to stop agent {} for task {}: {}",
                    thread.short(),
                    task_id.short(),
                    e
                );
            }
        }
    }

    /// Advance the phase when a subtask group finished.
    ///
    /// dev-complete -> ai_review (and QA auto-start); qa-complete ->
    /// human_review (or done without required review). The state
    /// machine's no-regression gating makes this idempotent: under
    /// repeated skip calls the advance and the QA auto-start happen
    /// exactly once.
    pub(crate) fn check_completion(core: &Arc<EngineCore>, task_id: TaskId) -> Result<()> {
        use crate::task::SubtaskKind;

        let mut applied = Applied::AlreadyDone;
        let task = core.store.update(task_id, |t| {
            applied = Applied::AlreadyDone;
            if t.phase == TaskPhase::InProgress && t.all_completed(SubtaskKind::Dev) {
                applied = phase::apply(t, Transition::DevComplete)?;
            } else if t.phase == TaskPhase::AiReview && t.all_completed(SubtaskKind::Qa) {
                applied = phase::apply(t, Transition::QaComplete)?;
            }
            Ok(())
        })?;

        if applied == Applied::Changed && task.phase == TaskPhase::AiReview {
            olog!("Task {} entered ai_review, starting QA", task_id.short());
            EngineCore::ensure_sequencer(core, task_id);
        }
        Ok(())
    }

    /// Spawn the sequencer flow for a task unless one is already live.
    pub(crate) fn ensure_sequencer(core: &Arc<EngineCore>, task_id: TaskId) {
        {
            let mut active = core.sequencers.lock().unwrap_or_else(|e| e.into_inner());
            if !active.insert(task_id) {
                olog_debug!("Sequencer already active for {}", task_id.short());
                return;
            }
        }
        let core = core.clone();
        tokio::spawn(async move {
            if let Err(e) = sequencer::sequence_task(core.clone(), task_id).await {
                olog_error!("Sequencer for {} failed: {}", task_id.short(), e);
            }
            core.sequencers
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&task_id);
        });
    }
}

/// Prompt for the planning agent.
pub(crate) fn planning_prompt(task: &Task) -> String {
    format!(
        "You are planning the implementation of the following task.\n\
         Title: {}\n\
         Description: {}\n\n\
         Produce a development plan and an ordered list of subtasks. Dev \
         subtasks implement the change; qa subtasks verify it. Respond with \
         a single JSON object: {{\"plan\": string, \"subtasks\": \
         [{{\"content\": string, \"label\": string, \"kind\": \"dev\"|\"qa\"}}]}}.",
        task.title, task.description
    )
}

/// Prompt for one subtask run.
pub(crate) fn subtask_prompt(task: &Task, subtask: &Subtask) -> String {
    let plan = task.plan_content.as_deref().unwrap_or("(no plan recorded)");
    format!(
        "Task: {}\nPlan:\n{}\n\nCurrent {} subtask [{}]: {}\n\n\
         Work only on this subtask. Commit your changes when done.",
        task.title, plan, subtask.kind, subtask.label, subtask.content
    )
}
