//! Sequential subtask execution.
//!
//! One flow per task drives its not-yet-completed subtasks strictly in
//! order, one at a time: dev subtasks while the task is in_progress, qa
//! subtasks while it is in ai_review. Each step reloads the persisted
//! record first, so concurrent skips and deletes between steps are
//! tolerated.
//!
//! The wait for a running subtask subscribes to the store's change feed
//! instead of polling on a fixed interval, bounded by the single
//! configured ceiling. A ceiling hit exits softly: the loop halts with a
//! warning and nothing is marked failed.

use std::sync::Arc;

use tokio::time::Instant;

use crate::engine::{subtask_prompt, EngineCore};
use crate::error::{Error, Result};
use crate::phase::{self, Transition};
use crate::supervisor::{AgentOutcome, StartOptions};
use crate::task::{SubtaskKind, SubtaskStatus, TaskId, TaskPhase};
use crate::util::blocking;
use crate::{olog, olog_debug, olog_error, olog_warn};

/// How a bounded wait resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WaitOutcome {
    /// The subtask reached completed.
    Completed,
    /// The task went blocked/completed or disappeared; stop sequencing.
    Halted,
    /// The subtask record was deleted; re-evaluate with the rest.
    SubtaskGone,
    /// The ceiling elapsed. Soft by policy: halt without failing.
    TimedOut,
}

/// Drive a task's subtasks until done, blocked, or softly timed out.
pub(crate) async fn sequence_task(core: Arc<EngineCore>, task_id: TaskId) -> Result<()> {
    olog_debug!("Sequencer starting for task {}", task_id.short());

    loop {
        // Reload every iteration; other writers may have advanced, skipped,
        // or deleted things since the last step.
        let task = match core.store.load(task_id) {
            Ok(t) => t,
            Err(Error::TaskNotFound(_)) => return Ok(()),
            Err(e) => return Err(e),
        };
        if !task.is_active() {
            olog_debug!(
                "Sequencer for {} halting: {}/{}",
                task_id.short(),
                task.phase,
                task.status
            );
            return Ok(());
        }

        let kind = match task.phase {
            TaskPhase::InProgress => SubtaskKind::Dev,
            TaskPhase::AiReview => SubtaskKind::Qa,
            _ => return Ok(()),
        };

        let Some(subtask) = task.next_incomplete(kind).cloned() else {
            // Group finished underneath us (skips); advance and retry.
            let phase_before = task.phase;
            EngineCore::check_completion(&core, task_id)?;
            let after = core.store.load(task_id)?;
            if after.phase == phase_before {
                return Ok(());
            }
            continue;
        };
        let subtask_id = subtask.id;

        // One subtask at a time: a session that survived the previous
        // step (a skip raced the start, or a soft timeout) serves a
        // subtask that is already resolved. Clear it before starting.
        if core.supervisor.running_session_for(task_id).is_some() {
            olog_warn!(
                "Stale agent still attached to task {}, stopping it",
                task_id.short()
            );
            core.stop_running_agent(task_id);
        }

        core.store.update(task_id, |t| {
            if let Some(s) = t.subtask_mut(subtask_id) {
                if s.status == SubtaskStatus::Pending {
                    s.status = SubtaskStatus::InProgress;
                    t.touch();
                }
            }
            Ok(())
        })?;

        let worktree_core = core.clone();
        let info = blocking(move || worktree_core.worktrees.create_worktree(task_id)).await?;

        let prompt = subtask_prompt(&task, &subtask);
        let callback_core = core.clone();
        let start = core
            .supervisor
            .adapter()
            .initialize(&task.capability.config)
            .and_then(|_| {
                core.supervisor.start_agent(
                    task_id,
                    &prompt,
                    StartOptions {
                        working_dir: info.path.clone(),
                        on_complete: Some(Box::new(move |outcome| {
                            on_subtask_complete(&callback_core, task_id, subtask_id, &outcome);
                        })),
                    },
                )
            });
        let thread = match start {
            Ok(thread) => thread,
            Err(Error::AgentConflict(_)) => {
                // A previous run for this task is still live (for example
                // after a soft timeout). Back off and let it resolve.
                olog_warn!(
                    "Sequencer for {} found an agent already running, halting",
                    task_id.short()
                );
                return Ok(());
            }
            Err(e) => {
                olog_error!("Agent start failed for {}: {}", task_id.short(), e);
                core.store.update(task_id, |t| {
                    if let Some(s) = t.subtask_mut(subtask_id) {
                        s.status = SubtaskStatus::Pending;
                    }
                    if let Err(apply_err) = phase::apply(
                        t,
                        Transition::Block {
                            reason: format!("agent start failed: {}", e),
                        },
                    ) {
                        olog_warn!("Could not block {}: {}", task_id.short(), apply_err);
                    }
                    Ok(())
                })?;
                return Ok(());
            }
        };
        core.record_agent_start(task_id, thread, &info)?;
        olog!(
            "Subtask {} of task {} started on thread {}",
            subtask_id,
            task_id.short(),
            thread.short()
        );

        let deadline = Instant::now() + core.config.subtask_timeout;
        match wait_for_subtask(&core, task_id, subtask_id, deadline).await? {
            WaitOutcome::Completed => {
                olog_debug!(
                    "Subtask {} of task {} completed",
                    subtask_id,
                    task_id.short()
                );
                EngineCore::check_completion(&core, task_id)?;
            }
            WaitOutcome::SubtaskGone => {
                olog_debug!(
                    "Subtask {} of task {} disappeared, re-evaluating",
                    subtask_id,
                    task_id.short()
                );
                EngineCore::check_completion(&core, task_id)?;
            }
            WaitOutcome::Halted => return Ok(()),
            WaitOutcome::TimedOut => {
                // Deliberate tolerance: no failure status, no retry, no
                // alert. The agent keeps running; the next completion or
                // human action re-drives state.
                olog_warn!(
                    "Subtask {} of task {} exceeded the wait ceiling ({:?}), halting softly",
                    subtask_id,
                    task_id.short(),
                    core.config.subtask_timeout
                );
                return Ok(());
            }
        }
    }
}

/// Completion callback for one subtask run. Success marks the subtask
/// completed; failure resets it to pending and blocks the task;
/// administrative stops only release the subtask (whoever stopped the
/// agent decides whether the task blocks). All paths clear the agent
/// assignment — that is the caller's job, not the supervisor's.
fn on_subtask_complete(
    core: &EngineCore,
    task_id: TaskId,
    subtask_id: u32,
    outcome: &AgentOutcome,
) {
    let result = core.store.update(task_id, |t| {
        t.assigned_agent = None;
        let Some(s) = t.subtask_mut(subtask_id) else {
            // Deleted while the agent ran; the sequencer re-evaluates.
            return Ok(());
        };
        if s.status != SubtaskStatus::InProgress {
            // Skipped or otherwise resolved by a human while running.
            return Ok(());
        }
        if outcome.success {
            s.status = SubtaskStatus::Completed;
            t.touch();
        } else if outcome.stopped {
            s.status = SubtaskStatus::Pending;
            t.touch();
        } else {
            s.status = SubtaskStatus::Pending;
            let reason = outcome
                .error
                .clone()
                .unwrap_or_else(|| "subtask execution failed".to_string());
            if let Err(e) = phase::apply(t, Transition::Block { reason }) {
                olog_warn!("Could not block {}: {}", task_id.short(), e);
            }
        }
        Ok(())
    });
    match result {
        Ok(_) => {}
        // The whole task can vanish while the agent winds down.
        Err(Error::TaskNotFound(_)) => {}
        Err(e) => {
            olog_error!(
                "Failed to record outcome of subtask {} on {}: {}",
                subtask_id,
                task_id.short(),
                e
            );
        }
    }
}

/// Wait until the subtask resolves, the task halts, the subtask record
/// disappears, or the ceiling elapses.
///
/// The notification is registered (`enable`) *before* each state read so
/// a save landing between the read and the await still wakes us.
async fn wait_for_subtask(
    core: &Arc<EngineCore>,
    task_id: TaskId,
    subtask_id: u32,
    deadline: Instant,
) -> Result<WaitOutcome> {
    loop {
        let notify = core.store.feed().handle(task_id);
        let notified = notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        let task = match core.store.load(task_id) {
            Ok(t) => t,
            Err(Error::TaskNotFound(_)) => return Ok(WaitOutcome::Halted),
            Err(e) => return Err(e),
        };
        if !task.is_active() {
            return Ok(WaitOutcome::Halted);
        }
        match task.subtask(subtask_id) {
            None => return Ok(WaitOutcome::SubtaskGone),
            Some(s) if s.status == SubtaskStatus::Completed => {
                return Ok(WaitOutcome::Completed)
            }
            Some(_) => {}
        }

        tokio::select! {
            _ = &mut notified => {}
            _ = tokio::time::sleep_until(deadline) => return Ok(WaitOutcome::TimedOut),
        }
    }
}
