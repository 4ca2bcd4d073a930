//! Phase state machine with transition validation.
//!
//! Transitions are expressed as [`Transition`] values applied to a
//! `&mut Task`. The machine enforces the forward-only ordering
//! planning -> in_progress -> ai_review -> human_review -> done, with
//! the lateral `blocked` status reachable from any active phase.
//!
//! Re-entrancy: applying a trigger to a record that a concurrent writer
//! already advanced is a no-op ([`Applied::AlreadyDone`]), not an error.
//! Phase never regresses automatically.

use crate::capability::PlannedSubtask;
use crate::error::{Error, Result};
use crate::task::{SubtaskKind, Task, TaskPhase, TaskStatus};

/// A trigger against the task state machine.
#[derive(Debug, Clone)]
pub enum Transition {
    /// A plan was generated and parsed; store it and install its subtasks.
    PlanParsed {
        plan: String,
        subtasks: Vec<PlannedSubtask>,
    },
    /// Human approved the plan, optionally starting development.
    Approve { start_development: bool },
    /// All dev subtasks completed.
    DevComplete,
    /// All qa subtasks completed.
    QaComplete,
    /// Human signed off on the review.
    ReviewApproved,
    /// Agent execution failed; task needs human intervention.
    Block { reason: String },
    /// Human cleared the blocked status.
    Unblock,
}

/// Outcome of applying a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    /// The record was mutated.
    Changed,
    /// A concurrent writer already advanced the record; nothing to do.
    AlreadyDone,
}

fn invalid(task: &Task, to: &str) -> Error {
    Error::InvalidPhaseTransition {
        from: format!("{}/{}", task.phase, task.status),
        to: to.to_string(),
    }
}

/// Apply a transition to the task record.
///
/// Returns `Ok(Applied::AlreadyDone)` when the record has already been
/// advanced past the trigger, and an error only for genuinely invalid
/// transitions.
pub fn apply(task: &mut Task, transition: Transition) -> Result<Applied> {
    let applied = match transition {
        Transition::PlanParsed { plan, subtasks } => {
            if task.phase != TaskPhase::Planning {
                return Ok(Applied::AlreadyDone);
            }
            task.plan_content = Some(plan);
            task.plan_approved = false;
            task.subtasks.clear();
            for s in subtasks {
                task.add_subtask(&s.content, &s.label, s.kind);
            }
            Applied::Changed
        }
        Transition::Approve { start_development } => {
            if task.phase > TaskPhase::Planning {
                return Ok(Applied::AlreadyDone);
            }
            if task.plan_content.is_none() {
                return Err(Error::Validation(format!(
                    "task {} has no plan to approve",
                    task.id.short()
                )));
            }
            task.plan_approved = true;
            if start_development {
                task.phase = TaskPhase::InProgress;
            }
            Applied::Changed
        }
        Transition::DevComplete => {
            if task.phase > TaskPhase::InProgress {
                return Ok(Applied::AlreadyDone);
            }
            if task.phase != TaskPhase::InProgress || !task.all_completed(SubtaskKind::Dev) {
                return Err(invalid(task, "ai_review"));
            }
            task.phase = TaskPhase::AiReview;
            task.assigned_agent = None;
            Applied::Changed
        }
        Transition::QaComplete => {
            if task.phase > TaskPhase::AiReview {
                return Ok(Applied::AlreadyDone);
            }
            if task.phase != TaskPhase::AiReview || !task.all_completed(SubtaskKind::Qa) {
                return Err(invalid(task, "human_review"));
            }
            task.assigned_agent = None;
            if task.requires_human_review {
                task.phase = TaskPhase::HumanReview;
            } else {
                task.phase = TaskPhase::Done;
                task.status = TaskStatus::Completed;
            }
            Applied::Changed
        }
        Transition::ReviewApproved => {
            if task.phase == TaskPhase::Done {
                return Ok(Applied::AlreadyDone);
            }
            if task.phase != TaskPhase::HumanReview {
                return Err(invalid(task, "done"));
            }
            task.phase = TaskPhase::Done;
            task.status = TaskStatus::Completed;
            Applied::Changed
        }
        Transition::Block { reason } => {
            if task.phase == TaskPhase::Done || task.status == TaskStatus::Completed {
                return Err(invalid(task, "blocked"));
            }
            if task.status == TaskStatus::Blocked {
                return Ok(Applied::AlreadyDone);
            }
            crate::olog_warn!("Task {} blocked: {}", task.id.short(), reason);
            task.status = TaskStatus::Blocked;
            task.assigned_agent = None;
            Applied::Changed
        }
        Transition::Unblock => {
            if task.status != TaskStatus::Blocked {
                return Ok(Applied::AlreadyDone);
            }
            task.status = TaskStatus::Active;
            Applied::Changed
        }
    };

    if applied == Applied::Changed {
        task.touch();
    }
    Ok(applied)
}
