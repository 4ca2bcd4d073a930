//! Full workflow execution tests.
//!
//! Each test drives a task from plan generation through the phase
//! machine using the scripted adapter, then asserts on the persisted
//! record and the supervisor's session state.

use std::time::Duration;

use overseer::capability::ScriptedRun;
use overseer::supervisor::SessionStatus;
use overseer::task::{SubtaskStatus, TaskPhase, TaskStatus};

use crate::fixtures::{
    build_engine, build_engine_with_timeout, create_planned_task, plan_one_dev_one_qa,
    plan_two_dev_one_qa, wait_for,
};

fn ok() -> ScriptedRun {
    ScriptedRun::success(serde_json::json!(null))
}

/// Scenario A: 2 dev + 1 qa subtasks, adapter always succeeds.
/// Final phase is human_review, all subtasks completed, agent unset.
#[tokio::test]
async fn test_scenario_a_full_success() {
    let ctx = build_engine(vec![
        ScriptedRun::success(plan_two_dev_one_qa()),
        ok(),
        ok(),
        ok(),
    ]);
    let task = create_planned_task(&ctx).await;
    assert_eq!(task.phase, TaskPhase::Planning);
    assert_eq!(task.subtasks.len(), 3);

    ctx.engine.approve_plan(task.id, true).unwrap();

    let finished = wait_for(&ctx.engine, task.id, |t| {
        t.phase == TaskPhase::HumanReview
    })
    .await;
    assert_eq!(finished.status, TaskStatus::Active);
    assert!(finished
        .subtasks
        .iter()
        .all(|s| s.status == SubtaskStatus::Completed));
    assert!(finished.assigned_agent.is_none());
    // One planning run plus one run per subtask.
    assert_eq!(ctx.adapter.runs_started(), 4);

    // Human sign-off finishes the workflow.
    let done = ctx.engine.approve_review(task.id).unwrap();
    assert_eq!(done.phase, TaskPhase::Done);
    assert_eq!(done.status, TaskStatus::Completed);
}

/// Scenario B: dev subtask 1 of 2 fails. The task blocks, the failed
/// subtask is reset to pending, and subtask 2 never starts.
#[tokio::test]
async fn test_scenario_b_dev_failure_blocks() {
    let ctx = build_engine(vec![
        ScriptedRun::success(plan_two_dev_one_qa()),
        ScriptedRun::failure("build failed"),
    ]);
    let task = create_planned_task(&ctx).await;
    ctx.engine.approve_plan(task.id, true).unwrap();

    let blocked = wait_for(&ctx.engine, task.id, |t| t.status == TaskStatus::Blocked).await;
    assert_eq!(blocked.phase, TaskPhase::InProgress);
    assert_eq!(blocked.subtasks[0].status, SubtaskStatus::Pending);
    assert_eq!(blocked.subtasks[1].status, SubtaskStatus::Pending);
    assert_eq!(blocked.subtasks[2].status, SubtaskStatus::Pending);
    assert!(blocked.assigned_agent.is_none());
    // Planning plus the single failed dev run; no auto-retry.
    assert_eq!(ctx.adapter.runs_started(), 2);
}

/// Scenario C: the agent for the active subtask is stopped mid-run.
/// The session becomes stopped, sequencing halts, the task blocks.
#[tokio::test]
async fn test_scenario_c_stop_mid_run() {
    let ctx = build_engine(vec![
        ScriptedRun::success(plan_one_dev_one_qa()),
        ScriptedRun::hang(),
    ]);
    let task = create_planned_task(&ctx).await;
    ctx.engine.approve_plan(task.id, true).unwrap();

    // Wait for the dev agent to actually be running.
    wait_for(&ctx.engine, task.id, |t| t.assigned_agent.is_some()).await;
    let thread = ctx
        .engine
        .supervisor()
        .running_session_for(task.id)
        .expect("agent should be running");

    let stopped = ctx.engine.stop_agent(task.id).unwrap();
    assert_eq!(stopped, Some(thread));

    let blocked = wait_for(&ctx.engine, task.id, |t| t.status == TaskStatus::Blocked).await;
    assert!(blocked.assigned_agent.is_none());
    assert_eq!(blocked.subtasks[0].status, SubtaskStatus::Pending);
    assert_eq!(
        ctx.engine.supervisor().get_agent_status(thread).unwrap().status,
        SessionStatus::Stopped
    );
    // No further subtask was started.
    assert_eq!(ctx.adapter.runs_started(), 2);
}

/// Skipping all remaining dev subtasks advances in_progress -> ai_review
/// exactly once and auto-starts QA exactly once, even under repeated
/// skip calls.
#[tokio::test]
async fn test_skip_all_dev_advances_exactly_once() {
    let ctx = build_engine(vec![
        ScriptedRun::success(plan_two_dev_one_qa()),
        ScriptedRun::hang(),
        ScriptedRun::hang(),
        ok(),
    ]);
    let task = create_planned_task(&ctx).await;
    ctx.engine.approve_plan(task.id, true).unwrap();

    // First dev agent running.
    wait_for(&ctx.engine, task.id, |t| {
        t.subtasks[0].status == SubtaskStatus::InProgress
    })
    .await;
    ctx.engine.skip_subtask(task.id, 0).unwrap();
    ctx.engine.skip_subtask(task.id, 0).unwrap();

    // Second dev agent running.
    wait_for(&ctx.engine, task.id, |t| {
        t.subtasks[1].status == SubtaskStatus::InProgress
    })
    .await;
    ctx.engine.skip_subtask(task.id, 1).unwrap();
    ctx.engine.skip_subtask(task.id, 1).unwrap();

    let finished = wait_for(&ctx.engine, task.id, |t| {
        t.phase == TaskPhase::HumanReview
    })
    .await;
    assert!(finished
        .subtasks
        .iter()
        .all(|s| s.status == SubtaskStatus::Completed));
    // Planning + two (stopped) dev agents + exactly one QA agent. A
    // second QA auto-start would have consumed a fifth run.
    assert_eq!(ctx.adapter.runs_started(), 4);
}

/// Deleting the in_progress subtask stops its agent, clears the
/// assignment, and re-evaluates completion with the remaining set.
#[tokio::test]
async fn test_delete_active_subtask_stops_agent() {
    let ctx = build_engine(vec![
        ScriptedRun::success(plan_one_dev_one_qa()),
        ScriptedRun::hang(),
        ok(),
    ]);
    let task = create_planned_task(&ctx).await;
    ctx.engine.approve_plan(task.id, true).unwrap();

    wait_for(&ctx.engine, task.id, |t| t.assigned_agent.is_some()).await;
    let thread = ctx
        .engine
        .supervisor()
        .running_session_for(task.id)
        .expect("agent should be running");

    ctx.engine.delete_subtask(task.id, 0).unwrap();

    assert_eq!(
        ctx.engine.supervisor().get_agent_status(thread).unwrap().status,
        SessionStatus::Stopped
    );

    // With the only dev subtask gone, dev is complete: QA auto-starts
    // and the task reaches human review.
    let finished = wait_for(&ctx.engine, task.id, |t| {
        t.phase == TaskPhase::HumanReview
    })
    .await;
    assert!(finished.assigned_agent.is_none());
    assert_eq!(finished.subtasks.len(), 1);
    assert_eq!(finished.subtasks[0].status, SubtaskStatus::Completed);
}

/// A blocked task can be unblocked and re-driven to completion.
#[tokio::test]
async fn test_recovery_after_unblock() {
    let ctx = build_engine(vec![
        ScriptedRun::success(plan_one_dev_one_qa()),
        ScriptedRun::failure("flaky failure"),
        ok(),
        ok(),
    ]);
    let task = create_planned_task(&ctx).await;
    ctx.engine.approve_plan(task.id, true).unwrap();

    wait_for(&ctx.engine, task.id, |t| t.status == TaskStatus::Blocked).await;

    ctx.engine.unblock(task.id).unwrap();
    // Re-approving with start_development re-spawns the sequencer; the
    // approval itself is a tolerated no-op on the advanced record.
    ctx.engine.approve_plan(task.id, true).unwrap();

    let finished = wait_for(&ctx.engine, task.id, |t| {
        t.phase == TaskPhase::HumanReview
    })
    .await;
    assert!(finished
        .subtasks
        .iter()
        .all(|s| s.status == SubtaskStatus::Completed));
}

/// The wait ceiling is soft: on expiry nothing is marked failed and the
/// agent keeps running.
#[tokio::test]
async fn test_wait_ceiling_exits_softly() {
    let ctx = build_engine_with_timeout(
        vec![
            ScriptedRun::success(plan_one_dev_one_qa()),
            ScriptedRun::hang(),
        ],
        Duration::from_millis(150),
    );
    let task = create_planned_task(&ctx).await;
    ctx.engine.approve_plan(task.id, true).unwrap();

    wait_for(&ctx.engine, task.id, |t| t.assigned_agent.is_some()).await;
    let thread = ctx
        .engine
        .supervisor()
        .running_session_for(task.id)
        .expect("agent should be running");

    // Let the ceiling expire with room to spare.
    tokio::time::sleep(Duration::from_millis(500)).await;

    let task = ctx.engine.store().load(task.id).unwrap();
    assert_eq!(task.status, TaskStatus::Active);
    assert_eq!(task.phase, TaskPhase::InProgress);
    assert_eq!(task.subtasks[0].status, SubtaskStatus::InProgress);
    assert_eq!(
        ctx.engine.supervisor().get_agent_status(thread).unwrap().status,
        SessionStatus::Running
    );
}

/// Deleting a task mid-run tears down its agent session and worktree
/// but never blocks record deletion.
#[tokio::test]
async fn test_delete_task_cascade_mid_run() {
    let ctx = build_engine(vec![
        ScriptedRun::success(plan_one_dev_one_qa()),
        ScriptedRun::hang(),
    ]);
    let task = create_planned_task(&ctx).await;
    ctx.engine.approve_plan(task.id, true).unwrap();
    wait_for(&ctx.engine, task.id, |t| t.assigned_agent.is_some()).await;

    let warnings = ctx.engine.delete_task(task.id, true).unwrap();
    assert!(warnings.is_empty());
    assert!(ctx.engine.store().load(task.id).is_err());
    assert!(ctx.engine.supervisor().running_session_for(task.id).is_none());
    assert!(ctx
        .engine
        .worktrees()
        .list_worktrees()
        .unwrap()
        .is_empty());
}
