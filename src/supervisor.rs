//! Agent process supervision.
//!
//! The supervisor owns agent sessions: it starts one run per call,
//! relays the capability's event stream into an ordered log, mirrors
//! events as newline-delimited JSON for the external relay, and fires
//! the completion callback exactly once on the terminal transition.
//!
//! Exactly one *running* session exists per task at any instant;
//! starting a second is a conflict. Process lifecycle is decoupled from
//! business-phase lifecycle: clearing `Task.assigned_agent` is the
//! caller's job, never the supervisor's.

use std::collections::HashMap;
use std::io::Write as _;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::capability::{CapabilityAdapter, RunEvent};
use crate::error::{Error, Result};
use crate::task::TaskId;
use crate::{olog, olog_debug, olog_warn};

/// Unique identifier for one agent run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ThreadId(pub Uuid);

impl ThreadId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Return first 8 characters of the UUID for display.
    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for ThreadId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ThreadId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for ThreadId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Lifecycle state of an agent session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Running,
    Completed,
    Error,
    Stopped,
}

impl SessionStatus {
    pub fn is_terminal(&self) -> bool {
        *self != SessionStatus::Running
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionStatus::Running => write!(f, "running"),
            SessionStatus::Completed => write!(f, "completed"),
            SessionStatus::Error => write!(f, "error"),
            SessionStatus::Stopped => write!(f, "stopped"),
        }
    }
}

/// One entry in a session's ordered log sequence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEvent {
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub event: RunEvent,
}

/// What the completion callback receives on the terminal transition.
#[derive(Debug, Clone)]
pub struct AgentOutcome {
    pub success: bool,
    pub output: Option<serde_json::Value>,
    pub error: Option<String>,
    /// True when the run was terminated through `stop_agent` rather
    /// than finishing (or failing) on its own. Callers use this to
    /// distinguish administrative stops from execution failures.
    pub stopped: bool,
}

pub type CompletionCallback = Box<dyn FnOnce(AgentOutcome) + Send + 'static>;

/// Options for [`AgentSupervisor::start_agent`].
pub struct StartOptions {
    pub working_dir: PathBuf,
    pub on_complete: Option<CompletionCallback>,
}

/// Snapshot of a session for observers.
#[derive(Debug, Clone)]
pub struct AgentStatusReport {
    pub task_id: TaskId,
    pub status: SessionStatus,
    pub logs: Vec<LogEvent>,
    pub error: Option<String>,
}

struct SessionState {
    status: SessionStatus,
    logs: Vec<LogEvent>,
    error: Option<String>,
}

struct Session {
    task_id: TaskId,
    state: Mutex<SessionState>,
    cancel: CancellationToken,
    // Taken exactly once, by whichever terminal path gets there first.
    on_complete: Mutex<Option<CompletionCallback>>,
}

impl Session {
    fn fire_completion(&self, outcome: AgentOutcome) {
        let callback = self
            .on_complete
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(cb) = callback {
            cb(outcome);
        }
    }
}

/// Starts, observes, and stops agent runs.
///
/// Explicitly constructed and dependency-injected; there is no
/// process-wide instance. Each supervisor owns its own session table.
pub struct AgentSupervisor {
    adapter: Arc<dyn CapabilityAdapter>,
    run_log_dir: Option<PathBuf>,
    sessions: Mutex<HashMap<ThreadId, Arc<Session>>>,
}

impl AgentSupervisor {
    pub fn new(adapter: Arc<dyn CapabilityAdapter>, run_log_dir: Option<PathBuf>) -> Self {
        Self {
            adapter,
            run_log_dir,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn adapter(&self) -> &Arc<dyn CapabilityAdapter> {
        &self.adapter
    }

    /// Start one agent run for a task. Non-blocking: the run proceeds on
    /// the runtime and the returned thread id is its handle.
    ///
    /// Fails with [`Error::AgentConflict`] when a session for this task
    /// is already running.
    pub fn start_agent(
        &self,
        task_id: TaskId,
        prompt: &str,
        opts: StartOptions,
    ) -> Result<ThreadId> {
        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        let already_running = sessions.values().any(|s| {
            s.task_id == task_id
                && s.state.lock().unwrap_or_else(|e| e.into_inner()).status
                    == SessionStatus::Running
        });
        if already_running {
            return Err(Error::AgentConflict(task_id));
        }

        let cancel = CancellationToken::new();
        let events = self
            .adapter
            .execute(prompt, &opts.working_dir, cancel.clone())?;

        let thread_id = ThreadId::new();
        let session = Arc::new(Session {
            task_id,
            state: Mutex::new(SessionState {
                status: SessionStatus::Running,
                logs: Vec::new(),
                error: None,
            }),
            cancel,
            on_complete: Mutex::new(opts.on_complete),
        });
        sessions.insert(thread_id, session.clone());
        drop(sessions);

        olog!(
            "Agent started: thread={} task={} dir={}",
            thread_id.short(),
            task_id.short(),
            opts.working_dir.display()
        );

        let run_log = self
            .run_log_dir
            .as_ref()
            .map(|dir| dir.join(format!("{}.ndjson", thread_id)));
        tokio::spawn(pump_events(session, thread_id, events, run_log));

        Ok(thread_id)
    }

    /// Snapshot a session's status and logs. `None` when the thread id
    /// is unknown.
    pub fn get_agent_status(&self, thread_id: ThreadId) -> Option<AgentStatusReport> {
        let sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        let session = sessions.get(&thread_id)?;
        let state = session.state.lock().unwrap_or_else(|e| e.into_inner());
        Some(AgentStatusReport {
            task_id: session.task_id,
            status: state.status,
            logs: state.logs.clone(),
            error: state.error.clone(),
        })
    }

    /// Terminate a run and return the owning task id. Idempotent on a
    /// session that already reached a terminal state.
    pub fn stop_agent(&self, thread_id: ThreadId) -> Result<TaskId> {
        let session = {
            let sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
            sessions
                .get(&thread_id)
                .cloned()
                .ok_or(Error::SessionNotFound(thread_id))?
        };

        {
            let mut state = session.state.lock().unwrap_or_else(|e| e.into_inner());
            if state.status.is_terminal() {
                olog_debug!("stop_agent: session {} already finished", thread_id.short());
                return Ok(session.task_id);
            }
            state.status = SessionStatus::Stopped;
        }
        session.cancel.cancel();
        olog!(
            "Agent stopped: thread={} task={}",
            thread_id.short(),
            session.task_id.short()
        );

        session.fire_completion(AgentOutcome {
            success: false,
            output: None,
            error: Some("agent stopped".to_string()),
            stopped: true,
        });
        Ok(session.task_id)
    }

    /// The running session for a task, if one exists.
    pub fn running_session_for(&self, task_id: TaskId) -> Option<ThreadId> {
        let sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        sessions.iter().find_map(|(id, s)| {
            let state = s.state.lock().unwrap_or_else(|e| e.into_inner());
            (s.task_id == task_id && state.status == SessionStatus::Running).then_some(*id)
        })
    }

    /// Number of sessions currently running.
    pub fn active_count(&self) -> usize {
        let sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        sessions
            .values()
            .filter(|s| {
                s.state.lock().unwrap_or_else(|e| e.into_inner()).status
                    == SessionStatus::Running
            })
            .count()
    }
}

/// Relay the capability's event stream into the session log until the
/// terminal event, then resolve the session.
async fn pump_events(
    session: Arc<Session>,
    thread_id: ThreadId,
    mut events: tokio::sync::mpsc::Receiver<RunEvent>,
    run_log: Option<PathBuf>,
) {
    let mut log_file = run_log.as_ref().and_then(|path| {
        std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| {
                olog_warn!("Cannot open run log {}: {}", path.display(), e);
            })
            .ok()
    });

    let mut terminal: Option<RunEvent> = None;
    let mut seq = 0u64;
    while let Some(event) = events.recv().await {
        let entry = LogEvent {
            seq,
            timestamp: Utc::now(),
            event: event.clone(),
        };
        seq += 1;

        if let Some(file) = log_file.as_mut() {
            if let Ok(line) = serde_json::to_string(&entry) {
                let _ = writeln!(file, "{}", line);
            }
        }

        let is_terminal = event.is_terminal();
        {
            let mut state = session.state.lock().unwrap_or_else(|e| e.into_inner());
            state.logs.push(entry);
        }
        if is_terminal {
            terminal = Some(event);
            break;
        }
    }

    // A stream that ends without a terminal event is an adapter bug;
    // resolve the session as an error rather than leaving it running.
    let (success, output, error) = match terminal {
        Some(RunEvent::Result {
            success,
            output,
            error,
        }) => (success, output, error),
        _ => (
            false,
            None,
            Some("agent event stream ended without a result".to_string()),
        ),
    };

    {
        let mut state = session.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.status == SessionStatus::Running {
            state.status = if success {
                SessionStatus::Completed
            } else {
                SessionStatus::Error
            };
            state.error = error.clone();
        } else {
            // stop_agent already resolved this session; keep its status.
            olog_debug!(
                "Session {} already resolved as {}",
                thread_id.short(),
                state.status
            );
        }
    }

    olog_debug!(
        "Agent finished: thread={} success={} error={:?}",
        thread_id.short(),
        success,
        error
    );
    session.fire_completion(AgentOutcome {
        success,
        output,
        error,
        stopped: false,
    });
}
