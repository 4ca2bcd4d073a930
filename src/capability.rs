//! Coding-agent capability boundary.
//!
//! The core depends only on "start something that emits log events and
//! eventually succeeds or fails". A [`CapabilityAdapter`] turns a prompt
//! and working directory into a lazy, ordered sequence of [`RunEvent`]s
//! ending in a terminal `Result` event. The terminal event carries
//! *structured* output; the core never scans free text for embedded
//! JSON. Malformed structured output surfaces as a validation error.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::AsyncBufReadExt as _;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::task::SubtaskKind;
use crate::olog_debug;

/// Which output stream a log line arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogStream {
    Stdout,
    Stderr,
}

/// One event from an agent run. Serialized as newline-delimited JSON
/// into the per-run log for the external relay.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunEvent {
    /// A plain text line from the agent process.
    Log { stream: LogStream, text: String },
    /// A structured event the agent emitted.
    Json { payload: serde_json::Value },
    /// Terminal event: the run finished.
    Result {
        success: bool,
        output: Option<serde_json::Value>,
        error: Option<String>,
    },
}

impl RunEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunEvent::Result { .. })
    }
}

/// A subtask as described by the planning agent's structured output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlannedSubtask {
    pub content: String,
    pub label: String,
    pub kind: SubtaskKind,
}

/// Structured output of a planning run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanOutput {
    pub plan: String,
    pub subtasks: Vec<PlannedSubtask>,
}

impl PlanOutput {
    /// Deserialize a plan from the terminal event's structured payload.
    /// Schema mismatches are validation errors, resolved to blocked by
    /// the caller.
    pub fn from_value(value: &serde_json::Value) -> Result<Self> {
        serde_json::from_value(value.clone())
            .map_err(|e| Error::Validation(format!("malformed plan output: {}", e)))
    }
}

/// Static description of a capability tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Capabilities {
    pub tool_id: String,
    pub display_name: String,
}

/// The external collaborator contract for coding-agent tools.
///
/// `execute` must be non-blocking: it spawns whatever it needs and hands
/// back the event stream. Cancelling the token terminates the run; the
/// adapter still emits a terminal `Result` event before closing.
pub trait CapabilityAdapter: Send + Sync {
    fn initialize(&self, config: &serde_json::Value) -> Result<()>;

    fn execute(
        &self,
        prompt: &str,
        working_dir: &Path,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<RunEvent>>;

    fn capabilities(&self) -> Capabilities;

    fn config_schema(&self) -> serde_json::Value;
}

/// Default adapter: runs the configured agent binary headless with
/// stream-json output and relays its lines as events.
pub struct ProcessAdapter {
    binary: PathBuf,
    extra_args: Mutex<Vec<String>>,
}

impl ProcessAdapter {
    /// Locate the agent binary on PATH.
    pub fn new(command: &str) -> Result<Self> {
        let binary = which::which(command)
            .map_err(|_| Error::Capability(format!("agent binary not found: {}", command)))?;
        Ok(Self {
            binary,
            extra_args: Mutex::new(Vec::new()),
        })
    }

    /// Use a specific binary path (tests, non-standard installs).
    pub fn with_binary(binary: PathBuf) -> Self {
        Self {
            binary,
            extra_args: Mutex::new(Vec::new()),
        }
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }
}

impl CapabilityAdapter for ProcessAdapter {
    fn initialize(&self, config: &serde_json::Value) -> Result<()> {
        if config.is_null() {
            return Ok(());
        }
        let args = match config.get("args") {
            None => Vec::new(),
            Some(v) => serde_json::from_value::<Vec<String>>(v.clone())
                .map_err(|e| Error::Validation(format!("capability config: {}", e)))?,
        };
        *self.extra_args.lock().unwrap_or_else(|e| e.into_inner()) = args;
        Ok(())
    }

    fn execute(
        &self,
        prompt: &str,
        working_dir: &Path,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<RunEvent>> {
        let extra = self
            .extra_args
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        let mut cmd = tokio::process::Command::new(&self.binary);
        cmd.args(&extra)
            .args(["--output-format", "stream-json"])
            .args(["-p", prompt])
            .current_dir(working_dir)
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|e| Error::Capability(format!("failed to start {}: {}", self.binary.display(), e)))?;
        olog_debug!(
            "Spawned agent process {} in {}",
            self.binary.display(),
            working_dir.display()
        );

        let (tx, rx) = mpsc::channel(256);
        let last_payload: Arc<Mutex<Option<serde_json::Value>>> = Arc::new(Mutex::new(None));
        let last_stderr: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let mut readers = Vec::new();
        if let Some(out) = stdout {
            let tx = tx.clone();
            let last_payload = last_payload.clone();
            readers.push(tokio::spawn(async move {
                let mut lines = tokio::io::BufReader::new(out).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if line.trim().is_empty() {
                        continue;
                    }
                    let event = match serde_json::from_str::<serde_json::Value>(&line) {
                        Ok(payload) => {
                            *last_payload.lock().unwrap_or_else(|e| e.into_inner()) =
                                Some(payload.clone());
                            RunEvent::Json { payload }
                        }
                        Err(_) => RunEvent::Log {
                            stream: LogStream::Stdout,
                            text: line,
                        },
                    };
                    if tx.send(event).await.is_err() {
                        break;
                    }
                }
            }));
        }
        if let Some(err) = stderr {
            let tx = tx.clone();
            let last_stderr = last_stderr.clone();
            readers.push(tokio::spawn(async move {
                let mut lines = tokio::io::BufReader::new(err).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if line.trim().is_empty() {
                        continue;
                    }
                    *last_stderr.lock().unwrap_or_else(|e| e.into_inner()) = Some(line.clone());
                    let event = RunEvent::Log {
                        stream: LogStream::Stderr,
                        text: line,
                    };
                    if tx.send(event).await.is_err() {
                        break;
                    }
                }
            }));
        }

        tokio::spawn(async move {
            let waited = tokio::select! {
                status = child.wait() => Some(status),
                _ = cancel.cancelled() => None,
            };
            let terminal = match waited {
                Some(status) => {
                    for r in readers {
                        let _ = r.await;
                    }
                    match status {
                        Ok(status) if status.success() => RunEvent::Result {
                            success: true,
                            output: last_payload.lock().unwrap_or_else(|e| e.into_inner()).take(),
                            error: None,
                        },
                        Ok(status) => {
                            let stderr_tail =
                                last_stderr.lock().unwrap_or_else(|e| e.into_inner()).take();
                            RunEvent::Result {
                                success: false,
                                output: None,
                                error: Some(stderr_tail.unwrap_or_else(|| {
                                    format!(
                                        "agent exited with code {}",
                                        status.code().unwrap_or(-1)
                                    )
                                })),
                            }
                        }
                        Err(e) => RunEvent::Result {
                            success: false,
                            output: None,
                            error: Some(format!("failed to wait on agent: {}", e)),
                        },
                    }
                }
                None => {
                    let _ = child.kill().await;
                    RunEvent::Result {
                        success: false,
                        output: None,
                        error: Some("cancelled".to_string()),
                    }
                }
            };
            let _ = tx.send(terminal).await;
        });

        Ok(rx)
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            tool_id: "claude".to_string(),
            display_name: "Claude Code (headless)".to_string(),
        }
    }

    fn config_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "args": {
                    "type": "array",
                    "items": { "type": "string" },
                    "description": "Extra arguments passed to the agent binary"
                }
            }
        })
    }
}

/// One scripted run for the [`ScriptedAdapter`].
#[derive(Debug, Clone)]
pub struct ScriptedRun {
    /// Log events emitted before the terminal event.
    pub logs: Vec<String>,
    /// Delay before the terminal event; gives tests a running window.
    pub delay: Duration,
    /// Terminal event, or `None` to run until cancelled.
    pub result: Option<RunEvent>,
}

impl ScriptedRun {
    pub fn success(output: serde_json::Value) -> Self {
        Self {
            logs: Vec::new(),
            delay: Duration::from_millis(0),
            result: Some(RunEvent::Result {
                success: true,
                output: Some(output),
                error: None,
            }),
        }
    }

    pub fn failure(error: &str) -> Self {
        Self {
            logs: Vec::new(),
            delay: Duration::from_millis(0),
            result: Some(RunEvent::Result {
                success: false,
                output: None,
                error: Some(error.to_string()),
            }),
        }
    }

    /// A run that never finishes on its own; only cancellation ends it.
    pub fn hang() -> Self {
        Self {
            logs: Vec::new(),
            delay: Duration::from_millis(0),
            result: None,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_logs(mut self, logs: &[&str]) -> Self {
        self.logs = logs.iter().map(|s| s.to_string()).collect();
        self
    }
}

/// Deterministic adapter driven by a script of runs, consumed in order.
/// Used by the test suites in place of a real agent; when the script is
/// exhausted it keeps replaying its last entry.
#[derive(Default)]
pub struct ScriptedAdapter {
    script: Mutex<VecDeque<ScriptedRun>>,
    last: Mutex<Option<ScriptedRun>>,
    started: std::sync::atomic::AtomicUsize,
}

impl ScriptedAdapter {
    pub fn new(runs: Vec<ScriptedRun>) -> Self {
        Self {
            script: Mutex::new(runs.into()),
            last: Mutex::new(None),
            started: std::sync::atomic::AtomicUsize::new(0),
        }
    }

    /// How many runs have been started so far.
    pub fn runs_started(&self) -> usize {
        self.started.load(std::sync::atomic::Ordering::SeqCst)
    }

    pub fn push(&self, run: ScriptedRun) {
        self.script
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(run);
    }

    fn next_run(&self) -> ScriptedRun {
        let mut script = self.script.lock().unwrap_or_else(|e| e.into_inner());
        let mut last = self.last.lock().unwrap_or_else(|e| e.into_inner());
        match script.pop_front() {
            Some(run) => {
                *last = Some(run.clone());
                run
            }
            None => last.clone().unwrap_or_else(|| ScriptedRun::failure("script exhausted")),
        }
    }
}

impl CapabilityAdapter for ScriptedAdapter {
    fn initialize(&self, _config: &serde_json::Value) -> Result<()> {
        Ok(())
    }

    fn execute(
        &self,
        _prompt: &str,
        _working_dir: &Path,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<RunEvent>> {
        self.started
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        let run = self.next_run();
        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(async move {
            for text in run.logs {
                let _ = tx
                    .send(RunEvent::Log {
                        stream: LogStream::Stdout,
                        text,
                    })
                    .await;
            }
            let terminal = match run.result {
                Some(result) => {
                    tokio::select! {
                        _ = tokio::time::sleep(run.delay) => result,
                        _ = cancel.cancelled() => RunEvent::Result {
                            success: false,
                            output: None,
                            error: Some("cancelled".to_string()),
                        },
                    }
                }
                None => {
                    cancel.cancelled().await;
                    RunEvent::Result {
                        success: false,
                        output: None,
                        error: Some("cancelled".to_string()),
                    }
                }
            };
            let _ = tx.send(terminal).await;
        });
        Ok(rx)
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            tool_id: "scripted".to_string(),
            display_name: "Scripted adapter".to_string(),
        }
    }

    fn config_schema(&self) -> serde_json::Value {
        serde_json::json!({ "type": "object", "properties": {} })
    }
}
