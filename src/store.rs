//! File-backed task record store.
//!
//! One JSON object per task at `{dir}/{id}.json`, written atomically via
//! temp-file rename. Saves carry an optimistic concurrency check: the
//! on-disk record version must match the in-memory one, otherwise the
//! write is rejected with [`Error::StaleTask`] and nothing changes.
//! Writers go through [`TaskStore::update`], which reloads, applies, and
//! retries on staleness.
//!
//! Every successful save publishes a change notification keyed by task
//! id; the sequencer's bounded wait subscribes to this feed instead of
//! polling on a fixed interval.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;

use crate::error::{Error, Result};
use crate::task::{Task, TaskId};
use crate::{olog_debug, olog_warn};

const UPDATE_RETRIES: usize = 10;

/// Per-task change notifications.
///
/// `handle` returns the shared [`Notify`] for a task; waiters must
/// register (`Notified::enable`) *before* re-reading state to avoid
/// missing a wake between the read and the await.
#[derive(Clone, Default)]
pub struct ChangeFeed {
    inner: Arc<Mutex<HashMap<TaskId, Arc<Notify>>>>,
}

impl ChangeFeed {
    pub fn handle(&self, task_id: TaskId) -> Arc<Notify> {
        let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        map.entry(task_id).or_default().clone()
    }

    pub fn notify(&self, task_id: TaskId) {
        let handle = {
            let map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            map.get(&task_id).cloned()
        };
        if let Some(n) = handle {
            n.notify_waiters();
        }
    }

    /// Drop the notification slot for a deleted task.
    fn forget(&self, task_id: TaskId) {
        let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(n) = map.remove(&task_id) {
            // Wake anyone still waiting so they observe the deletion.
            n.notify_waiters();
        }
    }
}

/// Load/save/list/delete of task records keyed by id.
#[derive(Clone)]
pub struct TaskStore {
    dir: PathBuf,
    feed: ChangeFeed,
    /// Serializes the read-check-write inside `save` across clones of
    /// this store. The version check still guards against writers going
    /// through a different store instance (or process).
    write_lock: Arc<Mutex<()>>,
}

impl TaskStore {
    /// Create a store rooted at the given directory, creating it if needed.
    pub fn new(dir: PathBuf) -> Result<Self> {
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            feed: ChangeFeed::default(),
            write_lock: Arc::new(Mutex::new(())),
        })
    }

    pub fn feed(&self) -> &ChangeFeed {
        &self.feed
    }

    fn path(&self, id: TaskId) -> PathBuf {
        self.dir.join(format!("{}.json", id))
    }

    pub fn load(&self, id: TaskId) -> Result<Task> {
        let path = self.path(id);
        if !path.exists() {
            return Err(Error::TaskNotFound(id));
        }
        let task: Task = serde_json::from_str(&fs::read_to_string(&path)?)?;
        Ok(task)
    }

    /// Persist the record, bumping its version.
    ///
    /// Fails with [`Error::StaleTask`] when the on-disk version no longer
    /// matches `task.version` (a concurrent writer got there first); the
    /// record on disk is left untouched in that case.
    pub fn save(&self, task: &mut Task) -> Result<()> {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());

        let path = self.path(task.id);
        if path.exists() {
            let on_disk: Task = serde_json::from_str(&fs::read_to_string(&path)?)?;
            if on_disk.version != task.version {
                return Err(Error::StaleTask(task.id));
            }
        }
        task.version += 1;

        let tmp = self.dir.join(format!(".{}.tmp-{}", task.id, task.version));
        fs::write(&tmp, serde_json::to_string_pretty(task)?)?;
        fs::rename(&tmp, &path)?;
        olog_debug!("Saved task {} v{}", task.id.short(), task.version);

        self.feed.notify(task.id);
        Ok(())
    }

    /// Reload-apply-save with bounded retry on staleness.
    ///
    /// This is the write path every mutator uses; it eliminates lost
    /// updates between the API boundary, UI, and the sequencer.
    pub fn update<F>(&self, id: TaskId, mut f: F) -> Result<Task>
    where
        F: FnMut(&mut Task) -> Result<()>,
    {
        for attempt in 0..UPDATE_RETRIES {
            let mut task = self.load(id)?;
            f(&mut task)?;
            match self.save(&mut task) {
                Ok(()) => return Ok(task),
                Err(Error::StaleTask(_)) if attempt + 1 < UPDATE_RETRIES => {
                    olog_debug!(
                        "Task {} stale on update attempt {}, retrying",
                        id.short(),
                        attempt + 1
                    );
                }
                Err(e) => return Err(e),
            }
        }
        Err(Error::StaleTask(id))
    }

    pub fn list(&self) -> Result<Vec<Task>> {
        let mut tasks = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match fs::read_to_string(&path).map_err(Error::Io).and_then(|s| {
                serde_json::from_str::<Task>(&s).map_err(Error::Json)
            }) {
                Ok(task) => tasks.push(task),
                Err(e) => {
                    olog_warn!("Skipping unreadable task record {}: {}", path.display(), e);
                }
            }
        }
        tasks.sort_by_key(|t| t.created_at);
        Ok(tasks)
    }

    /// Delete a task record. Idempotent: deleting a missing record is a no-op.
    pub fn delete(&self, id: TaskId) -> Result<()> {
        let path = self.path(id);
        if path.exists() {
            fs::remove_file(&path)?;
            olog_debug!("Deleted task record {}", id.short());
        }
        self.feed.forget(id);
        Ok(())
    }
}
