use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use crate::{olog_debug, Error, Result};

/// Default ceiling for a single subtask wait, in seconds (30 minutes).
///
/// One value applied uniformly at every wait site; on expiry the wait
/// exits softly without failing the task.
pub const DEFAULT_SUBTASK_TIMEOUT_SECS: u64 = 1800;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    pub worktree_dir: Option<String>,
    pub command: Option<String>,
    pub subtask_timeout_secs: Option<u64>,
}

impl Config {
    pub fn overseer_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir().ok_or(Error::NoHomeDir)?.join(".overseer"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::overseer_dir()?.join("overseer.toml"))
    }

    pub fn tasks_dir() -> Result<PathBuf> {
        Ok(Self::overseer_dir()?.join("tasks"))
    }

    pub fn runs_dir() -> Result<PathBuf> {
        Ok(Self::overseer_dir()?.join("runs"))
    }

    pub fn worktrees_dir() -> Result<PathBuf> {
        let config = Self::load()?;
        match config.worktree_dir {
            Some(dir) => Ok(expand_tilde(&dir)),
            None => Ok(Self::overseer_dir()?.join("worktrees")),
        }
    }

    pub fn effective_command(&self) -> &str {
        self.command.as_deref().unwrap_or("claude")
    }

    /// The single bounded-wait ceiling for subtask execution.
    pub fn subtask_timeout(&self) -> Duration {
        Duration::from_secs(
            self.subtask_timeout_secs
                .unwrap_or(DEFAULT_SUBTASK_TIMEOUT_SECS),
        )
    }

    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        olog_debug!("Config::load path={}", path.display());
        if !path.exists() {
            olog_debug!("Config file not found, using defaults");
            return Ok(Self::default());
        }
        let config: Self = toml::from_str(&fs::read_to_string(&path)?)?;
        olog_debug!(
            "Config loaded: worktree_dir={:?}, command={:?}, subtask_timeout_secs={:?}",
            config.worktree_dir,
            config.command,
            config.subtask_timeout_secs
        );
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        let overseer_dir = Self::overseer_dir()?;
        olog_debug!("Config::save overseer_dir={}", overseer_dir.display());
        if !overseer_dir.exists() {
            fs::create_dir_all(&overseer_dir)?;
        }
        let path = Self::config_path()?;
        fs::write(&path, toml::to_string_pretty(self)?)?;
        olog_debug!("Config saved to {}", path.display());
        Ok(())
    }

    pub fn ensure_dirs() -> Result<()> {
        for dir in [
            Self::overseer_dir()?,
            Self::tasks_dir()?,
            Self::runs_dir()?,
            Self::worktrees_dir()?,
        ] {
            if !dir.exists() {
                olog_debug!("Creating directory: {}", dir.display());
                fs::create_dir_all(&dir)?;
            }
        }
        Ok(())
    }
}

fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}
