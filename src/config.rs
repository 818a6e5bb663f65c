use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::{clog_debug, Error, Result};

/// Default per-task timeout when neither the agent nor the config sets one (30 minutes).
pub const DEFAULT_TIMEOUT_SECS: u64 = 1800;

/// Default number of retries an executor performs before failing a node.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Per-agent-kind overrides from `[agents.<kind>]`.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct AgentConfig {
    pub timeout_secs: Option<u64>,
}

/// An agent kind with its optional overrides resolved from config.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentDescriptor {
    pub kind: String,
    pub timeout: Option<Duration>,
}

impl AgentDescriptor {
    pub fn new(kind: &str) -> Self {
        Self {
            kind: kind.to_string(),
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// The agent's own timeout if set, else the global one.
    pub fn effective_timeout(&self, global: Duration) -> Duration {
        self.timeout.unwrap_or(global)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Upper bound on in-flight nodes; 0 means unlimited.
    pub max_concurrency: usize,
    pub default_timeout_secs: u64,
    pub max_retries: u32,
    pub checkpoint_path: Option<String>,
    pub agents: HashMap<String, AgentConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_concurrency: 0,
            default_timeout_secs: DEFAULT_TIMEOUT_SECS,
            max_retries: DEFAULT_MAX_RETRIES,
            checkpoint_path: None,
            agents: HashMap::new(),
        }
    }
}

impl Config {
    pub fn conductor_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir().ok_or(Error::NoHomeDir)?.join(".conductor"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::conductor_dir()?.join("conductor.toml"))
    }

    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        clog_debug!("Config::load path={}", path.display());
        if !path.exists() {
            clog_debug!("Config file not found, using defaults");
            return Ok(Self::default());
        }
        let config: Self = toml::from_str(&fs::read_to_string(path)?)?;
        config.check()?;
        clog_debug!(
            "Config loaded: max_concurrency={}, default_timeout_secs={}, agents={}",
            config.max_concurrency,
            config.default_timeout_secs,
            config.agents.len()
        );
        Ok(config)
    }

    fn check(&self) -> Result<()> {
        if self.default_timeout_secs == 0 {
            return Err(Error::Config("default_timeout_secs must be > 0".to_string()));
        }
        for (kind, agent) in &self.agents {
            if agent.timeout_secs == Some(0) {
                return Err(Error::Config(format!(
                    "agents.{}.timeout_secs must be > 0",
                    kind
                )));
            }
        }
        Ok(())
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.default_timeout_secs)
    }

    /// Where checkpoints live: the configured path, else `~/.conductor/checkpoint.json`.
    pub fn checkpoint_path(&self) -> Result<PathBuf> {
        match &self.checkpoint_path {
            Some(path) => Ok(expand_tilde(path)),
            None => Ok(Self::conductor_dir()?.join("checkpoint.json")),
        }
    }

    /// Resolve the descriptor for an agent kind. Unknown kinds get no overrides.
    pub fn agent(&self, kind: &str) -> AgentDescriptor {
        let timeout = self
            .agents
            .get(kind)
            .and_then(|a| a.timeout_secs)
            .map(Duration::from_secs);
        AgentDescriptor {
            kind: kind.to_string(),
            timeout,
        }
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
