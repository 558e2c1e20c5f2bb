use crate::error::{PilotError, Result};
use crate::paths;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

// ---------------------------------------------------------------------------
// ConfigWarning / WarnLevel
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigWarning {
    pub level: WarnLevel,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarnLevel {
    Warning,
    Error,
}

// ---------------------------------------------------------------------------
// ExecutionConfig
// ---------------------------------------------------------------------------

/// Limits applied to every command run on the orchestrator's behalf.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    #[serde(default = "default_min_timeout_ms")]
    pub min_timeout_ms: u64,
    #[serde(default = "default_max_timeout_ms")]
    pub max_timeout_ms: u64,
    /// Captured stdout/stderr longer than this are cut down before recording.
    #[serde(default = "default_max_output_bytes")]
    pub max_output_bytes: usize,
}

fn default_min_timeout_ms() -> u64 {
    2_000
}

fn default_max_timeout_ms() -> u64 {
    180_000
}

fn default_max_output_bytes() -> usize {
    50_000
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            min_timeout_ms: default_min_timeout_ms(),
            max_timeout_ms: default_max_timeout_ms(),
            max_output_bytes: default_max_output_bytes(),
        }
    }
}

impl ExecutionConfig {
    /// Clamp a requested timeout into `[min_timeout_ms, max_timeout_ms]`.
    /// `None` means "as long as allowed".
    pub fn clamp_timeout(&self, requested: Option<Duration>) -> Duration {
        let min = Duration::from_millis(self.min_timeout_ms);
        let max = Duration::from_millis(self.max_timeout_ms.max(self.min_timeout_ms));
        requested.unwrap_or(max).clamp(min, max)
    }
}

// ---------------------------------------------------------------------------
// SupervisorConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorConfig {
    /// Upper bound on a single output drain while running a command. The
    /// watcher waits ten times this for output after a process exits.
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
    /// Watcher poll interval while background processes are running.
    #[serde(default = "default_busy_interval_ms")]
    pub busy_interval_ms: u64,
    /// Watcher poll interval while nothing is running.
    #[serde(default = "default_idle_interval_ms")]
    pub idle_interval_ms: u64,
    /// How long a graceful termination may take before the tree is killed.
    #[serde(default = "default_terminate_grace_ms")]
    pub terminate_grace_ms: u64,
}

fn default_read_timeout_ms() -> u64 {
    10
}

fn default_busy_interval_ms() -> u64 {
    100
}

fn default_idle_interval_ms() -> u64 {
    1_000
}

fn default_terminate_grace_ms() -> u64 {
    1_000
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            read_timeout_ms: default_read_timeout_ms(),
            busy_interval_ms: default_busy_interval_ms(),
            idle_interval_ms: default_idle_interval_ms(),
            terminate_grace_ms: default_terminate_grace_ms(),
        }
    }
}

impl SupervisorConfig {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn busy_interval(&self) -> Duration {
        Duration::from_millis(self.busy_interval_ms)
    }

    pub fn idle_interval(&self) -> Duration {
        Duration::from_millis(self.idle_interval_ms)
    }

    pub fn terminate_grace(&self) -> Duration {
        Duration::from_millis(self.terminate_grace_ms)
    }
}

// ---------------------------------------------------------------------------
// CheckpointConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointConfig {
    /// Replay recorded steps when a session re-executes the same work.
    #[serde(default = "default_replay")]
    pub replay: bool,
    /// Database file name, relative to `.pilot/`.
    #[serde(default = "default_db_file")]
    pub db_file: String,
}

fn default_replay() -> bool {
    true
}

fn default_db_file() -> String {
    paths::CHECKPOINT_DB_FILE.to_string()
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            replay: default_replay(),
            db_file: default_db_file(),
        }
    }
}

// ---------------------------------------------------------------------------
// RetryConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_tries")]
    pub max_tries: u32,
    /// How deeply retry loops may nest inside each other's attempts.
    #[serde(default = "default_max_depth")]
    pub max_depth: u32,
}

fn default_max_tries() -> u32 {
    3
}

fn default_max_depth() -> u32 {
    3
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_tries: default_max_tries(),
            max_depth: default_max_depth(),
        }
    }
}

// ---------------------------------------------------------------------------
// Config (top-level)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub execution: ExecutionConfig,
    #[serde(default)]
    pub supervisor: SupervisorConfig,
    #[serde(default)]
    pub checkpoint: CheckpointConfig,
    #[serde(default)]
    pub retry: RetryConfig,
}

impl Config {
    /// Load `<root>/.pilot/config.yaml`, falling back to defaults when the
    /// file does not exist.
    pub fn load(root: &Path) -> Result<Self> {
        let path = paths::config_path(root);
        if !path.exists() {
            return Ok(Self::default());
        }
        let data = std::fs::read_to_string(&path)?;
        let cfg: Config = serde_yaml::from_str(&data)?;
        Ok(cfg)
    }

    pub fn save(&self, root: &Path) -> Result<()> {
        let path = paths::config_path(root);
        let data = serde_yaml::to_string(self)?;
        crate::io::atomic_write(&path, data.as_bytes())
    }

    /// Location of the checkpoint database for a project rooted at `root`.
    pub fn checkpoint_db_path(&self, root: &Path) -> Result<PathBuf> {
        let name = Path::new(&self.checkpoint.db_file);
        if name.is_absolute() || name.components().count() != 1 {
            return Err(PilotError::InvalidConfig(format!(
                "checkpoint.db_file must be a plain file name, got '{}'",
                self.checkpoint.db_file
            )));
        }
        Ok(paths::pilot_dir(root).join(name))
    }

    // -----------------------------------------------------------------------
    // Validation
    // -----------------------------------------------------------------------

    pub fn validate(&self) -> Vec<ConfigWarning> {
        let mut warnings = Vec::new();
        let mut error = |message: String| {
            warnings.push(ConfigWarning {
                level: WarnLevel::Error,
                message,
            })
        };

        let exec = &self.execution;
        if exec.min_timeout_ms > exec.max_timeout_ms {
            error(format!(
                "execution.min_timeout_ms ({}) is greater than execution.max_timeout_ms ({})",
                exec.min_timeout_ms, exec.max_timeout_ms
            ));
        }
        if exec.max_output_bytes == 0 {
            error("execution.max_output_bytes is 0: all command output would be dropped".into());
        }

        let sup = &self.supervisor;
        for (name, value) in [
            ("read_timeout_ms", sup.read_timeout_ms),
            ("busy_interval_ms", sup.busy_interval_ms),
            ("idle_interval_ms", sup.idle_interval_ms),
        ] {
            if value == 0 {
                error(format!("supervisor.{name} must be greater than 0"));
            }
        }

        if self.retry.max_tries == 0 {
            error("retry.max_tries is 0: at least one attempt is always made".into());
        }

        if self.retry.max_tries > 10 {
            warnings.push(ConfigWarning {
                level: WarnLevel::Warning,
                message: format!(
                    "retry.max_tries={} (>10 is unusual)",
                    self.retry.max_tries
                ),
            });
        }
        if self.retry.max_depth == 0 {
            warnings.push(ConfigWarning {
                level: WarnLevel::Warning,
                message: "retry.max_depth is 0: every retry loop will be rejected".into(),
            });
        }
        if self.checkpoint.db_file.trim().is_empty() {
            warnings.push(ConfigWarning {
                level: WarnLevel::Error,
                message: "checkpoint.db_file is empty".into(),
            });
        }

        warnings
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
