use crate::error::{RelayError, Result};
use crate::queue::BackoffPolicy;
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
// BackoffConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackoffConfig {
    #[serde(default = "default_backoff_first_ms")]
    pub first_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub max_ms: u64,
    #[serde(default = "default_backoff_factor")]
    pub factor: f64,
}

fn default_backoff_first_ms() -> u64 {
    1_000
}

fn default_backoff_max_ms() -> u64 {
    300_000
}

fn default_backoff_factor() -> f64 {
    2.0
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            first_ms: default_backoff_first_ms(),
            max_ms: default_backoff_max_ms(),
            factor: default_backoff_factor(),
        }
    }
}

impl BackoffConfig {
    /// The retry policy, with the first delay clamped to `max_ms`.
    pub fn policy(&self) -> BackoffPolicy {
        BackoffPolicy {
            first: Duration::from_millis(self.first_ms.min(self.max_ms)),
            max: Duration::from_millis(self.max_ms),
            factor: self.factor,
        }
    }
}

// ---------------------------------------------------------------------------
// QueueConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Buffered event count that triggers an automatic flush.
    #[serde(default = "default_flush_at")]
    pub flush_at: usize,
    /// Age of the oldest buffered event that triggers a timed flush.
    /// `0` disables the timer.
    #[serde(default = "default_flush_interval_secs")]
    pub flush_interval_secs: f64,
    /// Largest batch handed to the sender in one call.
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,
    /// Oldest events are evicted beyond this many. `None` means unbounded.
    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: Option<usize>,
    #[serde(default)]
    pub backoff: BackoffConfig,
}

fn default_flush_at() -> usize {
    20
}

fn default_flush_interval_secs() -> f64 {
    30.0
}

fn default_max_batch_size() -> usize {
    100
}

fn default_max_queue_size() -> Option<usize> {
    Some(1_000)
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            flush_at: default_flush_at(),
            flush_interval_secs: default_flush_interval_secs(),
            max_batch_size: default_max_batch_size(),
            max_queue_size: default_max_queue_size(),
            backoff: BackoffConfig::default(),
        }
    }
}

impl QueueConfig {
    /// `None` when the timer is disabled or the interval is not a
    /// representable duration.
    pub fn flush_interval(&self) -> Option<Duration> {
        if self.flush_interval_secs > 0.0 {
            Duration::try_from_secs_f64(self.flush_interval_secs).ok()
        } else {
            None
        }
    }
}

// ---------------------------------------------------------------------------
// DispatcherConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatcherConfig {
    /// Upper bound on actions executing at the same time.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
}

fn default_max_concurrency() -> usize {
    8
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
        }
    }
}

// ---------------------------------------------------------------------------
// StorageConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_storage_path")]
    pub path: PathBuf,
}

fn default_storage_path() -> PathBuf {
    PathBuf::from("relay.db")
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: default_storage_path(),
        }
    }
}

// ---------------------------------------------------------------------------
// Config (top-level)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub dispatcher: DispatcherConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(RelayError::Config(format!(
                "config file not found: {}",
                path.display()
            )));
        }
        let data = std::fs::read_to_string(path)?;
        let cfg: Config = serde_yaml::from_str(&data)?;
        Ok(cfg)
    }

    /// Load `path` if it exists, defaults otherwise.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let data = serde_yaml::to_string(self)?;
        crate::io::atomic_write(path, data.as_bytes())
    }

    // -----------------------------------------------------------------------
    // Validation
    // -----------------------------------------------------------------------

    pub fn validate(&self) -> Vec<ConfigWarning> {
        let mut warnings = Vec::new();
        let q = &self.queue;

        if q.flush_at == 0 {
            warnings.push(ConfigWarning {
                level: WarnLevel::Error,
                message: "queue.flush_at must be at least 1".to_string(),
            });
        }

        if q.max_batch_size == 0 {
            warnings.push(ConfigWarning {
                level: WarnLevel::Error,
                message: "queue.max_batch_size must be at least 1".to_string(),
            });
        }

        if q.flush_at > q.max_batch_size && q.max_batch_size > 0 {
            warnings.push(ConfigWarning {
                level: WarnLevel::Warning,
                message: format!(
                    "queue.flush_at ({}) exceeds queue.max_batch_size ({}); threshold flushes will span several batches",
                    q.flush_at, q.max_batch_size
                ),
            });
        }

        if let Some(max) = q.max_queue_size {
            if max < q.flush_at {
                warnings.push(ConfigWarning {
                    level: WarnLevel::Warning,
                    message: format!(
                        "queue.max_queue_size ({max}) is below queue.flush_at ({}); the threshold flush can never fire",
                        q.flush_at
                    ),
                });
            }
            if max == 0 {
                warnings.push(ConfigWarning {
                    level: WarnLevel::Error,
                    message: "queue.max_queue_size must be at least 1 (omit it for unbounded)"
                        .to_string(),
                });
            }
        }

        if q.flush_interval_secs < 0.0 || !q.flush_interval_secs.is_finite() {
            warnings.push(ConfigWarning {
                level: WarnLevel::Error,
                message: format!(
                    "queue.flush_interval_secs must be a non-negative number, got {}",
                    q.flush_interval_secs
                ),
            });
        }

        if q.flush_interval_secs.is_finite()
            && q.flush_interval_secs > 0.0
            && q.flush_interval().is_none()
        {
            warnings.push(ConfigWarning {
                level: WarnLevel::Error,
                message: format!(
                    "queue.flush_interval_secs={} is too large to be a timer interval",
                    q.flush_interval_secs
                ),
            });
        }

        if q.backoff.factor < 1.0 {
            warnings.push(ConfigWarning {
                level: WarnLevel::Warning,
                message: format!(
                    "queue.backoff.factor={} (<1.0 shrinks the delay after each failure)",
                    q.backoff.factor
                ),
            });
        }

        if q.backoff.first_ms > q.backoff.max_ms {
            warnings.push(ConfigWarning {
                level: WarnLevel::Warning,
                message: format!(
                    "queue.backoff.first_ms ({}) exceeds queue.backoff.max_ms ({}); every retry waits max_ms",
                    q.backoff.first_ms, q.backoff.max_ms
                ),
            });
        }

        if self.dispatcher.max_concurrency == 0 {
            warnings.push(ConfigWarning {
                level: WarnLevel::Error,
                message: "dispatcher.max_concurrency must be at least 1".to_string(),
            });
        }

        warnings
    }

    pub fn has_errors(&self) -> bool {
        self.validate()
            .iter()
            .any(|w| w.level == WarnLevel::Error)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
