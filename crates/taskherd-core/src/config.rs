//! Configuration resolution for the background task scheduler.
//!
//! Implements hierarchical config resolution:
//! 1. Built-in defaults
//! 2. Global config (~/.config/taskherd/scheduler.json)
//! 3. Project config (.taskherd/scheduler.json)
//! 4. Environment variables (highest priority)

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Default capacity for concurrency keys without an explicit limit.
pub const DEFAULT_CONCURRENCY: usize = 5;
/// Default inactivity threshold before a running task is considered stale (3 minutes).
pub const DEFAULT_STALE_TIMEOUT_MS: u64 = 180_000;
/// Default minimum runtime before the watchdog may cancel a task (30 seconds).
pub const DEFAULT_MIN_RUNTIME_GUARD_MS: u64 = 30_000;
/// Default retention window for task records (30 minutes).
pub const DEFAULT_RETENTION_MS: u64 = 30 * 60 * 1000;
/// Default poll loop period.
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 2_000;
/// Default bound on a single notification send.
pub const DEFAULT_NOTIFICATION_TIMEOUT_MS: u64 = 10_000;
/// Default minimum runtime before an idle report may complete a task.
pub const DEFAULT_MIN_IDLE_TIME_MS: u64 = 5_000;

/// Complete scheduler configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Capacity for keys without a model or provider limit. 0 = unlimited.
    pub default_concurrency: usize,
    /// Capacity per full concurrency key (e.g. `anthropic/claude-sonnet`).
    pub model_concurrency: HashMap<String, usize>,
    /// Capacity per provider prefix (text before the first `/` of a key).
    pub provider_concurrency: HashMap<String, usize>,
    pub stale_timeout_ms: u64,
    pub min_runtime_guard_ms: u64,
    pub retention_ms: u64,
    pub poll_interval_ms: u64,
    pub notification_timeout_ms: u64,
    /// Idle reports arriving earlier than this after start are ignored.
    pub min_idle_time_ms: u64,
    /// Exit the process after signal-triggered cleanup.
    pub exit_on_signal: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            default_concurrency: DEFAULT_CONCURRENCY,
            model_concurrency: HashMap::new(),
            provider_concurrency: HashMap::new(),
            stale_timeout_ms: DEFAULT_STALE_TIMEOUT_MS,
            min_runtime_guard_ms: DEFAULT_MIN_RUNTIME_GUARD_MS,
            retention_ms: DEFAULT_RETENTION_MS,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            notification_timeout_ms: DEFAULT_NOTIFICATION_TIMEOUT_MS,
            min_idle_time_ms: DEFAULT_MIN_IDLE_TIME_MS,
            exit_on_signal: true,
        }
    }
}

impl SchedulerConfig {
    /// Resolve the capacity for a concurrency key.
    ///
    /// Lookup order: exact key, provider prefix, default. A configured limit
    /// of 0 means unlimited and is reported as `None`.
    pub fn capacity_for(&self, key: &str) -> Option<usize> {
        let limit = self
            .model_concurrency
            .get(key)
            .or_else(|| {
                key.split_once('/')
                    .and_then(|(provider, _)| self.provider_concurrency.get(provider))
            })
            .copied()
            .unwrap_or(self.default_concurrency);
        (limit > 0).then_some(limit)
    }

    pub const fn stale_timeout(&self) -> Duration {
        Duration::from_millis(self.stale_timeout_ms)
    }

    pub const fn min_runtime_guard(&self) -> Duration {
        Duration::from_millis(self.min_runtime_guard_ms)
    }

    pub const fn retention(&self) -> Duration {
        Duration::from_millis(self.retention_ms)
    }

    pub const fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub const fn notification_timeout(&self) -> Duration {
        Duration::from_millis(self.notification_timeout_ms)
    }

    pub const fn min_idle_time(&self) -> Duration {
        Duration::from_millis(self.min_idle_time_ms)
    }
}

/// A config file layer. Only the fields present in the file override the
/// layers below it.
#[derive(Debug, Default, Deserialize)]
struct ConfigLayer {
    default_concurrency: Option<usize>,
    model_concurrency: Option<HashMap<String, usize>>,
    provider_concurrency: Option<HashMap<String, usize>>,
    stale_timeout_ms: Option<u64>,
    min_runtime_guard_ms: Option<u64>,
    retention_ms: Option<u64>,
    poll_interval_ms: Option<u64>,
    notification_timeout_ms: Option<u64>,
    min_idle_time_ms: Option<u64>,
    exit_on_signal: Option<bool>,
}

/// Load configuration with hierarchical resolution.
pub fn load_config(project_dir: Option<&Path>) -> Result<SchedulerConfig> {
    let mut config = SchedulerConfig::default();

    if let Some(global_path) = global_config_path()
        && global_path.exists()
    {
        let layer = load_config_file(&global_path)?;
        merge_layer(&mut config, layer);
    }

    if let Some(dir) = project_dir {
        let project_path = dir.join(".taskherd").join("scheduler.json");
        if project_path.exists() {
            let layer = load_config_file(&project_path)?;
            merge_layer(&mut config, layer);
        }
    }

    apply_env_overrides(&mut config, |name| std::env::var(name).ok());

    Ok(config)
}

/// Get the global config file path.
pub fn global_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("taskherd").join("scheduler.json"))
}

fn load_config_file(path: &Path) -> Result<ConfigLayer> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;
    serde_json::from_str(&content).map_err(|e| {
        Error::Config(format!("Failed to parse config file {}: {}", path.display(), e))
    })
}

fn merge_layer(base: &mut SchedulerConfig, layer: ConfigLayer) {
    if let Some(v) = layer.default_concurrency {
        base.default_concurrency = v;
    }
    if let Some(v) = layer.model_concurrency {
        base.model_concurrency.extend(v);
    }
    if let Some(v) = layer.provider_concurrency {
        base.provider_concurrency.extend(v);
    }
    if let Some(v) = layer.stale_timeout_ms {
        base.stale_timeout_ms = v;
    }
    if let Some(v) = layer.min_runtime_guard_ms {
        base.min_runtime_guard_ms = v;
    }
    if let Some(v) = layer.retention_ms {
        base.retention_ms = v;
    }
    if let Some(v) = layer.poll_interval_ms {
        base.poll_interval_ms = v;
    }
    if let Some(v) = layer.notification_timeout_ms {
        base.notification_timeout_ms = v;
    }
    if let Some(v) = layer.min_idle_time_ms {
        base.min_idle_time_ms = v;
    }
    if let Some(v) = layer.exit_on_signal {
        base.exit_on_signal = v;
    }
}

fn apply_env_overrides(config: &mut SchedulerConfig, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(n) = lookup("TASKHERD_DEFAULT_CONCURRENCY").and_then(|v| v.parse().ok()) {
        config.default_concurrency = n;
    }
    if let Some(n) = lookup("TASKHERD_STALE_TIMEOUT_MS").and_then(|v| v.parse().ok()) {
        config.stale_timeout_ms = n;
    }
    if let Some(n) = lookup("TASKHERD_MIN_RUNTIME_GUARD_MS").and_then(|v| v.parse().ok()) {
        config.min_runtime_guard_ms = n;
    }
    if let Some(n) = lookup("TASKHERD_RETENTION_MS").and_then(|v| v.parse().ok()) {
        config.retention_ms = n;
    }
    if let Some(n) = lookup("TASKHERD_POLL_INTERVAL_MS").and_then(|v| v.parse().ok()) {
        config.poll_interval_ms = n;
    }
}
