//! Configuration resolution for Foreman.
//!
//! Implements hierarchical config resolution:
//! 1. Built-in defaults
//! 2. Global config (~/.config/foreman/settings.json)
//! 3. Project config (.foreman/settings.json)
//! 4. Explicit config file (`--config`)
//! 5. Environment variables
//!
//! Files may be JSON or TOML (picked by extension). Layers are merged as
//! documents before deserialization: objects merge key by key, and arrays of
//! objects carrying an `id` merge entry by entry, so a project file can
//! override a single profile or workflow without restating the rest.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::profile::WorkerProfile;

/// Complete Foreman configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub daemon: DaemonConfig,
    pub profiles: Vec<WorkerProfile>,
    pub spawn_policy: SpawnPolicyConfig,
    pub warm_pool: WarmPoolConfig,
    pub health: HealthConfig,
    pub sessions: SessionConfig,
    pub jobs: JobsConfig,
    pub workflows: WorkflowsConfig,
}

/// Process launch settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Worker executable.
    pub worker_bin: PathBuf,
    /// Worker arguments; `{port}`, `{model}` and `{profile}` are substituted.
    pub worker_args: Vec<String>,
    pub host: String,
    /// First port handed out to workers; 0 lets the OS choose.
    pub port_range_start: u16,
    pub port_range_len: u16,
    pub startup_timeout_ms: u64,
    pub shutdown_timeout_ms: u64,
    pub request_timeout_ms: u64,
    /// Upper bound on live worker processes (warm pool included).
    pub max_workers: usize,
    /// Directory for the orphan-reconciliation registry.
    pub state_dir: Option<PathBuf>,
    pub log_level: String,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            worker_bin: PathBuf::from("opencode"),
            worker_args: vec![
                "serve".to_string(),
                "--hostname".to_string(),
                "127.0.0.1".to_string(),
                "--port".to_string(),
                "{port}".to_string(),
            ],
            host: "127.0.0.1".to_string(),
            port_range_start: 14_100,
            port_range_len: 100,
            startup_timeout_ms: 30_000,
            shutdown_timeout_ms: 5_000,
            request_timeout_ms: 600_000,
            max_workers: 16,
            state_dir: None,
            log_level: "info".to_string(),
        }
    }
}

impl DaemonConfig {
    pub const fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms)
    }

    pub const fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    pub const fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// State directory, falling back to `~/.foreman`.
    pub fn resolved_state_dir(&self) -> Option<PathBuf> {
        self.state_dir
            .clone()
            .or_else(|| dirs::home_dir().map(|h| h.join(".foreman")))
    }
}

/// Per-profile spawn permissions. Unset fields fall through to the default
/// entry and then to built-in pathway defaults.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpawnPolicyEntry {
    pub auto_spawn: Option<bool>,
    pub on_demand: Option<bool>,
    pub allow_manual: Option<bool>,
    pub warm_pool: Option<bool>,
    pub reuse_existing: Option<bool>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SpawnPolicyConfig {
    pub default: SpawnPolicyEntry,
    pub profiles: HashMap<String, SpawnPolicyEntry>,
}

/// Warm pool sizing for one profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WarmPoolEntry {
    /// Idle instances to keep while the profile is in demand.
    pub size: usize,
    /// Floor the pool shrinks to after idle eviction.
    pub min_idle: usize,
    pub idle_timeout_ms: u64,
}

impl Default for WarmPoolEntry {
    fn default() -> Self {
        Self {
            size: 1,
            min_idle: 0,
            idle_timeout_ms: 10 * 60 * 1000,
        }
    }
}

impl WarmPoolEntry {
    pub const fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WarmPoolConfig {
    pub maintenance_interval_ms: u64,
    pub profiles: HashMap<String, WarmPoolEntry>,
}

impl Default for WarmPoolConfig {
    fn default() -> Self {
        Self {
            maintenance_interval_ms: 15_000,
            profiles: HashMap::new(),
        }
    }
}

impl WarmPoolConfig {
    /// Never zero; a zero period would stop the maintenance loop.
    pub const fn maintenance_interval(&self) -> Duration {
        Duration::from_millis(nonzero_ms(self.maintenance_interval_ms))
    }
}

/// Health probing of live workers.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    pub enabled: bool,
    pub interval_ms: u64,
    pub timeout_ms: u64,
    /// Retries after the first failed probe before the worker is marked `error`.
    pub max_retries: u32,
    /// Relaunch a worker once its retries are exhausted.
    pub restart_on_error: bool,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: 30_000,
            timeout_ms: 3_000,
            max_retries: 3,
            restart_on_error: false,
        }
    }
}

impl HealthConfig {
    /// Never zero; a zero period would stop the health loop.
    pub const fn interval(&self) -> Duration {
        Duration::from_millis(nonzero_ms(self.interval_ms))
    }

    pub const fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// How a worker's session relates to the caller's session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionMode {
    /// Nested under a caller-provided parent session.
    Child,
    /// Standalone.
    #[default]
    Isolated,
    /// Attached to a pre-existing session id.
    Linked,
}

impl SessionMode {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Child => "child",
            Self::Isolated => "isolated",
            Self::Linked => "linked",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub mode: SessionMode,
    pub parent_session_id: Option<String>,
    pub linked_session_id: Option<String>,
    /// Ring buffer capacity for recent activity per session.
    pub activity_limit: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            mode: SessionMode::Isolated,
            parent_session_id: None,
            linked_session_id: None,
            activity_limit: 50,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct JobsConfig {
    /// Terminal jobs beyond this count are pruned oldest-first.
    pub max_retained: usize,
    pub default_await_timeout_ms: u64,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            max_retained: 500,
            default_await_timeout_ms: 60_000,
        }
    }
}

/// Size and time bounds for workflow runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkflowLimits {
    pub max_steps: usize,
    pub max_task_chars: usize,
    pub max_carry_chars: usize,
    pub per_step_timeout_ms: u64,
}

impl Default for WorkflowLimits {
    fn default() -> Self {
        Self {
            max_steps: 8,
            max_task_chars: 12_000,
            max_carry_chars: 24_000,
            per_step_timeout_ms: 120_000,
        }
    }
}

impl WorkflowLimits {
    pub const fn per_step_timeout(&self) -> Duration {
        Duration::from_millis(self.per_step_timeout_ms)
    }
}

/// One step of a workflow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowStep {
    pub id: String,
    #[serde(default)]
    pub title: String,
    /// Profile that runs this step.
    pub worker_id: String,
    /// Prompt with `{task}` and `{carry}` placeholders.
    pub prompt_template: String,
    /// Append this step's response to the carry buffer.
    #[serde(default)]
    pub carry: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub steps: Vec<WorkflowStep>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkflowsConfig {
    pub limits: WorkflowLimits,
    pub definitions: Vec<WorkflowDefinition>,
}

const fn nonzero_ms(ms: u64) -> u64 {
    if ms == 0 { 1 } else { ms }
}

impl Config {
    /// Reject settings the daemon cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.health.enabled && self.health.interval_ms == 0 {
            return Err(Error::Config(
                "health.interval_ms must be greater than zero".to_string(),
            ));
        }
        if self.warm_pool.maintenance_interval_ms == 0 {
            return Err(Error::Config(
                "warm_pool.maintenance_interval_ms must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Load configuration with hierarchical resolution.
pub fn load_config(project_dir: Option<&Path>, explicit: Option<&Path>) -> Result<Config> {
    let mut doc = serde_json::to_value(Config::default())?;

    if let Some(global_path) = global_config_path()
        && global_path.exists()
    {
        merge_value(&mut doc, read_config_value(&global_path)?);
    }

    if let Some(dir) = project_dir {
        let project_path = dir.join(".foreman").join("settings.json");
        if project_path.exists() {
            merge_value(&mut doc, read_config_value(&project_path)?);
        }
    }

    if let Some(path) = explicit {
        if !path.exists() {
            return Err(Error::Config(format!(
                "Config file {} does not exist",
                path.display()
            )));
        }
        merge_value(&mut doc, read_config_value(path)?);
    }

    let mut config: Config = serde_json::from_value(doc)
        .map_err(|e| Error::Config(format!("Invalid configuration: {e}")))?;

    apply_env_overrides(&mut config);
    config.validate()?;
    Ok(config)
}

/// Get the global config file path.
pub fn global_config_path() -> Option<PathBuf> {
    #[cfg(target_os = "linux")]
    {
        std::env::var("XDG_CONFIG_HOME")
            .ok()
            .map(PathBuf::from)
            .or_else(|| dirs::home_dir().map(|h| h.join(".config")))
            .map(|p| p.join("foreman").join("settings.json"))
    }
    #[cfg(not(target_os = "linux"))]
    {
        dirs::config_dir().map(|p| p.join("foreman").join("settings.json"))
    }
}

/// Parse one config file into a JSON document.
pub fn read_config_value(path: &Path) -> Result<Value> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;
    let is_toml = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
    if is_toml {
        toml::from_str(&content).map_err(|e| {
            Error::Config(format!("Failed to parse config file {}: {}", path.display(), e))
        })
    } else {
        serde_json::from_str(&content).map_err(|e| {
            Error::Config(format!("Failed to parse config file {}: {}", path.display(), e))
        })
    }
}

/// Merge `overlay` into `base`.
pub fn merge_value(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                match base_map.get_mut(&key) {
                    Some(existing) => merge_value(existing, value),
                    None => {
                        base_map.insert(key, value);
                    }
                }
            }
        }
        (Value::Array(base_items), Value::Array(overlay_items))
            if is_keyed(base_items) && is_keyed(&overlay_items) =>
        {
            for item in overlay_items {
                let id = item.get("id").cloned();
                match base_items.iter_mut().find(|b| b.get("id") == id.as_ref()) {
                    Some(existing) => *existing = item,
                    None => base_items.push(item),
                }
            }
        }
        (slot, value) => *slot = value,
    }
}

fn is_keyed(items: &[Value]) -> bool {
    items
        .iter()
        .all(|v| v.get("id").is_some_and(Value::is_string))
}

fn apply_env_overrides(config: &mut Config) {
    if let Ok(val) = std::env::var("FOREMAN_WORKER_BIN") {
        config.daemon.worker_bin = PathBuf::from(val);
    }
    if let Ok(val) = std::env::var("FOREMAN_LOG_LEVEL") {
        config.daemon.log_level = val;
    }
    if let Ok(val) = std::env::var("FOREMAN_HEALTH_INTERVAL_MS")
        && let Ok(n) = val.parse()
    {
        config.health.interval_ms = n;
    }
    if let Ok(val) = std::env::var("FOREMAN_STARTUP_TIMEOUT_MS")
        && let Ok(n) = val.parse()
    {
        config.daemon.startup_timeout_ms = n;
    }
    if let Ok(val) = std::env::var("FOREMAN_MAX_WORKERS")
        && let Ok(n) = val.parse()
    {
        config.daemon.max_workers = n;
    }
}
