//! Configuration management
//!
//! 設定は以下の優先順位で読み込まれます:
//! 1. 環境変数 (`KINGDOM_*`)
//! 2. kingdom.toml 設定ファイル
//! 3. デフォルト値
//!
//! 設定ファイル内では `${VAR_NAME}` 形式で環境変数を展開できます。

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::Error;

/// How submitted tasks reach a worker
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum DispatchMode {
    /// One shared FIFO; a worker that takes a task pinned to another agent requeues it
    #[default]
    Shared,
    /// Routing happens at submission and the task lands in the worker's private inbox
    Direct,
}

impl DispatchMode {
    fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "shared" => Some(Self::Shared),
            "direct" => Some(Self::Direct),
            _ => None,
        }
    }
}

/// Database connection pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Path to the SQLite database file (":memory:" for a private in-memory database per handle)
    #[serde(default = "default_db_path")]
    pub path: String,

    /// Number of pre-established connections
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,

    /// Keep going with fewer connections when some cannot be opened
    #[serde(default)]
    pub allow_partial_pool: bool,

    /// How long a handler may wait for a free connection
    #[serde(default = "default_acquire_timeout_ms")]
    pub acquire_timeout_ms: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            pool_size: default_pool_size(),
            allow_partial_pool: false,
            acquire_timeout_ms: default_acquire_timeout_ms(),
        }
    }
}

impl DatabaseConfig {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }
}

/// Polling and lifecycle timing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimingConfig {
    /// Upper bound on a single wait for the next task
    #[serde(default = "default_task_poll_interval_ms")]
    pub task_poll_interval_ms: u64,

    /// Upper bound on a single wait for the next mailbox envelope
    #[serde(default = "default_mailbox_poll_interval_ms")]
    pub mailbox_poll_interval_ms: u64,

    /// Pause after requeueing a task that belongs to another agent
    #[serde(default = "default_requeue_backoff_ms")]
    pub requeue_backoff_ms: u64,

    /// How often the monitor refreshes agent registrations
    #[serde(default = "default_monitor_interval_ms")]
    pub monitor_interval_ms: u64,

    /// How often the monitor logs an aggregate summary
    #[serde(default = "default_status_log_interval_secs")]
    pub status_log_interval_secs: u64,

    /// How long `stop()` waits for each worker loop before aborting it
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,

    /// Default deadline for callers waiting on a task
    #[serde(default = "default_task_timeout_secs")]
    pub task_timeout_secs: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            task_poll_interval_ms: default_task_poll_interval_ms(),
            mailbox_poll_interval_ms: default_mailbox_poll_interval_ms(),
            requeue_backoff_ms: default_requeue_backoff_ms(),
            monitor_interval_ms: default_monitor_interval_ms(),
            status_log_interval_secs: default_status_log_interval_secs(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
            task_timeout_secs: default_task_timeout_secs(),
        }
    }
}

impl TimingConfig {
    pub fn task_poll_interval(&self) -> Duration {
        Duration::from_millis(self.task_poll_interval_ms)
    }

    pub fn mailbox_poll_interval(&self) -> Duration {
        Duration::from_millis(self.mailbox_poll_interval_ms)
    }

    pub fn requeue_backoff(&self) -> Duration {
        Duration::from_millis(self.requeue_backoff_ms)
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_millis(self.monitor_interval_ms)
    }

    pub fn status_log_interval(&self) -> Duration {
        Duration::from_secs(self.status_log_interval_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    pub fn task_timeout(&self) -> Duration {
        Duration::from_secs(self.task_timeout_secs)
    }
}

/// Main configuration for the agent service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Name reported in status snapshots
    #[serde(default = "default_service_name")]
    pub service_name: String,

    /// Agent types to instantiate at startup
    #[serde(default = "default_agent_types")]
    pub agent_types: Vec<String>,

    /// Number of workers per agent type
    #[serde(default = "default_agents_per_type")]
    pub agents_per_type: usize,

    /// Shared queue or direct inboxes
    #[serde(default)]
    pub dispatch_mode: DispatchMode,

    /// Agent type used for unrecognised task types
    #[serde(default = "default_fallback_agent_type")]
    pub fallback_agent_type: String,

    /// Task type → agent type overrides on top of the built-in routing table
    #[serde(default)]
    pub routes: HashMap<String, String>,

    /// Database pool configuration
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Timing configuration
    #[serde(default)]
    pub timing: TimingConfig,

    /// Default log level when RUST_LOG is not set
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            service_name: default_service_name(),
            agent_types: default_agent_types(),
            agents_per_type: default_agents_per_type(),
            dispatch_mode: DispatchMode::default(),
            fallback_agent_type: default_fallback_agent_type(),
            routes: HashMap::new(),
            database: DatabaseConfig::default(),
            timing: TimingConfig::default(),
            log_level: default_log_level(),
        }
    }
}

fn default_service_name() -> String {
    "Kingdom Agent Service".to_string()
}

fn default_agent_types() -> Vec<String> {
    vec!["echo".to_string(), "tester2".to_string()]
}

fn default_agents_per_type() -> usize {
    2
}

fn default_fallback_agent_type() -> String {
    "tester1".to_string()
}

fn default_db_path() -> String {
    "data/kingdom.db".to_string()
}

fn default_pool_size() -> usize {
    10
}

fn default_acquire_timeout_ms() -> u64 {
    5_000
}

fn default_task_poll_interval_ms() -> u64 {
    1_000
}

fn default_mailbox_poll_interval_ms() -> u64 {
    100
}

fn default_requeue_backoff_ms() -> u64 {
    50
}

fn default_monitor_interval_ms() -> u64 {
    1_000
}

fn default_status_log_interval_secs() -> u64 {
    60
}

fn default_shutdown_grace_ms() -> u64 {
    5_000
}

fn default_task_timeout_secs() -> u64 {
    300
}

fn default_log_level() -> String {
    "info".to_string()
}

impl ServiceConfig {
    /// 設定ファイルから環境変数を展開する
    ///
    /// `${VAR_NAME}` 形式の文字列を環境変数の値に置換します。
    /// 環境変数が存在しない場合は空文字列になります。
    fn expand_env_vars(value: &str) -> String {
        let mut result = String::new();
        let mut chars = value.chars().peekable();

        while let Some(c) = chars.next() {
            if c == '$' && chars.peek() == Some(&'{') {
                chars.next(); // '{' を消費

                let mut var_name = String::new();
                for c in chars.by_ref() {
                    if c == '}' {
                        break;
                    }
                    var_name.push(c);
                }

                if let Ok(env_value) = std::env::var(&var_name) {
                    result.push_str(&env_value);
                }
            } else {
                result.push(c);
            }
        }

        result
    }

    fn parse_toml(content: &str) -> crate::Result<Self> {
        let expanded = Self::expand_env_vars(content);
        toml::from_str(&expanded).map_err(|e| Error::Config(format!("Failed to parse TOML: {}", e)))
    }

    /// Parse a TOML document (after `${VAR}` expansion)
    pub fn from_toml_str(content: &str) -> crate::Result<Self> {
        let config = Self::parse_toml(content)?;
        config.validate()?;
        Ok(config)
    }

    /// TOML 設定ファイルから設定を読み込む
    ///
    /// 環境変数 (`KINGDOM_*`) が設定されている場合はファイルの値より優先されます。
    pub fn from_toml_file<P: AsRef<Path>>(path: P) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| Error::Config(format!("Failed to read config file: {}", e)))?;

        // 検証は環境変数の上書き後に一度だけ行う
        let mut config = Self::parse_toml(&content)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// デフォルトパスから設定を読み込む
    ///
    /// 1. `KINGDOM_CONFIG` で指定されたファイル
    /// 2. `./kingdom.toml`
    /// 3. 見つからない場合はデフォルト値 + 環境変数
    pub fn load() -> crate::Result<Self> {
        if let Ok(path) = std::env::var("KINGDOM_CONFIG") {
            return Self::from_toml_file(path);
        }

        if Path::new("kingdom.toml").exists() {
            return Self::from_toml_file("kingdom.toml");
        }

        Self::from_env()
    }

    /// Defaults overlaid with environment variables
    pub fn from_env() -> crate::Result<Self> {
        let mut config = Self::default();
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// 環境変数で設定を上書きする
    fn apply_env_overrides(&mut self) {
        if let Ok(name) = std::env::var("KINGDOM_SERVICE_NAME") {
            if !name.is_empty() {
                self.service_name = name;
            }
        }

        if let Ok(types) = std::env::var("KINGDOM_AGENT_TYPES") {
            self.agent_types = types
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }

        if let Ok(count) = std::env::var("KINGDOM_AGENTS_PER_TYPE") {
            if let Ok(n) = count.parse() {
                self.agents_per_type = n;
            }
        }

        if let Ok(mode) = std::env::var("KINGDOM_DISPATCH_MODE") {
            if let Some(mode) = DispatchMode::parse(&mode) {
                self.dispatch_mode = mode;
            }
        }

        if let Ok(fallback) = std::env::var("KINGDOM_FALLBACK_AGENT_TYPE") {
            if !fallback.is_empty() {
                self.fallback_agent_type = fallback;
            }
        }

        // Database 設定の上書き
        if let Ok(path) = std::env::var("KINGDOM_DB_PATH") {
            self.database.path = path;
        }
        if let Ok(size) = std::env::var("KINGDOM_DB_POOL_SIZE") {
            if let Ok(n) = size.parse() {
                self.database.pool_size = n;
            }
        }
        if let Ok(partial) = std::env::var("KINGDOM_DB_ALLOW_PARTIAL_POOL") {
            self.database.allow_partial_pool = partial.to_lowercase() == "true";
        }

        if let Ok(timeout) = std::env::var("KINGDOM_TASK_TIMEOUT_SECS") {
            if let Ok(secs) = timeout.parse() {
                self.timing.task_timeout_secs = secs;
            }
        }

        if let Ok(level) = std::env::var("KINGDOM_LOG_LEVEL") {
            if !level.is_empty() {
                self.log_level = level;
            }
        }
    }

    /// Reject settings the supervisor cannot run with
    pub fn validate(&self) -> crate::Result<()> {
        if self.database.pool_size == 0 {
            return Err(Error::Config("database.pool_size must be at least 1".to_string()));
        }
        if self.timing.task_poll_interval_ms == 0 || self.timing.mailbox_poll_interval_ms == 0 {
            return Err(Error::Config("poll intervals must be non-zero".to_string()));
        }
        if self.timing.monitor_interval_ms == 0 || self.timing.status_log_interval_secs == 0 {
            return Err(Error::Config("monitor intervals must be non-zero".to_string()));
        }
        if self.fallback_agent_type.trim().is_empty() {
            return Err(Error::Config("fallback_agent_type must not be empty".to_string()));
        }
        Ok(())
    }
}
