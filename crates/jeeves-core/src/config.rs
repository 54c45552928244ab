use std::path::{Path, PathBuf};

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

/// Top-level config (jeeves.toml + JEEVES_* env overrides).
///
/// A handful of knobs are additionally honoured as bare environment
/// variables because operators set them in service units without a config
/// file: `WORKSPACE_DIR`, `HEARTBEAT_INTERVAL_MINUTES`,
/// `HEARTBEAT_ACTIVE_START`, `HEARTBEAT_ACTIVE_END`, `LOG_LEVEL`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JeevesConfig {
    /// Workspace root: convention files, `memory/`, `sessions/`, HEARTBEAT.md.
    #[serde(default = "default_workspace_dir")]
    pub workspace_dir: PathBuf,

    #[serde(default)]
    pub agent: AgentConfig,

    #[serde(default)]
    pub providers: ProvidersConfig,

    #[serde(default)]
    pub heartbeat: HeartbeatConfig,

    /// Default tracing level when RUST_LOG is unset: debug|info|warn|error.
    pub log_level: Option<String>,
}

impl Default for JeevesConfig {
    fn default() -> Self {
        Self {
            workspace_dir: default_workspace_dir(),
            agent: AgentConfig::default(),
            providers: ProvidersConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            log_level: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            model: default_model(),
            max_tokens: default_max_tokens(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ProvidersConfig {
    pub anthropic: Option<AnthropicConfig>,
    /// Embeddings backend for the memory index. Absent → lexical-only search.
    pub embeddings: Option<EmbeddingsConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnthropicConfig {
    /// API key (`sk-ant-…`) or OAuth access token (`sk-ant-oat01-…`).
    pub api_key: String,
    #[serde(default = "default_anthropic_base_url")]
    pub base_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingsConfig {
    pub api_key: String,
    #[serde(default = "default_embeddings_base_url")]
    pub base_url: String,
    #[serde(default = "default_embeddings_model")]
    pub model: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    #[serde(default = "default_heartbeat_interval")]
    pub interval_minutes: u64,
    /// Active-hours window start, "HH:MM" in process-local time.
    #[serde(default = "default_active_start")]
    pub active_start: String,
    /// Active-hours window end, "HH:MM". start > end wraps midnight.
    #[serde(default = "default_active_end")]
    pub active_end: String,
    /// Outbound channel recipient for heartbeat alerts, if any.
    pub channel_id: Option<String>,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_minutes: default_heartbeat_interval(),
            active_start: default_active_start(),
            active_end: default_active_end(),
            channel_id: None,
        }
    }
}

fn default_workspace_dir() -> PathBuf {
    std::env::current_dir()
        .unwrap_or_else(|_| PathBuf::from("."))
        .join("workspace")
}
fn default_model() -> String {
    "claude-sonnet-4-5".to_string()
}
fn default_max_tokens() -> u32 {
    8192
}
fn default_anthropic_base_url() -> String {
    "https://api.anthropic.com".to_string()
}
fn default_embeddings_base_url() -> String {
    "https://api.openai.com".to_string()
}
fn default_embeddings_model() -> String {
    "text-embedding-3-small".to_string()
}
fn default_heartbeat_interval() -> u64 {
    30
}
fn default_active_start() -> String {
    "08:00".to_string()
}
fn default_active_end() -> String {
    "23:00".to_string()
}

impl JeevesConfig {
    /// Load config from a TOML file with JEEVES_* env var overrides, then the
    /// bare env knobs on top.
    ///
    /// Checks in order: explicit path argument, then `~/.jeeves/jeeves.toml`.
    /// A missing file is fine — defaults plus env cover the minimal setup.
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        let mut config: JeevesConfig = Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("JEEVES_").split("_"))
            .extract()
            .map_err(|e| crate::error::JeevesError::Config(e.to_string()))?;

        config.apply_env_knobs();
        Ok(config)
    }

    fn apply_env_knobs(&mut self) {
        if let Ok(dir) = std::env::var("WORKSPACE_DIR") {
            if !dir.is_empty() {
                self.workspace_dir = PathBuf::from(dir);
            }
        }
        if let Ok(v) = std::env::var("HEARTBEAT_INTERVAL_MINUTES") {
            if let Ok(mins) = v.parse::<u64>() {
                self.heartbeat.interval_minutes = mins;
            }
        }
        if let Ok(v) = std::env::var("HEARTBEAT_ACTIVE_START") {
            if !v.is_empty() {
                self.heartbeat.active_start = v;
            }
        }
        if let Ok(v) = std::env::var("HEARTBEAT_ACTIVE_END") {
            if !v.is_empty() {
                self.heartbeat.active_end = v;
            }
        }
        if let Ok(v) = std::env::var("LOG_LEVEL") {
            if !v.is_empty() {
                self.log_level = Some(v);
            }
        }
    }

    /// `sessions/` directory under the workspace (created on demand).
    pub fn sessions_dir(&self) -> PathBuf {
        self.workspace_dir.join("sessions")
    }

    /// `memory/` directory of dated memory notes under the workspace.
    pub fn memory_dir(&self) -> PathBuf {
        self.workspace_dir.join("memory")
    }

    /// Memory index database file. Rebuildable from the workspace at any
    /// time, so it lives beside the data it indexes.
    pub fn index_db_path(&self) -> PathBuf {
        self.workspace_dir.join("index.db")
    }

    /// Cron job store file.
    pub fn cron_store_path(&self) -> PathBuf {
        self.workspace_dir.join("cron.json")
    }

    pub fn workspace(&self) -> &Path {
        &self.workspace_dir
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.jeeves/jeeves.toml", home)
}
