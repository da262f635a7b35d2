mod server;

pub use server::ServerConfig;
use server::RawServer;

use serde::Deserialize;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

const DEFAULT_CONFIG_PATH: &str = "config/orrery.toml";
const DEFAULT_ENDPOINT: &str = "http://127.0.0.1:11434";
const DEFAULT_MODEL: &str = "llama3";
const DEFAULT_DB_PATH: &str = "data/memory.db";
const API_KEY_ENV: &str = "ORRERY_API_KEY";

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are an autonomous research assistant. \
Use the available tools when they genuinely help answer the request; prefer specific, \
verifiable answers grounded in tool output over speculation. If a tool call fails, \
adjust the arguments or choose another tool instead of giving up. When you finish \
using tools, provide a complete final response.";

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub model: ModelConfig,
    pub system_prompt: Option<String>,
    pub servers: Vec<ServerConfig>,
    pub engine: EngineConfig,
    pub memory: MemoryConfig,
    pub sampling: SamplingConfig,
}

#[derive(Debug, Clone)]
pub struct ModelConfig {
    pub endpoint: String,
    pub model: String,
    pub api_key: Option<String>,
    pub request_timeout: Duration,
}

#[derive(Debug, Clone, Copy)]
pub struct EngineConfig {
    pub max_steps: usize,
    pub invoke_timeout: Duration,
    pub handshake_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct MemoryConfig {
    pub enabled: bool,
    pub db_path: PathBuf,
    pub default_incognito: bool,
    pub summary_enabled: bool,
    pub summary_interval: Duration,
    pub summary_max_tokens: u32,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SamplingConfig {
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub max_tokens: Option<u32>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config from {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse config from {path:?}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

#[derive(Debug, Deserialize, Default)]
struct RawConfig {
    #[serde(default)]
    model: RawModel,
    system_prompt: Option<String>,
    #[serde(default)]
    servers: Vec<RawServer>,
    #[serde(default)]
    engine: RawEngine,
    #[serde(default)]
    memory: RawMemory,
    #[serde(default)]
    sampling: RawSampling,
}

#[derive(Debug, Deserialize, Default)]
struct RawModel {
    endpoint: Option<String>,
    model: Option<String>,
    api_key: Option<String>,
    request_timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct RawEngine {
    max_steps: Option<usize>,
    invoke_timeout_secs: Option<u64>,
    handshake_timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct RawMemory {
    enabled: Option<bool>,
    db_path: Option<String>,
    default_incognito: Option<bool>,
    summary_enabled: Option<bool>,
    summary_interval_secs: Option<u64>,
    summary_max_tokens: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct RawSampling {
    temperature: Option<f32>,
    top_p: Option<f32>,
    max_tokens: Option<u32>,
}

impl AppConfig {
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(path) = path {
            return read_config(path);
        }
        let default_path = Path::new(DEFAULT_CONFIG_PATH);
        match read_config(default_path) {
            Ok(config) => Ok(config),
            Err(ConfigError::Io { source, .. }) if source.kind() == io::ErrorKind::NotFound => {
                info!("Configuration file not found; using defaults");
                Ok(Self::from_raw(RawConfig::default()))
            }
            Err(other) => Err(other),
        }
    }

    fn from_raw(raw: RawConfig) -> Self {
        let api_key = raw
            .model
            .api_key
            .or_else(|| std::env::var(API_KEY_ENV).ok())
            .filter(|key| !key.is_empty());

        Self {
            model: ModelConfig {
                endpoint: raw
                    .model
                    .endpoint
                    .unwrap_or_else(|| DEFAULT_ENDPOINT.to_string()),
                model: raw.model.model.unwrap_or_else(|| DEFAULT_MODEL.to_string()),
                api_key,
                request_timeout: Duration::from_secs(
                    raw.model.request_timeout_secs.unwrap_or(120),
                ),
            },
            system_prompt: raw.system_prompt,
            servers: raw.servers.into_iter().map(ServerConfig::from).collect(),
            engine: EngineConfig {
                max_steps: raw.engine.max_steps.unwrap_or(8),
                invoke_timeout: Duration::from_secs(raw.engine.invoke_timeout_secs.unwrap_or(60)),
                handshake_timeout: Duration::from_secs(
                    raw.engine.handshake_timeout_secs.unwrap_or(20),
                ),
            },
            memory: MemoryConfig {
                enabled: raw.memory.enabled.unwrap_or(true),
                db_path: PathBuf::from(
                    raw.memory
                        .db_path
                        .unwrap_or_else(|| DEFAULT_DB_PATH.to_string()),
                ),
                default_incognito: raw.memory.default_incognito.unwrap_or(false),
                summary_enabled: raw.memory.summary_enabled.unwrap_or(true),
                summary_interval: Duration::from_secs(
                    raw.memory.summary_interval_secs.unwrap_or(600),
                ),
                summary_max_tokens: raw.memory.summary_max_tokens.unwrap_or(512),
            },
            sampling: SamplingConfig {
                temperature: raw.sampling.temperature,
                top_p: raw.sampling.top_p,
                max_tokens: raw.sampling.max_tokens,
            },
        }
    }
}

fn read_config(path: &Path) -> Result<AppConfig, ConfigError> {
    debug!(path = %path.display(), "Reading client configuration file");
    let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let parsed: RawConfig = toml::from_str(&content).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(AppConfig::from_raw(parsed))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_when_file_is_empty() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("orrery.toml");
        fs::write(&path, "").expect("write");

        let config = AppConfig::load(Some(&path)).expect("load");
        assert_eq!(config.model.model, DEFAULT_MODEL);
        assert_eq!(config.model.endpoint, DEFAULT_ENDPOINT);
        assert_eq!(config.engine.max_steps, 8);
        assert!(config.memory.enabled);
        assert!(!config.memory.default_incognito);
        assert!(config.memory.summary_enabled);
        assert_eq!(config.memory.summary_interval, Duration::from_secs(600));
        assert!(config.servers.is_empty());
    }

    #[test]
    fn reads_model_and_engine_sections() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("orrery.toml");
        let mut file = fs::File::create(&path).expect("create config");
        writeln!(
            file,
            r#"
system_prompt = "keep short"

[model]
endpoint = "http://10.0.0.5:11434"
model = "mistral"

[engine]
max_steps = 3
invoke_timeout_secs = 5
"#
        )
        .expect("write");

        let config = AppConfig::load(Some(&path)).expect("load config");
        assert_eq!(config.model.model, "mistral");
        assert_eq!(config.model.endpoint, "http://10.0.0.5:11434");
        assert_eq!(config.system_prompt.as_deref(), Some("keep short"));
        assert_eq!(config.engine.max_steps, 3);
        assert_eq!(config.engine.invoke_timeout, Duration::from_secs(5));
    }

    #[test]
    fn reads_server_entries_in_order() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("orrery.toml");
        fs::write(
            &path,
            r#"
[[servers]]
name = "arxiv"
command = "/usr/bin/mcp-arxiv"
args = ["--stdio"]

[[servers]]
name = "calc"
command = "/usr/bin/mcp-calc"
env = { CALC_MODE = "strict" }
"#,
        )
        .expect("write servers config");

        let config = AppConfig::load(Some(&path)).expect("load");
        assert_eq!(config.servers.len(), 2);
        assert_eq!(config.servers[0].name, "arxiv");
        assert_eq!(config.servers[1].name, "calc");
        assert_eq!(
            config.servers[1].env.get("CALC_MODE").map(String::as_str),
            Some("strict")
        );
    }

    #[test]
    fn reads_memory_section() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("orrery.toml");
        fs::write(
            &path,
            r#"
[memory]
enabled = true
db_path = "state/chat.db"
default_incognito = true
summary_enabled = false
"#,
        )
        .expect("write");

        let config = AppConfig::load(Some(&path)).expect("load");
        assert_eq!(config.memory.db_path, PathBuf::from("state/chat.db"));
        assert!(config.memory.default_incognito);
        assert!(!config.memory.summary_enabled);
    }
}
