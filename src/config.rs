//! Configuration types.
//!
//! Everything is read from environment variables (after `.env` is loaded in
//! `main`). Unset variables fall back to defaults; set but unparsable values
//! are errors.

use std::fmt::Display;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;
use crate::store::DEFAULT_TTL;
use crate::worker::ConsumerConfig;
use crate::worker::consumer::DEFAULT_GROUP;

const DEFAULT_REDIS_URL: &str = "redis://localhost:6379";
const DEFAULT_LIBSQL_PATH: &str = "./data/tasks.db";
const DEFAULT_MODEL: &str = "Qwen/Qwen2.5-VL-3B-Instruct";

/// Where task records live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Redis,
    LibSql,
    Memory,
}

impl FromStr for StoreBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "redis" => Ok(Self::Redis),
            "libsql" | "sqlite" => Ok(Self::LibSql),
            "memory" => Ok(Self::Memory),
            other => Err(format!("unknown store backend '{other}'")),
        }
    }
}

/// How delivery messages travel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportBackend {
    Redis,
    Memory,
}

impl FromStr for TransportBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "redis" => Ok(Self::Redis),
            "memory" => Ok(Self::Memory),
            other => Err(format!("unknown transport backend '{other}'")),
        }
    }
}

/// Task store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    /// Sliding retention window for task records.
    pub ttl: Duration,
    pub libsql_path: PathBuf,
    pub redis_url: String,
}

/// Stream transport configuration.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub backend: TransportBackend,
    pub redis_url: String,
}

/// HTTP server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    /// Allowed CORS origins. `*` allows any.
    pub cors_allow_origins: Vec<String>,
    /// Run a consumer inside the API process.
    pub embedded_workers: bool,
}

/// Language model endpoint configuration.
#[derive(Debug, Clone)]
pub struct LlmConfig {
    /// Server root, without `/v1`. Unset disables LLM calls.
    pub base_url: Option<String>,
    pub model: String,
    pub api_key: SecretString,
    pub runpod_api_key: Option<SecretString>,
    pub timeout: Duration,
    pub max_retries: u32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            model: DEFAULT_MODEL.to_string(),
            api_key: SecretString::from("EMPTY"),
            runpod_api_key: None,
            timeout: Duration::from_secs(60),
            max_retries: 2,
        }
    }
}

/// Credentials and fixtures for the worker collaborators.
#[derive(Debug, Clone, Default)]
pub struct CollaboratorConfig {
    pub github_token: Option<SecretString>,
    pub tavily_api_key: Option<SecretString>,
    /// JSON feature bag used by mock fetch mode.
    pub mock_features_path: Option<PathBuf>,
}

/// Whole-process configuration.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub store: StoreConfig,
    pub transport: TransportConfig,
    pub consumer: ConsumerConfig,
    pub server: ServerConfig,
    pub llm: LlmConfig,
    pub collaborators: CollaboratorConfig,
}

impl AppConfig {
    /// Read configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read configuration through `lookup`, which maps a variable name to
    /// its value.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let secret = |key: &str| get(key).map(SecretString::from);

        let redis_url = get("REDIS_URL").unwrap_or_else(|| DEFAULT_REDIS_URL.to_string());

        let store = StoreConfig {
            backend: parse_or(&get, "TASKS_STORE", StoreBackend::Redis)?,
            ttl: Duration::from_secs(parse_or(&get, "TASKS_TTL_SECS", DEFAULT_TTL.as_secs())?),
            libsql_path: get("TASKS_LIBSQL_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_LIBSQL_PATH)),
            redis_url: redis_url.clone(),
        };
        if store.ttl.is_zero() {
            return Err(ConfigError::InvalidValue {
                key: "TASKS_TTL_SECS".into(),
                message: "must be greater than zero".into(),
            });
        }

        let transport = TransportConfig {
            backend: parse_or(&get, "TASKS_TRANSPORT", TransportBackend::Redis)?,
            redis_url,
        };

        let consumer = ConsumerConfig {
            group: get("TASKS_CONSUMER_GROUP").unwrap_or_else(|| DEFAULT_GROUP.to_string()),
            name: get("TASKS_WORKER_ID").unwrap_or_else(ConsumerConfig::generate_name),
            block: Duration::from_millis(parse_or(&get, "TASKS_BLOCK_MS", 5000)?),
            error_backoff: Duration::from_millis(parse_or(&get, "TASKS_ERROR_BACKOFF_MS", 1000)?),
            reclaim_idle: parse_opt::<u64>(&get, "TASKS_RECLAIM_IDLE_SECS")?
                .map(Duration::from_secs),
        };

        let server = ServerConfig {
            port: parse_or(&get, "AI_TASKS_PORT", 8000)?,
            cors_allow_origins: get("CORS_ALLOW_ORIGINS")
                .unwrap_or_else(|| "*".to_string())
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
            embedded_workers: parse_bool(&get, "TASKS_EMBEDDED_WORKERS", false)?,
        };

        let llm_defaults = LlmConfig::default();
        let llm = LlmConfig {
            base_url: get("VLLM_BASE_URL").map(|u| u.trim_end_matches('/').to_string()),
            model: get("VLLM_MODEL").unwrap_or(llm_defaults.model),
            api_key: secret("VLLM_API_KEY").unwrap_or(llm_defaults.api_key),
            runpod_api_key: secret("RUNPOD_API_KEY"),
            ..llm_defaults
        };

        let collaborators = CollaboratorConfig {
            github_token: secret("GITHUB_TOKEN"),
            tavily_api_key: secret("TAVILY_API_KEY"),
            mock_features_path: get("GITHUB_MOCK_FEATURES_PATH").map(PathBuf::from),
        };

        Ok(Self {
            store,
            transport,
            consumer,
            server,
            llm,
            collaborators,
        })
    }
}

fn parse_opt<T>(get: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: Display,
{
    get(key)
        .map(|raw| {
            raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
                key: key.to_string(),
                message: e.to_string(),
            })
        })
        .transpose()
}

fn parse_or<T>(get: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: Display,
{
    Ok(parse_opt(get, key)?.unwrap_or(default))
}

fn parse_bool(
    get: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: bool,
) -> Result<bool, ConfigError> {
    match get(key).map(|v| v.trim().to_ascii_lowercase()) {
        None => Ok(default),
        Some(v) => match v.as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(ConfigError::InvalidValue {
                key: key.to_string(),
                message: format!("expected a boolean, got '{v}'"),
            }),
        },
    }
}
