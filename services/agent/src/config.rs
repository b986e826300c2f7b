//! Agent configuration loading.
//!
//! TOML is the sole config source.  Default config path:
//! `/etc/herald/agent.toml`.
//!
//! # Required fields
//! - `schema_version = 1`
//! - `server.base_url`
//! - `auth.token_file`
//! - `forward.url`
//!
//! # Token file format
//! Raw subscriber API key on a single line; trimmed on read.

use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

// ---------------------------------------------------------------------------
// Config types (deserialized from TOML)
// ---------------------------------------------------------------------------

/// Top-level agent configuration.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub schema_version: u32,
    /// The raw API key (read from the token file, not the file path).
    pub token: String,
    pub server: ServerConfig,
    pub forward: ForwardConfig,
    pub status_http: StatusHttpConfig,
    pub backoff: BackoffConfig,
}

impl AgentConfig {
    /// The full tunnel URL (`wss://…/v1/tunnel`).
    pub fn tunnel_url(&self) -> String {
        format!(
            "{}{}",
            self.server.base_url.trim_end_matches('/'),
            self.server.tunnel_path
        )
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// E.g. `wss://relay.example.com`.
    pub base_url: String,
    pub tunnel_path: String,
}

#[derive(Debug, Clone)]
pub struct ForwardConfig {
    /// Local URL that receives each signal as an HTTP POST.
    pub url: String,
    /// Sent as `Authorization: Bearer …` on local requests when set.
    pub bearer_token: Option<String>,
}

#[derive(Debug, Clone)]
pub struct StatusHttpConfig {
    pub bind: String,
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffConfig {
    pub initial: Duration,
    pub factor: f64,
    /// Jitter half-width as a percentage of the base delay.
    pub jitter_pct: u8,
    pub max: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        BackoffConfig {
            initial: Duration::from_secs(1),
            factor: 2.0,
            jitter_pct: 20,
            max: Duration::from_secs(60),
        }
    }
}

// ---------------------------------------------------------------------------
// Raw TOML deserialization types (with Option for optional fields)
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RawConfig {
    schema_version: Option<u32>,
    server: Option<RawServerConfig>,
    auth: Option<RawAuthConfig>,
    forward: Option<RawForwardConfig>,
    status_http: Option<RawStatusHttpConfig>,
    backoff: Option<RawBackoffConfig>,
}

#[derive(Debug, Deserialize)]
struct RawServerConfig {
    base_url: Option<String>,
    tunnel_path: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawAuthConfig {
    token_file: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawForwardConfig {
    url: Option<String>,
    bearer_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawStatusHttpConfig {
    bind: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawBackoffConfig {
    initial_ms: Option<u64>,
    factor: Option<f64>,
    jitter_pct: Option<u8>,
    max_ms: Option<u64>,
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config I/O error: {0}")]
    Io(String),
    #[error("config parse error: {0}")]
    Parse(String),
    #[error("missing required config field: {0}")]
    Missing(&'static str),
    #[error("invalid config value: {0}")]
    Invalid(String),
}

/// Load agent config from the default path `/etc/herald/agent.toml`.
pub fn load_config() -> Result<AgentConfig, ConfigError> {
    load_config_from_path(Path::new("/etc/herald/agent.toml"))
}

/// Load agent config from a custom path.
pub fn load_config_from_path(path: &Path) -> Result<AgentConfig, ConfigError> {
    let toml_str = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Io(format!("reading config file '{}': {}", path.display(), e)))?;
    load_config_from_str(&toml_str)
}

/// Load agent config from a TOML string.  The token file named in the TOML
/// is read from disk.
pub fn load_config_from_str(toml_str: &str) -> Result<AgentConfig, ConfigError> {
    let raw: RawConfig = toml::from_str(toml_str).map_err(|e| ConfigError::Parse(e.to_string()))?;

    let schema_version = raw.schema_version.ok_or(ConfigError::Missing("schema_version"))?;
    if schema_version != 1 {
        return Err(ConfigError::Invalid(format!(
            "unsupported schema_version {schema_version}"
        )));
    }

    let raw_server = raw.server.ok_or(ConfigError::Missing("server"))?;
    let base_url = raw_server
        .base_url
        .ok_or(ConfigError::Missing("server.base_url"))?;

    let token_file = raw
        .auth
        .and_then(|a| a.token_file)
        .ok_or(ConfigError::Missing("auth.token_file"))?;
    let token = std::fs::read_to_string(&token_file)
        .map_err(|e| ConfigError::Io(format!("reading token file '{token_file}': {e}")))?
        .trim()
        .to_owned();
    if token.is_empty() {
        return Err(ConfigError::Invalid("token file is empty".to_owned()));
    }

    let raw_forward = raw.forward.ok_or(ConfigError::Missing("forward"))?;
    let forward_url = raw_forward.url.ok_or(ConfigError::Missing("forward.url"))?;

    let backoff_defaults = BackoffConfig::default();
    let backoff = match raw.backoff {
        Some(b) => BackoffConfig {
            initial: b
                .initial_ms
                .map_or(backoff_defaults.initial, Duration::from_millis),
            factor: b.factor.unwrap_or(backoff_defaults.factor),
            jitter_pct: b.jitter_pct.unwrap_or(backoff_defaults.jitter_pct),
            max: b.max_ms.map_or(backoff_defaults.max, Duration::from_millis),
        },
        None => backoff_defaults,
    };

    Ok(AgentConfig {
        schema_version,
        token,
        server: ServerConfig {
            base_url,
            tunnel_path: raw_server
                .tunnel_path
                .unwrap_or_else(|| "/v1/tunnel".to_owned()),
        },
        forward: ForwardConfig {
            url: forward_url,
            bearer_token: raw_forward.bearer_token,
        },
        status_http: StatusHttpConfig {
            bind: raw
                .status_http
                .and_then(|s| s.bind)
                .unwrap_or_else(|| "127.0.0.1:8090".to_owned()),
        },
        backoff,
    })
}
