//! Configuration loaded from environment variables.
//!
//! Every setting has a development default, so `commsync serve` starts with
//! zero configuration. Invalid values are logged and the default is kept.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use tracing::warn;

pub const DEFAULT_JWT_SECRET: &str = "dev-secret";
pub const DEFAULT_ASSISTANT_MODEL: &str = "gemini-1.5-flash";
pub const DEFAULT_ASSISTANT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Env: `HTTP_ADDR`. Default: `127.0.0.1:4000`
    pub http_addr: SocketAddr,

    /// Env: `DB_PATH`. Default: `.commsync/commsync.db`
    pub db_path: PathBuf,

    /// HS256 secret for bearer credentials.
    /// Env: `JWT_SECRET`. Default: `dev-secret` (development only).
    pub jwt_secret: String,

    /// Env: `GEMINI_API_KEY`. Unset disables the assistant.
    pub assistant_api_key: Option<String>,

    /// Env: `GEMINI_MODEL`
    pub assistant_model: String,

    /// Env: `GEMINI_BASE_URL`
    pub assistant_base_url: String,

    /// Env: `ASSISTANT_TIMEOUT_SECS`. Default: 30
    pub assistant_timeout: Duration,

    /// Env: `ALLOWED_ORIGINS` (comma separated)
    pub allowed_origins: Vec<String>,

    /// Permissive CORS. Env: `DEV_MODE`
    pub dev_mode: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: ([127, 0, 0, 1], 4000).into(),
            db_path: PathBuf::from(".commsync/commsync.db"),
            jwt_secret: DEFAULT_JWT_SECRET.to_string(),
            assistant_api_key: None,
            assistant_model: DEFAULT_ASSISTANT_MODEL.to_string(),
            assistant_base_url: DEFAULT_ASSISTANT_BASE_URL.to_string(),
            assistant_timeout: crate::server::assistant::DEFAULT_TIMEOUT,
            allowed_origins: Vec::new(),
            dev_mode: false,
        }
    }
}

impl ServerConfig {
    /// Load from the process environment (after an optional `.env` file).
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load using `lookup` to resolve variables.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(addr) = lookup("HTTP_ADDR") {
            match addr.parse::<SocketAddr>() {
                Ok(parsed) => config.http_addr = parsed,
                Err(_) => warn!(value = %addr, "Invalid HTTP_ADDR, using default"),
            }
        }

        if let Some(path) = lookup("DB_PATH").filter(|p| !p.is_empty()) {
            config.db_path = PathBuf::from(path);
        }

        if let Some(secret) = lookup("JWT_SECRET").filter(|s| !s.is_empty()) {
            config.jwt_secret = secret;
        }

        config.assistant_api_key = lookup("GEMINI_API_KEY").filter(|k| !k.trim().is_empty());

        if let Some(model) = lookup("GEMINI_MODEL").filter(|m| !m.is_empty()) {
            config.assistant_model = model;
        }

        if let Some(url) = lookup("GEMINI_BASE_URL").filter(|u| !u.is_empty()) {
            config.assistant_base_url = url;
        }

        if let Some(secs) = lookup("ASSISTANT_TIMEOUT_SECS") {
            match secs.parse::<u64>() {
                Ok(n) if n > 0 => config.assistant_timeout = Duration::from_secs(n),
                _ => warn!(value = %secs, "Invalid ASSISTANT_TIMEOUT_SECS, using default"),
            }
        }

        if let Some(origins) = lookup("ALLOWED_ORIGINS") {
            config.allowed_origins = origins
                .split(',')
                .map(str::trim)
                .filter(|o| !o.is_empty())
                .map(String::from)
                .collect();
        }

        if let Some(v) = lookup("DEV_MODE") {
            config.dev_mode = parse_flag("DEV_MODE", &v, config.dev_mode);
        }

        config
    }

    pub fn uses_default_secret(&self) -> bool {
        self.jwt_secret == DEFAULT_JWT_SECRET
    }
}

/// Read a boolean variable without logging. Used before tracing is set up.
pub fn env_flag(name: &str) -> bool {
    std::env::var(name)
        .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
        .unwrap_or(false)
}

fn parse_flag(name: &str, value: &str, default: bool) -> bool {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => true,
        "0" | "false" | "no" | "off" | "" => false,
        _ => {
            warn!(variable = name, value = %value, "Invalid boolean, using default");
            default
        }
    }
}

/// Client runtime configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Server base URL, e.g. `http://127.0.0.1:4000`.
    pub base_url: String,
    pub token: String,
    /// Where per-room message caches are kept.
    pub cache_dir: PathBuf,
}

impl ClientConfig {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
            cache_dir: default_cache_dir(),
        }
    }

    pub fn with_cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cache_dir = dir.into();
        self
    }

    /// WebSocket endpoint derived from the base URL.
    pub fn ws_url(&self) -> String {
        let base = if let Some(rest) = self.base_url.strip_prefix("https://") {
            format!("wss://{}", rest)
        } else if let Some(rest) = self.base_url.strip_prefix("http://") {
            format!("ws://{}", rest)
        } else {
            self.base_url.clone()
        };
        format!("{}/ws", base)
    }
}

fn default_cache_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("commsync")
}
