pub mod clock;
pub mod glob;

use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {0}: {1}")]
    InvalidValue(&'static str, String),
}

pub const DEFAULT_BASE_URL: &str = "https://ollama.com/api";

/// One sliding-window scope (global, per-IP, or per-token).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitScope {
    pub enabled: bool,
    pub max_requests: u32,
    pub window_ms: u64,
}

impl RateLimitScope {
    pub fn new(enabled: bool, max_requests: u32, window_ms: u64) -> Self {
        Self {
            enabled,
            max_requests,
            window_ms,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AccessMode {
    #[default]
    Disabled,
    Whitelist,
    Blacklist,
}

impl AccessMode {
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "whitelist" => AccessMode::Whitelist,
            "blacklist" => AccessMode::Blacklist,
            _ => AccessMode::Disabled,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AccessMode::Disabled => "disabled",
            AccessMode::Whitelist => "whitelist",
            AccessMode::Blacklist => "blacklist",
        }
    }
}

/// Final, merged process configuration.
///
/// Merge order: CLI > ENV > defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub data_dir: String,
    /// Default upstream for bare keys with no URL of their own.
    pub default_base_url: String,
    /// Legacy single shared secret; only consulted when no tokens exist.
    pub api_token: Option<String>,
    pub connect_timeout_ms: u64,
    pub request_timeout_ms: u64,
    pub max_retries: u32,
    /// Seconds between active health probes; 0 disables the loop.
    pub health_check_interval_secs: u64,
    pub rate_limit_global: RateLimitScope,
    pub rate_limit_ip: RateLimitScope,
    pub rate_limit_token: RateLimitScope,
    pub ip_access_mode: AccessMode,
    pub ip_whitelist: Vec<String>,
    pub ip_blacklist: Vec<String>,
    pub log_level: String,
    /// Honor X-Forwarded-For when resolving the client IP.
    pub trust_proxy: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 11444,
            data_dir: "./data".to_string(),
            default_base_url: DEFAULT_BASE_URL.to_string(),
            api_token: None,
            connect_timeout_ms: 30_000,
            request_timeout_ms: 300_000,
            max_retries: 2,
            health_check_interval_secs: 60,
            rate_limit_global: RateLimitScope::new(true, 100, 60_000),
            rate_limit_ip: RateLimitScope::new(true, 30, 60_000),
            rate_limit_token: RateLimitScope::new(true, 60, 60_000),
            ip_access_mode: AccessMode::Disabled,
            ip_whitelist: Vec::new(),
            ip_blacklist: Vec::new(),
            log_level: "info".to_string(),
            trust_proxy: false,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        let mut cfg = Config::default();

        if let Some(port) = env_parse::<u16>("PORT") {
            cfg.port = port;
        }
        if let Some(token) = env_string("API_TOKEN") {
            cfg.api_token = Some(token);
        }
        if let Some(url) = env_string("OLLAMA_BASE_URL") {
            cfg.default_base_url = url;
        }
        if let Some(ms) = env_parse::<u64>("CONNECT_TIMEOUT") {
            cfg.connect_timeout_ms = ms;
        }
        if let Some(ms) = env_parse::<u64>("REQUEST_TIMEOUT") {
            cfg.request_timeout_ms = ms;
        }
        if let Some(n) = env_parse::<u32>("MAX_RETRIES") {
            cfg.max_retries = n;
        }
        if let Some(secs) = env_parse::<u64>("HEALTH_CHECK_INTERVAL") {
            cfg.health_check_interval_secs = secs;
        }

        cfg.rate_limit_global = rate_limit_from_env("GLOBAL", cfg.rate_limit_global);
        cfg.rate_limit_ip = rate_limit_from_env("IP", cfg.rate_limit_ip);
        cfg.rate_limit_token = rate_limit_from_env("TOKEN", cfg.rate_limit_token);

        if let Some(mode) = env_string("IP_ACCESS_MODE") {
            cfg.ip_access_mode = AccessMode::parse(&mode);
        }
        if let Some(list) = env_string("IP_WHITELIST") {
            cfg.ip_whitelist = split_list(&list);
        }
        if let Some(list) = env_string("IP_BLACKLIST") {
            cfg.ip_blacklist = split_list(&list);
        }
        if let Some(level) = env_string("LOG_LEVEL") {
            cfg.log_level = level;
        }
        if let Some(flag) = env_string("TRUST_PROXY") {
            cfg.trust_proxy = parse_bool(&flag);
        }

        cfg
    }
}

fn rate_limit_from_env(scope: &str, defaults: RateLimitScope) -> RateLimitScope {
    let enabled = env_string(&format!("RATE_LIMIT_{scope}_ENABLED"))
        .map(|v| parse_bool(&v))
        .unwrap_or(defaults.enabled);
    let max_requests =
        env_parse::<u32>(&format!("RATE_LIMIT_{scope}_MAX")).unwrap_or(defaults.max_requests);
    let window_ms =
        env_parse::<u64>(&format!("RATE_LIMIT_{scope}_WINDOW")).unwrap_or(defaults.window_ms);
    RateLimitScope {
        enabled,
        max_requests,
        window_ms,
    }
}

fn env_string(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    let raw = env_string(name)?;
    match raw.parse::<T>() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(var = name, value = %raw, "ignoring unparsable env value");
            None
        }
    }
}

fn parse_bool(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

pub fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
