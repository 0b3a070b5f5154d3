use serde::Serialize;
use std::time::Duration;

/// Backend family behind `upstream_base_url`, derived once at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderClass {
    Openrouter,
    Openai,
    Ollama,
    Unknown,
}

#[derive(Debug)]
pub enum ConfigError {
    MissingApiKey,
    InvalidPort(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::MissingApiKey => {
                write!(
                    f,
                    "OPENAI_API_KEY is required (unless using localhost/Ollama)"
                )
            }
            ConfigError::InvalidPort(raw) => write!(f, "invalid PORT value: {raw}"),
        }
    }
}

impl std::error::Error for ConfigError {}

/// Read-only snapshot of the proxy configuration, built once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    pub upstream_base_url: String,
    pub api_key: String,
    pub client_auth_key: Option<String>,
    pub host: String,
    pub port: u16,
    pub debug: bool,
    pub simple_log: bool,
    pub passthrough: bool,
    pub opus_override: Option<String>,
    pub sonnet_override: Option<String>,
    pub haiku_override: Option<String>,
    pub upstream_app_name: Option<String>,
    pub upstream_app_url: Option<String>,
    pub request_timeout: Duration,
    pub stream_timeout: Duration,
    provider_class: ProviderClass,
    is_localhost: bool,
}

impl Config {
    /// Build a config from the process environment. Fails when no upstream
    /// key is set and the upstream is not a localhost endpoint.
    pub fn from_env() -> Result<Self, ConfigError> {
        let upstream_base_url = env_or("OPENAI_BASE_URL", "https://api.openai.com/v1");
        let port = match std::env::var("PORT").ok().filter(|v| !v.trim().is_empty()) {
            Some(raw) => raw.parse::<u16>().map_err(|_| ConfigError::InvalidPort(raw))?,
            None => 8082,
        };

        let mut config = Self::new(upstream_base_url, std::env::var("OPENAI_API_KEY").ok())?;
        config.client_auth_key = non_empty_env("ANTHROPIC_API_KEY");
        config.host = env_or("HOST", "0.0.0.0");
        config.port = port;
        config.debug = env_flag("DEBUG");
        config.simple_log = env_flag("SIMPLE_LOG");
        config.passthrough = env_flag("PASSTHROUGH_MODE");
        config.opus_override = non_empty_env("ANTHROPIC_DEFAULT_OPUS_MODEL");
        config.sonnet_override = non_empty_env("ANTHROPIC_DEFAULT_SONNET_MODEL");
        config.haiku_override = non_empty_env("ANTHROPIC_DEFAULT_HAIKU_MODEL");
        config.upstream_app_name = non_empty_env("OPENROUTER_APP_NAME");
        config.upstream_app_url = non_empty_env("OPENROUTER_APP_URL");
        if let Some(secs) = env_u64("REQUEST_TIMEOUT_SECS") {
            config.request_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = env_u64("STREAM_TIMEOUT_SECS") {
            config.stream_timeout = Duration::from_secs(secs);
        }
        Ok(config)
    }

    /// Build a config with defaults for everything but the upstream. Localhost
    /// upstreams get a dummy key so callers never special-case the header
    /// value; any other upstream requires a real key.
    pub fn new(
        upstream_base_url: impl Into<String>,
        api_key: Option<String>,
    ) -> Result<Self, ConfigError> {
        let upstream_base_url = upstream_base_url.into();
        let is_localhost = base_url_is_localhost(&upstream_base_url);
        let api_key = match api_key.filter(|k| !k.trim().is_empty()) {
            Some(key) => key,
            None if is_localhost => "ollama".to_string(),
            None => return Err(ConfigError::MissingApiKey),
        };
        Ok(Self {
            provider_class: classify_provider(&upstream_base_url),
            is_localhost,
            upstream_base_url,
            api_key,
            client_auth_key: None,
            host: "0.0.0.0".to_string(),
            port: 8082,
            debug: false,
            simple_log: false,
            passthrough: false,
            opus_override: None,
            sonnet_override: None,
            haiku_override: None,
            upstream_app_name: None,
            upstream_app_url: None,
            request_timeout: Duration::from_secs(90),
            stream_timeout: Duration::from_secs(300),
        })
    }

    pub fn provider_class(&self) -> ProviderClass {
        self.provider_class
    }

    pub fn is_localhost(&self) -> bool {
        self.is_localhost
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Case-insensitive substring classification of the upstream base URL.
pub fn classify_provider(base_url: &str) -> ProviderClass {
    let base_url = base_url.to_lowercase();
    if base_url.contains("openrouter.ai") {
        ProviderClass::Openrouter
    } else if base_url.contains("api.openai.com") {
        ProviderClass::Openai
    } else if base_url_is_localhost(&base_url) {
        ProviderClass::Ollama
    } else {
        ProviderClass::Unknown
    }
}

fn base_url_is_localhost(base_url: &str) -> bool {
    let base_url = base_url.to_lowercase();
    base_url.contains("localhost") || base_url.contains("127.0.0.1")
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_flag(key: &str) -> bool {
    matches!(
        std::env::var(key).ok().as_deref(),
        Some("true") | Some("1") | Some("yes")
    )
}

fn env_u64(key: &str) -> Option<u64> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}
