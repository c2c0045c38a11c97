use std::time::Duration;

#[derive(Clone, Debug)]
pub struct Config {
    pub server: ServerConfig,
    pub upstream: UpstreamConfig,
    pub auth: AuthConfig,
    pub cache: CacheConfig,
    pub limits: LimitsConfig,
    pub user: UserConfig,
    pub observability: ObservabilityConfig,
    pub reasoning_mode: crate::reasoning::ReasoningMode,
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub port: u16,
}

#[derive(Clone, Debug)]
pub struct UpstreamConfig {
    pub base_url: String,
    pub token: String,
    pub anon_token_enabled: bool,
    pub default_model: String,
    pub pool_max_idle_per_host: usize,
}

#[derive(Clone, Debug)]
pub struct AuthConfig {
    pub api_key: String,
    pub enabled: bool,
}

impl AuthConfig {
    /// The gate is active only when enabled and a non-empty key is set.
    pub fn required(&self) -> bool {
        self.enabled && !self.api_key.is_empty()
    }
}

#[derive(Clone, Debug)]
pub struct CacheConfig {
    pub models_ttl_secs: u64,
    pub token_ttl_secs: u64,
    pub content_ttl_secs: u64,
    pub max_size: usize,
}

#[derive(Clone, Debug)]
pub struct LimitsConfig {
    pub request_timeout_secs: u64,
    pub stream_timeout_secs: u64,
    pub tool_call_timeout_secs: u64,
    pub max_concurrent_requests: usize,
}

/// Fields substituted into `{{USER_NAME}}`-style prompt placeholders.
#[derive(Clone, Debug)]
pub struct UserConfig {
    pub name: String,
    pub location: String,
    pub language: String,
    pub timezone: String,
}

#[derive(Clone, Debug)]
pub struct ObservabilityConfig {
    pub service_name: String,
    pub log_level: String,
    pub debug: bool,
    pub perf_monitoring_enabled: bool,
    pub otlp_endpoint: String,
    pub otlp_timeout_ms: u64,
    pub cors_origins: String,
}

impl Config {
    pub fn from_env() -> Result<Self, String> {
        let mut config = Self {
            server: ServerConfig {
                port: env_parse("GLM_PROXY_PORT", 8089)?,
            },
            upstream: UpstreamConfig {
                base_url: env_or("GLM_PROXY_BASE_URL", "https://chat.z.ai"),
                token: env_or("GLM_PROXY_UPSTREAM_TOKEN", ""),
                anon_token_enabled: env_bool("GLM_PROXY_ANON_TOKEN_ENABLED", true)?,
                default_model: env_or("GLM_PROXY_DEFAULT_MODEL", "glm-4.5v"),
                pool_max_idle_per_host: env_parse("GLM_PROXY_POOL_MAX_IDLE", 20)?,
            },
            auth: AuthConfig {
                api_key: env_or("GLM_PROXY_API_KEY", ""),
                enabled: env_bool("GLM_PROXY_API_KEY_ENABLED", false)?,
            },
            cache: CacheConfig {
                models_ttl_secs: env_parse("GLM_PROXY_MODELS_CACHE_TTL", 300)?,
                token_ttl_secs: env_parse("GLM_PROXY_AUTH_TOKEN_CACHE_TTL", 600)?,
                content_ttl_secs: env_parse("GLM_PROXY_CONTENT_CACHE_TTL", 1800)?,
                max_size: env_parse("GLM_PROXY_CACHE_MAX_SIZE", 1000)?,
            },
            limits: LimitsConfig {
                request_timeout_secs: env_parse("GLM_PROXY_REQUEST_TIMEOUT", 60)?,
                stream_timeout_secs: env_parse("GLM_PROXY_STREAM_TIMEOUT", 120)?,
                tool_call_timeout_secs: env_parse("GLM_PROXY_TOOL_CALL_TIMEOUT", 30)?,
                max_concurrent_requests: env_parse("GLM_PROXY_MAX_CONCURRENT_REQUESTS", 100)?,
            },
            user: UserConfig {
                name: env_or("GLM_PROXY_USER_NAME", "Guest"),
                location: env_or("GLM_PROXY_USER_LOCATION", "Unknown"),
                language: env_or("GLM_PROXY_USER_LANG", "en-US"),
                timezone: env_or("GLM_PROXY_TZ", "UTC"),
            },
            observability: ObservabilityConfig {
                service_name: env_or("GLM_PROXY_SERVICE_NAME", "glm-proxy"),
                log_level: env_or("GLM_PROXY_LOG_LEVEL", "info"),
                debug: env_bool("GLM_PROXY_DEBUG", false)?,
                perf_monitoring_enabled: env_bool("GLM_PROXY_PERF_MONITORING", true)?,
                otlp_endpoint: env_or("GLM_PROXY_OTLP_ENDPOINT", "http://localhost:4317"),
                otlp_timeout_ms: env_parse("GLM_PROXY_OTLP_TIMEOUT_MS", 3000)?,
                cors_origins: env_or("GLM_PROXY_CORS_ORIGINS", "*"),
            },
            reasoning_mode: crate::reasoning::ReasoningMode::Think,
        };

        let mode = env_or("GLM_PROXY_REASONING_MODE", "think");
        config.reasoning_mode = mode
            .parse()
            .map_err(|_| format!("GLM_PROXY_REASONING_MODE invalid: {}", mode))?;

        config.normalize()?;
        Ok(config)
    }

    pub fn chat_completions_url(&self) -> String {
        format!("{}/api/chat/completions", self.base_trimmed())
    }

    pub fn models_url(&self) -> String {
        format!("{}/api/models", self.base_trimmed())
    }

    pub fn auths_url(&self) -> String {
        format!("{}/api/v1/auths/", self.base_trimmed())
    }

    pub fn referer_url(&self, chat_id: &str) -> String {
        format!("{}/c/{}", self.base_trimmed(), chat_id)
    }

    fn base_trimmed(&self) -> &str {
        self.upstream.base_url.trim_end_matches('/')
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.limits.request_timeout_secs)
    }

    pub fn stream_timeout(&self) -> Duration {
        Duration::from_secs(self.limits.stream_timeout_secs)
    }

    pub fn tool_call_timeout(&self) -> Duration {
        Duration::from_secs(self.limits.tool_call_timeout_secs)
    }

    fn normalize(&mut self) -> Result<(), String> {
        if self.server.port == 0 {
            return Err("GLM_PROXY_PORT must be non-zero".to_string());
        }
        if self.upstream.base_url.is_empty() {
            return Err("GLM_PROXY_BASE_URL must not be empty".to_string());
        }
        if !self.upstream.anon_token_enabled && self.upstream.token.trim().is_empty() {
            return Err(
                "GLM_PROXY_UPSTREAM_TOKEN is required when anonymous tokens are disabled"
                    .to_string(),
            );
        }
        if self.cache.max_size == 0 {
            return Err("GLM_PROXY_CACHE_MAX_SIZE must be at least 1".to_string());
        }
        if self.limits.max_concurrent_requests == 0 {
            return Err("GLM_PROXY_MAX_CONCURRENT_REQUESTS must be at least 1".to_string());
        }
        self.observability.log_level = self.observability.log_level.to_lowercase();
        match self.observability.log_level.as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            other => return Err(format!("GLM_PROXY_LOG_LEVEL invalid: {}", other)),
        }
        Ok(())
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> Result<T, String> {
    match std::env::var(key) {
        Ok(raw) => raw.parse().map_err(|_| format!("{} invalid: {}", key, raw)),
        Err(_) => Ok(default),
    }
}

fn env_bool(key: &str, default: bool) -> Result<bool, String> {
    match std::env::var(key) {
        Ok(raw) => match raw.to_lowercase().as_str() {
            "true" | "1" | "yes" | "on" => Ok(true),
            "false" | "0" | "no" | "off" => Ok(false),
            other => Err(format!("{} invalid: {}", key, other)),
        },
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
pub fn test_config() -> Config {
    Config {
        server: ServerConfig { port: 8089 },
        upstream: UpstreamConfig {
            base_url: "https://chat.z.ai".to_string(),
            token: "tok".to_string(),
            anon_token_enabled: false,
            default_model: "glm-4.5v".to_string(),
            pool_max_idle_per_host: 4,
        },
        auth: AuthConfig {
            api_key: String::new(),
            enabled: false,
        },
        cache: CacheConfig {
            models_ttl_secs: 300,
            token_ttl_secs: 600,
            content_ttl_secs: 1800,
            max_size: 16,
        },
        limits: LimitsConfig {
            request_timeout_secs: 60,
            stream_timeout_secs: 120,
            tool_call_timeout_secs: 30,
            max_concurrent_requests: 100,
        },
        user: UserConfig {
            name: "Guest".to_string(),
            location: "Unknown".to_string(),
            language: "en-US".to_string(),
            timezone: "UTC".to_string(),
        },
        observability: ObservabilityConfig {
            service_name: "glm-proxy".to_string(),
            log_level: "info".to_string(),
            debug: false,
            perf_monitoring_enabled: true,
            otlp_endpoint: "http://localhost:4317".to_string(),
            otlp_timeout_ms: 3000,
            cors_origins: "*".to_string(),
        },
        reasoning_mode: crate::reasoning::ReasoningMode::Think,
    }
}
