use serde::Deserialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::cache::TtlCache;
use crate::config::Config;
use crate::error::{map_transport_error, map_upstream_status, AppError};
use crate::models::{UpstreamChatRequest, UpstreamModelsResponse};

const AUTH_TOKEN_KEY: &str = "auth_token";

/// One browser-identical header profile; a pool of these rotates across
/// upstream requests.
struct HeaderProfile {
    user_agent: &'static str,
    sec_ch_ua: &'static str,
    platform: &'static str,
}

static HEADER_PROFILES: &[HeaderProfile] = &[
    HeaderProfile {
        user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/139.0.0.0 Safari/537.36",
        sec_ch_ua: "\"Not;A=Brand\";v=\"99\", \"Chromium\";v=\"139\"",
        platform: "\"Windows\"",
    },
    HeaderProfile {
        user_agent: "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/139.0.0.0 Safari/537.36",
        sec_ch_ua: "\"Not;A=Brand\";v=\"99\", \"Chromium\";v=\"139\"",
        platform: "\"macOS\"",
    },
    HeaderProfile {
        user_agent: "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/139.0.0.0 Safari/537.36",
        sec_ch_ua: "\"Not;A=Brand\";v=\"99\", \"Chromium\";v=\"139\"",
        platform: "\"Linux\"",
    },
];

const FE_VERSION: &str = "prod-fe-1.0.77";

#[derive(Debug, Deserialize)]
struct AuthsResponse {
    #[serde(default)]
    token: Option<String>,
}

/// Client for the single upstream chat service: token acquisition, chat
/// completion streams, and the model catalog.
#[derive(Clone)]
pub struct UpstreamClient {
    client: reqwest::Client,
    stream_client: reqwest::Client,
    config: Arc<Config>,
    token_cache: Arc<TtlCache<String>>,
    profile_cursor: Arc<AtomicUsize>,
}

impl UpstreamClient {
    pub fn new(config: Arc<Config>, token_cache: Arc<TtlCache<String>>) -> Result<Self, String> {
        let pool = config.upstream.pool_max_idle_per_host;
        let client = reqwest::Client::builder()
            .pool_max_idle_per_host(pool)
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| format!("client build error: {}", e))?;
        // The stream client carries no overall read timeout; idleness is
        // policed by the SSE parser.
        let stream_client = reqwest::Client::builder()
            .pool_max_idle_per_host(pool)
            .connect_timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| format!("stream client build error: {}", e))?;
        Ok(Self {
            client,
            stream_client,
            config,
            token_cache,
            profile_cursor: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Bearer token for upstream calls: the configured token, or an
    /// anonymous one fetched and cached (falling back to the configured
    /// token when the fetch fails).
    pub async fn auth_token(&self) -> String {
        if !self.config.upstream.anon_token_enabled {
            return self.config.upstream.token.clone();
        }
        if let Some(token) = self.token_cache.get(AUTH_TOKEN_KEY) {
            return token;
        }
        match self.fetch_anonymous_token().await {
            Ok(Some(token)) => {
                self.token_cache.insert_with_ttl(
                    AUTH_TOKEN_KEY,
                    token.clone(),
                    Duration::from_secs(self.config.cache.token_ttl_secs),
                );
                token
            }
            Ok(None) => self.config.upstream.token.clone(),
            Err(err) => {
                tracing::warn!("anonymous token fetch failed: {}", err);
                self.config.upstream.token.clone()
            }
        }
    }

    async fn fetch_anonymous_token(&self) -> Result<Option<String>, AppError> {
        let request = self.with_browser_headers(self.client.get(self.config.auths_url()));
        let resp = request.send().await.map_err(|e| map_transport_error(&e))?;
        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(map_upstream_status(status, &text));
        }
        let auths: AuthsResponse = resp
            .json()
            .await
            .map_err(|e| AppError::upstream_unavailable(format!("invalid auths response: {}", e)))?;
        Ok(auths.token)
    }

    /// Open the upstream chat-completion SSE stream.
    pub async fn chat_stream(
        &self,
        body: &UpstreamChatRequest,
    ) -> Result<reqwest::Response, AppError> {
        let token = self.auth_token().await;
        let request = self
            .with_browser_headers(self.stream_client.post(self.config.chat_completions_url()))
            .header(reqwest::header::AUTHORIZATION, format!("Bearer {}", token))
            .header(reqwest::header::REFERER, self.config.referer_url(&body.chat_id))
            .json(body);
        let resp = request.send().await.map_err(|e| map_transport_error(&e))?;
        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(map_upstream_status(status, &text));
        }
        Ok(resp)
    }

    /// Fetch the upstream model catalog.
    pub async fn fetch_models(&self) -> Result<UpstreamModelsResponse, AppError> {
        let token = self.auth_token().await;
        let request = self
            .with_browser_headers(self.client.get(self.config.models_url()))
            .header(reqwest::header::AUTHORIZATION, format!("Bearer {}", token));
        let resp = request.send().await.map_err(|e| map_transport_error(&e))?;
        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(map_upstream_status(status, &text));
        }
        resp.json()
            .await
            .map_err(|e| AppError::upstream_unavailable(format!("invalid models response: {}", e)))
    }

    fn with_browser_headers(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        let profile = self.next_profile();
        request
            .header(reqwest::header::USER_AGENT, profile.user_agent)
            .header(reqwest::header::ACCEPT, "*/*")
            .header(reqwest::header::ACCEPT_LANGUAGE, "en-US,en;q=0.9")
            .header(reqwest::header::ORIGIN, self.config.upstream.base_url.trim_end_matches('/'))
            .header("X-FE-Version", FE_VERSION)
            .header("sec-ch-ua", profile.sec_ch_ua)
            .header("sec-ch-ua-mobile", "?0")
            .header("sec-ch-ua-platform", profile.platform)
    }

    fn next_profile(&self) -> &'static HeaderProfile {
        let cursor = self.profile_cursor.fetch_add(1, Ordering::Relaxed);
        &HEADER_PROFILES[cursor % HEADER_PROFILES.len()]
    }
}
