//! Authenticated HTTP request pipeline.

use std::sync::Arc;
use std::time::Duration;

use reqwest::{Method, Response, StatusCode};

use crate::config::ClientConfig;
use crate::error::{LanewireError, Result};
use crate::session::{SessionManager, SessionState};

/// Description of one outbound request.
///
/// The retry budget lives in the pipeline as an explicit per-call attempt
/// counter, not as hidden state on this config, so a `RequestConfig` can be
/// cloned and resent freely.
#[derive(Debug, Clone)]
pub struct RequestConfig {
    pub method: Method,
    pub path: String,
    pub query: Vec<(String, String)>,
    pub body: Option<serde_json::Value>,
    pub headers: Vec<(String, String)>,
    pub timeout: Option<Duration>,
}

impl RequestConfig {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            body: None,
            headers: Vec::new(),
            timeout: None,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::POST, path)
    }

    pub fn put(path: impl Into<String>) -> Self {
        Self::new(Method::PUT, path)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::DELETE, path)
    }

    pub fn with_query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    pub fn with_json(mut self, body: serde_json::Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Wraps every outbound HTTP call: injects credentials, detects
/// authorization failures, and replays once after a refresh.
pub struct RequestPipeline {
    session: Arc<SessionManager>,
    client: reqwest::Client,
    base_url: String,
    request_timeout: Duration,
}

impl RequestPipeline {
    pub fn new(session: Arc<SessionManager>, config: &ClientConfig) -> Self {
        Self {
            session,
            client: reqwest::Client::new(),
            base_url: config.api_url.trim_end_matches('/').to_string(),
            request_timeout: config.request_timeout,
        }
    }

    /// Send a request, transparently refreshing the access token once when
    /// the backend rejects it.
    ///
    /// Anonymous sessions send bare requests; expired sessions reject with
    /// `Unauthenticated`. Non-401 error statuses are returned as-is — they
    /// are the caller's concern. A second 401 after a successful refresh
    /// surfaces `Unauthenticated` without another refresh attempt.
    pub async fn send(&self, config: RequestConfig) -> Result<Response> {
        let mut attempt: u8 = 0;
        loop {
            let token = match self.session.state() {
                SessionState::Anonymous => None,
                _ => match self.session.get_valid_access_token().await {
                    Ok(token) => Some(token),
                    Err(error @ LanewireError::Storage(_)) => return Err(error),
                    // A failed or expired refresh rejects the queued request.
                    Err(_) => return Err(LanewireError::Unauthenticated),
                },
            };
            let response = self.execute(&config, token.as_deref()).await?;
            if response.status() != StatusCode::UNAUTHORIZED || token.is_none() {
                return Ok(response);
            }
            if attempt >= 1 {
                return Err(LanewireError::Unauthenticated);
            }
            attempt += 1;
            match self.session.refresh_after_unauthorized().await {
                Ok(_) => {}
                Err(error @ LanewireError::Storage(_)) => return Err(error),
                Err(_) => return Err(LanewireError::Unauthenticated),
            }
        }
    }

    async fn execute(&self, config: &RequestConfig, token: Option<&str>) -> Result<Response> {
        let url = format!("{}{}", self.base_url, config.path);
        let mut request = self
            .client
            .request(config.method.clone(), url)
            .timeout(config.timeout.unwrap_or(self.request_timeout));
        if !config.query.is_empty() {
            request = request.query(&config.query);
        }
        if let Some(token) = token {
            request = request.header("Authorization", format!("Bearer {token}"));
            if let Some(identity) = self.session.identity() {
                request = request
                    .header("X-User-ID", identity.user_id)
                    .header("X-User-Type", identity.role.to_string());
            }
        }
        for (name, value) in &config.headers {
            request = request.header(name, value);
        }
        if let Some(body) = &config.body {
            request = request.json(body);
        }
        Ok(request.send().await?)
    }
}
