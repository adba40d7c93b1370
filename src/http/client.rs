use std::future::Future;
use std::time::{Duration, Instant};

use reqwest::{Client, Method, StatusCode};
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use super::error::ApiError;
use super::retry::{RetryDecision, RetryPolicy};

/// Supplies and refreshes the bearer token for one external system.
///
/// Implementations decide what a refresh means: the roster service re-runs
/// its token-acquisition step with cached credentials, while the access log
/// carries a static token with nothing to refresh.
pub trait TokenSource: Send + Sync {
    /// The current bearer token, if one has been obtained.
    fn bearer(&self) -> impl Future<Output = Option<String>> + Send;

    /// Re-acquire the token after a 401.
    fn refresh(&self) -> impl Future<Output = Result<(), ApiError>> + Send;
}

/// Fixed bearer token. `refresh` always fails, so a 401 surfaces as
/// [`ApiError::Auth`] after the client's single refresh attempt.
pub struct StaticToken(pub String);

impl TokenSource for StaticToken {
    async fn bearer(&self) -> Option<String> {
        Some(self.0.clone())
    }

    async fn refresh(&self) -> Result<(), ApiError> {
        Err(ApiError::Auth(
            "static token was rejected and cannot be refreshed".into(),
        ))
    }
}

/// HTTP client for one external system: applies bearer authentication,
/// retries transient failures per [`RetryPolicy`], and logs every
/// request/response pair.
pub struct ResilientClient<T> {
    http: Client,
    tokens: T,
    policy: RetryPolicy,
    service: &'static str,
}

impl<T: TokenSource> ResilientClient<T> {
    pub fn new(tokens: T, policy: RetryPolicy, service: &'static str) -> Self {
        let http = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(120))
            .build()
            .expect("failed to build HTTP client");
        Self {
            http,
            tokens,
            policy,
            service,
        }
    }

    /// The token source backing this client.
    pub fn token_source(&self) -> &T {
        &self.tokens
    }

    pub async fn get<R: DeserializeOwned>(
        &self,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<R, ApiError> {
        self.request(Method::GET, url, query, None).await
    }

    pub async fn post<R: DeserializeOwned>(
        &self,
        url: &str,
        body: &serde_json::Value,
    ) -> Result<R, ApiError> {
        self.request(Method::POST, url, &[], Some(body)).await
    }

    /// Send one logical request, replaying it as the retry policy dictates.
    ///
    /// Backoff waits suspend only this request; other in-flight calls on the
    /// same client are unaffected.
    async fn request<R: DeserializeOwned>(
        &self,
        method: Method,
        url: &str,
        query: &[(&str, String)],
        body: Option<&serde_json::Value>,
    ) -> Result<R, ApiError> {
        let mut refreshed = false;
        let mut server_error_retries = 0u32;

        loop {
            let mut req = self.http.request(method.clone(), url);
            if !query.is_empty() {
                req = req.query(query);
            }
            if let Some(token) = self.tokens.bearer().await {
                req = req.bearer_auth(token);
            }
            if let Some(json) = body {
                req = req.json(json);
            }

            let started = Instant::now();
            let response = req
                .send()
                .await
                .map_err(|e| ApiError::Network(e.to_string()))?;
            let status = response.status();
            debug!(
                service = self.service,
                method = %method,
                url,
                status = status.as_u16(),
                elapsed_ms = started.elapsed().as_millis() as u64,
                "api request"
            );

            if status.is_success() {
                let bytes = response
                    .bytes()
                    .await
                    .map_err(|e| ApiError::Network(e.to_string()))?;
                // Endpoints with empty bodies decode as JSON null.
                let slice: &[u8] = if bytes.is_empty() { b"null" } else { &bytes };
                return serde_json::from_slice(slice).map_err(|e| ApiError::Decode(e.to_string()));
            }

            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok());

            match self
                .policy
                .decide(status.as_u16(), retry_after, refreshed, server_error_retries)
            {
                RetryDecision::RefreshToken => {
                    warn!(service = self.service, url, "401 response, refreshing credentials");
                    refreshed = true;
                    if let Err(e) = self.tokens.refresh().await {
                        // A failed refresh is an authentication failure,
                        // whatever went wrong underneath.
                        return Err(match e {
                            ApiError::Auth(_) => e,
                            other => ApiError::Auth(format!("credential refresh failed: {other}")),
                        });
                    }
                }
                RetryDecision::Wait(delay) => {
                    if status == StatusCode::INTERNAL_SERVER_ERROR {
                        server_error_retries += 1;
                    }
                    warn!(
                        service = self.service,
                        url,
                        status = status.as_u16(),
                        delay_ms = delay.as_millis() as u64,
                        "transient failure, backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
                RetryDecision::Fail => {
                    let body_text = response.text().await.unwrap_or_default();
                    return Err(if status == StatusCode::UNAUTHORIZED {
                        ApiError::Auth("credentials rejected after refresh".into())
                    } else {
                        ApiError::Upstream {
                            status: status.as_u16(),
                            body: body_text,
                        }
                    });
                }
            }
        }
    }
}
