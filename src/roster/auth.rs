//! Roster service credential handshake.
//!
//! [`RosterAuth`] performs the three-step handshake (resolve tenant →
//! resolve user identity → obtain bearer token) and implements
//! [`TokenSource`] so the resilient client can transparently re-run the
//! token-acquisition step on a 401. A refresh never repeats the full
//! handshake: the tenant and user identity from the first handshake are
//! reused with the cached credentials.

use std::time::Duration;

use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::http::{ApiError, TokenSource};

#[derive(Debug, Clone)]
struct Session {
    tenant_id: String,
    user_id: String,
    token: String,
}

pub struct RosterAuth {
    http: Client,
    base_url: String,
    username: String,
    password: String,
    session: Mutex<Option<Session>>,
}

#[derive(Debug, Deserialize)]
struct TenantResponse {
    tenant_id: String,
}

#[derive(Debug, Deserialize)]
struct UserResponse {
    user_id: String,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
}

impl RosterAuth {
    pub fn new(
        base_url: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        let http = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(30))
            .build()
            .expect("failed to build HTTP client");
        let base_url = base_url.into();
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            username: username.into(),
            password: password.into(),
            session: Mutex::new(None),
        }
    }

    /// Run the full handshake and store the resulting session.
    pub async fn authenticate(&self) -> Result<(), ApiError> {
        let tenant_id = self.resolve_tenant().await?;
        let user_id = self.resolve_user(&tenant_id).await?;
        let token = self.obtain_token(&tenant_id, &user_id).await?;
        info!(tenant = %tenant_id, "roster authentication complete");
        *self.session.lock().await = Some(Session {
            tenant_id,
            user_id,
            token,
        });
        Ok(())
    }

    /// Run the handshake only if no session exists yet.
    pub async fn ensure_authenticated(&self) -> Result<(), ApiError> {
        if self.session.lock().await.is_some() {
            return Ok(());
        }
        self.authenticate().await
    }

    async fn resolve_tenant(&self) -> Result<String, ApiError> {
        let url = format!("{}/api/v1/auth/tenant", self.base_url);
        let response = self
            .http
            .get(&url)
            .query(&[("login", self.username.as_str())])
            .send()
            .await
            .map_err(network)?;
        match response.status() {
            StatusCode::NOT_FOUND => Err(ApiError::Auth(format!(
                "no tenant registered for login {}",
                self.username
            ))),
            status if status.is_success() => {
                let body: TenantResponse = response.json().await.map_err(decode)?;
                Ok(body.tenant_id)
            }
            _ => Err(upstream(response).await),
        }
    }

    async fn resolve_user(&self, tenant_id: &str) -> Result<String, ApiError> {
        let url = format!("{}/api/v1/tenants/{tenant_id}/users", self.base_url);
        let response = self
            .http
            .get(&url)
            .query(&[("login", self.username.as_str())])
            .send()
            .await
            .map_err(network)?;
        match response.status() {
            StatusCode::NOT_FOUND => Err(ApiError::Auth(format!(
                "login {} is not a member of tenant {tenant_id}",
                self.username
            ))),
            status if status.is_success() => {
                let body: UserResponse = response.json().await.map_err(decode)?;
                Ok(body.user_id)
            }
            _ => Err(upstream(response).await),
        }
    }

    async fn obtain_token(&self, tenant_id: &str, user_id: &str) -> Result<String, ApiError> {
        let url = format!("{}/api/v1/tenants/{tenant_id}/auth/token", self.base_url);
        let response = self
            .http
            .post(&url)
            .json(&json!({ "user_id": user_id, "password": self.password }))
            .send()
            .await
            .map_err(network)?;
        match response.status() {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN | StatusCode::NOT_FOUND => {
                Err(ApiError::Auth("roster credentials rejected".into()))
            }
            status if status.is_success() => {
                let body: TokenResponse = response.json().await.map_err(decode)?;
                Ok(body.access_token)
            }
            _ => Err(upstream(response).await),
        }
    }
}

impl TokenSource for RosterAuth {
    async fn bearer(&self) -> Option<String> {
        self.session.lock().await.as_ref().map(|s| s.token.clone())
    }

    async fn refresh(&self) -> Result<(), ApiError> {
        let mut guard = self.session.lock().await;
        let Some(session) = guard.as_mut() else {
            return Err(ApiError::Auth("token refresh requested before authentication".into()));
        };
        let token = self.obtain_token(&session.tenant_id, &session.user_id).await?;
        debug!("roster token refreshed");
        session.token = token;
        Ok(())
    }
}

fn network(e: reqwest::Error) -> ApiError {
    ApiError::Network(e.to_string())
}

fn decode(e: reqwest::Error) -> ApiError {
    ApiError::Decode(e.to_string())
}

async fn upstream(response: reqwest::Response) -> ApiError {
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    ApiError::Upstream { status, body }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    async fn mount_handshake(server: &MockServer) {
        Mock::given(method("GET"))
            .and(path("/api/v1/auth/tenant"))
            .and(query_param("login", "frontdesk"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"tenant_id": "t-1"})))
            .mount(server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/v1/tenants/t-1/users"))
            .and(query_param("login", "frontdesk"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"user_id": "u-9"})))
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn handshake_resolves_tenant_user_and_token() {
        let server = MockServer::start().await;
        mount_handshake(&server).await;
        Mock::given(method("POST"))
            .and(path("/api/v1/tenants/t-1/auth/token"))
            .and(body_partial_json(json!({"user_id": "u-9", "password": "hunter2"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"access_token": "tok-a"})))
            .expect(1)
            .mount(&server)
            .await;

        let auth = RosterAuth::new(server.uri(), "frontdesk", "hunter2");
        auth.authenticate().await.unwrap();
        assert_eq!(auth.bearer().await, Some("tok-a".into()));
    }

    #[tokio::test]
    async fn unknown_tenant_is_an_auth_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/auth/tenant"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let auth = RosterAuth::new(server.uri(), "nobody", "pw");
        let err = auth.authenticate().await.unwrap_err();
        assert!(matches!(err, ApiError::Auth(_)), "got {err:?}");
    }

    #[tokio::test]
    async fn rejected_password_is_an_auth_error() {
        let server = MockServer::start().await;
        mount_handshake(&server).await;
        Mock::given(method("POST"))
            .and(path("/api/v1/tenants/t-1/auth/token"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let auth = RosterAuth::new(server.uri(), "frontdesk", "wrong");
        let err = auth.authenticate().await.unwrap_err();
        assert!(matches!(err, ApiError::Auth(_)), "got {err:?}");
    }

    #[tokio::test]
    async fn refresh_reruns_only_the_token_step() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/auth/tenant"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"tenant_id": "t-1"})))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/v1/tenants/t-1/users"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"user_id": "u-9"})))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/v1/tenants/t-1/auth/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"access_token": "tok-b"})))
            .expect(2) // handshake, then one refresh
            .mount(&server)
            .await;

        let auth = RosterAuth::new(server.uri(), "frontdesk", "hunter2");
        auth.authenticate().await.unwrap();
        auth.refresh().await.unwrap();
        assert_eq!(auth.bearer().await, Some("tok-b".into()));
        // wiremock verifies on drop that tenant and user resolution ran once.
    }

    #[tokio::test]
    async fn refresh_before_authentication_fails() {
        let auth = RosterAuth::new("http://localhost:9", "frontdesk", "pw");
        let err = auth.refresh().await.unwrap_err();
        assert!(matches!(err, ApiError::Auth(_)), "got {err:?}");
        assert_eq!(auth.bearer().await, None);
    }

    #[tokio::test]
    async fn ensure_authenticated_is_idempotent() {
        let server = MockServer::start().await;
        mount_handshake(&server).await;
        Mock::given(method("POST"))
            .and(path("/api/v1/tenants/t-1/auth/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"access_token": "tok-a"})))
            .expect(1)
            .mount(&server)
            .await;

        let auth = RosterAuth::new(server.uri(), "frontdesk", "hunter2");
        auth.ensure_authenticated().await.unwrap();
        auth.ensure_authenticated().await.unwrap();
    }
}
