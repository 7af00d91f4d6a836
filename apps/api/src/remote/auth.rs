//! Authentication session for the recruiting backend.
//!
//! Holds the bearer/refresh token pair, performs login and refresh, and publishes the
//! session status so the presentation layer can force re-authentication once the
//! session is gone.

use std::sync::RwLock;

use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Mutex};
use tracing::{info, warn};

use super::RemoteError;

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// No credential has been issued yet.
    Anonymous,
    Active,
    /// Refresh failed; the user has to log in again.
    Expired,
}

#[derive(Debug, Clone)]
struct Tokens {
    access: String,
    refresh: Option<String>,
}

#[derive(Debug, Serialize)]
struct LoginRequest<'a> {
    email: &'a str,
    password: &'a str,
}

#[derive(Debug, Serialize)]
struct RefreshRequest<'a> {
    refresh_token: &'a str,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(alias = "access", alias = "token")]
    access_token: String,
    #[serde(default, alias = "refresh")]
    refresh_token: Option<String>,
}

pub struct AuthSession {
    client: Client,
    base_url: String,
    tokens: RwLock<Option<Tokens>>,
    status_tx: watch::Sender<SessionStatus>,
    // One refresh at a time; concurrent 401s share the result.
    refresh_lock: Mutex<()>,
}

impl AuthSession {
    pub fn new(client: Client, base_url: impl Into<String>) -> Self {
        let (status_tx, _) = watch::channel(SessionStatus::Anonymous);
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            tokens: RwLock::new(None),
            status_tx,
            refresh_lock: Mutex::new(()),
        }
    }

    /// Installs pre-issued tokens (e.g. from configuration) and marks the session active.
    pub fn set_tokens(&self, access: String, refresh: Option<String>) {
        self.store_tokens(Some(Tokens { access, refresh }));
        self.status_tx.send_replace(SessionStatus::Active);
    }

    pub fn access_token(&self) -> Option<String> {
        match self.tokens.read() {
            Ok(guard) => guard.as_ref().map(|t| t.access.clone()),
            Err(e) => {
                tracing::error!("RwLock poisoned reading tokens: {e}");
                None
            }
        }
    }

    pub fn status(&self) -> SessionStatus {
        *self.status_tx.borrow()
    }

    pub fn watch_status(&self) -> watch::Receiver<SessionStatus> {
        self.status_tx.subscribe()
    }

    /// POST /api/v1/auth/login
    pub async fn login(&self, email: &str, password: &str) -> Result<(), RemoteError> {
        let response = self
            .client
            .post(format!("{}/api/v1/auth/login", self.base_url))
            .json(&LoginRequest { email, password })
            .send()
            .await?;

        let tokens = read_token_response(response).await?;
        self.set_tokens(tokens.access_token, tokens.refresh_token);
        info!("Logged in to recruiting backend as {email}");
        Ok(())
    }

    /// Renews the access token once. `stale` is the token that was rejected: if another
    /// caller already replaced it, the newer token is returned without a second refresh.
    pub async fn refresh(&self, stale: &str) -> Result<String, RemoteError> {
        let _guard = self.refresh_lock.lock().await;

        let current = self.current_tokens().ok_or(RemoteError::Unauthorized)?;
        if current.access != stale {
            return Ok(current.access);
        }
        let refresh_token = current.refresh.ok_or(RemoteError::Unauthorized)?;

        let response = self
            .client
            .post(format!("{}/api/v1/auth/refresh", self.base_url))
            .json(&RefreshRequest {
                refresh_token: &refresh_token,
            })
            .send()
            .await?;

        let tokens = read_token_response(response).await?;
        let access = tokens.access_token.clone();
        self.store_tokens(Some(Tokens {
            access: tokens.access_token,
            // Backends that do not rotate refresh tokens omit the field.
            refresh: tokens.refresh_token.or(Some(refresh_token)),
        }));
        info!("Access token refreshed");
        Ok(access)
    }

    /// Drops the credential and flags the session for re-authentication.
    pub fn invalidate(&self) {
        self.store_tokens(None);
        if self.status_tx.send_replace(SessionStatus::Expired) != SessionStatus::Expired {
            warn!("Session expired; re-authentication required");
        }
    }

    fn current_tokens(&self) -> Option<Tokens> {
        match self.tokens.read() {
            Ok(guard) => guard.clone(),
            Err(e) => {
                tracing::error!("RwLock poisoned reading tokens: {e}");
                None
            }
        }
    }

    fn store_tokens(&self, tokens: Option<Tokens>) {
        match self.tokens.write() {
            Ok(mut guard) => *guard = tokens,
            Err(e) => tracing::error!("RwLock poisoned writing tokens: {e}"),
        }
    }
}

async fn read_token_response(response: reqwest::Response) -> Result<TokenResponse, RemoteError> {
    let status = response.status();
    if status.as_u16() == 401 {
        return Err(RemoteError::Unauthorized);
    }
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(RemoteError::Api {
            status: status.as_u16(),
            message: body,
        });
    }
    Ok(response.json().await?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{extract::State, http::StatusCode, routing::post, Json, Router};
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Login hands out `a-1`/`r-1`; refresh never rotates the refresh token.
    #[derive(Default)]
    struct AuthBackend {
        refreshes: AtomicUsize,
    }

    async fn login_handler(Json(body): Json<Value>) -> Result<Json<Value>, StatusCode> {
        if body["email"] == "hr@example.com" && body["password"] == "secret" {
            Ok(Json(json!({"access_token": "a-1", "refresh_token": "r-1"})))
        } else {
            Err(StatusCode::UNAUTHORIZED)
        }
    }

    async fn refresh_handler(
        State(backend): State<Arc<AuthBackend>>,
        Json(body): Json<Value>,
    ) -> Result<Json<Value>, StatusCode> {
        if body["refresh_token"] != "r-1" {
            return Err(StatusCode::UNAUTHORIZED);
        }
        let n = backend.refreshes.fetch_add(1, Ordering::SeqCst) + 2;
        Ok(Json(json!({"access": format!("a-{n}")})))
    }

    async fn spawn_backend() -> (String, Arc<AuthBackend>) {
        let backend = Arc::new(AuthBackend::default());
        let app = Router::new()
            .route("/api/v1/auth/login", post(login_handler))
            .route("/api/v1/auth/refresh", post(refresh_handler))
            .with_state(backend.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{addr}"), backend)
    }

    #[tokio::test]
    async fn test_login_activates_session() {
        let (url, _) = spawn_backend().await;
        let auth = AuthSession::new(Client::new(), url.as_str());
        assert_eq!(auth.status(), SessionStatus::Anonymous);

        auth.login("hr@example.com", "secret").await.unwrap();
        assert_eq!(auth.status(), SessionStatus::Active);
        assert_eq!(auth.access_token().as_deref(), Some("a-1"));
    }

    #[tokio::test]
    async fn test_rejected_login_leaves_session_anonymous() {
        let (url, _) = spawn_backend().await;
        let auth = AuthSession::new(Client::new(), url.as_str());

        let err = auth.login("hr@example.com", "wrong").await.unwrap_err();
        assert!(matches!(err, RemoteError::Unauthorized));
        assert_eq!(auth.status(), SessionStatus::Anonymous);
        assert!(auth.access_token().is_none());
    }

    #[tokio::test]
    async fn test_refresh_keeps_refresh_token_when_not_rotated() {
        let (url, backend) = spawn_backend().await;
        let auth = AuthSession::new(Client::new(), url.as_str());
        auth.login("hr@example.com", "secret").await.unwrap();

        assert_eq!(auth.refresh("a-1").await.unwrap(), "a-2");
        // Only works if r-1 was kept after the first refresh.
        assert_eq!(auth.refresh("a-2").await.unwrap(), "a-3");
        assert_eq!(backend.refreshes.load(Ordering::SeqCst), 2);
        assert_eq!(auth.status(), SessionStatus::Active);
    }

    #[tokio::test]
    async fn test_refresh_with_outdated_stale_token_reuses_current() {
        let (url, backend) = spawn_backend().await;
        let auth = AuthSession::new(Client::new(), url.as_str());
        auth.set_tokens("a-5".to_string(), Some("r-1".to_string()));

        assert_eq!(auth.refresh("a-4").await.unwrap(), "a-5");
        assert_eq!(backend.refreshes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_refresh_without_refresh_token_is_unauthorized() {
        let (url, backend) = spawn_backend().await;
        let auth = AuthSession::new(Client::new(), url.as_str());
        auth.set_tokens("a-1".to_string(), None);

        let err = auth.refresh("a-1").await.unwrap_err();
        assert!(matches!(err, RemoteError::Unauthorized));
        assert_eq!(backend.refreshes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_invalidate_expires_session() {
        let (url, _) = spawn_backend().await;
        let auth = AuthSession::new(Client::new(), url.as_str());
        auth.set_tokens("a-1".to_string(), Some("r-1".to_string()));
        let mut status = auth.watch_status();

        auth.invalidate();
        assert!(status.has_changed().unwrap());
        assert_eq!(*status.borrow_and_update(), SessionStatus::Expired);
        assert!(auth.access_token().is_none());
    }
}
