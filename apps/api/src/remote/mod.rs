//! Remote Job Service client, the only place that talks to the recruiting backend's job API.
//!
//! Every request carries the session's bearer token. A 401 triggers exactly one token
//! refresh and one retry of the same request; a second rejection invalidates the session.
//! No other retry or backoff happens here: the tracker decides what a failed poll means.

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use crate::jobs::normalize::{extract_job_id, normalize_job, NormalizeError};
use crate::models::job::{Job, JobKind};

pub mod auth;

use auth::AuthSession;

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error (status {status}): {message}")]
    Api { status: u16, message: String },

    #[error("Unauthorized")]
    Unauthorized,

    #[error("Unexpected job payload: {0}")]
    Payload(#[from] NormalizeError),
}

/// The Remote Job Service as the tracker and handlers see it.
#[async_trait]
pub trait JobService: Send + Sync {
    /// Starts a remote job and returns its id.
    async fn submit(&self, kind: JobKind, parameters: &Value) -> Result<String, RemoteError>;

    /// Fetches the current snapshot of a job.
    async fn get_status(&self, job_id: &str) -> Result<Job, RemoteError>;
}

/// HTTP implementation over the backend's JSON API.
#[derive(Clone)]
pub struct HttpJobService {
    client: Client,
    base_url: String,
    auth: Arc<AuthSession>,
}

impl HttpJobService {
    pub fn new(client: Client, base_url: impl Into<String>, auth: Arc<AuthSession>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            auth,
        }
    }

    fn submit_url(&self, kind: JobKind) -> String {
        match kind {
            JobKind::Sync => format!("{}/api/v1/sync/start", self.base_url),
            JobKind::Analysis => format!("{}/api/v1/analysis/bulk", self.base_url),
        }
    }

    fn status_url(&self, job_id: &str) -> String {
        format!("{}/api/v1/jobs/{}", self.base_url, job_id)
    }

    /// Sends a request with the bearer token, refreshing and retrying once on 401.
    async fn send_authorized<F>(&self, build: F) -> Result<Response, RemoteError>
    where
        F: Fn(&Client) -> RequestBuilder + Send + Sync,
    {
        let token = self.auth.access_token().ok_or(RemoteError::Unauthorized)?;
        let response = build(&self.client).bearer_auth(&token).send().await?;
        if response.status().as_u16() != 401 {
            return Ok(response);
        }

        warn!("Backend rejected access token, refreshing");
        let fresh = match self.auth.refresh(&token).await {
            Ok(fresh) => fresh,
            Err(e) => {
                warn!("Token refresh failed: {e}");
                self.auth.invalidate();
                return Err(RemoteError::Unauthorized);
            }
        };

        let retry = build(&self.client).bearer_auth(&fresh).send().await?;
        if retry.status().as_u16() == 401 {
            self.auth.invalidate();
            return Err(RemoteError::Unauthorized);
        }
        Ok(retry)
    }
}

#[async_trait]
impl JobService for HttpJobService {
    async fn submit(&self, kind: JobKind, parameters: &Value) -> Result<String, RemoteError> {
        let url = self.submit_url(kind);
        let response = self
            .send_authorized(|client| client.post(&url).json(parameters))
            .await?;
        let body = read_json(response).await?;
        let job_id = extract_job_id(&body)?;
        debug!("Submitted {kind:?} job {job_id}");
        Ok(job_id)
    }

    async fn get_status(&self, job_id: &str) -> Result<Job, RemoteError> {
        let url = self.status_url(job_id);
        let response = self.send_authorized(|client| client.get(&url)).await?;
        let body = read_json(response).await?;
        Ok(normalize_job(&body)?)
    }
}

async fn read_json(response: Response) -> Result<Value, RemoteError> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(RemoteError::Api {
            status: status.as_u16(),
            message: body,
        });
    }
    Ok(response.json().await?)
}
