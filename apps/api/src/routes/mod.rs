pub mod health;

use axum::{
    routing::{get, post},
    Router,
};

use crate::jobs::handlers;
use crate::state::AppState;

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health_handler))
        // Job tracking
        .route("/api/v1/jobs", post(handlers::handle_start_job))
        .route(
            "/api/v1/jobs/current",
            get(handlers::handle_current_job).delete(handlers::handle_clear_job),
        )
        .route(
            "/api/v1/jobs/current/stop",
            post(handlers::handle_stop_job),
        )
        .route(
            "/api/v1/jobs/current/resume",
            post(handlers::handle_resume_job),
        )
        // Client signals
        .route("/api/v1/visibility", post(handlers::handle_visibility))
        .route("/api/v1/session", get(handlers::handle_session))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::jobs::store::MemorySnapshotStore;
    use crate::jobs::tracker::JobTracker;
    use crate::models::job::{Job, JobKind, Phase};
    use crate::remote::auth::AuthSession;
    use crate::remote::{JobService, RemoteError};
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use serde_json::{json, Value};
    use std::collections::BTreeMap;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tower::ServiceExt;

    #[derive(Default)]
    struct FakeJobs {
        submitted: Mutex<Vec<(JobKind, Value)>>,
        reject_auth: bool,
    }

    #[async_trait]
    impl JobService for FakeJobs {
        async fn submit(&self, kind: JobKind, parameters: &Value) -> Result<String, RemoteError> {
            if self.reject_auth {
                return Err(RemoteError::Unauthorized);
            }
            self.submitted.lock().unwrap().push((kind, parameters.clone()));
            Ok("job-77".to_string())
        }

        async fn get_status(&self, job_id: &str) -> Result<Job, RemoteError> {
            Ok(Job {
                id: job_id.to_string(),
                phase: Phase::Running,
                progress_counters: BTreeMap::from([
                    ("processed".to_string(), 5),
                    ("total".to_string(), 20),
                ]),
                errors: vec![],
                created_at: None,
                started_at: None,
                completed_at: None,
            })
        }
    }

    fn test_config() -> Config {
        Config {
            remote_api_url: "http://backend.invalid".to_string(),
            remote_email: None,
            remote_password: None,
            remote_token: None,
            remote_refresh_token: None,
            redis_url: None,
            poll_interval: Duration::from_millis(2_000),
            poll_timeout: Duration::from_millis(300_000),
            snapshot_ttl: Duration::from_secs(60),
            http_timeout: Duration::from_secs(5),
            port: 0,
            rust_log: "info".to_string(),
        }
    }

    fn app_with(jobs: Arc<FakeJobs>) -> (Router, AppState) {
        let config = test_config();
        let tracker = JobTracker::new(
            jobs.clone(),
            Arc::new(MemorySnapshotStore::new()),
            config.snapshot_ttl,
        );
        let auth = Arc::new(AuthSession::new(
            reqwest::Client::new(),
            config.remote_api_url.clone(),
        ));
        let state = AppState {
            config,
            jobs,
            auth,
            tracker,
        };
        (build_router(state.clone()), state)
    }

    async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(match body {
                Some(b) => Body::from(b.to_string()),
                None => Body::empty(),
            })
            .unwrap();

        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    #[tokio::test]
    async fn test_health() {
        let (app, _) = app_with(Arc::new(FakeJobs::default()));
        let (status, body) = send(&app, "GET", "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn test_start_job_submits_and_tracks() {
        let jobs = Arc::new(FakeJobs::default());
        let (app, state) = app_with(jobs.clone());

        let (status, body) = send(
            &app,
            "POST",
            "/api/v1/jobs",
            Some(json!({"kind": "analysis", "parameters": {"vacancy_id": 12}})),
        )
        .await;

        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["job_id"], "job-77");
        assert_eq!(jobs.submitted.lock().unwrap()[0].0, JobKind::Analysis);
        assert!(state.tracker.is_active());

        let (status, body) = send(&app, "GET", "/api/v1/jobs/current", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["tracker"]["status"], "polling");
        assert_eq!(body["tracker"]["job_id"], "job-77");

        state.tracker.stop();
    }

    #[tokio::test]
    async fn test_start_job_defaults_parameters_to_empty_object() {
        let jobs = Arc::new(FakeJobs::default());
        let (app, state) = app_with(jobs.clone());

        let (status, _) = send(&app, "POST", "/api/v1/jobs", Some(json!({"kind": "sync"}))).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(jobs.submitted.lock().unwrap()[0].1, json!({}));
        state.tracker.stop();
    }

    #[tokio::test]
    async fn test_start_job_unauthorized() {
        let jobs = Arc::new(FakeJobs {
            reject_auth: true,
            ..FakeJobs::default()
        });
        let (app, state) = app_with(jobs);

        let (status, body) = send(&app, "POST", "/api/v1/jobs", Some(json!({"kind": "sync"}))).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"]["code"], "UNAUTHORIZED");
        assert!(!state.tracker.is_active());
    }

    #[tokio::test]
    async fn test_stop_then_resume() {
        let (app, state) = app_with(Arc::new(FakeJobs::default()));
        state
            .tracker
            .start("job-1", Duration::from_secs(2), Duration::from_secs(60))
            .unwrap();

        let (status, body) = send(&app, "POST", "/api/v1/jobs/current/stop", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["tracker"]["status"], "stopped");

        let (status, body) = send(&app, "POST", "/api/v1/jobs/current/resume", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["tracker"]["status"], "polling");
        state.tracker.stop();
    }

    #[tokio::test]
    async fn test_resume_without_job_is_not_found() {
        let (app, _) = app_with(Arc::new(FakeJobs::default()));
        let (status, body) = send(&app, "POST", "/api/v1/jobs/current/resume", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"]["code"], "NOT_FOUND");
    }

    #[tokio::test]
    async fn test_clear_resets_tracker() {
        let (app, state) = app_with(Arc::new(FakeJobs::default()));
        state
            .tracker
            .start("job-1", Duration::from_secs(2), Duration::from_secs(60))
            .unwrap();

        let (status, _) = send(&app, "DELETE", "/api/v1/jobs/current", None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let (_, body) = send(&app, "GET", "/api/v1/jobs/current", None).await;
        assert_eq!(body["tracker"]["status"], "idle");
        assert!(body["tracker"]["job"].is_null());
    }

    #[tokio::test]
    async fn test_visibility_and_session() {
        let (app, _) = app_with(Arc::new(FakeJobs::default()));

        let (status, _) = send(
            &app,
            "POST",
            "/api/v1/visibility",
            Some(json!({"visible": false})),
        )
        .await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let (status, body) = send(&app, "GET", "/api/v1/session", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "anonymous");
    }
}
