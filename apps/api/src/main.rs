mod config;
mod errors;
mod jobs;
mod models;
mod remote;
mod routes;
mod state;

use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{debug, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::Config;
use crate::jobs::store::{MemorySnapshotStore, RedisSnapshotStore, SnapshotStore};
use crate::jobs::tracker::JobTracker;
use crate::remote::auth::{AuthSession, SessionStatus};
use crate::remote::HttpJobService;
use crate::routes::build_router;
use crate::state::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration first (fails on missing required env vars)
    let config = Config::from_env()?;

    // Initialize structured logging
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(format!("{}={}", env!("CARGO_CRATE_NAME"), &config.rust_log))
        }))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Recruit API v{}", env!("CARGO_PKG_VERSION"));

    let http = reqwest::Client::builder()
        .timeout(config.http_timeout)
        .build()
        .context("Failed to build HTTP client")?;

    // Authenticate against the recruiting backend
    let auth = Arc::new(AuthSession::new(http.clone(), config.remote_api_url.clone()));
    match (&config.remote_email, &config.remote_password, &config.remote_token) {
        (Some(email), Some(password), _) => auth.login(email, password).await?,
        (_, _, Some(token)) => {
            auth.set_tokens(token.clone(), config.remote_refresh_token.clone());
            info!("Using pre-issued access token");
        }
        _ => warn!("No backend credentials configured; job requests will be rejected"),
    }

    let mut session_status = auth.watch_status();
    tokio::spawn(async move {
        while session_status.changed().await.is_ok() {
            if *session_status.borrow() == SessionStatus::Expired {
                warn!("Backend session expired; recruiter must sign in again");
            }
        }
    });

    let jobs = Arc::new(HttpJobService::new(
        http,
        config.remote_api_url.clone(),
        auth.clone(),
    ));
    info!("Remote job service at {}", config.remote_api_url);

    // Session mirror: Redis when configured, process memory otherwise
    let store: Arc<dyn SnapshotStore> = match &config.redis_url {
        Some(url) => {
            let client = redis::Client::open(url.as_str())?;
            info!("Redis snapshot store initialized");
            Arc::new(RedisSnapshotStore::new(client))
        }
        None => {
            info!("REDIS_URL not set; mirroring tracked job in memory");
            Arc::new(MemorySnapshotStore::new())
        }
    };

    let tracker = JobTracker::new(jobs.clone(), store, config.snapshot_ttl);
    let _transitions = tracker.subscribe(|state| {
        debug!(
            status = ?state.status,
            polls = state.polls,
            failed_polls = state.failed_polls,
            "Tracker state changed"
        );
    });
    if let Some(job) = tracker.restore().await {
        info!(
            "Last tracked job {} was {}; resume via /api/v1/jobs/current/resume",
            job.id,
            job.phase.as_str()
        );
    }

    // Build app state
    let state = AppState {
        config: config.clone(),
        jobs,
        auth,
        tracker,
    };

    // Build router
    let app = build_router(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive()); // TODO: restrict CORS to the recruiter UI origin

    let addr: SocketAddr = format!("0.0.0.0:{}", config.port).parse()?;
    info!("Listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
