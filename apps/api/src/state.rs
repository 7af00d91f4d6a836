use std::sync::Arc;

use crate::config::Config;
use crate::jobs::tracker::JobTracker;
use crate::remote::auth::AuthSession;
use crate::remote::JobService;

/// Shared application state injected into all route handlers via Axum extractors.
#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    /// Remote Job Service. `HttpJobService` in production.
    pub jobs: Arc<dyn JobService>,
    pub auth: Arc<AuthSession>,
    /// The one tracker this process drives; handlers share it rather than owning their own.
    pub tracker: JobTracker,
}
