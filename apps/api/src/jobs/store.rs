//! Session mirror for the tracked job.
//!
//! The last-known job is written under a single fixed key on every snapshot update so a
//! restarted process (or a reloaded client) can pick tracking back up. Terminal jobs are
//! written with a short expiry; explicit clears delete the key.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use redis::Client as RedisClient;
use thiserror::Error;
use tokio::time::Instant;

use crate::models::job::Job;

pub const TRACKED_JOB_KEY: &str = "recruit:tracked_job";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Overwrites the mirrored job. `ttl = None` keeps it until the next write or clear.
    async fn save(&self, job: &Job, ttl: Option<Duration>) -> Result<(), StoreError>;

    async fn load(&self) -> Result<Option<Job>, StoreError>;

    async fn clear(&self) -> Result<(), StoreError>;
}

// ────────────────────────────────────────────────────────────────────────────
// In-memory store (default when REDIS_URL is unset)
// ────────────────────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct MemorySnapshotStore {
    slot: Mutex<Option<(Job, Option<Instant>)>>,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SnapshotStore for MemorySnapshotStore {
    async fn save(&self, job: &Job, ttl: Option<Duration>) -> Result<(), StoreError> {
        let expires_at = ttl.map(|ttl| Instant::now() + ttl);
        match self.slot.lock() {
            Ok(mut slot) => *slot = Some((job.clone(), expires_at)),
            Err(e) => tracing::error!("Mutex poisoned writing snapshot slot: {e}"),
        }
        Ok(())
    }

    async fn load(&self) -> Result<Option<Job>, StoreError> {
        let mut slot = match self.slot.lock() {
            Ok(slot) => slot,
            Err(e) => {
                tracing::error!("Mutex poisoned reading snapshot slot: {e}");
                return Ok(None);
            }
        };
        let expired = matches!(&*slot, Some((_, Some(at))) if Instant::now() >= *at);
        if expired {
            *slot = None;
        }
        Ok(slot.as_ref().map(|(job, _)| job.clone()))
    }

    async fn clear(&self) -> Result<(), StoreError> {
        match self.slot.lock() {
            Ok(mut slot) => *slot = None,
            Err(e) => tracing::error!("Mutex poisoned clearing snapshot slot: {e}"),
        }
        Ok(())
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Redis store
// ────────────────────────────────────────────────────────────────────────────

pub struct RedisSnapshotStore {
    client: RedisClient,
    key: String,
}

impl RedisSnapshotStore {
    pub fn new(client: RedisClient) -> Self {
        Self {
            client,
            key: TRACKED_JOB_KEY.to_string(),
        }
    }
}

#[async_trait]
impl SnapshotStore for RedisSnapshotStore {
    async fn save(&self, job: &Job, ttl: Option<Duration>) -> Result<(), StoreError> {
        let payload = serde_json::to_string(job)?;
        let mut conn = self.client.get_multiplexed_async_connection().await?;

        let mut cmd = redis::cmd("SET");
        cmd.arg(&self.key).arg(payload);
        if let Some(ttl) = ttl {
            cmd.arg("EX").arg(ttl.as_secs().max(1));
        }
        cmd.query_async::<_, ()>(&mut conn).await?;
        Ok(())
    }

    async fn load(&self) -> Result<Option<Job>, StoreError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let payload: Option<String> = redis::cmd("GET")
            .arg(&self.key)
            .query_async(&mut conn)
            .await?;

        match payload {
            Some(p) => Ok(Some(serde_json::from_str(&p)?)),
            None => Ok(None),
        }
    }

    async fn clear(&self) -> Result<(), StoreError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        redis::cmd("DEL")
            .arg(&self.key)
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }
}
