//! Advisory progress figures for display. Nothing here feeds back into tracking:
//! a job at 100% keeps being polled until the service reports a terminal phase.

use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

use crate::jobs::tracker::TrackerState;

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ProgressView {
    /// 0–100, capped; `None` until both counters are known.
    pub percent: Option<u8>,
    pub processed: Option<u64>,
    pub total: Option<u64>,
    pub elapsed_ms: Option<u64>,
    /// Linear estimate of the time left; `None` without progress to extrapolate from.
    pub eta_ms: Option<u64>,
}

impl ProgressView {
    pub fn from_state(state: &TrackerState, now: Instant) -> Self {
        let counters = state.job.as_ref().and_then(|j| j.processed_of_total());
        let elapsed = state
            .started_at
            .map(|started| state.finished_at.unwrap_or(now).saturating_duration_since(started));

        let (processed, total) = match counters {
            Some((p, t)) => (Some(p), Some(t)),
            None => (None, None),
        };

        Self {
            percent: counters.map(|(p, t)| percent(p, t)),
            processed,
            total,
            elapsed_ms: elapsed.map(|e| e.as_millis() as u64),
            eta_ms: match (counters, elapsed, state.status.is_final()) {
                (Some((p, t)), Some(e), false) => estimate_remaining(p, t, e),
                _ => None,
            },
        }
    }
}

fn percent(processed: u64, total: u64) -> u8 {
    if total == 0 {
        return 0;
    }
    // Widened so counters near u64::MAX cannot overflow.
    (u128::from(processed.min(total)) * 100 / u128::from(total)) as u8
}

fn estimate_remaining(processed: u64, total: u64, elapsed: Duration) -> Option<u64> {
    if processed == 0 {
        return None;
    }
    let remaining = total.saturating_sub(processed);
    let per_item_ms = elapsed.as_millis() as f64 / processed as f64;
    Some((per_item_ms * remaining as f64).round() as u64)
}
