//! Job normalization: turns whatever job body the recruiting backend sends into a `Job`.
//!
//! The backend has changed its job payload across product iterations (`status` vs `phase`,
//! `task_id` vs `id`, counters nested under `progress` or flattened at the top level).
//! All of that is resolved here so the tracker only ever sees the canonical shape.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::models::job::{Job, Phase, COUNTER_PROCESSED, COUNTER_TOTAL};

#[derive(Debug, Error, PartialEq)]
pub enum NormalizeError {
    #[error("job payload is not a JSON object")]
    NotAnObject,

    #[error("job payload has no id")]
    MissingId,

    #[error("job payload has no phase")]
    MissingPhase,

    #[error("unknown job phase '{0}'")]
    UnknownPhase(String),
}

const ENVELOPE_KEYS: &[&str] = &["data", "job", "task"];
const ID_KEYS: &[&str] = &["id", "job_id", "jobId", "task_id", "taskId"];
const PHASE_KEYS: &[&str] = &["phase", "status", "state"];
const COUNTER_OBJECT_KEYS: &[&str] = &["progress", "counters", "stats"];

const PROCESSED_ALIASES: &[&str] = &[
    "processed",
    "done",
    "current",
    "synced",
    "analyzed",
    "processed_count",
    "items_processed",
];
const TOTAL_ALIASES: &[&str] = &["total", "total_count", "items_total"];

/// Top-level counters some payload versions report next to the phase.
const TOP_LEVEL_COUNTERS: &[&str] = &[
    "processed",
    "processed_count",
    "total",
    "total_count",
    "synced_vacancies",
    "synced_applications",
    "analyzed_count",
    "failed_count",
];

/// Normalizes a raw job body into the canonical `Job`.
pub fn normalize_job(raw: &Value) -> Result<Job, NormalizeError> {
    let obj = unwrap_envelope(raw.as_object().ok_or(NormalizeError::NotAnObject)?);

    let id = first_present(obj, ID_KEYS)
        .and_then(id_string)
        .ok_or(NormalizeError::MissingId)?;

    let phase_raw = first_present(obj, PHASE_KEYS)
        .and_then(Value::as_str)
        .ok_or(NormalizeError::MissingPhase)?;
    let phase = parse_phase(phase_raw)?;

    Ok(Job {
        id,
        phase,
        progress_counters: collect_counters(obj),
        errors: collect_errors(obj),
        created_at: timestamp(obj, &["created_at", "createdAt"]),
        started_at: timestamp(obj, &["started_at", "startedAt"]),
        completed_at: timestamp(obj, &["completed_at", "completedAt", "finished_at", "finishedAt"]),
    })
}

/// Extracts only the job id, for submit responses that carry nothing else.
pub fn extract_job_id(raw: &Value) -> Result<String, NormalizeError> {
    let obj = unwrap_envelope(raw.as_object().ok_or(NormalizeError::NotAnObject)?);
    let obj = if first_present(obj, ID_KEYS).is_some() {
        obj
    } else {
        ENVELOPE_KEYS
            .iter()
            .find_map(|k| obj.get(*k).and_then(Value::as_object))
            .unwrap_or(obj)
    };
    first_present(obj, ID_KEYS)
        .and_then(id_string)
        .ok_or(NormalizeError::MissingId)
}

/// Maps the phase spellings seen across backend versions onto `Phase`.
pub fn parse_phase(raw: &str) -> Result<Phase, NormalizeError> {
    match raw.trim().to_lowercase().as_str() {
        "pending" | "queued" | "created" | "new" => Ok(Phase::Pending),
        "running" | "processing" | "in_progress" | "started" => Ok(Phase::Running),
        "completed" | "complete" | "done" | "success" | "succeeded" | "finished" => {
            Ok(Phase::Completed)
        }
        "failed" | "failure" | "error" | "cancelled" | "canceled" => Ok(Phase::Failed),
        other => Err(NormalizeError::UnknownPhase(other.to_string())),
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Field helpers
// ────────────────────────────────────────────────────────────────────────────

/// Descends into `{"data": {...}}`-style wrappers until the job fields are reached.
fn unwrap_envelope(obj: &Map<String, Value>) -> &Map<String, Value> {
    if first_present(obj, PHASE_KEYS).is_some() {
        return obj;
    }
    for key in ENVELOPE_KEYS {
        if let Some(inner) = obj.get(*key).and_then(Value::as_object) {
            return unwrap_envelope(inner);
        }
    }
    obj
}

fn first_present<'a>(obj: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a Value> {
    keys.iter()
        .filter_map(|k| obj.get(*k))
        .find(|v| !v.is_null())
}

fn id_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Non-negative integers, or floats that fit a `u64` (fraction truncated).
/// Anything out of range is dropped rather than saturated.
fn counter_value(value: &Value) -> Option<u64> {
    value.as_u64().or_else(|| {
        value
            .as_f64()
            .filter(|f| f.is_finite() && *f >= 0.0 && *f < u64::MAX as f64)
            .map(|f| f as u64)
    })
}

fn canonical_counter_name(name: &str) -> &str {
    if PROCESSED_ALIASES.contains(&name) {
        COUNTER_PROCESSED
    } else if TOTAL_ALIASES.contains(&name) {
        COUNTER_TOTAL
    } else {
        name
    }
}

fn collect_counters(obj: &Map<String, Value>) -> BTreeMap<String, u64> {
    let mut counters = BTreeMap::new();

    for key in TOP_LEVEL_COUNTERS {
        if let Some(v) = obj.get(*key).and_then(counter_value) {
            counters.insert(canonical_counter_name(key).to_string(), v);
        }
    }

    // Nested counters win over flattened ones; they are the newer payload shape.
    for key in COUNTER_OBJECT_KEYS {
        if let Some(nested) = obj.get(*key).and_then(Value::as_object) {
            for (name, v) in nested {
                if let Some(v) = counter_value(v) {
                    counters.insert(canonical_counter_name(name).to_string(), v);
                }
            }
        }
    }

    counters
}

fn collect_errors(obj: &Map<String, Value>) -> Vec<String> {
    let mut errors: Vec<String> = match obj.get("errors") {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|item| match item {
                Value::String(s) => Some(s.clone()),
                Value::Object(o) => o
                    .get("message")
                    .and_then(Value::as_str)
                    .map(str::to_string),
                _ => None,
            })
            .collect(),
        Some(Value::String(s)) => vec![s.clone()],
        _ => vec![],
    };

    for key in ["error", "error_message"] {
        if let Some(msg) = obj.get(key).and_then(Value::as_str) {
            if !msg.is_empty() && !errors.iter().any(|e| e == msg) {
                errors.push(msg.to_string());
            }
        }
    }

    errors
}

fn timestamp(obj: &Map<String, Value>, keys: &[&str]) -> Option<DateTime<Utc>> {
    first_present(obj, keys)
        .and_then(Value::as_str)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}
