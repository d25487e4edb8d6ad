//! Delivery event records
//!
//! One record is emitted per terminal transaction state and consumed by
//! the external logging/stats collaborator. Records go to the tracing
//! subscriber and, best effort, as JSON lines to `logs/relay.jsonl`.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::PathBuf;
use uuid::Uuid;

use crate::error::Reason;

/// Event severity tag, matching the level field on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EventLevel {
    #[serde(rename = "deliver.ok")]
    Ok,
    #[serde(rename = "deliver.err")]
    Err,
    #[serde(rename = "deliver.warn")]
    Warn,
}

/// Immutable record of one terminal transaction state
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryEvent {
    pub ts: DateTime<Utc>,
    pub level: EventLevel,
    pub msg_id: Uuid,
    pub tenant: String,
    pub from: String,
    pub rcpt_count: usize,
    /// Comma-joined recipient list
    pub rcpts: String,
    #[serde(rename = "sizeKB")]
    pub size_kb: u64,
    #[serde(rename = "remoteIP")]
    pub remote_ip: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delivery_method: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<Reason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Sink for delivery events
///
/// File writes never fail the transaction that produced the event.
#[derive(Debug, Clone)]
pub struct EventLog {
    path: Option<PathBuf>,
}

impl EventLog {
    pub fn new(path: PathBuf) -> Self {
        Self { path: Some(path) }
    }

    /// Tracing-only sink, used in tests and when no log dir is wanted.
    pub fn disabled() -> Self {
        Self { path: None }
    }

    pub fn emit(&self, event: &DeliveryEvent) {
        match event.level {
            EventLevel::Ok => tracing::info!(
                msg_id = %event.msg_id,
                tenant = %event.tenant,
                from = %event.from,
                rcpt_count = event.rcpt_count,
                rcpts = %event.rcpts,
                size_kb = event.size_kb,
                remote_ip = %event.remote_ip,
                method = event.delivery_method,
                "deliver.ok"
            ),
            EventLevel::Warn => tracing::warn!(
                msg_id = %event.msg_id,
                tenant = %event.tenant,
                rcpts = %event.rcpts,
                remote_ip = %event.remote_ip,
                reason = event.reason.map(|r| r.as_str()),
                "deliver.warn"
            ),
            EventLevel::Err => tracing::error!(
                msg_id = %event.msg_id,
                tenant = %event.tenant,
                from = %event.from,
                rcpts = %event.rcpts,
                remote_ip = %event.remote_ip,
                reason = event.reason.map(|r| r.as_str()),
                error = event.error.as_deref(),
                "deliver.err"
            ),
        }
        self.append(event);
    }

    fn append(&self, event: &DeliveryEvent) {
        let Some(path) = &self.path else {
            return;
        };
        let Ok(line) = serde_json::to_string(event) else {
            return;
        };
        if let Some(dir) = path.parent() {
            let _ = std::fs::create_dir_all(dir);
        }
        use std::io::Write;
        if let Ok(mut file) = std::fs::OpenOptions::new().create(true).append(true).open(path) {
            let _ = writeln!(file, "{line}");
        }
    }
}
