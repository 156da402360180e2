//! Inbound report wire format and error-payload normalization.
//!
//! Reports come from independent, retrying external callers. The success
//! shape is stable, but failure payloads are whatever the failing component
//! happened to serialize: a bare string, a structured object, or an
//! arbitrarily nested shape. Everything here is written to accept, never to
//! reject, beyond the two genuinely required fields.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use muster_core::SubtaskId;

/// Success callback payload from the external task engine.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SuccessReport {
    pub job_id: String,
    pub subtask_id: SubtaskId,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
    /// Result content (chart image reference, analysis text, ...). Carried
    /// opportunistically; never inspected here.
    #[serde(default)]
    pub data: JsonValue,
    #[serde(default)]
    pub metadata: JsonValue,
}

/// Failure callback payload. Only `job_id` and `error` are required; a
/// report may name one subtask, several, or none at all.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureReport {
    pub job_id: String,
    pub error: RawError,
    #[serde(default)]
    pub subtask_id: Option<SubtaskId>,
    #[serde(default)]
    pub subtask_ids: Vec<SubtaskId>,
    #[serde(default)]
    pub retry_count: Option<u32>,
    #[serde(default)]
    pub component: Option<String>,
    #[serde(default)]
    pub workflow_id: Option<String>,
    #[serde(default)]
    pub execution_id: Option<String>,
}

impl FailureReport {
    /// Union of the single- and multi-subtask forms, de-duplicated, order
    /// preserved.
    pub fn affected_subtasks(&self) -> Vec<SubtaskId> {
        let mut affected = Vec::new();
        let candidates = self.subtask_id.iter().chain(self.subtask_ids.iter());
        for id in candidates {
            if !affected.contains(id) {
                affected.push(id.clone());
            }
        }
        affected
    }
}

/// Failure payload as received off the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawError {
    Text(String),
    Shape(JsonValue),
}

/// Fixed normalized form of a failure payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorSummary {
    pub message: String,
    pub code: Option<String>,
    pub kind: Option<String>,
}

/// Normalize an arbitrary failure payload into a fixed summary.
///
/// Prioritized fallbacks: message from `message`, `error`, `description`,
/// then the whole value serialized; code from `code`, then `status`; kind
/// from `name`, then `type`. Nested objects under any message key are
/// searched with the same priorities. Never fails, whatever the shape.
pub fn normalize_error(raw: &RawError) -> ErrorSummary {
    match raw {
        RawError::Text(text) => {
            let trimmed = text.trim();
            let message = if trimmed.is_empty() {
                "unknown error".to_string()
            } else {
                trimmed.to_string()
            };
            ErrorSummary {
                message,
                code: None,
                kind: None,
            }
        }
        RawError::Shape(value) => ErrorSummary {
            message: extract_message(value, &["message", "error", "description"])
                .unwrap_or_else(|| stringify_whole(value)),
            code: extract_scalar(value, &["code", "status"]),
            kind: extract_string(value, &["name", "type"]),
        },
    }
}

fn extract_message(value: &JsonValue, keys: &[&str]) -> Option<String> {
    let object = value.as_object()?;
    for key in keys {
        match object.get(*key) {
            Some(JsonValue::String(s)) if !s.trim().is_empty() => {
                return Some(s.trim().to_string());
            }
            Some(nested @ JsonValue::Object(_)) => {
                if let Some(message) = extract_message(nested, keys) {
                    return Some(message);
                }
            }
            _ => {}
        }
    }
    None
}

fn extract_string(value: &JsonValue, keys: &[&str]) -> Option<String> {
    let object = value.as_object()?;
    for key in keys {
        if let Some(JsonValue::String(s)) = object.get(*key) {
            if !s.trim().is_empty() {
                return Some(s.trim().to_string());
            }
        }
    }
    None
}

fn extract_scalar(value: &JsonValue, keys: &[&str]) -> Option<String> {
    let object = value.as_object()?;
    for key in keys {
        match object.get(*key) {
            Some(JsonValue::String(s)) if !s.trim().is_empty() => {
                return Some(s.trim().to_string());
            }
            Some(JsonValue::Number(n)) => return Some(n.to_string()),
            _ => {}
        }
    }
    None
}

fn stringify_whole(value: &JsonValue) -> String {
    let rendered =
        serde_json::to_string(value).unwrap_or_else(|_| "unrecognized error payload".to_string());
    if rendered.trim().is_empty() {
        "unknown error".to_string()
    } else {
        rendered
    }
}
