//! Wire and storage formats
//!
//! - [`RequestEnvelope`]: what the dispatcher publishes to a request stream.
//! - [`ResultMessage`]: what the external worker publishes to the results stream.
//! - [`ResultRecord`]: what lives in the result store under `async:result:{id}`.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::RelayError;

/// Epoch milliseconds, the timestamp unit used on every wire format
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Request published for the external worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestEnvelope {
    pub correlation_id: String,
    pub operation: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(rename = "timestamp")]
    pub issued_at: i64,
}

impl RequestEnvelope {
    pub fn new(correlation_id: impl Into<String>, operation: impl Into<String>, payload: Value) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            operation: operation.into(),
            payload,
            issued_at: now_millis(),
        }
    }
}

/// Lifecycle status of a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultStatus {
    Processing,
    Completed,
    Failed,
}

impl ResultStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ResultStatus::Processing)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ResultStatus::Processing => "processing",
            ResultStatus::Completed => "completed",
            ResultStatus::Failed => "failed",
        }
    }
}

/// Who wrote a record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultSource {
    Dispatcher,
    Listener,
}

/// Outcome message as published by the worker on the results stream.
///
/// `timestamp` must be a JSON number (epoch milliseconds) when present; anything
/// else makes the message malformed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultMessage {
    pub correlation_id: String,
    pub status: ResultStatus,
    #[serde(default)]
    pub data: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub timestamp: Option<i64>,
}

impl ResultMessage {
    /// Decode a raw message body. Empty correlation ids are rejected.
    pub fn parse(raw: &str) -> Result<Self, RelayError> {
        let message: ResultMessage = serde_json::from_str(raw)?;
        if message.correlation_id.trim().is_empty() {
            return Err(RelayError::Serialization(
                "result message has an empty correlationId".to_string(),
            ));
        }
        Ok(message)
    }

    pub fn completed(correlation_id: impl Into<String>, data: Value) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            status: ResultStatus::Completed,
            data: Some(data),
            error: None,
            timestamp: Some(now_millis()),
        }
    }

    pub fn failed(correlation_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            status: ResultStatus::Failed,
            data: None,
            error: Some(error.into()),
            timestamp: Some(now_millis()),
        }
    }

    /// Turn a terminal message into the record the listener stores.
    ///
    /// Returns `None` for `processing` messages. The producer timestamp is kept so
    /// redelivery rewrites the exact same record.
    pub fn into_record(self) -> Option<ResultRecord> {
        let produced_at = self.timestamp.unwrap_or_else(now_millis);
        match self.status {
            ResultStatus::Processing => None,
            ResultStatus::Completed => Some(ResultRecord::completed(
                self.correlation_id,
                self.data.unwrap_or(Value::Null),
                produced_at,
            )),
            ResultStatus::Failed => Some(ResultRecord::failed(
                self.correlation_id,
                self.error
                    .unwrap_or_else(|| "worker reported a failure without details".to_string()),
                produced_at,
            )),
        }
    }
}

/// Record held in the result store.
///
/// Only the constructors build records, so `data` is set exactly when the status is
/// `completed` and `error` exactly when it is `failed`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultRecord {
    correlation_id: String,
    status: ResultStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(rename = "timestamp")]
    produced_at: i64,
    source: ResultSource,
}

/// Borrowed view of a record's state
#[derive(Debug, PartialEq)]
pub enum ResultState<'a> {
    Processing,
    Completed(&'a Value),
    Failed(&'a str),
}

impl ResultRecord {
    /// Existence marker written by the dispatcher
    pub fn processing(correlation_id: impl Into<String>) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            status: ResultStatus::Processing,
            data: None,
            error: None,
            produced_at: now_millis(),
            source: ResultSource::Dispatcher,
        }
    }

    pub fn completed(correlation_id: impl Into<String>, data: Value, produced_at: i64) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            status: ResultStatus::Completed,
            // `null` is a valid result; keep it explicit so the field is always present
            data: Some(data),
            error: None,
            produced_at,
            source: ResultSource::Listener,
        }
    }

    pub fn failed(correlation_id: impl Into<String>, error: impl Into<String>, produced_at: i64) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            status: ResultStatus::Failed,
            data: None,
            error: Some(error.into()),
            produced_at,
            source: ResultSource::Listener,
        }
    }

    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    pub fn status(&self) -> ResultStatus {
        self.status
    }

    pub fn produced_at(&self) -> i64 {
        self.produced_at
    }

    pub fn source(&self) -> ResultSource {
        self.source
    }

    pub fn state(&self) -> ResultState<'_> {
        static NULL: Value = Value::Null;
        match self.status {
            ResultStatus::Processing => ResultState::Processing,
            ResultStatus::Completed => ResultState::Completed(self.data.as_ref().unwrap_or(&NULL)),
            ResultStatus::Failed => ResultState::Failed(self.error.as_deref().unwrap_or_default()),
        }
    }

    /// Consume the record, yielding its payload or the worker's error text
    pub fn into_outcome(self) -> Option<Result<Value, String>> {
        match self.status {
            ResultStatus::Processing => None,
            ResultStatus::Completed => Some(Ok(self.data.unwrap_or(Value::Null))),
            ResultStatus::Failed => Some(Err(self.error.unwrap_or_default())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_envelope_wire_names() {
        let envelope = RequestEnvelope::new("r-1", "get-all-people", Value::Null);
        let json = serde_json::to_value(&envelope).unwrap();

        assert_eq!(json["correlationId"], "r-1");
        assert_eq!(json["operation"], "get-all-people");
        assert!(json["payload"].is_null());
        assert!(json["timestamp"].as_i64().unwrap() > 0);
    }

    #[test]
    fn test_parse_completed_message() {
        let raw = r#"{"correlationId":"r-1","status":"completed","data":[{"name":"Alice"}],"timestamp":1700000000000}"#;
        let message = ResultMessage::parse(raw).unwrap();
        let record = message.into_record().unwrap();

        assert_eq!(record.status(), ResultStatus::Completed);
        assert_eq!(record.produced_at(), 1_700_000_000_000);
        assert_eq!(record.source(), ResultSource::Listener);
        assert_eq!(record.state(), ResultState::Completed(&json!([{"name": "Alice"}])));
    }

    #[test]
    fn test_processing_message_yields_no_record() {
        let raw = r#"{"correlationId":"r-1","status":"processing"}"#;
        assert!(ResultMessage::parse(raw).unwrap().into_record().is_none());
    }

    #[test]
    fn test_failed_without_error_text_gets_placeholder() {
        let raw = r#"{"correlationId":"r-1","status":"failed"}"#;
        let record = ResultMessage::parse(raw).unwrap().into_record().unwrap();
        assert!(matches!(record.state(), ResultState::Failed(text) if !text.is_empty()));
    }

    #[test]
    fn test_completed_with_null_data_is_kept() {
        let record = ResultRecord::completed("r-1", Value::Null, 1);
        let stored = serde_json::to_string(&record).unwrap();
        let restored: ResultRecord = serde_json::from_str(&stored).unwrap();

        assert_eq!(restored.state(), ResultState::Completed(&Value::Null));
        assert_eq!(restored.into_outcome(), Some(Ok(Value::Null)));
    }

    #[test]
    fn test_malformed_messages_are_rejected() {
        assert!(ResultMessage::parse("not json").is_err());
        assert!(ResultMessage::parse(r#"{"status":"completed"}"#).is_err());
        assert!(ResultMessage::parse(r#"{"correlationId":"  ","status":"completed"}"#).is_err());
        assert!(ResultMessage::parse(r#"{"correlationId":"r","status":"done"}"#).is_err());
        assert!(
            ResultMessage::parse(r#"{"correlationId":"r","status":"failed","timestamp":"yesterday"}"#)
                .is_err()
        );
    }

    #[test]
    fn test_record_invariants() {
        let processing = ResultRecord::processing("r-1");
        assert_eq!(processing.state(), ResultState::Processing);
        assert_eq!(processing.source(), ResultSource::Dispatcher);
        assert!(processing.clone().into_outcome().is_none());

        let json = serde_json::to_value(&processing).unwrap();
        assert!(json.get("data").is_none());
        assert!(json.get("error").is_none());

        let failed = ResultRecord::failed("r-1", "boom", 5);
        let json = serde_json::to_value(&failed).unwrap();
        assert_eq!(json["status"], "failed");
        assert_eq!(json["error"], "boom");
        assert!(json.get("data").is_none());
    }
}
