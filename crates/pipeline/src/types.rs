//! The call envelope exchanged with the orchestrator, plus shared value types.
//!
//! Request: `{ input: {...}, state: {outputDirectory, baseDirectory,
//! transferDirectory, clientId, ...}, cache: {...} }`
//!
//! Response: `{ output: {...}, success?: bool, cache: {...} }`
//!
//! Both transports (standard input/output and the socket listener) carry this
//! same envelope.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::cache::Cache;
use crate::errors::PipelineError;

// ---------------------------------------------------------------------------
// Request
// ---------------------------------------------------------------------------

/// Execution state supplied by the orchestrator with every call.
///
/// Only used for file locations and diagnostic naming; it plays no part in
/// phase resolution.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallState {
    /// Where results and debug logs are written.
    #[serde(default)]
    pub output_directory: PathBuf,

    /// Where files shared with this party are read from.
    #[serde(default)]
    pub base_directory: PathBuf,

    /// Where files destined for the other role are written.
    #[serde(default)]
    pub transfer_directory: PathBuf,

    /// Identity of the acting party.
    #[serde(default)]
    pub client_id: String,

    /// Any further orchestrator-specific fields, kept verbatim.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// One call from the orchestrator.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CallRequest {
    /// Local role: this site's payload. Remote role: site id to previous output.
    pub input: Map<String, Value>,

    #[serde(default)]
    pub state: CallState,

    /// Empty on the first call of a run.
    #[serde(default)]
    pub cache: Cache,
}

impl CallRequest {
    /// Parses a request envelope.
    ///
    /// # Errors
    ///
    /// [`PipelineError::MalformedRequest`] if `raw` is not a valid envelope.
    pub fn from_json(raw: &str) -> Result<Self, PipelineError> {
        serde_json::from_str(raw).map_err(|e| PipelineError::MalformedRequest {
            message: e.to_string(),
        })
    }

    /// Converts an already-parsed JSON value into a request envelope.
    pub fn from_value(value: Value) -> Result<Self, PipelineError> {
        serde_json::from_value(value).map_err(|e| PipelineError::MalformedRequest {
            message: e.to_string(),
        })
    }
}

// ---------------------------------------------------------------------------
// Response
// ---------------------------------------------------------------------------

/// The result of one call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CallResponse {
    pub output: Map<String, Value>,

    /// Remote role only: the executed phase's own success value.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success: Option<bool>,

    /// Must be persisted verbatim and supplied with the next call.
    pub cache: Cache,
}

impl CallResponse {
    /// Serializes the response for the wire.
    ///
    /// # Errors
    ///
    /// [`PipelineError::ResponseSerialization`] with the offending output attached.
    pub fn to_json(&self) -> Result<String, PipelineError> {
        serde_json::to_string(self).map_err(|e| PipelineError::ResponseSerialization {
            message: e.to_string(),
            output: Value::Object(self.output.clone()),
        })
    }

    /// Serializes the response into a JSON value.
    pub fn to_value(&self) -> Result<Value, PipelineError> {
        serde_json::to_value(self).map_err(|e| PipelineError::ResponseSerialization {
            message: e.to_string(),
            output: Value::Object(self.output.clone()),
        })
    }
}

// ---------------------------------------------------------------------------
// Time
// ---------------------------------------------------------------------------

/// A UTC wall-clock timestamp.
///
/// Wraps [`chrono::DateTime<Utc>`] so callers never depend on `chrono` types
/// directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Timestamp(DateTime<Utc>);

impl Timestamp {
    /// Returns the current UTC time as a [`Timestamp`].
    pub fn now() -> Self {
        Self(Utc::now())
    }

    /// Creates a [`Timestamp`] from a [`DateTime<Utc>`].
    pub fn from_utc(dt: DateTime<Utc>) -> Self {
        Self(dt)
    }

    /// Returns the underlying [`DateTime<Utc>`].
    pub fn as_datetime(self) -> DateTime<Utc> {
        self.0
    }

    /// `HH:MM:SS mm/dd/YYYY`, the format used in debug call logs.
    pub fn to_log_string(self) -> String {
        self.0.format("%H:%M:%S %m/%d/%Y").to_string()
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.to_rfc3339())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    #[test]
    fn test_request_parses_camel_case_state() {
        let raw = r#"{
            "input": {"data": [1, 2, 3]},
            "state": {
                "outputDirectory": "/out",
                "baseDirectory": "/in",
                "transferDirectory": "/xfer",
                "clientId": "site1",
                "iteration": 4
            },
            "cache": {"k": "v"}
        }"#;
        let request = CallRequest::from_json(raw).unwrap();
        assert_eq!(request.state.client_id, "site1");
        assert_eq!(request.state.base_directory, PathBuf::from("/in"));
        assert_eq!(request.state.extra.get("iteration"), Some(&json!(4)));
        assert_eq!(request.cache.get("k"), Some(&json!("v")));
    }

    #[test]
    fn test_state_and_cache_default_when_absent() {
        let request = CallRequest::from_json(r#"{"input": {}}"#).unwrap();
        assert!(request.cache.is_empty());
        assert_eq!(request.state, CallState::default());
    }

    #[test]
    fn test_malformed_requests_are_rejected() {
        for raw in ["not json", r#"{"state": {}}"#, r#"{"input": [1, 2]}"#] {
            assert!(matches!(
                CallRequest::from_json(raw),
                Err(PipelineError::MalformedRequest { .. })
            ));
        }
    }

    #[test]
    fn test_response_omits_absent_success() {
        let response = CallResponse::default();
        assert_eq!(
            response.to_value().unwrap(),
            json!({"output": {}, "cache": {}})
        );

        let response = CallResponse {
            success: Some(true),
            ..CallResponse::default()
        };
        assert_eq!(response.to_value().unwrap()["success"], json!(true));
    }

    #[test]
    fn test_log_timestamp_format() {
        let ts = Timestamp::from_utc(Utc.with_ymd_and_hms(2024, 3, 9, 14, 5, 7).unwrap());
        assert_eq!(ts.to_log_string(), "14:05:07 03/09/2024");
    }
}
