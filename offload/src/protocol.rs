//! Wire protocol between a handler and its worker.
//!
//! Messages are structured values. The process substrate carries them as
//! newline-delimited JSON over the child's stdio; the thread substrate
//! passes them through in-process channels unchanged.
//!
//! Exact shapes:
//!
//! - Request: `{"id": 1, "method": "echo", "params": [42]}`
//! - Response: `{"id": 1, "result": ...}` | `{"id": 1, "error": ...}` |
//!   `{"id": 1, "isEvent": true, "payload": ...}`
//! - Out-of-band signals: the literal string `"ready"` (worker → handler,
//!   once per readiness epoch) and `"__workerpool-terminate__"`
//!   (handler → worker, process substrate only).

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Task identifier, monotone per handler and starting at 1.
pub type TaskId = u64;

/// Readiness signal sent by a worker once per readiness epoch.
pub const READY_SIGNAL: &str = "ready";

/// Graceful-termination signal sent to process-substrate workers.
pub const TERMINATE_SIGNAL: &str = "__workerpool-terminate__";

// =============================================================================
// Requests (handler → worker)
// =============================================================================

/// A task request addressed to a worker method.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    /// Correlation id; echoed back in every response for this task.
    pub id: TaskId,
    /// Method name to invoke.
    pub method: String,
    /// Positional parameters.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub params: Vec<Value>,
}

/// Any message a handler can deliver to its worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HandlerMessage {
    /// A task request.
    Request(Request),
    /// An out-of-band signal string.
    Signal(String),
}

impl HandlerMessage {
    /// The graceful-termination signal.
    pub fn terminate() -> Self {
        Self::Signal(TERMINATE_SIGNAL.to_string())
    }

    /// True if this is the graceful-termination signal.
    pub fn is_terminate(&self) -> bool {
        matches!(self, Self::Signal(s) if s == TERMINATE_SIGNAL)
    }

    /// Serializes to a JSON line (with trailing newline).
    pub fn to_line(&self) -> String {
        let mut json = serde_json::to_string(self).expect("handler message serialization failed");
        json.push('\n');
        json
    }

    /// Deserializes from a JSON line.
    pub fn from_line(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line.trim())
    }
}

// =============================================================================
// Responses (worker → handler)
// =============================================================================

/// A response correlated to a request by `id`.
///
/// Exactly one of three shapes: a terminal result, a terminal error, or a
/// non-terminal event (`is_event` set, `payload` carrying the data).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Response {
    /// Correlation id of the owning task.
    pub id: TaskId,
    /// Terminal result value.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Terminal error descriptor.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorDescriptor>,
    /// Marks a streamed, non-terminal event.
    #[serde(default, rename = "isEvent", skip_serializing_if = "std::ops::Not::not")]
    pub is_event: bool,
    /// Event payload, present when `is_event` is set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

impl Response {
    /// A terminal success response.
    pub fn result(id: TaskId, result: Value) -> Self {
        Self {
            id,
            result: Some(result),
            ..Default::default()
        }
    }

    /// A terminal error response.
    pub fn error(id: TaskId, error: ErrorDescriptor) -> Self {
        Self {
            id,
            error: Some(error),
            ..Default::default()
        }
    }

    /// A streamed event for a still-running task.
    pub fn event(id: TaskId, payload: Value) -> Self {
        Self {
            id,
            is_event: true,
            payload: Some(payload),
            ..Default::default()
        }
    }
}

/// Any message a worker can deliver to its handler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WorkerMessage {
    /// A correlated response.
    Response(Response),
    /// An out-of-band signal string.
    Signal(String),
}

impl WorkerMessage {
    /// The readiness signal.
    pub fn ready() -> Self {
        Self::Signal(READY_SIGNAL.to_string())
    }

    /// True if this is the readiness signal.
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Signal(s) if s == READY_SIGNAL)
    }

    /// Serializes to a JSON line (with trailing newline).
    pub fn to_line(&self) -> String {
        let mut json = serde_json::to_string(self).expect("worker message serialization failed");
        json.push('\n');
        json
    }

    /// Deserializes from a JSON line.
    pub fn from_line(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line.trim())
    }
}

// =============================================================================
// Error descriptors
// =============================================================================

/// An error crossing the worker boundary, as a property bag.
///
/// A string value decodes to an error with that string as its message; an
/// object value decodes to an error whose enumerable properties are copied
/// from the object. See [`crate::error::TaskError`] for the decoded form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ErrorDescriptor {
    /// Bare message form.
    Message(String),
    /// Property-bag form (typically `name`, `message`, `stack`).
    Object(Map<String, Value>),
}

impl ErrorDescriptor {
    /// An object descriptor from `(name, message)`.
    pub fn object(name: &str, message: &str) -> Self {
        let mut props = Map::new();
        props.insert("name".to_string(), Value::String(name.to_string()));
        props.insert("message".to_string(), Value::String(message.to_string()));
        Self::Object(props)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_line_round_trip() {
        let request = Request {
            id: 7,
            method: "echo".to_string(),
            params: vec![json!(42), json!("abc")],
        };
        let line = HandlerMessage::Request(request.clone()).to_line();
        assert!(line.ends_with('\n'));
        assert!(line.contains("\"method\":\"echo\""));

        match HandlerMessage::from_line(&line).unwrap() {
            HandlerMessage::Request(parsed) => assert_eq!(parsed, request),
            other => panic!("expected request, got {:?}", other),
        }
    }

    #[test]
    fn test_request_without_params_omits_field() {
        let request = Request {
            id: 1,
            method: "methods".to_string(),
            params: vec![],
        };
        let line = HandlerMessage::Request(request).to_line();
        assert!(!line.contains("params"));
    }

    #[test]
    fn test_terminate_signal_serializes_as_bare_string() {
        let line = HandlerMessage::terminate().to_line();
        assert_eq!(line, format!("\"{}\"\n", TERMINATE_SIGNAL));

        let parsed = HandlerMessage::from_line(&line).unwrap();
        assert!(parsed.is_terminate());
    }

    #[test]
    fn test_ready_signal_parses_from_bare_string() {
        let parsed = WorkerMessage::from_line("\"ready\"\n").unwrap();
        assert!(parsed.is_ready());
    }

    #[test]
    fn test_result_response_round_trip() {
        let line = WorkerMessage::Response(Response::result(3, json!({"ok": true}))).to_line();
        match WorkerMessage::from_line(&line).unwrap() {
            WorkerMessage::Response(r) => {
                assert_eq!(r.id, 3);
                assert_eq!(r.result, Some(json!({"ok": true})));
                assert!(!r.is_event);
                assert!(r.error.is_none());
            }
            other => panic!("expected response, got {:?}", other),
        }
    }

    #[test]
    fn test_event_response_round_trip() {
        let line = WorkerMessage::Response(Response::event(9, json!("tick"))).to_line();
        assert!(line.contains("\"isEvent\":true"));
        match WorkerMessage::from_line(&line).unwrap() {
            WorkerMessage::Response(r) => {
                assert!(r.is_event);
                assert_eq!(r.payload, Some(json!("tick")));
            }
            other => panic!("expected response, got {:?}", other),
        }
    }

    #[test]
    fn test_error_descriptor_string_form() {
        let parsed: ErrorDescriptor = serde_json::from_str("\"boom\"").unwrap();
        assert_eq!(parsed, ErrorDescriptor::Message("boom".to_string()));
    }

    #[test]
    fn test_error_descriptor_object_form() {
        let parsed: ErrorDescriptor =
            serde_json::from_str(r#"{"name":"RangeError","message":"oops"}"#).unwrap();
        match parsed {
            ErrorDescriptor::Object(props) => {
                assert_eq!(props.get("name"), Some(&json!("RangeError")));
                assert_eq!(props.get("message"), Some(&json!("oops")));
            }
            other => panic!("expected object form, got {:?}", other),
        }
    }

    #[test]
    fn test_null_result_is_absent_after_parse() {
        // Workers may send an explicit null result; callers observe null.
        let parsed = WorkerMessage::from_line(r#"{"id":1,"result":null}"#).unwrap();
        match parsed {
            WorkerMessage::Response(r) => {
                assert_eq!(r.id, 1);
                assert!(r.result.is_none());
                assert!(!r.is_event);
            }
            other => panic!("expected response, got {:?}", other),
        }
    }
}
