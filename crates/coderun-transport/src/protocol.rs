//! Wire protocol between the editor client and the execution backend.

use coderun_core::{ProtocolError, RunId};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Run request sent to the backend.
///
/// Serializes to `{"code": ..., "userInput": ..., "run_id": ...}`; the
/// optional keys are omitted when unset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunRequest {
    /// Source text to execute.
    pub code: String,
    /// Text fed to the program's stdin.
    #[serde(rename = "userInput", default, skip_serializing_if = "Option::is_none")]
    pub user_input: Option<String>,
    /// Token a cooperating backend echoes back on its replies.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<RunId>,
}

impl RunRequest {
    /// Create a request for the given source text.
    #[must_use]
    pub fn new(code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            user_input: None,
            run_id: None,
        }
    }

    /// Attach stdin text.
    #[must_use]
    pub fn with_user_input(mut self, user_input: Option<String>) -> Self {
        self.user_input = user_input;
        self
    }

    /// Attach the run token.
    #[must_use]
    pub const fn with_run_id(mut self, run_id: RunId) -> Self {
        self.run_id = Some(run_id);
        self
    }

    /// Encode as a JSON text message.
    ///
    /// # Errors
    /// Returns error if serialization fails.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Message received from the backend.
///
/// Every field is optional. A frame with neither `output` nor `done` carries
/// no display payload and is tolerated; unknown keys are ignored.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerFrame {
    /// Output text chunk.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    /// Run the frame belongs to. Absent means the active run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<RunId>,
    /// Fragment sequence number. Absent means the next one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
    /// Completion marker.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub done: bool,
}

impl ServerFrame {
    /// Parse a raw text message.
    ///
    /// # Errors
    /// Returns `ProtocolError` if the text is not a JSON object or a known
    /// field has the wrong type.
    pub fn parse(raw: &str) -> Result<Self, ProtocolError> {
        let value: Value = serde_json::from_str(raw)?;
        if !value.is_object() {
            return Err(ProtocolError::NotAnObject(json_kind(&value)));
        }
        Ok(serde_json::from_value(value)?)
    }

    /// Output frame.
    #[must_use]
    pub fn output(text: impl Into<String>) -> Self {
        Self {
            output: Some(text.into()),
            ..Self::default()
        }
    }

    /// Completion marker.
    #[must_use]
    pub fn completed() -> Self {
        Self {
            done: true,
            ..Self::default()
        }
    }

    /// Address the frame to a run.
    #[must_use]
    pub const fn for_run(mut self, run_id: RunId) -> Self {
        self.run_id = Some(run_id);
        self
    }

    /// Set the sequence number.
    #[must_use]
    pub const fn with_seq(mut self, seq: u64) -> Self {
        self.seq = Some(seq);
        self
    }

    /// Whether the frame carries neither output nor completion.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.output.is_none() && !self.done
    }

    /// Encode as a JSON text message.
    ///
    /// # Errors
    /// Returns error if serialization fails.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

const fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::*;

    #[test]
    fn test_minimal_request_shape() {
        let json = RunRequest::new("print('x')").to_json().unwrap();
        assert_eq!(json, r#"{"code":"print('x')"}"#);
    }

    #[test]
    fn test_request_with_input_and_token() {
        let run_id = Uuid::new_v4();
        let request = RunRequest::new("input()")
            .with_user_input(Some("42\n".to_string()))
            .with_run_id(run_id);
        let value: Value = serde_json::from_str(&request.to_json().unwrap()).unwrap();

        assert_eq!(value["code"], "input()");
        assert_eq!(value["userInput"], "42\n");
        assert_eq!(value["run_id"], run_id.to_string());
    }

    #[test]
    fn test_bare_output_frame() {
        let frame = ServerFrame::parse(r#"{"output": "x\n"}"#).unwrap();
        assert_eq!(frame.output.as_deref(), Some("x\n"));
        assert_eq!(frame.run_id, None);
        assert_eq!(frame.seq, None);
        assert!(!frame.done);
    }

    #[test]
    fn test_unrelated_keys_are_tolerated() {
        let frame = ServerFrame::parse(r#"{"message": "WebSocket connected!"}"#).unwrap();
        assert!(frame.is_empty());
    }

    #[test]
    fn test_full_frame() {
        let run_id = Uuid::new_v4();
        let raw = format!(r#"{{"output": "y", "run_id": "{run_id}", "seq": 3, "done": true}}"#);
        let frame = ServerFrame::parse(&raw).unwrap();
        let expected = ServerFrame {
            output: Some("y".to_string()),
            run_id: Some(run_id),
            seq: Some(3),
            done: true,
        };
        assert_eq!(frame, expected);
    }

    #[test]
    fn test_rejects_non_objects() {
        assert!(matches!(
            ServerFrame::parse("[1, 2]"),
            Err(ProtocolError::NotAnObject("an array"))
        ));
        assert!(matches!(
            ServerFrame::parse("not json"),
            Err(ProtocolError::InvalidJson(_))
        ));
    }

    #[test]
    fn test_rejects_mistyped_fields() {
        assert!(ServerFrame::parse(r#"{"output": 12}"#).is_err());
        assert!(ServerFrame::parse(r#"{"seq": -1, "output": "a"}"#).is_err());
        assert!(ServerFrame::parse(r#"{"run_id": "nope", "output": "a"}"#).is_err());
    }

    #[test]
    fn test_completed_frame_encoding() {
        let json = ServerFrame::completed().to_json().unwrap();
        assert_eq!(json, r#"{"done":true}"#);
        let json = ServerFrame::output("a").to_json().unwrap();
        assert_eq!(json, r#"{"output":"a"}"#);
    }
}
