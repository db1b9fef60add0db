//! Line-delimited JSON wire format spoken with worker processes.
//!
//! Request: `{"method": "...", "params": {...}, "id": N}` on one line.
//! Response: `{"id": N, "result": ...}` or `{"id": N, "error": "..."}` on one line.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Request id used for every call in [`CorrelationMode::Fixed`].
pub const FIXED_REQUEST_ID: u64 = 1;

/// How request ids are assigned and matched against responses.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CorrelationMode {
    /// Every request carries id 1 and response ids are ignored. Only the
    /// per-worker call lock keeps responses attributed correctly, so a
    /// response arriving after its call timed out is taken by the next call.
    #[default]
    Fixed,
    /// Ids increase per call. A response echoing a different id is a late
    /// answer to an earlier call and is discarded. Responses without an id
    /// are accepted.
    Sequential,
}

impl CorrelationMode {
    /// Whether a response carrying `response_id` answers the request sent
    /// with `request_id`.
    pub fn accepts(self, request_id: u64, response_id: Option<&Value>) -> bool {
        match (self, response_id) {
            (CorrelationMode::Fixed, _) => true,
            (CorrelationMode::Sequential, None | Some(Value::Null)) => true,
            (CorrelationMode::Sequential, Some(Value::Number(number))) => {
                number.as_u64() == Some(request_id)
            }
            (CorrelationMode::Sequential, Some(Value::String(text))) => {
                text.parse::<u64>().ok() == Some(request_id)
            }
            (CorrelationMode::Sequential, Some(_)) => false,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct WorkerRequest<'a> {
    pub method: &'a str,
    pub params: &'a Value,
    pub id: u64,
}

impl WorkerRequest<'_> {
    /// Serialize as exactly one line terminated by `\n`.
    ///
    /// Compact JSON escapes control characters inside strings, so the only
    /// raw newline in the output is the terminator.
    pub fn encode_line(&self) -> serde_json::Result<Vec<u8>> {
        let mut line = serde_json::to_vec(self)?;
        line.push(b'\n');
        Ok(line)
    }
}

/// Outcome carried by one well-formed response line.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Result(Value),
    Error(String),
}

/// One decoded stdout line.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Decoded {
    Blank,
    Malformed,
    Response { id: Option<Value>, reply: Reply },
}

pub(crate) fn decode_line(line: &str) -> Decoded {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Decoded::Blank;
    }

    let Ok(value) = serde_json::from_str::<Value>(trimmed) else {
        return Decoded::Malformed;
    };

    let Value::Object(mut object) = value else {
        return Decoded::Response {
            id: None,
            reply: Reply::Result(value),
        };
    };

    let id = object.get("id").cloned();
    if let Some(result) = object.remove("result") {
        return Decoded::Response {
            id,
            reply: Reply::Result(result),
        };
    }

    if let Some(error) = object.get("error") {
        let message = match error {
            Value::String(message) => message.clone(),
            Value::Object(fields) => fields
                .get("message")
                .and_then(Value::as_str)
                .map(str::to_owned)
                .unwrap_or_else(|| error.to_string()),
            other => other.to_string(),
        };
        return Decoded::Response {
            id,
            reply: Reply::Error(message),
        };
    }

    Decoded::Response {
        id,
        reply: Reply::Result(Value::Object(object)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_line_is_single_line_with_escaped_newlines() {
        let params = json!({"filename": "a.txt", "content": "line one\nline two\r\n"});
        let request = WorkerRequest {
            method: "writeFile",
            params: &params,
            id: 1,
        };

        let line = request.encode_line().expect("serializable");
        let text = String::from_utf8(line).expect("utf8");

        assert!(text.ends_with('\n'));
        assert_eq!(text.matches('\n').count(), 1);
        assert!(!text.contains('\r'));

        let parsed: Value = serde_json::from_str(text.trim_end()).expect("valid json");
        assert_eq!(parsed["method"], "writeFile");
        assert_eq!(parsed["params"], params);
        assert_eq!(parsed["id"], 1);
    }

    #[test]
    fn decodes_result_field() {
        assert_eq!(
            decode_line(r#"{"id":1,"result":"File written successfully"}"#),
            Decoded::Response {
                id: Some(json!(1)),
                reply: Reply::Result(json!("File written successfully")),
            }
        );
    }

    #[test]
    fn null_result_is_still_a_result() {
        assert_eq!(
            decode_line(r#"{"id":1,"result":null}"#),
            Decoded::Response {
                id: Some(json!(1)),
                reply: Reply::Result(Value::Null),
            }
        );
    }

    #[test]
    fn object_without_result_resolves_to_whole_object() {
        assert_eq!(
            decode_line(r#"{"files":["a.txt"]}"#),
            Decoded::Response {
                id: None,
                reply: Reply::Result(json!({"files": ["a.txt"]})),
            }
        );
    }

    #[test]
    fn decodes_error_shapes() {
        assert_eq!(
            decode_line(r#"{"id":1,"error":"Unknown method: x"}"#),
            Decoded::Response {
                id: Some(json!(1)),
                reply: Reply::Error("Unknown method: x".into()),
            }
        );
        assert_eq!(
            decode_line(r#"{"id":2,"error":{"code":-32601,"message":"no such method"}}"#),
            Decoded::Response {
                id: Some(json!(2)),
                reply: Reply::Error("no such method".into()),
            }
        );
    }

    #[test]
    fn blank_and_malformed_lines() {
        assert_eq!(decode_line("   \r"), Decoded::Blank);
        assert_eq!(
            decode_line("Simple Filesystem Server running on stdio"),
            Decoded::Malformed
        );
        assert_eq!(decode_line(r#"{"id":1,"result":"#), Decoded::Malformed);
    }

    #[test]
    fn sequential_mode_matches_ids() {
        let mode = CorrelationMode::Sequential;
        assert!(mode.accepts(3, Some(&json!(3))));
        assert!(mode.accepts(3, Some(&json!("3"))));
        assert!(mode.accepts(3, None));
        assert!(mode.accepts(3, Some(&Value::Null)));
        assert!(!mode.accepts(3, Some(&json!(2))));
        assert!(!mode.accepts(3, Some(&json!({"nested": 3}))));
    }

    #[test]
    fn fixed_mode_ignores_ids() {
        let mode = CorrelationMode::Fixed;
        assert!(mode.accepts(FIXED_REQUEST_ID, Some(&json!(99))));
        assert!(mode.accepts(FIXED_REQUEST_ID, None));
    }
}
