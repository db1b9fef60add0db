//! Function-tool manifest offered to the model, and parsing of the tool
//! calls it sends back.
//!
//! Every worker is exposed as a single synthetic tool named `<worker>.call`
//! taking `{method, args}`.

use crate::error::LlmError;

use serde_json::{Value, json};

const TOOL_SUFFIX: &str = "call";

/// A decoded request from the model to run `method(args)` on `worker`.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolInvocation {
    pub worker: String,
    pub method: String,
    pub args: Value,
}

/// One function tool per worker name, in the order given.
pub fn tool_manifest(worker_names: &[String]) -> Vec<Value> {
    worker_names
        .iter()
        .map(|name| {
            json!({
                "type": "function",
                "function": {
                    "name": format!("{name}.{TOOL_SUFFIX}"),
                    "description": format!("Call a function on the {name} worker"),
                    "parameters": {
                        "type": "object",
                        "properties": {
                            "method": {
                                "type": "string",
                                "description": "Name of the method to invoke"
                            },
                            "args": {
                                "type": "object",
                                "description": "Arguments passed to the method"
                            }
                        },
                        "required": ["method", "args"]
                    }
                }
            })
        })
        .collect()
}

/// Worker name from a tool name such as `filesystem.call`. Everything before
/// the first `.` is the worker; a name without a dot is taken whole.
pub fn parse_tool_name(tool_name: &str) -> &str {
    tool_name
        .split_once('.')
        .map_or(tool_name, |(worker, _)| worker)
}

impl ToolInvocation {
    /// Decode one `function` object from a tool call:
    /// `{"name": "fs.call", "arguments": {"method": .., "args": ..}}`.
    ///
    /// `arguments` may also arrive as a JSON-encoded string. Missing `args`
    /// become an empty object.
    pub fn from_function(function: &Value) -> Result<Self, LlmError> {
        let tool_name = function["name"]
            .as_str()
            .ok_or_else(|| LlmError::InvalidResponse("tool call without a name".into()))?;

        let worker = parse_tool_name(tool_name);
        if worker.is_empty() {
            return Err(LlmError::UnknownTool(tool_name.to_owned()));
        }

        let arguments = match &function["arguments"] {
            Value::String(raw) => serde_json::from_str::<Value>(raw).map_err(|error| {
                LlmError::InvalidResponse(format!(
                    "arguments for '{tool_name}' are not valid JSON: {error}"
                ))
            })?,
            other => other.clone(),
        };

        let method = arguments["method"].as_str().ok_or_else(|| {
            LlmError::InvalidResponse(format!("tool call '{tool_name}' has no method"))
        })?;

        let args = match arguments.get("args") {
            Some(Value::Null) | None => json!({}),
            Some(args) => args.clone(),
        };

        Ok(Self {
            worker: worker.to_owned(),
            method: method.to_owned(),
            args,
        })
    }
}
