//! Parsed gadget calls and the line-oriented wire syntax.
//!
//! The LLM invokes gadgets with marker-prefixed blocks inside its text
//! stream:
//!
//! ```text
//! !!!GADGET_START:<name>[:<invocationId>[:<depId1>,<depId2>,...]]
//! !!!ARG:<path>
//! <value>
//! !!!GADGET_END
//! ```
//!
//! Paths are slash-separated; numeric components index into arrays. Values
//! are inferred (bool, number, string). The prefixes are configurable per
//! agent but fixed for its lifetime.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Marker prefixes for the invocation wire syntax.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WireSyntax {
    pub start_prefix: String,
    pub arg_prefix: String,
    pub end_marker: String,
}

impl Default for WireSyntax {
    fn default() -> Self {
        Self {
            start_prefix: "!!!GADGET_START:".to_string(),
            arg_prefix: "!!!ARG:".to_string(),
            end_marker: "!!!GADGET_END".to_string(),
        }
    }
}

/// One invocation extracted from the stream.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ParsedGadgetCall {
    pub gadget_name: String,
    /// Unique across the whole run, sub-agents included.
    pub invocation_id: String,
    /// The body exactly as it appeared between the markers.
    pub parameters_raw: String,
    /// Assembled parameter object, when the body parsed.
    pub parameters: Option<Value>,
    pub parse_error: Option<String>,
    /// Invocation ids this call waits on. Must refer to earlier calls.
    pub dependencies: Vec<String>,
}

impl ParsedGadgetCall {
    /// Render this call back into wire form. Satisfies
    /// `parse(serialize(call)) == call` for well-formed calls.
    pub fn serialize(&self, syntax: &WireSyntax) -> String {
        let mut out = String::new();
        out.push_str(&syntax.start_prefix);
        out.push_str(&self.gadget_name);
        out.push(':');
        out.push_str(&self.invocation_id);
        if !self.dependencies.is_empty() {
            out.push(':');
            out.push_str(&self.dependencies.join(","));
        }
        out.push('\n');

        match &self.parameters {
            Some(params) => {
                for (path, value) in flatten_params(params) {
                    out.push_str(&syntax.arg_prefix);
                    out.push_str(&path);
                    out.push('\n');
                    out.push_str(&value);
                    out.push('\n');
                }
            }
            None => {
                if !self.parameters_raw.is_empty() {
                    out.push_str(&self.parameters_raw);
                    if !self.parameters_raw.ends_with('\n') {
                        out.push('\n');
                    }
                }
            }
        }

        out.push_str(&syntax.end_marker);
        out.push('\n');
        out
    }
}

/// Flatten a parameter object into (path, rendered value) leaves, depth-first
/// in key order.
fn flatten_params(value: &Value) -> Vec<(String, String)> {
    let mut out = Vec::new();
    flatten_into("", value, &mut out);
    out
}

fn flatten_into(path: &str, value: &Value, out: &mut Vec<(String, String)>) {
    match value {
        Value::Object(map) => {
            for (key, child) in map {
                let child_path = if path.is_empty() {
                    key.clone()
                } else {
                    format!("{}/{}", path, key)
                };
                flatten_into(&child_path, child, out);
            }
        }
        Value::Array(items) => {
            for (i, child) in items.iter().enumerate() {
                let child_path = if path.is_empty() {
                    i.to_string()
                } else {
                    format!("{}/{}", path, i)
                };
                flatten_into(&child_path, child, out);
            }
        }
        Value::String(s) => out.push((path.to_string(), s.clone())),
        Value::Bool(b) => out.push((path.to_string(), b.to_string())),
        Value::Number(n) => out.push((path.to_string(), n.to_string())),
        Value::Null => out.push((path.to_string(), String::new())),
    }
}

/// Render a gadget result for the conversation. The leading `path=` line
/// correlates the result with its invocation; the body follows verbatim.
pub fn render_result_wire(invocation_id: &str, body: &str) -> String {
    format!("path={}\n{}", invocation_id, body)
}
