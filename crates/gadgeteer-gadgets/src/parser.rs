//! Incremental gadget-call parser.
//!
//! Consumes text chunks as they stream in and emits `Text` and `Call` events
//! without buffering the whole response. Markers are recognized at line
//! starts only. A body is terminated by the end marker or, tolerance for a
//! common LLM mistake, by the next start marker. Text outside gadget blocks
//! passes through unmodified.

use crate::call::{ParsedGadgetCall, WireSyntax};
use gadgeteer_core::next_invocation_id;
use serde_json::{Map, Value};
use tracing::trace;

/// Event emitted by the parser.
#[derive(Clone, Debug)]
pub enum ParseEvent {
    Text(String),
    Call(ParsedGadgetCall),
}

#[derive(Debug)]
struct Header {
    name: String,
    invocation_id: String,
    dependencies: Vec<String>,
}

#[derive(Debug)]
enum State {
    ScanText,
    AwaitHeader,
    AwaitBody(Header),
    /// Drop the single newline that trails an end marker, once it arrives.
    SkipNewline,
}

/// Streaming parser for one model response. Create one per LLM call;
/// invocation ids come from the process-wide counter, so ids stay unique
/// across parsers and sub-agents.
pub struct StreamParser {
    syntax: WireSyntax,
    buffer: String,
    state: State,
}

impl StreamParser {
    pub fn new(syntax: WireSyntax) -> Self {
        Self {
            syntax,
            buffer: String::new(),
            state: State::ScanText,
        }
    }

    /// Feed one chunk, draining every complete event it enables.
    pub fn feed(&mut self, chunk: &str) -> Vec<ParseEvent> {
        self.buffer.push_str(chunk);
        let mut events = Vec::new();

        loop {
            match std::mem::replace(&mut self.state, State::ScanText) {
                State::ScanText => {
                    match find_line_marker(&self.buffer, &self.syntax.start_prefix) {
                        Some(idx) => {
                            if idx > 0 {
                                events.push(ParseEvent::Text(self.buffer[..idx].to_string()));
                            }
                            self.buffer.drain(..idx + self.syntax.start_prefix.len());
                            self.state = State::AwaitHeader;
                        }
                        None => {
                            let keep = self.holdback_len();
                            let emit_to = self.buffer.len() - keep;
                            if emit_to > 0 {
                                events.push(ParseEvent::Text(self.buffer[..emit_to].to_string()));
                                self.buffer.drain(..emit_to);
                            }
                            self.state = State::ScanText;
                            break;
                        }
                    }
                }
                State::AwaitHeader => match self.buffer.find('\n') {
                    Some(idx) => {
                        let line = self.buffer[..idx].trim_end_matches('\r').to_string();
                        self.buffer.drain(..idx + 1);
                        self.state = State::AwaitBody(parse_header(&line));
                    }
                    None => {
                        // Chunk ended mid-header; wait for more data.
                        self.state = State::AwaitHeader;
                        break;
                    }
                },
                State::SkipNewline => {
                    if self.buffer.is_empty() {
                        self.state = State::SkipNewline;
                        break;
                    }
                    if self.buffer.starts_with('\n') {
                        self.buffer.drain(..1);
                    }
                    self.state = State::ScanText;
                }
                State::AwaitBody(header) => {
                    let end = find_line_marker(&self.buffer, &self.syntax.end_marker);
                    let next_start = find_line_marker(&self.buffer, &self.syntax.start_prefix);
                    match (end, next_start) {
                        (Some(e), None) => {
                            let body = take_body(&mut self.buffer, e);
                            self.buffer.drain(..self.syntax.end_marker.len());
                            events.push(ParseEvent::Call(self.build_call(header, &body)));
                            self.state = State::SkipNewline;
                        }
                        (Some(e), s) if s.map_or(true, |s| e <= s) => {
                            let body = take_body(&mut self.buffer, e);
                            self.buffer.drain(..self.syntax.end_marker.len());
                            events.push(ParseEvent::Call(self.build_call(header, &body)));
                            self.state = State::SkipNewline;
                        }
                        (_, Some(s)) => {
                            // Implicit end: the next block starts before this
                            // one was closed. Leave the marker for ScanText.
                            trace!(gadget = %header.name, "gadget block without end marker");
                            let body = take_body(&mut self.buffer, s);
                            events.push(ParseEvent::Call(self.build_call(header, &body)));
                            self.state = State::ScanText;
                        }
                        (None, None) => {
                            self.state = State::AwaitBody(header);
                            break;
                        }
                    }
                }
            }
        }

        events
    }

    /// Flush whatever remains when the stream ends. A pending body becomes a
    /// partial call; a lone marker fragment that never named a gadget is
    /// surfaced as text.
    pub fn finalize(&mut self) -> Vec<ParseEvent> {
        let mut events = Vec::new();
        match std::mem::replace(&mut self.state, State::ScanText) {
            State::ScanText => {
                if !self.buffer.is_empty() {
                    events.push(ParseEvent::Text(std::mem::take(&mut self.buffer)));
                }
            }
            State::SkipNewline => {
                if self.buffer.starts_with('\n') {
                    self.buffer.drain(..1);
                }
                if !self.buffer.is_empty() {
                    events.push(ParseEvent::Text(std::mem::take(&mut self.buffer)));
                }
            }
            State::AwaitHeader => {
                let fragment = std::mem::take(&mut self.buffer);
                let line = fragment.trim_end_matches('\r');
                if line.trim().is_empty() {
                    events.push(ParseEvent::Text(format!(
                        "{}{}",
                        self.syntax.start_prefix, fragment
                    )));
                } else {
                    events.push(ParseEvent::Call(self.build_call(parse_header(line), "")));
                }
            }
            State::AwaitBody(header) => {
                let body = std::mem::take(&mut self.buffer);
                events.push(ParseEvent::Call(self.build_call(header, &body)));
            }
        }
        events
    }

    fn build_call(&self, header: Header, body: &str) -> ParsedGadgetCall {
        let (parameters, parse_error) = parse_body(body, &self.syntax.arg_prefix);
        let parse_error = if header.name.is_empty() {
            Some("missing gadget name in block header".to_string())
        } else {
            parse_error
        };
        ParsedGadgetCall {
            gadget_name: header.name,
            invocation_id: header.invocation_id,
            parameters_raw: body.to_string(),
            parameters,
            parse_error,
            dependencies: header.dependencies,
        }
    }

    /// How much of the buffer tail to keep while scanning text: the final
    /// partial line, when it could still grow into a start marker.
    fn holdback_len(&self) -> usize {
        let tail_start = self.buffer.rfind('\n').map(|i| i + 1).unwrap_or(0);
        let tail = &self.buffer[tail_start..];
        if !tail.is_empty() && self.syntax.start_prefix.starts_with(tail) {
            tail.len()
        } else {
            0
        }
    }
}

impl Default for StreamParser {
    fn default() -> Self {
        Self::new(WireSyntax::default())
    }
}

/// Find `marker` at a line start (offset 0 or right after a newline).
fn find_line_marker(buffer: &str, marker: &str) -> Option<usize> {
    let mut from = 0;
    while let Some(rel) = buffer[from..].find(marker) {
        let idx = from + rel;
        if idx == 0 || buffer.as_bytes()[idx - 1] == b'\n' {
            return Some(idx);
        }
        from = idx + 1;
    }
    None
}

/// Split the body off the front of the buffer, dropping the newline that
/// separated it from the terminating marker.
fn take_body(buffer: &mut String, marker_idx: usize) -> String {
    let body_end = if marker_idx > 0 { marker_idx - 1 } else { 0 };
    let body = buffer[..body_end].to_string();
    buffer.drain(..marker_idx);
    body
}

fn parse_header(line: &str) -> Header {
    let mut fields = line.splitn(3, ':');
    let name = fields.next().unwrap_or("").trim().to_string();
    let invocation_id = match fields.next().map(str::trim) {
        Some(id) if !id.is_empty() => id.to_string(),
        _ => next_invocation_id(),
    };
    let dependencies = fields
        .next()
        .map(|deps| {
            deps.split(',')
                .map(str::trim)
                .filter(|d| !d.is_empty())
                .map(String::from)
                .collect()
        })
        .unwrap_or_default();
    Header {
        name,
        invocation_id,
        dependencies,
    }
}

/// Parse the `!!!ARG:` sections of a body into a parameter object.
fn parse_body(body: &str, arg_prefix: &str) -> (Option<Value>, Option<String>) {
    let body = strip_fence(body);
    let mut params = Value::Object(Map::new());
    let mut current: Option<(String, Vec<&str>)> = None;
    let mut error = None;

    let mut flush = |current: &mut Option<(String, Vec<&str>)>,
                     params: &mut Value,
                     error: &mut Option<String>| {
        if let Some((path, lines)) = current.take() {
            let value = infer_value(&lines.join("\n"));
            if let Err(e) = insert_at_path(params, &path, value) {
                error.get_or_insert(e);
            }
        }
    };

    for line in body.lines() {
        if let Some(path) = line.strip_prefix(arg_prefix) {
            flush(&mut current, &mut params, &mut error);
            let path = path.trim();
            if path.is_empty() {
                error.get_or_insert("empty ARG path".to_string());
                current = None;
            } else if path.split('/').any(|seg| seg.is_empty()) {
                error.get_or_insert(format!("incomplete path expression: '{}'", path));
                current = None;
            } else {
                current = Some((path.to_string(), Vec::new()));
            }
        } else if let Some((_, lines)) = current.as_mut() {
            lines.push(line);
        } else if !line.trim().is_empty() {
            error.get_or_insert(format!("unexpected content before first ARG: '{}'", line.trim()));
        }
    }
    flush(&mut current, &mut params, &mut error);

    match error {
        Some(e) => (None, Some(e)),
        None => (Some(params), None),
    }
}

/// Strip one outer markdown fence (``` or ```lang) around the body.
fn strip_fence(body: &str) -> &str {
    let trimmed = body.trim_matches(|c| c == '\n' || c == '\r' || c == ' ');
    let Some(rest) = trimmed.strip_prefix("```") else {
        return body;
    };
    // Drop the info string ("toml", "yaml", "json", ...) on the fence line.
    let rest = match rest.find('\n') {
        Some(idx) => &rest[idx + 1..],
        None => return body,
    };
    match rest.strip_suffix("```") {
        Some(inner) => inner.trim_end_matches(|c| c == '\n' || c == '\r' || c == ' '),
        None => rest,
    }
}

/// Infer a leaf value: bool, then number, else string (multi-line preserved).
fn infer_value(raw: &str) -> Value {
    let trimmed = raw.trim();
    match trimmed {
        "true" => return Value::Bool(true),
        "false" => return Value::Bool(false),
        _ => {}
    }
    if let Ok(n) = trimmed.parse::<i64>() {
        return Value::Number(n.into());
    }
    if let Ok(f) = trimmed.parse::<f64>() {
        if let Some(n) = serde_json::Number::from_f64(f) {
            return Value::Number(n);
        }
    }
    Value::String(raw.to_string())
}

/// Insert a leaf at a slash-separated path. Numeric components index arrays;
/// a repeated sibling path grows an array in place.
fn insert_at_path(root: &mut Value, path: &str, leaf: Value) -> Result<(), String> {
    let segments: Vec<&str> = path.split('/').collect();
    let mut node = root;

    for (i, segment) in segments.iter().enumerate() {
        let last = i == segments.len() - 1;

        match segment.parse::<usize>() {
            Ok(idx) => {
                if node.is_null() {
                    *node = Value::Array(Vec::new());
                }
                let arr = match node {
                    Value::Array(arr) => arr,
                    _ => return Err(format!("path conflict at '{}': not an array", segment)),
                };
                while arr.len() <= idx {
                    arr.push(Value::Null);
                }
                if last {
                    arr[idx] = merge_leaf(std::mem::take(&mut arr[idx]), leaf);
                    return Ok(());
                }
                node = &mut arr[idx];
            }
            Err(_) => {
                if node.is_null() {
                    *node = Value::Object(Map::new());
                }
                let map = match node {
                    Value::Object(map) => map,
                    _ => return Err(format!("path conflict at '{}': not an object", segment)),
                };
                let slot = map.entry(segment.to_string()).or_insert(Value::Null);
                if last {
                    *slot = merge_leaf(std::mem::take(slot), leaf);
                    return Ok(());
                }
                node = slot;
            }
        }
    }
    Ok(())
}

/// Repeated sibling paths accumulate into an array.
fn merge_leaf(existing: Value, leaf: Value) -> Value {
    match existing {
        Value::Null => leaf,
        Value::Array(mut items) => {
            items.push(leaf);
            Value::Array(items)
        }
        prior => Value::Array(vec![prior, leaf]),
    }
}
