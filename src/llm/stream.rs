use std::collections::{BTreeMap, HashSet};

use serde_json::Value;
use tracing::warn;

use crate::traits::ToolCall;

const SSE_DATA_PREFIX: &str = "data: ";
const SSE_DONE: &str = "[DONE]";

/// Reassembles newline-delimited SSE lines from arbitrary byte chunks.
/// Chunk boundaries can fall inside a UTF-8 sequence; only complete lines
/// are decoded.
#[derive(Default)]
pub struct SseLineBuffer {
    buf: Vec<u8>,
}

impl SseLineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Absorb a chunk and return the lines it completed, in order.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let mut line: Vec<u8> = self.buf.drain(..=pos).collect();
            line.pop(); // the newline itself
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            lines.push(String::from_utf8_lossy(&line).into_owned());
        }
        lines
    }
}

/// One parsed SSE line.
#[derive(Debug)]
pub enum SsePayload {
    Chunk(Value),
    Done,
}

/// Parse a single SSE line. Blank lines, comments, and undecodable payloads
/// yield `None`.
pub fn parse_sse_line(line: &str) -> Option<SsePayload> {
    let line = line.trim();
    if line.is_empty() || !line.starts_with(SSE_DATA_PREFIX) {
        return None;
    }
    let payload = &line[SSE_DATA_PREFIX.len()..];
    if payload == SSE_DONE {
        return Some(SsePayload::Done);
    }
    match serde_json::from_str::<Value>(payload) {
        Ok(v) => Some(SsePayload::Chunk(v)),
        Err(e) => {
            warn!(error = %e, "Dropping undecodable SSE payload");
            None
        }
    }
}

fn is_valid_json(s: &str) -> bool {
    !s.trim().is_empty() && serde_json::from_str::<Value>(s).is_ok()
}

#[derive(Default, Clone)]
struct PartialCall {
    id: String,
    name: String,
    arguments: String,
}

/// Accumulates `delta.tool_calls` fragments keyed by their `index` field
/// and emits each call exactly once, as soon as it has an id, a name, and
/// arguments that parse as JSON.
#[derive(Default)]
pub struct ToolCallAssembler {
    partial: BTreeMap<u64, PartialCall>,
    emitted: HashSet<u64>,
}

impl ToolCallAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge one delta's `tool_calls` array. Returns the calls completed by
    /// this delta, in index order.
    pub fn absorb(&mut self, delta_tool_calls: &Value) -> Vec<ToolCall> {
        let entries = match delta_tool_calls.as_array() {
            Some(a) => a,
            None => return Vec::new(),
        };
        let mut touched = Vec::new();
        for entry in entries {
            let index = entry["index"].as_u64().unwrap_or(0);
            let partial = self.partial.entry(index).or_default();
            if let Some(id) = entry["id"].as_str() {
                if !id.is_empty() {
                    partial.id = id.to_string();
                }
            }
            if let Some(name) = entry["function"]["name"].as_str() {
                if !name.is_empty() {
                    partial.name = name.to_string();
                }
            }
            if let Some(args) = entry["function"]["arguments"].as_str() {
                partial.arguments.push_str(args);
            }
            touched.push(index);
        }

        let mut completed = Vec::new();
        touched.sort_unstable();
        touched.dedup();
        for index in touched {
            if self.emitted.contains(&index) {
                continue;
            }
            let partial = match self.partial.get(&index) {
                Some(p) => p,
                None => continue,
            };
            if !partial.id.is_empty() && !partial.name.is_empty() && is_valid_json(&partial.arguments)
            {
                completed.push(ToolCall {
                    id: partial.id.clone(),
                    name: partial.name.clone(),
                    arguments: partial.arguments.clone(),
                });
                self.emitted.insert(index);
            }
        }
        completed
    }

    /// Flush at end of the tool-call phase: any named call not yet emitted
    /// goes out with its arguments defaulted to `{}` when they never became
    /// valid JSON. Idempotent.
    pub fn finish(&mut self) -> Vec<ToolCall> {
        let pending: Vec<u64> = self
            .partial
            .keys()
            .copied()
            .filter(|i| !self.emitted.contains(i))
            .collect();
        let mut flushed = Vec::new();
        for index in pending {
            let partial = &self.partial[&index];
            if partial.id.is_empty() || partial.name.is_empty() {
                continue;
            }
            let arguments = if is_valid_json(&partial.arguments) {
                partial.arguments.clone()
            } else {
                "{}".to_string()
            };
            flushed.push(ToolCall {
                id: partial.id.clone(),
                name: partial.name.clone(),
                arguments,
            });
            self.emitted.insert(index);
        }
        flushed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn line_buffer_handles_split_chunks() {
        let mut buf = SseLineBuffer::new();
        assert!(buf.push(b"data: {\"a\":").is_empty());
        let lines = buf.push(b" 1}\r\ndata: [DO");
        assert_eq!(lines, vec!["data: {\"a\": 1}"]);
        let lines = buf.push(b"NE]\n\n");
        assert_eq!(lines, vec!["data: [DONE]", ""]);
    }

    #[test]
    fn line_buffer_preserves_multibyte_text_across_chunks() {
        let mut buf = SseLineBuffer::new();
        let text = "data: {\"content\":\"列出博客\"}\n".as_bytes();
        // Split inside a UTF-8 sequence.
        assert!(buf.push(&text[..12]).is_empty());
        let lines = buf.push(&text[12..]);
        assert_eq!(lines.len(), 1);
        assert!(lines[0].contains("列出博客"));
    }

    #[test]
    fn parse_recognizes_done_and_chunks() {
        assert!(matches!(parse_sse_line("data: [DONE]"), Some(SsePayload::Done)));
        match parse_sse_line(r#"data: {"choices": []}"#) {
            Some(SsePayload::Chunk(v)) => assert!(v["choices"].is_array()),
            other => panic!("expected chunk, got {:?}", other),
        }
        assert!(parse_sse_line("").is_none());
        assert!(parse_sse_line(": keepalive").is_none());
        assert!(parse_sse_line("data: not json").is_none());
    }

    #[test]
    fn assembler_emits_once_when_arguments_complete() {
        let mut asm = ToolCallAssembler::new();

        let first = asm.absorb(&json!([
            {"index": 0, "id": "call_1", "function": {"name": "RawAllBlogData", "arguments": "{\"acco"}}
        ]));
        assert!(first.is_empty(), "arguments are not yet valid JSON");

        let second = asm.absorb(&json!([
            {"index": 0, "function": {"arguments": "unt\":\"alice\"}"}}
        ]));
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].name, "RawAllBlogData");
        assert_eq!(second[0].arguments, r#"{"account":"alice"}"#);

        // Re-delivery of the same index never re-emits.
        let third = asm.absorb(&json!([
            {"index": 0, "function": {"arguments": ""}}
        ]));
        assert!(third.is_empty());
        assert!(asm.finish().is_empty());
    }

    #[test]
    fn assembler_tracks_parallel_indexes() {
        let mut asm = ToolCallAssembler::new();
        let done = asm.absorb(&json!([
            {"index": 0, "id": "a", "function": {"name": "one", "arguments": "{}"}},
            {"index": 1, "id": "b", "function": {"name": "two", "arguments": "{\"x\":1}"}}
        ]));
        assert_eq!(done.len(), 2);
        assert_eq!(done[0].id, "a");
        assert_eq!(done[1].id, "b");
    }

    #[test]
    fn finish_defaults_unparsable_arguments() {
        let mut asm = ToolCallAssembler::new();
        asm.absorb(&json!([
            {"index": 2, "id": "c", "function": {"name": "broken", "arguments": "{\"never"}}
        ]));
        let flushed = asm.finish();
        assert_eq!(flushed.len(), 1);
        assert_eq!(flushed[0].arguments, "{}");
        // Second finish is a no-op.
        assert!(asm.finish().is_empty());
    }
}
