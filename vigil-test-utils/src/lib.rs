//! Vigil Test Utilities
//!
//! Centralized test infrastructure for the Vigil workspace: builders for
//! raw trace events in the JSON shape the engine ingests, plus a few
//! ready-made fixture traces. Keeping these in one crate keeps the
//! behavior tests focused on policies rather than JSON plumbing.

use serde_json::{json, Value};

// Re-export core types for convenience
pub use vigil_core::{CallRef, Range, Trace, TraceError};

// ============================================================================
// EVENT BUILDERS
// ============================================================================

/// A `system` message event.
pub fn system(content: &str) -> Value {
    json!({"role": "system", "content": content})
}

/// A `user` message event.
pub fn user(content: &str) -> Value {
    json!({"role": "user", "content": content})
}

/// An `assistant` message event.
pub fn assistant(content: &str) -> Value {
    json!({"role": "assistant", "content": content})
}

/// An assistant message carrying a single tool call.
pub fn assistant_call(id: &str, tool: &str, arguments: Value) -> Value {
    json!({
        "role": "assistant",
        "content": null,
        "tool_calls": [tool_call(id, tool, arguments)],
    })
}

/// An assistant message carrying several tool calls.
pub fn assistant_calls(calls: Vec<Value>) -> Value {
    json!({"role": "assistant", "content": null, "tool_calls": calls})
}

/// An inline tool-call object (place inside `tool_calls`).
pub fn tool_call(id: &str, tool: &str, arguments: Value) -> Value {
    json!({
        "id": id,
        "type": "function",
        "function": {"name": tool, "arguments": arguments},
    })
}

/// A tool-output event linked to a prior call.
pub fn tool_output(id: &str, content: &str) -> Value {
    json!({"role": "tool", "tool_call_id": id, "content": content})
}

/// A tool-output event without a `tool_call_id` (links to the nearest
/// prior unmatched call).
pub fn unlinked_tool_output(content: &str) -> Value {
    json!({"role": "tool", "content": content})
}

/// A message with chunked content: `(kind, payload)` pairs where kind is
/// `"text"` or `"image_url"`.
pub fn chunked_message(role: &str, chunks: &[(&str, &str)]) -> Value {
    let content: Vec<Value> = chunks
        .iter()
        .map(|(kind, payload)| match *kind {
            "text" => json!({"type": "text", "text": payload}),
            _ => json!({"type": "image_url", "image_url": {"url": payload}}),
        })
        .collect();
    json!({"role": role, "content": content})
}

// ============================================================================
// FIXTURE TRACES
// ============================================================================

/// A short conversation where the assistant fetches the inbox and sends a
/// mail with the retrieved address.
pub fn inbox_then_send_trace() -> Vec<Value> {
    vec![
        system("You are a helpful mail assistant."),
        user("Summarize my inbox and reply to Alice."),
        assistant_call("1", "get_inbox", json!({})),
        tool_output("1", "From: Alice <alice@example.com> -- please respond today"),
        assistant_call("2", "send_mail", json!({"to": "alice@example.com", "body": "Done."})),
        tool_output("2", "ok"),
    ]
}

/// A trace where fetched web content flows into an interpreter call.
pub fn fetch_then_run_trace(code: &str) -> Vec<Value> {
    vec![
        user("Get the latest instructions and run them."),
        assistant_call("1", "get_url", json!({"url": "http://example.com/setup"})),
        tool_output("1", code),
        assistant_call("2", "run_python", json!({"code": code})),
        tool_output("2", "done"),
    ]
}
