//! Parsed trace model.
//!
//! A trace is an ordered sequence of events: messages, tool calls and tool
//! outputs. Events are parsed once per analysis from a JSON array (see the
//! input format in the crate docs) and assigned trace indices and node
//! identities in document order. Tool outputs are linked to their
//! originating tool call by id, falling back to the nearest prior unmatched
//! call; the link is stored as the call's location, never an owning handle.

use crate::{CallRef, EvalError, NodeId, ObjValue, Range, StrValue, TraceError, Value};
use std::collections::BTreeMap;
use std::collections::HashMap;

// ============================================================================
// EVENT TYPES
// ============================================================================

/// A string field of the trace together with its node identity.
#[derive(Debug, Clone, PartialEq)]
pub struct TextNode {
    pub node: NodeId,
    pub text: String,
}

/// One chunk of a chunked content list.
#[derive(Debug, Clone, PartialEq)]
pub enum Chunk {
    Text { node: NodeId, text: TextNode },
    Image { node: NodeId, url: TextNode },
}

/// Content of a message or tool output.
#[derive(Debug, Clone, PartialEq)]
pub enum Content {
    Text(TextNode),
    Chunks(Vec<Chunk>),
    /// Tool outputs may carry a structured JSON object as content.
    Json(Value),
}

/// A chat message.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub node: NodeId,
    pub role: String,
    pub content: Option<Content>,
    pub tool_calls: Vec<ToolCall>,
    pub metadata: ObjValue,
}

/// A tool invocation, either standalone or inline in a message.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCall {
    pub node: NodeId,
    /// Trace index of this call: its own event index when standalone, the
    /// containing message's index when inline.
    pub trace_idx: usize,
    pub call_id: Option<String>,
    pub call_type: String,
    pub name: TextNode,
    pub arguments: Value,
    pub metadata: ObjValue,
}

/// The output of a tool invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolOutput {
    pub node: NodeId,
    pub role: String,
    pub call_id: Option<String>,
    pub content: Option<Content>,
    /// Location of the originating tool call, resolved at parse time.
    pub origin_call: Option<CallRef>,
    pub metadata: ObjValue,
}

/// A top-level trace event.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Message(Message),
    ToolCall(ToolCall),
    ToolOutput(ToolOutput),
}

impl Event {
    pub fn node(&self) -> NodeId {
        match self {
            Event::Message(m) => m.node,
            Event::ToolCall(c) => c.node,
            Event::ToolOutput(o) => o.node,
        }
    }
}

// ============================================================================
// TRACE
// ============================================================================

/// A parsed trace, frozen for the duration of one analysis.
#[derive(Debug, Clone, Default)]
pub struct Trace {
    events: Vec<Event>,
    /// Dotted JSON path per node, indexed by `NodeId`.
    paths: Vec<String>,
    /// Monotone position per event and inline call, for the flow relation.
    flow_pos: HashMap<NodeId, usize>,
}

impl Trace {
    /// Parses a trace from a JSON array of event objects.
    pub fn from_json_str(source: &str) -> Result<Self, TraceError> {
        let parsed: serde_json::Value =
            serde_json::from_str(source).map_err(|e| TraceError::InvalidInput {
                reason: e.to_string(),
            })?;
        match parsed {
            serde_json::Value::Array(events) => Self::parse(&events),
            other => Err(TraceError::InvalidInput {
                reason: format!("expected an array, got {}", other),
            }),
        }
    }

    /// Parses a trace from already-deserialized event objects.
    pub fn parse(events: &[serde_json::Value]) -> Result<Self, TraceError> {
        TraceBuilder::default().build(events)
    }

    pub fn events(&self) -> &[Event] {
        &self.events
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn message(&self, idx: usize) -> Option<&Message> {
        match self.events.get(idx) {
            Some(Event::Message(m)) => Some(m),
            _ => None,
        }
    }

    pub fn output(&self, idx: usize) -> Option<&ToolOutput> {
        match self.events.get(idx) {
            Some(Event::ToolOutput(o)) => Some(o),
            _ => None,
        }
    }

    pub fn call(&self, site: CallRef) -> Option<&ToolCall> {
        match (self.events.get(site.event), site.slot) {
            (Some(Event::ToolCall(c)), None) => Some(c),
            (Some(Event::Message(m)), Some(slot)) => m.tool_calls.get(slot),
            _ => None,
        }
    }

    /// Content of the event referenced by a `Chunks` value.
    pub fn content_of(&self, idx: usize) -> Option<&Content> {
        match self.events.get(idx) {
            Some(Event::Message(m)) => m.content.as_ref(),
            Some(Event::ToolOutput(o)) => o.content.as_ref(),
            _ => None,
        }
    }

    /// The dotted JSON path of a trace node, without the `messages.` root.
    pub fn node_path(&self, node: NodeId) -> Option<&str> {
        self.paths.get(node.0 as usize).map(String::as_str)
    }

    // ------------------------------------------------------------------------
    // Selection
    // ------------------------------------------------------------------------

    /// All events of the given declared type, in document order. Inline
    /// tool calls are included when selecting `ToolCall`.
    pub fn select(&self, type_name: &str) -> Vec<Value> {
        if type_name == "Input" {
            return vec![Value::Trace];
        }
        let mut out = Vec::new();
        for (idx, event) in self.events.iter().enumerate() {
            match (event, type_name) {
                (Event::Message(_), "Message") => out.push(Value::Message(idx)),
                (Event::Message(m), "ToolCall") => {
                    for slot in 0..m.tool_calls.len() {
                        out.push(Value::ToolCall(CallRef::inline(idx, slot)));
                    }
                }
                (Event::ToolCall(_), "ToolCall") => {
                    out.push(Value::ToolCall(CallRef::standalone(idx)))
                }
                (Event::ToolOutput(_), "ToolOutput") => out.push(Value::ToolOutput(idx)),
                _ => {}
            }
        }
        out
    }

    /// Selects values of the given type from an explicit candidate value,
    /// descending into lists, objects and message tool calls.
    pub fn select_within(&self, value: &Value, type_name: &str) -> Vec<Value> {
        match value {
            Value::Trace if type_name == "Input" => vec![Value::Trace],
            Value::Message(idx) => {
                if type_name == "Message" {
                    vec![value.clone()]
                } else if type_name == "ToolCall" {
                    let calls = self
                        .message(*idx)
                        .map(|m| m.tool_calls.len())
                        .unwrap_or(0);
                    (0..calls)
                        .map(|slot| Value::ToolCall(CallRef::inline(*idx, slot)))
                        .collect()
                } else {
                    Vec::new()
                }
            }
            Value::ToolCall(_) if type_name == "ToolCall" => vec![value.clone()],
            Value::ToolOutput(_) if type_name == "ToolOutput" => vec![value.clone()],
            Value::List(l) => l
                .items
                .iter()
                .flat_map(|item| self.select_within(item, type_name))
                .collect(),
            Value::Object(o) => o
                .entries
                .values()
                .flat_map(|item| self.select_within(item, type_name))
                .collect(),
            _ => Vec::new(),
        }
    }

    // ------------------------------------------------------------------------
    // Flow relations
    // ------------------------------------------------------------------------

    fn entity_node(&self, value: &Value) -> Option<NodeId> {
        match value {
            Value::Message(idx) | Value::ToolOutput(idx) => {
                self.events.get(*idx).map(Event::node)
            }
            Value::ToolCall(site) => self.call(*site).map(|c| c.node),
            _ => None,
        }
    }

    /// Trace index of an event value; inline tool calls carry the index of
    /// their containing message.
    pub fn trace_index_of(&self, value: &Value) -> Option<usize> {
        match value {
            Value::Message(idx) | Value::ToolOutput(idx) => Some(*idx),
            Value::ToolCall(site) => self.call(*site).map(|c| c.trace_idx),
            _ => None,
        }
    }

    /// Whether there is a dataflow edge from `a` to `b`, i.e. `a` precedes
    /// `b` in the event sequence (messages and their inline calls in
    /// document order).
    pub fn has_flow(&self, a: &Value, b: &Value) -> Result<bool, EvalError> {
        let pa = self
            .entity_node(a)
            .and_then(|n| self.flow_pos.get(&n))
            .ok_or(EvalError::NotInFlowGraph { operator: "->" })?;
        let pb = self
            .entity_node(b)
            .and_then(|n| self.flow_pos.get(&n))
            .ok_or(EvalError::NotInFlowGraph { operator: "->" })?;
        Ok(pa < pb)
    }

    /// Whether `b` is the immediately next event after `a` in the trace.
    pub fn is_successor(&self, a: &Value, b: &Value) -> Result<bool, EvalError> {
        let ia = self
            .trace_index_of(a)
            .ok_or(EvalError::NotInFlowGraph { operator: "~>" })?;
        let ib = self
            .trace_index_of(b)
            .ok_or(EvalError::NotInFlowGraph { operator: "~>" })?;
        Ok(ib == ia + 1)
    }

    // ------------------------------------------------------------------------
    // Range localization
    // ------------------------------------------------------------------------

    /// Converts identity-based ranges into addressable ranges with dotted
    /// JSON paths. Ranges whose object is not part of this trace are
    /// dropped.
    pub fn locate(&self, ranges: &[Range]) -> Vec<Range> {
        ranges
            .iter()
            .filter_map(|r| {
                let node = r.object_id?;
                let path = self.node_path(node)?;
                let mut located = r.clone();
                located.json_path = Some(path.to_string());
                Some(located)
            })
            .collect()
    }

    // ------------------------------------------------------------------------
    // Chunked content helpers
    // ------------------------------------------------------------------------

    /// Text chunks of an event's content list, with their identities.
    pub fn chunk_texts(&self, idx: usize) -> Vec<(NodeId, &str)> {
        match self.content_of(idx) {
            Some(Content::Chunks(chunks)) => chunks
                .iter()
                .filter_map(|chunk| match chunk {
                    Chunk::Text { text, .. } => Some((text.node, text.text.as_str())),
                    Chunk::Image { .. } => None,
                })
                .collect(),
            _ => Vec::new(),
        }
    }

    /// Image URL chunks of an event's content list.
    pub fn chunk_images(&self, idx: usize) -> Vec<(NodeId, &str)> {
        match self.content_of(idx) {
            Some(Content::Chunks(chunks)) => chunks
                .iter()
                .filter_map(|chunk| match chunk {
                    Chunk::Image { url, .. } => Some((url.node, url.text.as_str())),
                    Chunk::Text { .. } => None,
                })
                .collect(),
            _ => Vec::new(),
        }
    }

    // ------------------------------------------------------------------------
    // Entity attribute access
    // ------------------------------------------------------------------------

    /// Resolves member access on trace entities against their fixed
    /// attribute set. Anything outside the set is an evaluation error.
    pub fn member(&self, value: &Value, name: &str) -> Result<Value, EvalError> {
        match value {
            Value::Message(idx) => {
                let msg = self
                    .message(*idx)
                    .ok_or_else(|| EvalError::Type(format!("event {} is not a message", idx)))?;
                match name {
                    "role" => Ok(Value::str(msg.role.clone())),
                    "content" => Ok(self.content_value(msg.content.as_ref(), *idx)),
                    "tool_calls" => Ok(Value::list(
                        (0..msg.tool_calls.len())
                            .map(|slot| Value::ToolCall(CallRef::inline(*idx, slot)))
                            .collect(),
                    )),
                    "metadata" => Ok(Value::Object(msg.metadata.clone())),
                    _ => Err(EvalError::unavailable(
                        "Message",
                        name,
                        "role, content, tool_calls, metadata",
                    )),
                }
            }
            Value::ToolCall(site) => {
                let call = self
                    .call(*site)
                    .ok_or_else(|| EvalError::Type("dangling tool call reference".to_string()))?;
                match name {
                    "id" => Ok(call
                        .call_id
                        .as_ref()
                        .map(|id| Value::str(id.clone()))
                        .unwrap_or(Value::None)),
                    "type" => Ok(Value::str(call.call_type.clone())),
                    "function" => Ok(Value::FuncSpec(*site)),
                    "metadata" => Ok(Value::Object(call.metadata.clone())),
                    _ => Err(EvalError::unavailable(
                        "ToolCall",
                        name,
                        "function, type, id, metadata",
                    )),
                }
            }
            Value::FuncSpec(site) => {
                let call = self
                    .call(*site)
                    .ok_or_else(|| EvalError::Type("dangling tool call reference".to_string()))?;
                match name {
                    "name" => Ok(Value::Str(StrValue::traced(
                        call.name.text.clone(),
                        call.name.node,
                    ))),
                    "arguments" => Ok(call.arguments.clone()),
                    _ => Err(EvalError::unavailable(
                        "Function",
                        name,
                        "name, arguments",
                    )),
                }
            }
            Value::ToolOutput(idx) => {
                let out = self
                    .output(*idx)
                    .ok_or_else(|| EvalError::Type(format!("event {} is not a tool output", idx)))?;
                match name {
                    "role" => Ok(Value::str(out.role.clone())),
                    "content" => Ok(self.content_value(out.content.as_ref(), *idx)),
                    "tool_call_id" => Ok(out
                        .call_id
                        .as_ref()
                        .map(|id| Value::str(id.clone()))
                        .unwrap_or(Value::None)),
                    "metadata" => Ok(Value::Object(out.metadata.clone())),
                    _ => Err(EvalError::unavailable(
                        "ToolOutput",
                        name,
                        "role, content, tool_call_id, metadata",
                    )),
                }
            }
            Value::Chunks(idx) => match name {
                "text" | "image" => Ok(Value::Method {
                    target: Box::new(Value::Chunks(*idx)),
                    name: if name == "text" { "text" } else { "image" },
                }),
                _ => Err(EvalError::unavailable(
                    "Contents",
                    name,
                    "text, image",
                )),
            },
            other => Err(EvalError::Type(format!(
                "value of type {} does not support member access (e.g. {})",
                other.type_name(),
                name
            ))),
        }
    }

    fn content_value(&self, content: Option<&Content>, event_idx: usize) -> Value {
        match content {
            None => Value::None,
            Some(Content::Text(text)) => Value::Str(StrValue::traced(text.text.clone(), text.node)),
            Some(Content::Chunks(_)) => Value::Chunks(event_idx),
            Some(Content::Json(value)) => value.clone(),
        }
    }

    // ------------------------------------------------------------------------
    // Snapshots
    // ------------------------------------------------------------------------

    /// Detaches a value from the trace, replacing entity references with
    /// plain objects. Used when constructing error records that must stay
    /// meaningful after the trace is gone.
    pub fn snapshot(&self, value: &Value) -> Value {
        match value {
            Value::Message(idx) => {
                let Some(msg) = self.message(*idx) else {
                    return value.clone();
                };
                let mut entries = BTreeMap::new();
                entries.insert("role".to_string(), Value::str(msg.role.clone()));
                entries.insert(
                    "content".to_string(),
                    self.snapshot(&self.content_value(msg.content.as_ref(), *idx)),
                );
                entries.insert(
                    "tool_calls".to_string(),
                    Value::list(
                        (0..msg.tool_calls.len())
                            .map(|slot| {
                                self.snapshot(&Value::ToolCall(CallRef::inline(*idx, slot)))
                            })
                            .collect(),
                    ),
                );
                Value::Object(ObjValue {
                    entries,
                    origin: Some(msg.node),
                })
            }
            Value::ToolCall(site) => {
                let Some(call) = self.call(*site) else {
                    return value.clone();
                };
                let mut function = BTreeMap::new();
                function.insert("name".to_string(), Value::str(call.name.text.clone()));
                function.insert("arguments".to_string(), call.arguments.clone());
                let mut entries = BTreeMap::new();
                entries.insert(
                    "id".to_string(),
                    call.call_id
                        .as_ref()
                        .map(|id| Value::str(id.clone()))
                        .unwrap_or(Value::None),
                );
                entries.insert("type".to_string(), Value::str(call.call_type.clone()));
                entries.insert("function".to_string(), Value::object(function));
                Value::Object(ObjValue {
                    entries,
                    origin: Some(call.node),
                })
            }
            Value::ToolOutput(idx) => {
                let Some(out) = self.output(*idx) else {
                    return value.clone();
                };
                let mut entries = BTreeMap::new();
                entries.insert("role".to_string(), Value::str(out.role.clone()));
                entries.insert(
                    "content".to_string(),
                    self.snapshot(&self.content_value(out.content.as_ref(), *idx)),
                );
                entries.insert(
                    "tool_call_id".to_string(),
                    out.call_id
                        .as_ref()
                        .map(|id| Value::str(id.clone()))
                        .unwrap_or(Value::None),
                );
                Value::Object(ObjValue {
                    entries,
                    origin: Some(out.node),
                })
            }
            Value::Chunks(idx) => Value::list(
                self.chunk_texts(*idx)
                    .into_iter()
                    .map(|(node, text)| Value::Str(StrValue::traced(text.to_string(), node)))
                    .collect(),
            ),
            Value::FuncSpec(site) => {
                let Some(call) = self.call(*site) else {
                    return value.clone();
                };
                let mut entries = BTreeMap::new();
                entries.insert("name".to_string(), Value::str(call.name.text.clone()));
                entries.insert("arguments".to_string(), call.arguments.clone());
                Value::object(entries)
            }
            Value::List(l) => Value::List(crate::ListValue {
                items: l.items.iter().map(|v| self.snapshot(v)).collect(),
                origin: l.origin,
            }),
            Value::Object(o) => Value::Object(ObjValue {
                entries: o
                    .entries
                    .iter()
                    .map(|(k, v)| (k.clone(), self.snapshot(v)))
                    .collect(),
                origin: o.origin,
            }),
            other => other.clone(),
        }
    }
}

// ============================================================================
// TRACE CONSTRUCTION
// ============================================================================

#[derive(Default)]
struct TraceBuilder {
    paths: Vec<String>,
    flow_pos: HashMap<NodeId, usize>,
    next_flow: usize,
}

impl TraceBuilder {
    fn node(&mut self, path: String) -> NodeId {
        let id = NodeId(self.paths.len() as u32);
        self.paths.push(path);
        id
    }

    fn flow(&mut self, node: NodeId) {
        self.flow_pos.insert(node, self.next_flow);
        self.next_flow += 1;
    }

    fn build(mut self, raw: &[serde_json::Value]) -> Result<Trace, TraceError> {
        let mut events = Vec::with_capacity(raw.len());
        // tool calls seen so far, for output linking
        let mut calls_by_id: HashMap<String, CallRef> = HashMap::new();
        let mut unmatched: Vec<CallRef> = Vec::new();

        for (idx, event) in raw.iter().enumerate() {
            let obj = event
                .as_object()
                .ok_or_else(|| TraceError::UnrecognizedEvent {
                    index: idx,
                    reason: "event is not an object".to_string(),
                })?;

            if let Some(role) = obj.get("role").and_then(|r| r.as_str()) {
                if role == "tool" {
                    let output = self.parse_output(obj, idx, &mut calls_by_id, &mut unmatched)?;
                    events.push(Event::ToolOutput(output));
                } else {
                    let message =
                        self.parse_message(obj, idx, role, &mut calls_by_id, &mut unmatched)?;
                    events.push(Event::Message(message));
                }
            } else if obj.contains_key("type") || obj.contains_key("function") {
                let site = CallRef::standalone(idx);
                let call = self.parse_call(obj, &format!("{}", idx), idx)?;
                calls_by_id
                    .extend(call.call_id.clone().map(|id| (id, site)));
                unmatched.push(site);
                self.flow(call.node);
                events.push(Event::ToolCall(call));
            } else {
                return Err(TraceError::UnrecognizedEvent {
                    index: idx,
                    reason: "event has neither a role nor a tool-call shape".to_string(),
                });
            }
        }

        Ok(Trace {
            events,
            paths: self.paths,
            flow_pos: self.flow_pos,
        })
    }

    fn parse_message(
        &mut self,
        obj: &serde_json::Map<String, serde_json::Value>,
        idx: usize,
        role: &str,
        calls_by_id: &mut HashMap<String, CallRef>,
        unmatched: &mut Vec<CallRef>,
    ) -> Result<Message, TraceError> {
        let node = self.node(format!("{}", idx));
        self.flow(node);
        let content = self.parse_content(obj.get("content"), &format!("{}.content", idx), idx)?;

        let mut tool_calls = Vec::new();
        if let Some(serde_json::Value::Array(raw_calls)) = obj.get("tool_calls") {
            for (slot, raw_call) in raw_calls.iter().enumerate() {
                let call_obj =
                    raw_call
                        .as_object()
                        .ok_or_else(|| TraceError::UnrecognizedEvent {
                            index: idx,
                            reason: "tool call entry is not an object".to_string(),
                        })?;
                let call =
                    self.parse_call(call_obj, &format!("{}.tool_calls.{}", idx, slot), idx)?;
                let site = CallRef::inline(idx, slot);
                if let Some(id) = call.call_id.clone() {
                    calls_by_id.insert(id, site);
                }
                unmatched.push(site);
                self.flow(call.node);
                tool_calls.push(call);
            }
        }

        let metadata = self.parse_metadata(obj.get("metadata"), &format!("{}.metadata", idx));

        Ok(Message {
            node,
            role: role.to_string(),
            content,
            tool_calls,
            metadata,
        })
    }

    fn parse_call(
        &mut self,
        obj: &serde_json::Map<String, serde_json::Value>,
        path: &str,
        trace_idx: usize,
    ) -> Result<ToolCall, TraceError> {
        let node = self.node(path.to_string());
        let call_id = obj
            .get("id")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string());
        let call_type = obj
            .get("type")
            .and_then(|v| v.as_str())
            .unwrap_or("function")
            .to_string();

        let function = obj
            .get("function")
            .and_then(|v| v.as_object())
            .ok_or_else(|| TraceError::MalformedArguments {
                tool: call_id.clone().unwrap_or_default(),
                reason: "tool call has no function record".to_string(),
            })?;
        let name_text = function
            .get("name")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        let name = TextNode {
            node: self.node(format!("{}.function.name", path)),
            text: name_text.clone(),
        };

        // arguments given as a JSON string are parsed into an object here
        let raw_args = match function.get("arguments") {
            Some(serde_json::Value::String(s)) => {
                serde_json::from_str(s).map_err(|e| TraceError::MalformedArguments {
                    tool: name_text.clone(),
                    reason: e.to_string(),
                })?
            }
            Some(other) => other.clone(),
            None => serde_json::Value::Object(Default::default()),
        };
        let arguments = self.value_with_ids(&raw_args, &format!("{}.function.arguments", path));

        let metadata = self.parse_metadata(obj.get("metadata"), &format!("{}.metadata", path));

        Ok(ToolCall {
            node,
            trace_idx,
            call_id,
            call_type,
            name,
            arguments,
            metadata,
        })
    }

    fn parse_output(
        &mut self,
        obj: &serde_json::Map<String, serde_json::Value>,
        idx: usize,
        calls_by_id: &mut HashMap<String, CallRef>,
        unmatched: &mut Vec<CallRef>,
    ) -> Result<ToolOutput, TraceError> {
        let node = self.node(format!("{}", idx));
        self.flow(node);
        let content = self.parse_content(obj.get("content"), &format!("{}.content", idx), idx)?;

        let given_id = obj
            .get("tool_call_id")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string());

        // resolve the originating call: by id when present, otherwise the
        // nearest prior unmatched call
        let origin_call = match &given_id {
            Some(id) => calls_by_id.get(id).copied(),
            None => unmatched.last().copied(),
        };
        if let Some(site) = origin_call {
            unmatched.retain(|c| *c != site);
        }

        let metadata = self.parse_metadata(obj.get("metadata"), &format!("{}.metadata", idx));

        Ok(ToolOutput {
            node,
            role: "tool".to_string(),
            call_id: given_id,
            content,
            origin_call,
            metadata,
        })
    }

    fn parse_content(
        &mut self,
        raw: Option<&serde_json::Value>,
        path: &str,
        idx: usize,
    ) -> Result<Option<Content>, TraceError> {
        match raw {
            None | Some(serde_json::Value::Null) => Ok(None),
            Some(serde_json::Value::String(s)) => Ok(Some(Content::Text(TextNode {
                node: self.node(path.to_string()),
                text: s.clone(),
            }))),
            Some(serde_json::Value::Array(raw_chunks)) => {
                let mut chunks = Vec::with_capacity(raw_chunks.len());
                for (j, raw_chunk) in raw_chunks.iter().enumerate() {
                    let chunk_obj =
                        raw_chunk
                            .as_object()
                            .ok_or_else(|| TraceError::UnrecognizedEvent {
                                index: idx,
                                reason: "content chunk is not an object".to_string(),
                            })?;
                    let chunk_node = self.node(format!("{}.{}", path, j));
                    let chunk_type = chunk_obj.get("type").and_then(|v| v.as_str());
                    match chunk_type {
                        Some("text") => {
                            let text = chunk_obj
                                .get("text")
                                .and_then(|v| v.as_str())
                                .unwrap_or_default();
                            chunks.push(Chunk::Text {
                                node: chunk_node,
                                text: TextNode {
                                    node: self.node(format!("{}.{}.text", path, j)),
                                    text: text.to_string(),
                                },
                            });
                        }
                        Some("image_url") => {
                            let url = chunk_obj
                                .get("image_url")
                                .and_then(|v| v.get("url"))
                                .and_then(|v| v.as_str())
                                .unwrap_or_default();
                            chunks.push(Chunk::Image {
                                node: chunk_node,
                                url: TextNode {
                                    node: self.node(format!("{}.{}.image_url.url", path, j)),
                                    text: url.to_string(),
                                },
                            });
                        }
                        other => {
                            return Err(TraceError::UnrecognizedEvent {
                                index: idx,
                                reason: format!("unknown content chunk type: {:?}", other),
                            })
                        }
                    }
                }
                Ok(Some(Content::Chunks(chunks)))
            }
            Some(object @ serde_json::Value::Object(_)) => {
                let value = self.value_with_ids(object, path);
                Ok(Some(Content::Json(value)))
            }
            Some(other) => Err(TraceError::UnrecognizedEvent {
                index: idx,
                reason: format!("unsupported content value: {}", other),
            }),
        }
    }

    fn parse_metadata(&mut self, raw: Option<&serde_json::Value>, path: &str) -> ObjValue {
        match raw {
            Some(object @ serde_json::Value::Object(_)) => {
                match self.value_with_ids(object, path) {
                    Value::Object(obj) => obj,
                    _ => ObjValue::default(),
                }
            }
            _ => ObjValue::default(),
        }
    }

    /// Converts raw JSON into a `Value`, assigning a node identity to every
    /// string, array and object along the way.
    fn value_with_ids(&mut self, raw: &serde_json::Value, path: &str) -> Value {
        match raw {
            serde_json::Value::Null => Value::None,
            serde_json::Value::Bool(b) => Value::Bool(*b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Value::Int(i)
                } else {
                    Value::Float(n.as_f64().unwrap_or(f64::NAN))
                }
            }
            serde_json::Value::String(s) => Value::Str(StrValue {
                text: s.clone(),
                origin: Some(self.node(path.to_string())),
            }),
            serde_json::Value::Array(items) => {
                let origin = self.node(path.to_string());
                Value::List(crate::ListValue {
                    items: items
                        .iter()
                        .enumerate()
                        .map(|(i, item)| self.value_with_ids(item, &format!("{}.{}", path, i)))
                        .collect(),
                    origin: Some(origin),
                })
            }
            serde_json::Value::Object(entries) => {
                let origin = self.node(path.to_string());
                Value::Object(ObjValue {
                    entries: entries
                        .iter()
                        .map(|(k, v)| {
                            (k.clone(), self.value_with_ids(v, &format!("{}.{}", path, k)))
                        })
                        .collect(),
                    origin: Some(origin),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_trace() -> Trace {
        Trace::parse(&[
            json!({"role": "user", "content": "fetch the inbox"}),
            json!({"role": "assistant", "content": null, "tool_calls": [
                {"id": "1", "type": "function", "function": {"name": "get_inbox", "arguments": {"n": 10}}}
            ]}),
            json!({"role": "tool", "tool_call_id": "1", "content": "mail from alice"}),
        ])
        .unwrap()
    }

    #[test]
    fn parses_roles_and_indices() {
        let trace = sample_trace();
        assert_eq!(trace.len(), 3);
        assert!(matches!(trace.events()[0], Event::Message(_)));
        assert!(matches!(trace.events()[2], Event::ToolOutput(_)));
        let call = trace.call(CallRef::inline(1, 0)).unwrap();
        assert_eq!(call.name.text, "get_inbox");
        assert_eq!(call.trace_idx, 1);
    }

    #[test]
    fn links_output_to_call_by_id() {
        let trace = sample_trace();
        let out = trace.output(2).unwrap();
        assert_eq!(out.origin_call, Some(CallRef::inline(1, 0)));
    }

    #[test]
    fn links_output_to_nearest_unmatched_call_without_id() {
        let trace = Trace::parse(&[
            json!({"role": "assistant", "tool_calls": [
                {"id": "a", "type": "function", "function": {"name": "first", "arguments": {}}},
                {"id": "b", "type": "function", "function": {"name": "second", "arguments": {}}}
            ]}),
            json!({"role": "tool", "content": "out"}),
        ])
        .unwrap();
        let out = trace.output(1).unwrap();
        assert_eq!(out.origin_call, Some(CallRef::inline(0, 1)));
    }

    #[test]
    fn string_arguments_are_parsed() {
        let trace = Trace::parse(&[json!({"role": "assistant", "tool_calls": [
            {"id": "1", "type": "function", "function": {"name": "run", "arguments": "{\"x\": 2}"}}
        ]})])
        .unwrap();
        let call = trace.call(CallRef::inline(0, 0)).unwrap();
        match &call.arguments {
            Value::Object(obj) => assert_eq!(obj.get("x"), Some(&Value::Int(2))),
            other => panic!("expected object arguments, got {:?}", other),
        }
    }

    #[test]
    fn flow_follows_document_order() {
        let trace = sample_trace();
        let user = Value::Message(0);
        let call = Value::ToolCall(CallRef::inline(1, 0));
        let out = Value::ToolOutput(2);
        assert!(trace.has_flow(&user, &call).unwrap());
        assert!(trace.has_flow(&call, &out).unwrap());
        assert!(!trace.has_flow(&out, &user).unwrap());
        assert!(!trace.has_flow(&user, &user).unwrap());
    }

    #[test]
    fn successor_is_strictly_adjacent() {
        let trace = sample_trace();
        assert!(trace
            .is_successor(&Value::Message(0), &Value::Message(1))
            .unwrap());
        assert!(!trace
            .is_successor(&Value::Message(0), &Value::ToolOutput(2))
            .unwrap());
    }

    #[test]
    fn node_paths_reach_into_function_names() {
        let trace = sample_trace();
        let call = trace.call(CallRef::inline(1, 0)).unwrap();
        assert_eq!(
            trace.node_path(call.name.node),
            Some("1.tool_calls.0.function.name")
        );
    }

    #[test]
    fn member_access_is_whitelisted() {
        let trace = sample_trace();
        let msg = Value::Message(0);
        assert_eq!(trace.member(&msg, "role").unwrap(), Value::str("user"));
        let err = trace.member(&msg, "internal_state").unwrap_err();
        assert!(matches!(err, EvalError::UnavailableAttribute { .. }));
    }

    #[test]
    fn prefix_extension_keeps_node_ids_stable() {
        let base = vec![
            json!({"role": "user", "content": "hi"}),
            json!({"role": "assistant", "content": "hello"}),
        ];
        let mut extended = base.clone();
        extended.push(json!({"role": "user", "content": "more"}));

        let t1 = Trace::parse(&base).unwrap();
        let t2 = Trace::parse(&extended).unwrap();
        assert_eq!(t1.events()[1].node(), t2.events()[1].node());
    }
}
