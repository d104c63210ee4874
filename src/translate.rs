//! Dialect translators.
//!
//! A translator owns an extractor for its input dialect and re-emits each
//! classified event reshaped into its output dialect. When both dialects
//! match it forwards the original event untouched, so a same-vendor session
//! costs nothing. Unclassified events are dropped (the extractor already
//! logged them).
//!
//! Reshaping is semantic, not byte-exact: a round trip through the other
//! dialect must land in the same classification bucket, but delta framing
//! and field spelling may differ.

use anyhow::Result;
use serde_json::{json, Map, Value};

use crate::bus::{BusNode, EventBus, NodeHandle};
use crate::events::{
    gemini, openai, ApiStyle, ClientExtractor, ClientKind, Event, ServerExtractor, ServerKind,
    TurnBoundary,
};

// ── Client-side translator (client dialect → provider dialect) ────

pub struct ClientTranslator {
    from: ApiStyle,
    to: ApiStyle,
    extractor: ClientExtractor,
    out: EventBus,
}

impl ClientTranslator {
    pub fn new(from: ApiStyle, to: ApiStyle) -> Self {
        Self {
            from,
            to,
            extractor: ClientExtractor::new(from),
            out: EventBus::new(),
        }
    }

    pub fn subscribe(&mut self, node: NodeHandle) {
        self.out.subscribe(node);
    }

    /// Release the downstream edge. The extractor is owned exclusively and
    /// holds no references back into the graph.
    pub fn cleanup(&mut self) {
        self.out.cleanup();
    }

    fn emit(&self, payload: Value) {
        self.out.emit(&Event::new(self.to, payload));
    }
}

impl BusNode for ClientTranslator {
    fn name(&self) -> &'static str {
        "client_translator"
    }

    fn receive(&mut self, event: &Event) -> Result<()> {
        if self.from == self.to {
            self.out.emit(event);
            return Ok(());
        }

        let Some(kind) = self.extractor.extract(event) else {
            return Ok(());
        };

        match (kind, self.to) {
            (ClientKind::UserAudio { data }, ApiStyle::Gemini) => {
                self.emit(gemini::realtime_audio(&data));
            }
            (ClientKind::UserAudio { data }, ApiStyle::OpenAi) => {
                self.emit(openai::user_audio(&data));
            }
            (ClientKind::SessionUpdate, ApiStyle::Gemini) => {
                self.emit(gemini::setup(session_to_setup(event.payload.get("session"))));
            }
            (ClientKind::SessionUpdate, ApiStyle::OpenAi) => {
                self.emit(openai::session_update(setup_to_session(
                    event.payload.get("setup"),
                )));
            }
            (ClientKind::ToolResponse { responses }, ApiStyle::Gemini) => {
                self.emit(gemini::tool_response(&responses));
            }
            (ClientKind::ToolResponse { responses }, ApiStyle::OpenAi) => {
                // The target dialect carries one item per response.
                for response in &responses {
                    self.emit(openai::tool_response(response));
                }
            }
        }
        Ok(())
    }
}

// ── Server-side translator (provider dialect → client dialect) ────

pub struct ServerTranslator {
    from: ApiStyle,
    to: ApiStyle,
    extractor: ServerExtractor,
    out: EventBus,
}

impl ServerTranslator {
    pub fn new(from: ApiStyle, to: ApiStyle) -> Self {
        Self {
            from,
            to,
            extractor: ServerExtractor::new(from),
            out: EventBus::new(),
        }
    }

    pub fn subscribe(&mut self, node: NodeHandle) {
        self.out.subscribe(node);
    }

    pub fn cleanup(&mut self) {
        self.out.cleanup();
    }

    fn emit(&self, payload: Value) {
        self.out.emit(&Event::new(self.to, payload));
    }
}

impl BusNode for ServerTranslator {
    fn name(&self) -> &'static str {
        "server_translator"
    }

    fn receive(&mut self, event: &Event) -> Result<()> {
        if self.from == self.to {
            self.out.emit(event);
            return Ok(());
        }

        let Some(kind) = self.extractor.extract(event) else {
            return Ok(());
        };

        match (kind, self.to) {
            (ServerKind::UserTranscript { delta }, ApiStyle::OpenAi) => {
                self.emit(openai::user_transcript_delta(&delta));
            }
            (ServerKind::UserTranscript { delta }, ApiStyle::Gemini) => {
                self.emit(gemini::input_transcription(&delta));
            }
            (ServerKind::ResponseTranscript { delta }, ApiStyle::OpenAi) => {
                self.emit(openai::response_transcript_delta(&delta));
            }
            (ServerKind::ResponseTranscript { delta }, ApiStyle::Gemini) => {
                self.emit(gemini::output_transcription(&delta));
            }
            (ServerKind::ResponseAudio { chunks }, ApiStyle::OpenAi) => {
                for chunk in &chunks {
                    self.emit(openai::response_audio_delta(&chunk.data));
                }
            }
            (ServerKind::ResponseAudio { chunks }, ApiStyle::Gemini) => {
                self.emit(gemini::model_turn_audio(&chunks));
            }
            (ServerKind::ToolCall { calls }, ApiStyle::OpenAi) => {
                for call in &calls {
                    self.emit(openai::tool_call(call));
                }
            }
            (ServerKind::ToolCall { calls }, ApiStyle::Gemini) => {
                self.emit(gemini::tool_call(&calls));
            }
            (ServerKind::TurnBoundary { boundary }, ApiStyle::Gemini) => {
                match boundary {
                    TurnBoundary::Completed => self.emit(gemini::generation_complete()),
                    TurnBoundary::Cancelled => self.emit(gemini::interrupted()),
                    TurnBoundary::TurnComplete => {}
                }
                self.emit(gemini::turn_complete());
            }
            (ServerKind::TurnBoundary { boundary }, ApiStyle::OpenAi) => {
                // The trailing turn-complete marker is redundant here: the
                // completion or interruption marker already became a done
                // event.
                if boundary != TurnBoundary::TurnComplete {
                    self.emit(openai::turn_done(boundary));
                }
            }
        }
        Ok(())
    }
}

// ── Session configuration reshaping ───────────────────────────────

/// Reshape an OpenAI-dialect `session` map into a Gemini-dialect `setup` map.
///
/// Fields with no counterpart in the target dialect (for example `voice`)
/// are dropped silently.
fn session_to_setup(session: Option<&Value>) -> Value {
    let empty = Map::new();
    let session = session.and_then(Value::as_object).unwrap_or(&empty);

    let mut setup = Map::new();
    setup.insert("model".to_string(), json!(gemini::DEFAULT_LIVE_MODEL));
    setup.insert(
        "generationConfig".to_string(),
        json!({ "responseModalities": ["AUDIO"] }),
    );

    if let Some(instructions) = session.get("instructions").and_then(Value::as_str) {
        setup.insert(
            "systemInstruction".to_string(),
            json!({ "parts": [{ "text": instructions }] }),
        );
    }

    if let Some(tools) = session.get("tools").and_then(Value::as_array) {
        let declarations: Vec<Value> = tools
            .iter()
            .filter_map(|tool| {
                let name = tool.get("name").and_then(Value::as_str)?;
                let mut declaration = Map::new();
                declaration.insert("name".to_string(), json!(name));
                if let Some(description) = tool.get("description").and_then(Value::as_str) {
                    declaration.insert("description".to_string(), json!(description));
                }
                if let Some(parameters) = tool.get("parameters") {
                    declaration.insert(
                        "parameters".to_string(),
                        map_schema_types(parameters, true),
                    );
                }
                Some(Value::Object(declaration))
            })
            .collect();
        if !declarations.is_empty() {
            setup.insert(
                "tools".to_string(),
                json!([{ "functionDeclarations": declarations }]),
            );
        }
    }

    Value::Object(setup)
}

/// Reshape a Gemini-dialect `setup` map into an OpenAI-dialect `session` map.
fn setup_to_session(setup: Option<&Value>) -> Value {
    let empty = Map::new();
    let setup = setup.and_then(Value::as_object).unwrap_or(&empty);

    let mut session = Map::new();

    if let Some(text) = setup
        .get("systemInstruction")
        .and_then(|si| si.pointer("/parts/0/text"))
        .and_then(Value::as_str)
    {
        session.insert("instructions".to_string(), json!(text));
    }

    if let Some(tool_groups) = setup.get("tools").and_then(Value::as_array) {
        let tools: Vec<Value> = tool_groups
            .iter()
            .filter_map(|group| group.get("functionDeclarations").and_then(Value::as_array))
            .flatten()
            .filter_map(|declaration| {
                let name = declaration.get("name").and_then(Value::as_str)?;
                let mut tool = Map::new();
                tool.insert("type".to_string(), json!("function"));
                tool.insert("name".to_string(), json!(name));
                if let Some(description) = declaration.get("description").and_then(Value::as_str) {
                    tool.insert("description".to_string(), json!(description));
                }
                if let Some(parameters) = declaration.get("parameters") {
                    tool.insert(
                        "parameters".to_string(),
                        map_schema_types(parameters, false),
                    );
                }
                Some(Value::Object(tool))
            })
            .collect();
        if !tools.is_empty() {
            session.insert("tools".to_string(), Value::Array(tools));
        }
    }

    Value::Object(session)
}

/// Recursively flip the case of JSON-schema `type` tokens. The OpenAI
/// dialect uses lowercase tokens, the Gemini dialect uppercase.
fn map_schema_types(value: &Value, uppercase: bool) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(key, val)| {
                    if key == "type" {
                        if let Some(token) = val.as_str() {
                            let mapped = if uppercase {
                                token.to_ascii_uppercase()
                            } else {
                                token.to_ascii_lowercase()
                            };
                            return (key.clone(), Value::String(mapped));
                        }
                    }
                    (key.clone(), map_schema_types(val, uppercase))
                })
                .collect(),
        ),
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| map_schema_types(item, uppercase))
                .collect(),
        ),
        other => other.clone(),
    }
}

// ── Tests ─────────────────────────────────────────────────────────
