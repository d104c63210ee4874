//! Gemini live dialect: classification and payload builders.
//!
//! Events carry no type discriminator; they are recognised by the presence of
//! marker sub-objects (`setup`, `realtimeInput`, `serverContent`, `toolCall`,
//! `toolResponse`). A single frame can carry several markers; classification
//! picks the first match in a fixed priority order so that exactly one bucket
//! fires per event.

use serde_json::{json, Value};

use super::{AudioChunk, ClientKind, ServerKind, ToolInvocation, ToolResult, TurnBoundary};

/// Default model requested when a session configuration arrives from the
/// other dialect without one.
pub const DEFAULT_LIVE_MODEL: &str = "models/gemini-2.5-flash-native-audio-preview-12-2025";

/// MIME type declared on forwarded client audio.
pub const INPUT_AUDIO_MIME: &str = "audio/pcm;rate=24000";

// ── Classification ────────────────────────────────────────────────

/// Classify a client-originated payload.
pub fn extract_client(payload: &Value) -> Option<ClientKind> {
    if payload.get("setup").is_some() {
        return Some(ClientKind::SessionUpdate);
    }

    if let Some(input) = payload.get("realtimeInput") {
        if let Some(data) = input.pointer("/audio/data").and_then(Value::as_str) {
            return Some(ClientKind::UserAudio {
                data: data.to_string(),
            });
        }
        tracing::debug!("realtimeInput without audio data");
        return None;
    }

    if let Some(responses) = payload
        .pointer("/toolResponse/functionResponses")
        .and_then(Value::as_array)
    {
        let responses = responses
            .iter()
            .map(|r| ToolResult {
                id: r
                    .get("id")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                name: r
                    .get("name")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                output: r.get("response").cloned().unwrap_or(json!({})),
            })
            .collect();
        return Some(ClientKind::ToolResponse { responses });
    }

    tracing::debug!("Unclassified Gemini client event");
    None
}

/// Classify a server-originated payload.
pub fn extract_server(payload: &Value) -> Option<ServerKind> {
    if let Some(content) = payload.get("serverContent") {
        if let Some(text) = content
            .pointer("/inputTranscription/text")
            .and_then(Value::as_str)
        {
            return Some(ServerKind::UserTranscript {
                delta: text.to_string(),
            });
        }

        if let Some(text) = content
            .pointer("/outputTranscription/text")
            .and_then(Value::as_str)
        {
            return Some(ServerKind::ResponseTranscript {
                delta: text.to_string(),
            });
        }

        if let Some(parts) = content.pointer("/modelTurn/parts").and_then(Value::as_array) {
            let chunks: Vec<AudioChunk> = parts
                .iter()
                .filter_map(|part| part.get("inlineData"))
                .filter_map(|inline| {
                    let data = inline.get("data").and_then(Value::as_str)?;
                    Some(AudioChunk {
                        data: data.to_string(),
                        mime_type: inline
                            .get("mimeType")
                            .and_then(Value::as_str)
                            .map(str::to_string),
                    })
                })
                .collect();
            if !chunks.is_empty() {
                return Some(ServerKind::ResponseAudio { chunks });
            }
            tracing::debug!("modelTurn without inline audio");
            return None;
        }

        if content.get("generationComplete").and_then(Value::as_bool) == Some(true) {
            return Some(ServerKind::TurnBoundary {
                boundary: TurnBoundary::Completed,
            });
        }
        if content.get("interrupted").and_then(Value::as_bool) == Some(true) {
            return Some(ServerKind::TurnBoundary {
                boundary: TurnBoundary::Cancelled,
            });
        }
        if content.get("turnComplete").and_then(Value::as_bool) == Some(true) {
            return Some(ServerKind::TurnBoundary {
                boundary: TurnBoundary::TurnComplete,
            });
        }

        tracing::debug!("Unclassified serverContent");
        return None;
    }

    if let Some(calls) = payload
        .pointer("/toolCall/functionCalls")
        .and_then(Value::as_array)
    {
        let calls = calls
            .iter()
            .map(|c| ToolInvocation {
                id: c
                    .get("id")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                name: c
                    .get("name")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                args: c.get("args").cloned().unwrap_or(json!({})),
            })
            .collect();
        return Some(ServerKind::ToolCall { calls });
    }

    tracing::debug!("Unclassified Gemini server event");
    None
}

// ── Builders ──────────────────────────────────────────────────────

pub fn realtime_audio(data: &str) -> Value {
    json!({
        "realtimeInput": {
            "audio": {
                "mimeType": INPUT_AUDIO_MIME,
                "data": data,
            }
        }
    })
}

pub fn setup(setup: Value) -> Value {
    json!({ "setup": setup })
}

pub fn tool_response(responses: &[ToolResult]) -> Value {
    let responses: Vec<Value> = responses
        .iter()
        .map(|r| {
            json!({
                "id": r.id,
                "name": r.name,
                "response": r.output,
            })
        })
        .collect();
    json!({ "toolResponse": { "functionResponses": responses } })
}

pub fn input_transcription(text: &str) -> Value {
    json!({ "serverContent": { "inputTranscription": { "text": text } } })
}

pub fn output_transcription(text: &str) -> Value {
    json!({ "serverContent": { "outputTranscription": { "text": text } } })
}

pub fn model_turn_audio(chunks: &[AudioChunk]) -> Value {
    let parts: Vec<Value> = chunks
        .iter()
        .map(|chunk| {
            json!({
                "inlineData": {
                    "mimeType": chunk.mime_type.as_deref().unwrap_or(INPUT_AUDIO_MIME),
                    "data": chunk.data,
                }
            })
        })
        .collect();
    json!({ "serverContent": { "modelTurn": { "parts": parts } } })
}

pub fn tool_call(calls: &[ToolInvocation]) -> Value {
    let calls: Vec<Value> = calls
        .iter()
        .map(|c| {
            json!({
                "id": c.id,
                "name": c.name,
                "args": c.args,
            })
        })
        .collect();
    json!({ "toolCall": { "functionCalls": calls } })
}

pub fn generation_complete() -> Value {
    json!({ "serverContent": { "generationComplete": true } })
}

pub fn interrupted() -> Value {
    json!({ "serverContent": { "interrupted": true } })
}

pub fn turn_complete() -> Value {
    json!({ "serverContent": { "turnComplete": true } })
}

// ── Tests ─────────────────────────────────────────────────────────
