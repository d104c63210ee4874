//! OpenAI realtime dialect: classification and payload builders.
//!
//! Events are discriminated by a top-level `type` string. Only the fields the
//! gateway reads are touched; unknown event types are logged at debug and
//! dropped by the caller.

use serde_json::{json, Value};

use super::{AudioChunk, ClientKind, ServerKind, ToolInvocation, ToolResult, TurnBoundary};

// ── Classification ────────────────────────────────────────────────

/// Classify a client-originated payload.
pub fn extract_client(payload: &Value) -> Option<ClientKind> {
    let event_type = payload.get("type").and_then(Value::as_str)?;

    match event_type {
        "input_audio_buffer.append" => {
            let data = payload.get("audio").and_then(Value::as_str)?.to_string();
            Some(ClientKind::UserAudio { data })
        }
        "session.update" => Some(ClientKind::SessionUpdate),
        "conversation.item.create" => {
            let item = payload.get("item")?;
            if item.get("type").and_then(Value::as_str) != Some("function_call_output") {
                tracing::debug!(event_type, "Unclassified conversation item");
                return None;
            }
            let id = item
                .get("call_id")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let output = parse_json_string(item.get("output"));
            Some(ClientKind::ToolResponse {
                responses: vec![ToolResult {
                    id,
                    name: String::new(),
                    output,
                }],
            })
        }
        _ => {
            tracing::debug!(event_type, "Unclassified OpenAI client event");
            None
        }
    }
}

/// Classify a server-originated payload.
pub fn extract_server(payload: &Value) -> Option<ServerKind> {
    let event_type = payload.get("type").and_then(Value::as_str)?;

    match event_type {
        "conversation.item.input_audio_transcription.delta" => {
            let delta = payload.get("delta").and_then(Value::as_str)?.to_string();
            Some(ServerKind::UserTranscript { delta })
        }
        "response.audio_transcript.delta" => {
            let delta = payload.get("delta").and_then(Value::as_str)?.to_string();
            Some(ServerKind::ResponseTranscript { delta })
        }
        "response.audio.delta" => {
            let data = payload.get("delta").and_then(Value::as_str)?.to_string();
            Some(ServerKind::ResponseAudio {
                chunks: vec![AudioChunk {
                    data,
                    mime_type: None,
                }],
            })
        }
        "response.output_item.done" => {
            let item = payload.get("item")?;
            if item.get("type").and_then(Value::as_str) != Some("function_call") {
                tracing::debug!(event_type, "Output item is not a function call");
                return None;
            }
            let call = ToolInvocation {
                id: item
                    .get("call_id")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                name: item
                    .get("name")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                args: parse_json_string(item.get("arguments")),
            };
            Some(ServerKind::ToolCall { calls: vec![call] })
        }
        "response.done" => {
            let status = payload
                .pointer("/response/status")
                .and_then(Value::as_str)
                .unwrap_or_default();
            match status {
                "completed" => Some(ServerKind::TurnBoundary {
                    boundary: TurnBoundary::Completed,
                }),
                "cancelled" => Some(ServerKind::TurnBoundary {
                    boundary: TurnBoundary::Cancelled,
                }),
                _ => {
                    tracing::debug!(status, "response.done with unrecognised status");
                    None
                }
            }
        }
        _ => {
            tracing::debug!(event_type, "Unclassified OpenAI server event");
            None
        }
    }
}

/// The dialect carries tool arguments and outputs as JSON-encoded strings.
/// A value that fails to parse is kept verbatim as a string rather than lost.
fn parse_json_string(value: Option<&Value>) -> Value {
    match value {
        Some(Value::String(raw)) => serde_json::from_str(raw).unwrap_or_else(|e| {
            tracing::error!(error = %e, "Malformed embedded JSON string, passing through raw");
            Value::String(raw.clone())
        }),
        Some(other) => other.clone(),
        None => json!({}),
    }
}

// ── Builders ──────────────────────────────────────────────────────

pub fn user_audio(data: &str) -> Value {
    json!({
        "type": "input_audio_buffer.append",
        "audio": data,
    })
}

pub fn session_update(session: Value) -> Value {
    json!({
        "type": "session.update",
        "session": session,
    })
}

pub fn tool_response(result: &ToolResult) -> Value {
    let output = serde_json::to_string(&result.output).unwrap_or_default();
    json!({
        "type": "conversation.item.create",
        "item": {
            "type": "function_call_output",
            "call_id": result.id,
            "output": output,
        }
    })
}

pub fn user_transcript_delta(delta: &str) -> Value {
    json!({
        "type": "conversation.item.input_audio_transcription.delta",
        "delta": delta,
    })
}

pub fn response_transcript_delta(delta: &str) -> Value {
    json!({
        "type": "response.audio_transcript.delta",
        "delta": delta,
    })
}

pub fn response_audio_delta(data: &str) -> Value {
    json!({
        "type": "response.audio.delta",
        "delta": data,
    })
}

pub fn tool_call(call: &ToolInvocation) -> Value {
    let arguments = serde_json::to_string(&call.args).unwrap_or_default();
    json!({
        "type": "response.output_item.done",
        "item": {
            "type": "function_call",
            "call_id": call.id,
            "name": call.name,
            "arguments": arguments,
        }
    })
}

pub fn turn_done(boundary: TurnBoundary) -> Value {
    let status = match boundary {
        TurnBoundary::Cancelled => "cancelled",
        _ => "completed",
    };
    json!({
        "type": "response.done",
        "response": { "status": status },
    })
}

// ── Tests ─────────────────────────────────────────────────────────
