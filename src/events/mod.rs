//! Vendor event model.
//!
//! Events are JSON trees tagged with the wire dialect they are shaped in.
//! The gateway never validates full payload schemas: extractors read only the
//! fields they recognise and everything else passes through untouched.
//!
//! Each dialect module (`openai`, `gemini`) provides two pure classifiers,
//! one for client-originated traffic and one for server-originated traffic,
//! plus the payload builders the translators use to reshape an event into
//! that dialect.

pub mod gemini;
pub mod openai;

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ── Dialect / vendor tag ──────────────────────────────────────────

/// Wire dialect of a realtime voice API. Each supported upstream vendor
/// speaks exactly one dialect, so the same tag identifies the provider a
/// session is routed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ApiStyle {
    /// OpenAI realtime shapes (`type`-discriminated events).
    OpenAi,
    /// Gemini live shapes (marker-object events: `setup`, `serverContent`, ...).
    Gemini,
}

impl ApiStyle {
    /// Tag used in handshake query parameters and logs.
    pub fn as_tag(self) -> &'static str {
        match self {
            Self::OpenAi => "OPENAI",
            Self::Gemini => "GEMINI",
        }
    }

    /// Parse a handshake tag (case-insensitive).
    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag.to_ascii_uppercase().as_str() {
            "OPENAI" => Some(Self::OpenAi),
            "GEMINI" => Some(Self::Gemini),
            _ => None,
        }
    }

    /// The alternate vendor, used as the failover target.
    pub fn other(self) -> Self {
        match self {
            Self::OpenAi => Self::Gemini,
            Self::Gemini => Self::OpenAi,
        }
    }
}

impl std::fmt::Display for ApiStyle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_tag())
    }
}

// ── Event ─────────────────────────────────────────────────────────

/// A single wire event: an opaque JSON payload plus the dialect it is
/// shaped in.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    /// Dialect of `payload`.
    pub src: ApiStyle,
    /// Opaque JSON tree; only recognised fields are ever read.
    pub payload: Value,
}

impl Event {
    pub fn new(src: ApiStyle, payload: Value) -> Self {
        Self { src, payload }
    }
}

// ── Semantic classification ───────────────────────────────────────

/// Client-originated semantic buckets.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientKind {
    /// A chunk of microphone audio (base64 payload).
    UserAudio { data: String },
    /// A session (re)configuration. The raw payload carries the config map;
    /// the config store merges it directly.
    SessionUpdate,
    /// Output of one or more tool invocations executed on the client.
    ToolResponse { responses: Vec<ToolResult> },
}

/// Server-originated semantic buckets.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerKind {
    /// Transcription delta of the user's speech.
    UserTranscript { delta: String },
    /// Transcription delta of the model's speech.
    ResponseTranscript { delta: String },
    /// Synthesized audio chunk(s) from the model.
    ResponseAudio { chunks: Vec<AudioChunk> },
    /// The model requests one or more tool invocations.
    ToolCall { calls: Vec<ToolInvocation> },
    /// End (or interruption) of a model response turn.
    TurnBoundary { boundary: TurnBoundary },
}

/// How a model turn ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnBoundary {
    /// The turn ran to completion.
    Completed,
    /// The turn was cancelled (for example the user barged in).
    Cancelled,
    /// Trailing turn-complete marker that follows a completion or
    /// interruption marker on the Gemini dialect.
    TurnComplete,
}

/// One synthesized audio chunk.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioChunk {
    /// Base64-encoded audio bytes.
    pub data: String,
    /// Declared MIME type, when the dialect carries one.
    pub mime_type: Option<String>,
}

/// A tool invocation requested by the model.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolInvocation {
    pub id: String,
    pub name: String,
    /// Parsed argument object.
    pub args: Value,
}

/// The result of a tool invocation, reported by the client.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolResult {
    pub id: String,
    /// Tool name; empty when the source dialect does not carry it.
    pub name: String,
    /// Parsed result value.
    pub output: Value,
}

// ── Extractors ────────────────────────────────────────────────────

/// Classifies client-originated events of one dialect into semantic buckets.
///
/// Classification is pure: at most one bucket matches per event, and
/// unrecognised shapes yield `None` (logged at debug by the caller's
/// dialect module).
#[derive(Debug, Clone, Copy)]
pub struct ClientExtractor {
    style: ApiStyle,
}

impl ClientExtractor {
    pub fn new(style: ApiStyle) -> Self {
        Self { style }
    }

    pub fn style(&self) -> ApiStyle {
        self.style
    }

    pub fn extract(&self, event: &Event) -> Option<ClientKind> {
        match self.style {
            ApiStyle::OpenAi => openai::extract_client(&event.payload),
            ApiStyle::Gemini => gemini::extract_client(&event.payload),
        }
    }
}

/// Classifies server-originated events of one dialect into semantic buckets.
#[derive(Debug, Clone, Copy)]
pub struct ServerExtractor {
    style: ApiStyle,
}

impl ServerExtractor {
    pub fn new(style: ApiStyle) -> Self {
        Self { style }
    }

    pub fn style(&self) -> ApiStyle {
        self.style
    }

    pub fn extract(&self, event: &Event) -> Option<ServerKind> {
        match self.style {
            ApiStyle::OpenAi => openai::extract_server(&event.payload),
            ApiStyle::Gemini => gemini::extract_server(&event.payload),
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn style_tag_roundtrip() {
        for style in [ApiStyle::OpenAi, ApiStyle::Gemini] {
            assert_eq!(ApiStyle::from_tag(style.as_tag()), Some(style));
        }
    }

    #[test]
    fn style_tag_case_insensitive() {
        assert_eq!(ApiStyle::from_tag("openai"), Some(ApiStyle::OpenAi));
        assert_eq!(ApiStyle::from_tag("Gemini"), Some(ApiStyle::Gemini));
        assert_eq!(ApiStyle::from_tag("unknown"), None);
    }

    #[test]
    fn other_is_involutive() {
        assert_eq!(ApiStyle::OpenAi.other(), ApiStyle::Gemini);
        assert_eq!(ApiStyle::Gemini.other(), ApiStyle::OpenAi);
        assert_eq!(ApiStyle::OpenAi.other().other(), ApiStyle::OpenAi);
    }

    #[test]
    fn extractor_dispatches_by_style() {
        let openai_update = Event::new(
            ApiStyle::OpenAi,
            json!({"type": "session.update", "session": {}}),
        );
        let extractor = ClientExtractor::new(ApiStyle::OpenAi);
        assert_eq!(
            extractor.extract(&openai_update),
            Some(ClientKind::SessionUpdate)
        );

        // The same payload is not a recognised Gemini client shape.
        let extractor = ClientExtractor::new(ApiStyle::Gemini);
        assert_eq!(extractor.extract(&openai_update), None);
    }
}
