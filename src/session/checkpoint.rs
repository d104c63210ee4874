//! Conversation checkpointer.
//!
//! Watches server-side events in the client's dialect, buffers user and
//! agent transcript deltas, and appends them to the durable conversation
//! log. The log is an append-only stream of `kind:text` lines; consecutive
//! deltas of the same kind concatenate with no separator and a kind change
//! starts a fresh line. Flushes never block the event path.

use std::sync::Arc;

use anyhow::Result;

use crate::bus::BusNode;
use crate::events::{ApiStyle, Event, ServerExtractor, ServerKind};
use crate::persist::{Persistence, PersistQueue};

/// Buffered characters that trigger a flush.
const FLUSH_THRESHOLD_CHARS: usize = 200;

/// Entity key of the conversation log.
const CONVERSATIONS_ENTITY: &str = "conversations";

/// Reason recorded when a checkpoint is created without one.
const DEFAULT_CHECKPOINT_REASON: &str = "session checkpoint";

// ── Entry kinds ───────────────────────────────────────────────────

/// Kind tag of a conversation log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    User,
    Agent,
    AgentSummary,
    AgentCheckpoint,
}

impl EntryKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Agent => "agent",
            Self::AgentSummary => "agent_summary",
            Self::AgentCheckpoint => "agent_checkpoint",
        }
    }
}

// ── Transcript buffer ─────────────────────────────────────────────

/// In-memory accumulation of transcript deltas between flushes.
#[derive(Debug, Default)]
pub struct TranscriptBuffer {
    current: Option<EntryKind>,
    chunks: Vec<String>,
    total_chars: usize,
}

impl TranscriptBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a delta. Same-kind deltas concatenate; a kind change starts a
    /// new `kind:` line, preceded by a newline when the buffer already has
    /// content.
    pub fn push(&mut self, kind: EntryKind, delta: &str) {
        if self.current == Some(kind) && !self.chunks.is_empty() {
            self.chunks.push(delta.to_string());
        } else {
            if !self.chunks.is_empty() {
                self.chunks.push("\n".to_string());
            }
            self.chunks.push(format!("{}:{}", kind.as_str(), delta));
            self.current = Some(kind);
        }
        self.total_chars += delta.chars().count();
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn total_chars(&self) -> usize {
        self.total_chars
    }

    /// Serialise and reset. `None` when nothing is buffered.
    pub fn take(&mut self) -> Option<String> {
        if self.chunks.is_empty() {
            return None;
        }
        let joined = self.chunks.concat();
        self.chunks.clear();
        self.current = None;
        self.total_chars = 0;
        Some(joined)
    }
}

// ── Checkpointer ──────────────────────────────────────────────────

pub struct Checkpointer {
    account_id: String,
    session_id: String,
    extractor: ServerExtractor,
    buffer: TranscriptBuffer,
    queue: PersistQueue,
    store: Arc<dyn Persistence>,
    /// Transcript characters observed over the session lifetime, for usage
    /// accounting.
    logged_chars: u64,
}

impl Checkpointer {
    pub fn new(
        style: ApiStyle,
        account_id: String,
        session_id: String,
        store: Arc<dyn Persistence>,
        queue: PersistQueue,
    ) -> Self {
        Self {
            account_id,
            session_id,
            extractor: ServerExtractor::new(style),
            buffer: TranscriptBuffer::new(),
            queue,
            store,
            logged_chars: 0,
        }
    }

    pub fn logged_chars(&self) -> u64 {
        self.logged_chars
    }

    fn record(&mut self, kind: EntryKind, delta: &str) {
        self.buffer.push(kind, delta);
        self.logged_chars += delta.chars().count() as u64;
        if self.buffer.total_chars() >= FLUSH_THRESHOLD_CHARS {
            self.flush();
        }
    }

    /// Queue the buffered transcript for appending. Non-blocking; the
    /// buffer is reset immediately.
    pub fn flush(&mut self) {
        if let Some(text) = self.buffer.take() {
            self.queue
                .append(&self.account_id, CONVERSATIONS_ENTITY, &self.session_id, &text);
        }
    }

    /// Flush, write a checkpoint marker entry, flush again.
    pub fn create_checkpoint(&mut self, reason: Option<&str>) {
        self.flush();
        let marker = format!(
            "Checkpoint: {} - {}",
            reason.unwrap_or(DEFAULT_CHECKPOINT_REASON),
            chrono::Utc::now().to_rfc3339(),
        );
        self.buffer.push(EntryKind::AgentCheckpoint, &marker);
        self.flush();
    }

    /// Final flush plus backend release when this session owns the store.
    /// The flush is fire-and-forget; losing the tail of an unflushed buffer
    /// on a hard exit is accepted.
    pub fn cleanup(&mut self) {
        self.flush();
        if !self.store.is_shared() {
            let store = Arc::clone(&self.store);
            let session_id = self.session_id.clone();
            tokio::spawn(async move {
                if let Err(e) = store.cleanup().await {
                    tracing::error!(session_id, error = %e, "Store cleanup failed");
                }
            });
        }
    }
}

impl BusNode for Checkpointer {
    fn name(&self) -> &'static str {
        "checkpointer"
    }

    fn receive(&mut self, event: &Event) -> Result<()> {
        match self.extractor.extract(event) {
            Some(ServerKind::UserTranscript { delta }) => {
                self.record(EntryKind::User, &delta);
            }
            Some(ServerKind::ResponseTranscript { delta }) => {
                self.record(EntryKind::Agent, &delta);
            }
            // Audio, tool calls, and turn boundaries flow through the
            // pipeline but are not logged.
            Some(_) | None => {}
        }
        Ok(())
    }
}

// ── Tests ─────────────────────────────────────────────────────────
