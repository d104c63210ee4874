//! Session configuration store.
//!
//! Captures every configuration update the client sends, merges them with
//! shallow last-writer-wins semantics, persists the merged view, and hands
//! out a replay copy (enriched with the prior conversation) whenever the
//! upstream connection (re)opens.

use std::sync::Arc;

use anyhow::Result;
use serde_json::Value;

use crate::bus::{BusNode, EventBus, NodeHandle};
use crate::events::{ApiStyle, ClientExtractor, ClientKind, Event};
use crate::persist::{Persistence, PersistQueue};

/// Entity key under which merged session configs are stored.
const SESSIONS_ENTITY: &str = "sessions";

/// Entity key under which conversation logs are stored.
const CONVERSATIONS_ENTITY: &str = "conversations";

/// Sentence placed before the replayed transcript in the instructions field.
const REPLAY_PREFIX: &str = "The following is the prior conversation to continue:";

pub struct SessionConfigStore {
    style: ApiStyle,
    account_id: String,
    session_id: String,
    extractor: ClientExtractor,
    stored: Option<Event>,
    store: Arc<dyn Persistence>,
    queue: PersistQueue,
    out: EventBus,
}

impl SessionConfigStore {
    pub fn new(
        style: ApiStyle,
        account_id: String,
        session_id: String,
        store: Arc<dyn Persistence>,
        queue: PersistQueue,
    ) -> Self {
        Self {
            style,
            account_id,
            session_id,
            extractor: ClientExtractor::new(style),
            stored: None,
            store,
            queue,
            out: EventBus::new(),
        }
    }

    pub fn subscribe(&mut self, node: NodeHandle) {
        self.out.subscribe(node);
    }

    pub fn cleanup(&mut self) {
        self.out.cleanup();
    }

    /// Key of the map holding the top-level config fields in this dialect.
    fn config_field(&self) -> &'static str {
        match self.style {
            ApiStyle::OpenAi => "session",
            ApiStyle::Gemini => "setup",
        }
    }

    /// Load a previously persisted config, if any. Called once at session
    /// start; failures leave the store empty.
    pub async fn load(&mut self) {
        match self
            .store
            .read(&self.account_id, SESSIONS_ENTITY, &self.session_id)
            .await
        {
            Ok(Some(text)) => match serde_json::from_str::<Value>(&text) {
                Ok(payload) => {
                    tracing::debug!(
                        session_id = %self.session_id,
                        "Loaded persisted session config"
                    );
                    self.stored = Some(Event::new(self.style, payload));
                }
                Err(e) => {
                    tracing::error!(
                        session_id = %self.session_id,
                        error = %e,
                        "Persisted session config is malformed"
                    );
                }
            },
            Ok(None) => {}
            Err(e) => {
                tracing::error!(
                    session_id = %self.session_id,
                    error = %e,
                    "Failed to load persisted session config"
                );
            }
        }
    }

    /// Currently merged config, if any update was ever seen or loaded.
    pub fn current(&self) -> Option<&Event> {
        self.stored.as_ref()
    }

    fn absorb_update(&mut self, event: &Event) {
        let field = self.config_field();
        match &mut self.stored {
            None => {
                self.stored = Some(event.clone());
            }
            Some(held) => {
                let incoming = event.payload.get(field).and_then(Value::as_object).cloned();
                let held_has_map = held
                    .payload
                    .get(field)
                    .map(Value::is_object)
                    .unwrap_or(false);
                match incoming {
                    Some(incoming) if held_has_map => {
                        // Shallow merge: each named field replaces the held
                        // one wholesale, absent fields survive.
                        if let Some(target) =
                            held.payload.get_mut(field).and_then(Value::as_object_mut)
                        {
                            for (key, value) in incoming {
                                target.insert(key, value);
                            }
                        }
                    }
                    // Either side lacks the config map: the newer payload
                    // wins wholesale.
                    _ => held.payload = event.payload.clone(),
                }
            }
        }

        if let Some(held) = &self.stored {
            match serde_json::to_string(&held.payload) {
                Ok(text) => {
                    self.queue
                        .overwrite(&self.account_id, SESSIONS_ENTITY, &self.session_id, &text);
                }
                Err(e) => {
                    tracing::error!(
                        session_id = %self.session_id,
                        error = %e,
                        "Failed to serialise session config"
                    );
                }
            }
        }
    }

    /// Replay copy of the merged config: reloaded from persistence, with the
    /// prior conversation appended into the instructions field. `None` when
    /// no configuration was ever observed.
    pub async fn config_for_replay(&mut self) -> Option<Event> {
        // Reload to pick up writes from other instances of this session.
        match self
            .store
            .read(&self.account_id, SESSIONS_ENTITY, &self.session_id)
            .await
        {
            Ok(Some(text)) => {
                if let Ok(payload) = serde_json::from_str::<Value>(&text) {
                    self.stored = Some(Event::new(self.style, payload));
                }
            }
            Ok(None) => {}
            Err(e) => {
                tracing::error!(
                    session_id = %self.session_id,
                    error = %e,
                    "Reload of session config failed, using in-memory copy"
                );
            }
        }

        let mut event = self.stored.clone()?;

        match self
            .store
            .read(&self.account_id, CONVERSATIONS_ENTITY, &self.session_id)
            .await
        {
            Ok(Some(transcript)) if !transcript.is_empty() => {
                append_history(&mut event, self.style, &transcript);
            }
            Ok(_) => {}
            Err(e) => {
                tracing::error!(
                    session_id = %self.session_id,
                    error = %e,
                    "Failed to read prior conversation, replaying config alone"
                );
            }
        }

        Some(event)
    }
}

impl BusNode for SessionConfigStore {
    fn name(&self) -> &'static str {
        "config_store"
    }

    fn receive(&mut self, event: &Event) -> Result<()> {
        if let Some(ClientKind::SessionUpdate) = self.extractor.extract(event) {
            self.absorb_update(event);
        }
        // Every event continues downstream, config updates included.
        self.out.emit(event);
        Ok(())
    }
}

/// Append the prior transcript into the dialect's instructions field.
fn append_history(event: &mut Event, style: ApiStyle, transcript: &str) {
    let addition = format!("{REPLAY_PREFIX}\n{transcript}");
    match style {
        ApiStyle::OpenAi => {
            let session = ensure_object(&mut event.payload, "session");
            let existing = session
                .get("instructions")
                .and_then(Value::as_str)
                .unwrap_or_default();
            let combined = if existing.is_empty() {
                addition
            } else {
                format!("{existing}\n\n{addition}")
            };
            session.insert("instructions".to_string(), Value::String(combined));
        }
        ApiStyle::Gemini => {
            let setup = ensure_object(&mut event.payload, "setup");
            let instruction = setup
                .entry("systemInstruction".to_string())
                .or_insert_with(|| serde_json::json!({ "parts": [{ "text": "" }] }));
            let text_slot = instruction
                .pointer_mut("/parts/0/text")
                .filter(|slot| slot.is_string());
            match text_slot {
                Some(slot) => {
                    let existing = slot.as_str().unwrap_or_default();
                    let combined = if existing.is_empty() {
                        addition
                    } else {
                        format!("{existing}\n\n{addition}")
                    };
                    *slot = Value::String(combined);
                }
                None => {
                    *instruction = serde_json::json!({ "parts": [{ "text": addition }] });
                }
            }
        }
    }
}

fn ensure_object<'a>(
    payload: &'a mut Value,
    field: &str,
) -> &'a mut serde_json::Map<String, Value> {
    if !payload.is_object() {
        *payload = Value::Object(serde_json::Map::new());
    }
    let map = payload.as_object_mut().unwrap_or_else(|| unreachable!());
    let entry = map
        .entry(field.to_string())
        .or_insert_with(|| Value::Object(serde_json::Map::new()));
    if !entry.is_object() {
        *entry = Value::Object(serde_json::Map::new());
    }
    entry.as_object_mut().unwrap_or_else(|| unreachable!())
}

// ── Tests ─────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persist::MemoryStore;
    use serde_json::json;

    fn store_pair() -> (Arc<dyn Persistence>, PersistQueue) {
        let store: Arc<dyn Persistence> = Arc::new(MemoryStore::new());
        let queue = PersistQueue::new(Arc::clone(&store));
        (store, queue)
    }

    fn openai_store() -> (SessionConfigStore, Arc<dyn Persistence>) {
        let (store, queue) = store_pair();
        let config_store = SessionConfigStore::new(
            ApiStyle::OpenAi,
            "acc".to_string(),
            "sess".to_string(),
            Arc::clone(&store),
            queue,
        );
        (config_store, store)
    }

    fn update(session: Value) -> Event {
        Event::new(
            ApiStyle::OpenAi,
            json!({"type": "session.update", "session": session}),
        )
    }

    #[tokio::test]
    async fn first_update_is_stored_verbatim() {
        let (mut config_store, _store) = openai_store();
        config_store
            .receive(&update(json!({"voice": "x", "instructions": "hi"})))
            .unwrap();

        let held = config_store.current().unwrap();
        assert_eq!(held.src, ApiStyle::OpenAi);
        assert_eq!(held.payload["session"]["voice"], "x");
        assert_eq!(held.payload["session"]["instructions"], "hi");
    }

    #[tokio::test]
    async fn merge_is_shallow_last_writer_wins() {
        let (mut config_store, _store) = openai_store();
        config_store
            .receive(&update(json!({
                "voice": "a",
                "instructions": "i",
                "tools": [{"name": "f"}],
            })))
            .unwrap();
        config_store
            .receive(&update(json!({
                "voice": "b",
                "tools": [{"name": "g"}],
            })))
            .unwrap();

        let session = &config_store.current().unwrap().payload["session"];
        assert_eq!(session["voice"], "b");
        // Untouched fields survive.
        assert_eq!(session["instructions"], "i");
        // Arrays are replaced, not concatenated.
        assert_eq!(session["tools"], json!([{"name": "g"}]));
    }

    #[tokio::test]
    async fn merged_config_is_persisted() {
        let (mut config_store, store) = openai_store();
        config_store.receive(&update(json!({"voice": "a"}))).unwrap();
        config_store.receive(&update(json!({"voice": "b"}))).unwrap();
        config_store.queue.drain().await;

        let text = store.read("acc", "sessions", "sess").await.unwrap().unwrap();
        let payload: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(payload["session"]["voice"], "b");
    }

    #[tokio::test]
    async fn non_update_events_pass_through_without_storing() {
        let (mut config_store, _store) = openai_store();
        config_store
            .receive(&Event::new(
                ApiStyle::OpenAi,
                json!({"type": "input_audio_buffer.append", "audio": "AA"}),
            ))
            .unwrap();
        assert!(config_store.current().is_none());
    }

    #[tokio::test]
    async fn load_restores_persisted_config() {
        let (store, queue) = store_pair();
        store
            .overwrite(
                "acc",
                "sessions",
                "sess",
                "{\"type\":\"session.update\",\"session\":{\"voice\":\"z\"}}",
            )
            .await
            .unwrap();

        let mut config_store = SessionConfigStore::new(
            ApiStyle::OpenAi,
            "acc".to_string(),
            "sess".to_string(),
            Arc::clone(&store),
            queue,
        );
        config_store.load().await;
        assert_eq!(
            config_store.current().unwrap().payload["session"]["voice"],
            "z"
        );
    }

    #[tokio::test]
    async fn replay_none_without_any_update() {
        let (mut config_store, _store) = openai_store();
        assert!(config_store.config_for_replay().await.is_none());
    }

    #[tokio::test]
    async fn replay_without_transcript_is_unmodified() {
        let (mut config_store, _store) = openai_store();
        config_store
            .receive(&update(json!({"instructions": "hi"})))
            .unwrap();
        config_store.queue.drain().await;

        let replayed = config_store.config_for_replay().await.unwrap();
        assert_eq!(replayed.src, ApiStyle::OpenAi);
        assert_eq!(replayed.payload["session"]["instructions"], "hi");
    }

    #[tokio::test]
    async fn replay_appends_prior_conversation() {
        let (mut config_store, store) = openai_store();
        store
            .overwrite("acc", "conversations", "sess", "user:hello\nagent:hi")
            .await
            .unwrap();
        config_store
            .receive(&update(json!({"instructions": "base"})))
            .unwrap();
        config_store.queue.drain().await;

        let replayed = config_store.config_for_replay().await.unwrap();
        let instructions = replayed.payload["session"]["instructions"].as_str().unwrap();
        assert!(instructions.starts_with("base"));
        let prefix_at = instructions.find(REPLAY_PREFIX).expect("prefix present");
        let history_at = instructions.find("user:hello\nagent:hi").expect("history present");
        assert!(history_at > prefix_at);
    }

    #[tokio::test]
    async fn replay_appends_history_for_gemini_dialect() {
        let (store, queue) = store_pair();
        store
            .overwrite("acc", "conversations", "sess", "user:a\nagent:b")
            .await
            .unwrap();

        let mut config_store = SessionConfigStore::new(
            ApiStyle::Gemini,
            "acc".to_string(),
            "sess".to_string(),
            Arc::clone(&store),
            queue,
        );
        config_store
            .receive(&Event::new(
                ApiStyle::Gemini,
                json!({"setup": {"systemInstruction": {"parts": [{"text": "base"}]}}}),
            ))
            .unwrap();
        config_store.queue.drain().await;

        let replayed = config_store.config_for_replay().await.unwrap();
        let text = replayed
            .payload
            .pointer("/setup/systemInstruction/parts/0/text")
            .and_then(Value::as_str)
            .unwrap();
        assert!(text.starts_with("base"));
        assert!(text.contains(REPLAY_PREFIX));
        assert!(text.contains("user:a\nagent:b"));
    }

    #[tokio::test]
    async fn replay_creates_instruction_path_when_missing() {
        let (store, queue) = store_pair();
        store
            .overwrite("acc", "conversations", "sess", "user:x")
            .await
            .unwrap();

        let mut config_store = SessionConfigStore::new(
            ApiStyle::Gemini,
            "acc".to_string(),
            "sess".to_string(),
            Arc::clone(&store),
            queue,
        );
        config_store
            .receive(&Event::new(
                ApiStyle::Gemini,
                json!({"setup": {"model": "models/x"}}),
            ))
            .unwrap();
        config_store.queue.drain().await;

        let replayed = config_store.config_for_replay().await.unwrap();
        let text = replayed
            .payload
            .pointer("/setup/systemInstruction/parts/0/text")
            .and_then(Value::as_str)
            .unwrap();
        assert!(text.starts_with(REPLAY_PREFIX));
        assert!(text.contains("user:x"));
        // The rest of the setup is untouched.
        assert_eq!(replayed.payload["setup"]["model"], "models/x");
    }

    #[tokio::test]
    async fn updates_are_re_emitted_to_subscribers() {
        use parking_lot::Mutex;

        struct Count(Arc<Mutex<usize>>);
        impl BusNode for Count {
            fn name(&self) -> &'static str {
                "count"
            }
            fn receive(&mut self, _event: &Event) -> Result<()> {
                *self.0.lock() += 1;
                Ok(())
            }
        }

        let (mut config_store, _store) = openai_store();
        let count = Arc::new(Mutex::new(0));
        config_store.subscribe(Arc::new(Mutex::new(Count(Arc::clone(&count)))));

        config_store.receive(&update(json!({"voice": "a"}))).unwrap();
        config_store
            .receive(&Event::new(
                ApiStyle::OpenAi,
                json!({"type": "input_audio_buffer.append", "audio": "AA"}),
            ))
            .unwrap();
        assert_eq!(*count.lock(), 2);
    }
}
