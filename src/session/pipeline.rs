//! Per-session pipeline.
//!
//! Wires the config store, translators, provider connection, checkpointer,
//! and switch controller into one graph, owns the swap transaction, and runs
//! the session's single event loop. All handlers execute on that loop, so no
//! two ever run concurrently within a session.
//!
//! ```text
//! client ─► receive_event ─► ConfigStore ─► ClientTranslator ─► upstream
//!                                                                  │
//! socket ◄─┬─ ServerTranslator ◄───────────────────────────────────┘
//!          └─ Checkpointer          Switch ◄─ latency samples
//! ```

use std::sync::Arc;

use anyhow::Result;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use crate::bus::{BusNode, EventBus, NodeHandle};
use crate::config::Config;
use crate::events::{ApiStyle, Event};
use crate::persist::{Persistence, PersistQueue};
use crate::provider::{ProviderConnection, Upstream, UpstreamConnector};
use crate::session::checkpoint::Checkpointer;
use crate::session::config_store::SessionConfigStore;
use crate::session::switch::SwitchController;
use crate::translate::{ClientTranslator, ServerTranslator};

/// Rough token-equivalent accounting: four transcript characters per token.
const CHARS_PER_TOKEN: u64 = 4;

/// Identity of one session.
#[derive(Debug, Clone)]
pub struct SessionParams {
    /// Dialect the client speaks.
    pub style: ApiStyle,
    /// Initial upstream vendor.
    pub provider: ApiStyle,
    pub account_id: String,
    pub session_id: String,
}

/// Switch policy knobs.
#[derive(Debug, Clone, Copy)]
pub struct SwitchTuning {
    pub threshold_ms: u64,
    pub consecutive: usize,
}

impl SwitchTuning {
    pub fn from_config(config: &Config) -> Self {
        Self {
            threshold_ms: config.latency_threshold_ms,
            consecutive: config.switch_after_samples,
        }
    }
}

/// Bus node forwarding client-dialect events to the downstream socket
/// writer. A gone writer just drops frames; the session loop notices the
/// disconnect through its own channel.
struct DownstreamSink {
    tx: mpsc::UnboundedSender<String>,
}

impl BusNode for DownstreamSink {
    fn name(&self) -> &'static str {
        "downstream"
    }

    fn receive(&mut self, event: &Event) -> Result<()> {
        match serde_json::to_string(&event.payload) {
            Ok(json) => {
                let _ = self.tx.send(json);
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to serialise downstream event");
            }
        }
        Ok(())
    }
}

pub struct Pipeline {
    params: SessionParams,
    connector: Arc<dyn UpstreamConnector>,
    store: Arc<dyn Persistence>,
    queue: PersistQueue,
    config_store: SessionConfigStore,
    client_translator: Arc<Mutex<ClientTranslator>>,
    upstream: ProviderConnection,
    /// Inbound edge from the provider connection to the server translator.
    upstream_bus: EventBus,
    server_translator: Arc<Mutex<ServerTranslator>>,
    downstream: NodeHandle,
    checkpointer: Arc<Mutex<Checkpointer>>,
    switch: SwitchController,
    closed: bool,
}

impl Pipeline {
    pub fn new(
        params: SessionParams,
        downstream_tx: mpsc::UnboundedSender<String>,
        store: Arc<dyn Persistence>,
        connector: Arc<dyn UpstreamConnector>,
        tuning: SwitchTuning,
    ) -> Self {
        let queue = PersistQueue::new(Arc::clone(&store));
        let config_store = SessionConfigStore::new(
            params.style,
            params.account_id.clone(),
            params.session_id.clone(),
            Arc::clone(&store),
            queue.clone(),
        );
        let checkpointer = Arc::new(Mutex::new(Checkpointer::new(
            params.style,
            params.account_id.clone(),
            params.session_id.clone(),
            Arc::clone(&store),
            queue.clone(),
        )));
        let downstream: NodeHandle = Arc::new(Mutex::new(DownstreamSink { tx: downstream_tx }));

        let upstream = connector.connect(params.provider);
        let client_translator = Arc::new(Mutex::new(ClientTranslator::new(
            params.style,
            params.provider,
        )));
        let server_translator = Arc::new(Mutex::new(ServerTranslator::new(
            params.provider,
            params.style,
        )));
        let switch = SwitchController::new(params.provider, tuning.threshold_ms, tuning.consecutive);

        let mut pipeline = Self {
            params,
            connector,
            store,
            queue,
            config_store,
            client_translator,
            upstream,
            upstream_bus: EventBus::new(),
            server_translator,
            downstream,
            checkpointer,
            switch,
            closed: false,
        };
        pipeline.wire();
        pipeline
    }

    /// Rebuild the subscription edges around the current translators and
    /// provider connection. Every prior edge must be cleaned up first.
    fn wire(&mut self) {
        self.config_store.subscribe(self.client_translator.clone());
        self.client_translator
            .lock()
            .subscribe(Arc::new(Mutex::new(self.upstream.sink())));
        self.upstream_bus.subscribe(self.server_translator.clone());
        let mut server_translator = self.server_translator.lock();
        server_translator.subscribe(self.downstream.clone());
        server_translator.subscribe(self.checkpointer.clone());
    }

    pub fn current_provider(&self) -> ApiStyle {
        self.upstream.provider()
    }

    /// Entry point for raw client frames.
    pub fn receive_event(&mut self, raw: Value) {
        let event = Event::new(self.params.style, raw);
        if let Err(e) = self.config_store.receive(&event) {
            tracing::error!(
                session_id = %self.params.session_id,
                error = %e,
                "Client event handling failed"
            );
        }
    }

    /// React to one message from the provider link. Returns false when the
    /// session should end.
    pub(crate) async fn handle_upstream(&mut self, message: Upstream) -> bool {
        match message {
            Upstream::Connected => {
                self.handle_connected().await;
                true
            }
            Upstream::Event(event) => {
                self.upstream_bus.emit(&event);
                true
            }
            Upstream::Latency(sample) => {
                if let Some(target) = self.switch.add_sample(&sample) {
                    self.perform_swap(target);
                }
                true
            }
            Upstream::Closed => {
                tracing::error!(
                    session_id = %self.params.session_id,
                    provider = %self.upstream.provider(),
                    "Upstream gone for good, ending session"
                );
                false
            }
        }
    }

    /// Replay the merged configuration (plus prior conversation) into the
    /// upstream. Fires on the first connect and on every reconnect,
    /// including after a swap. The replay bypasses the config store so it is
    /// not persisted again.
    pub(crate) async fn handle_connected(&mut self) {
        let Some(config) = self.config_store.config_for_replay().await else {
            return;
        };
        tracing::info!(
            session_id = %self.params.session_id,
            provider = %self.upstream.provider(),
            "Replaying session config to upstream"
        );
        let mut translator = self.client_translator.lock();
        if let Err(e) = translator.receive(&config) {
            tracing::error!(
                session_id = %self.params.session_id,
                error = %e,
                "Config replay failed"
            );
        }
    }

    /// Atomic provider swap: replace the connection and both translators,
    /// keep the config store, checkpointer, switch, and downstream socket.
    pub fn perform_swap(&mut self, target: ApiStyle) {
        tracing::warn!(
            session_id = %self.params.session_id,
            from = %self.upstream.provider(),
            to = %target,
            "Swapping provider mid-session"
        );

        // Mark the hand-off in the conversation log while the old link is
        // still the current one.
        self.checkpointer
            .lock()
            .create_checkpoint(Some("provider switch"));

        // Tear down the leaving side: self-initiated close (no reconnect)
        // and release of every edge that references the old nodes.
        self.upstream.close();
        self.client_translator.lock().cleanup();
        self.server_translator.lock().cleanup();
        self.config_store.cleanup();
        self.upstream_bus.cleanup();

        // Build the arriving side and rewire the surviving nodes onto it.
        self.upstream = self.connector.connect(target);
        self.client_translator = Arc::new(Mutex::new(ClientTranslator::new(
            self.params.style,
            target,
        )));
        self.server_translator = Arc::new(Mutex::new(ServerTranslator::new(
            target,
            self.params.style,
        )));
        self.wire();
        // Replay happens when the new link reports Connected.
    }

    /// Run the session loop until the client disconnects or the upstream is
    /// gone for good, then clean up.
    pub async fn run(mut self, mut client_rx: mpsc::UnboundedReceiver<Value>) {
        self.config_store.load().await;

        loop {
            tokio::select! {
                maybe_raw = client_rx.recv() => match maybe_raw {
                    Some(raw) => self.receive_event(raw),
                    None => {
                        tracing::info!(
                            session_id = %self.params.session_id,
                            "Client disconnected, ending session"
                        );
                        break;
                    }
                },
                maybe_message = self.upstream.recv() => match maybe_message {
                    Some(message) => {
                        if !self.handle_upstream(message).await {
                            break;
                        }
                    }
                    None => {
                        tracing::warn!(
                            session_id = %self.params.session_id,
                            "Upstream link task ended, ending session"
                        );
                        break;
                    }
                },
            }
        }

        self.cleanup().await;
    }

    /// Release every owned component. Idempotent; the downstream socket is
    /// the caller's to close.
    pub async fn cleanup(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        self.config_store.cleanup();
        self.upstream.close();
        self.client_translator.lock().cleanup();
        self.server_translator.lock().cleanup();
        self.upstream_bus.cleanup();

        let logged_chars = {
            let mut checkpointer = self.checkpointer.lock();
            checkpointer.cleanup();
            checkpointer.logged_chars()
        };

        let total_tokens = (logged_chars / CHARS_PER_TOKEN) as i64;
        if total_tokens > 0 {
            let store = Arc::clone(&self.store);
            let record = json!({
                "account_id": self.params.account_id,
                "session_id": self.params.session_id,
                "total_tokens": total_tokens,
                "created_at": chrono::Utc::now().timestamp_millis(),
            });
            tokio::spawn(async move {
                if let Err(e) = store.insert("usage", &record).await {
                    // Expected when the backend has no record tables.
                    tracing::debug!(error = %e, "Usage record skipped");
                }
            });
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persist::MemoryStore;
    use crate::provider::testing::LoopbackConnector;
    use crate::provider::LatencySample;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    struct Harness {
        pipeline: Pipeline,
        connector: Arc<LoopbackConnector>,
        downstream_rx: mpsc::UnboundedReceiver<String>,
        store: Arc<dyn Persistence>,
    }

    fn harness(style: ApiStyle, provider: ApiStyle) -> Harness {
        harness_with_store(style, provider, Arc::new(MemoryStore::new()))
    }

    fn harness_with_store(
        style: ApiStyle,
        provider: ApiStyle,
        store: Arc<dyn Persistence>,
    ) -> Harness {
        let connector = LoopbackConnector::new();
        let (downstream_tx, downstream_rx) = mpsc::unbounded_channel();
        let pipeline = Pipeline::new(
            SessionParams {
                style,
                provider,
                account_id: "acc".to_string(),
                session_id: "sess".to_string(),
            },
            downstream_tx,
            Arc::clone(&store),
            connector.clone(),
            SwitchTuning {
                threshold_ms: 500,
                consecutive: 3,
            },
        );
        Harness {
            pipeline,
            connector,
            downstream_rx,
            store,
        }
    }

    /// What the fake upstream received, as parsed JSON.
    async fn upstream_frame(harness: &mut Harness, link: usize) -> Value {
        let json = tokio::time::timeout(Duration::from_secs(2), async {
            harness.connector.ends.lock()[link].outbound_rx.recv().await
        })
        .await
        .expect("timed out waiting for upstream frame")
        .expect("upstream channel closed");
        serde_json::from_str(&json).unwrap()
    }

    fn session_update(session: Value) -> Value {
        json!({"type": "session.update", "session": session})
    }

    #[tokio::test]
    async fn identity_pipeline_forwards_both_directions() {
        let mut h = harness(ApiStyle::OpenAi, ApiStyle::OpenAi);

        // Client to provider: the frame crosses unchanged.
        let update = session_update(json!({"voice": "x", "instructions": "hi"}));
        h.pipeline.receive_event(update.clone());
        assert_eq!(upstream_frame(&mut h, 0).await, update);

        // Provider to client: three frames cross unchanged, in order.
        let frames = [
            json!({"type": "response.audio_transcript.delta", "delta": "he"}),
            json!({"type": "response.audio_transcript.delta", "delta": "llo"}),
            json!({"type": "response.done", "response": {"status": "completed"}}),
        ];
        for frame in &frames {
            h.pipeline
                .handle_upstream(Upstream::Event(Event::new(ApiStyle::OpenAi, frame.clone())))
                .await;
        }
        for frame in &frames {
            let delivered: Value =
                serde_json::from_str(&h.downstream_rx.try_recv().unwrap()).unwrap();
            assert_eq!(&delivered, frame);
        }

        // The transcript was checkpointed as one agent line.
        h.pipeline.cleanup().await;
        h.pipeline.queue.drain().await;
        let log = h.store.read("acc", "conversations", "sess").await.unwrap();
        assert_eq!(log.as_deref(), Some("agent:hello"));
    }

    #[tokio::test]
    async fn cross_pipeline_translates_both_directions() {
        let mut h = harness(ApiStyle::OpenAi, ApiStyle::Gemini);

        h.pipeline.receive_event(session_update(json!({
            "voice": "x",
            "instructions": "hi",
            "tools": [{
                "type": "function",
                "name": "f",
                "parameters": {"type": "object", "properties": {"x": {"type": "string"}}},
            }],
        })));

        let setup = upstream_frame(&mut h, 0).await;
        assert_eq!(
            setup.pointer("/setup/systemInstruction/parts/0/text"),
            Some(&json!("hi"))
        );
        assert_eq!(
            setup.pointer("/setup/tools/0/functionDeclarations/0/parameters/type"),
            Some(&json!("OBJECT"))
        );
        assert_eq!(
            setup.pointer("/setup/tools/0/functionDeclarations/0/parameters/properties/x/type"),
            Some(&json!("STRING"))
        );

        // Provider transcript comes back reshaped into the client dialect.
        h.pipeline
            .handle_upstream(Upstream::Event(Event::new(
                ApiStyle::Gemini,
                json!({"serverContent": {"inputTranscription": {"text": "yo"}}}),
            )))
            .await;
        let delivered: Value = serde_json::from_str(&h.downstream_rx.try_recv().unwrap()).unwrap();
        assert_eq!(
            delivered,
            json!({
                "type": "conversation.item.input_audio_transcription.delta",
                "delta": "yo",
            })
        );
    }

    #[tokio::test]
    async fn merge_then_swap_replays_merged_config_in_new_dialect() {
        let mut h = harness(ApiStyle::OpenAi, ApiStyle::OpenAi);

        h.pipeline
            .receive_event(session_update(json!({"voice": "a", "instructions": "i"})));
        h.pipeline.receive_event(session_update(json!({"voice": "b"})));
        // Both updates crossed to the first provider.
        upstream_frame(&mut h, 0).await;
        upstream_frame(&mut h, 0).await;
        h.pipeline.queue.drain().await;

        h.pipeline.perform_swap(ApiStyle::Gemini);
        assert_eq!(h.pipeline.current_provider(), ApiStyle::Gemini);

        // The old link was closed by this side.
        assert!(h.connector.ends.lock()[0].closing.load(Ordering::SeqCst));

        // When the new provider connects, the first frame it sees is the
        // merged config in its own dialect.
        h.pipeline.handle_upstream(Upstream::Connected).await;
        let setup = upstream_frame(&mut h, 1).await;
        let text = setup
            .pointer("/setup/systemInstruction/parts/0/text")
            .and_then(Value::as_str)
            .unwrap();
        assert!(text.starts_with('i'));
        // `voice` has no counterpart in the target dialect.
        assert!(setup["setup"].get("voice").is_none());
    }

    #[tokio::test]
    async fn latency_policy_triggers_swap_through_pipeline() {
        let mut h = harness(ApiStyle::OpenAi, ApiStyle::OpenAi);

        for _ in 0..3 {
            h.pipeline
                .handle_upstream(Upstream::Latency(LatencySample {
                    timestamp_ms: 0,
                    latency_ms: 600,
                    provider: ApiStyle::OpenAi,
                }))
                .await;
        }

        assert_eq!(h.pipeline.current_provider(), ApiStyle::Gemini);
        assert_eq!(h.connector.ends.lock().len(), 2);

        // The swap left a checkpoint marker in the conversation log.
        h.pipeline.queue.drain().await;
        let log = h
            .store
            .read("acc", "conversations", "sess")
            .await
            .unwrap()
            .unwrap_or_default();
        assert!(log.contains("agent_checkpoint:Checkpoint: provider switch"));
    }

    #[tokio::test]
    async fn below_threshold_and_foreign_samples_do_not_swap() {
        let mut h = harness(ApiStyle::OpenAi, ApiStyle::OpenAi);

        for latency in [600, 499, 600, 600] {
            h.pipeline
                .handle_upstream(Upstream::Latency(LatencySample {
                    timestamp_ms: 0,
                    latency_ms: latency,
                    provider: ApiStyle::OpenAi,
                }))
                .await;
        }
        for _ in 0..3 {
            h.pipeline
                .handle_upstream(Upstream::Latency(LatencySample {
                    timestamp_ms: 0,
                    latency_ms: 501,
                    provider: ApiStyle::Gemini,
                }))
                .await;
        }

        assert_eq!(h.pipeline.current_provider(), ApiStyle::OpenAi);
        assert_eq!(h.connector.ends.lock().len(), 1);
    }

    #[tokio::test]
    async fn replay_includes_preloaded_conversation() {
        let store: Arc<dyn Persistence> = Arc::new(MemoryStore::new());
        store
            .overwrite("acc", "conversations", "sess", "user:hello\nagent:hi")
            .await
            .unwrap();
        let mut h = harness_with_store(ApiStyle::OpenAi, ApiStyle::OpenAi, store);

        h.pipeline
            .receive_event(session_update(json!({"instructions": "base"})));
        upstream_frame(&mut h, 0).await;
        h.pipeline.queue.drain().await;

        h.pipeline.handle_upstream(Upstream::Connected).await;
        let replayed = upstream_frame(&mut h, 0).await;
        let instructions = replayed
            .pointer("/session/instructions")
            .and_then(Value::as_str)
            .unwrap();
        assert!(instructions.contains("prior conversation to continue"));
        assert!(instructions.contains("user:hello\nagent:hi"));
    }

    #[tokio::test]
    async fn connect_without_any_update_replays_nothing() {
        let mut h = harness(ApiStyle::OpenAi, ApiStyle::OpenAi);
        h.pipeline.handle_upstream(Upstream::Connected).await;
        // No config was ever seen: nothing is sent upstream.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let mut ends = h.connector.ends.lock();
        assert!(ends[0].outbound_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn cleanup_is_idempotent_and_leaves_downstream_open() {
        let mut h = harness(ApiStyle::OpenAi, ApiStyle::OpenAi);
        h.pipeline
            .handle_upstream(Upstream::Event(Event::new(
                ApiStyle::OpenAi,
                json!({"type": "response.audio_transcript.delta", "delta": "x"}),
            )))
            .await;
        let _ = h.downstream_rx.try_recv();

        h.pipeline.cleanup().await;
        h.pipeline.cleanup().await;
        h.pipeline.queue.drain().await;

        let log = h.store.read("acc", "conversations", "sess").await.unwrap();
        assert_eq!(log.as_deref(), Some("agent:x"));

        // The downstream channel is still open: the sender side survives
        // cleanup because the socket belongs to the caller.
        assert!(matches!(
            h.downstream_rx.try_recv(),
            Err(mpsc::error::TryRecvError::Empty)
        ));
    }

    #[tokio::test]
    async fn cleanup_records_usage() {
        let mut h = harness(ApiStyle::OpenAi, ApiStyle::OpenAi);
        let delta = "z".repeat(40);
        h.pipeline
            .handle_upstream(Upstream::Event(Event::new(
                ApiStyle::OpenAi,
                json!({"type": "response.audio_transcript.delta", "delta": delta}),
            )))
            .await;

        h.pipeline.cleanup().await;
        // The usage insert is fire-and-forget; give it a beat.
        tokio::time::sleep(Duration::from_millis(50)).await;

        let usage = h.store.usage_sum("acc", None, None).await.unwrap().unwrap();
        assert_eq!(usage.total_tokens, 10);
    }

    #[tokio::test]
    async fn run_loop_drives_replay_and_shuts_down_with_client() {
        let h = harness(ApiStyle::OpenAi, ApiStyle::OpenAi);
        let Harness {
            pipeline,
            connector,
            mut downstream_rx,
            store,
        } = h;

        let (client_tx, client_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(pipeline.run(client_rx));

        client_tx
            .send(session_update(json!({"instructions": "hi"})))
            .unwrap();

        // The update crosses to the provider.
        let frame = tokio::time::timeout(Duration::from_secs(2), async {
            connector.ends.lock()[0].outbound_rx.recv().await
        })
        .await
        .unwrap()
        .unwrap();
        assert!(frame.contains("session.update"));

        // Upstream connect triggers replay through the loop.
        connector.ends.lock()[0]
            .events_tx
            .send(Upstream::Connected)
            .unwrap();
        let replay = tokio::time::timeout(Duration::from_secs(2), async {
            connector.ends.lock()[0].outbound_rx.recv().await
        })
        .await
        .unwrap()
        .unwrap();
        assert!(replay.contains("hi"));

        // Upstream events reach the downstream socket.
        connector.ends.lock()[0]
            .events_tx
            .send(Upstream::Event(Event::new(
                ApiStyle::OpenAi,
                json!({"type": "response.audio_transcript.delta", "delta": "ok"}),
            )))
            .unwrap();
        let delivered = tokio::time::timeout(Duration::from_secs(2), downstream_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(delivered.contains("ok"));

        // Dropping the client channel ends the session and flushes the log.
        drop(client_tx);
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap();
        // Cleanup queued the final flush before returning.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let log = store.read("acc", "conversations", "sess").await.unwrap();
        assert_eq!(log.as_deref(), Some("agent:ok"));
    }
}
