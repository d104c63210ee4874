//! Upstream vendor connection.
//!
//! Each session holds one live WebSocket to the current provider. The
//! connection runs as a single background task that owns the socket: it
//! drains outbound frames, parses inbound frames into events, probes
//! round-trip latency with timestamped pings, and reconnects with capped
//! exponential backoff when the peer closes unexpectedly. Nothing here
//! surfaces as an error to the session; everything arrives as an
//! [`Upstream`] message or silence.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::bus::BusNode;
use crate::config::Config;
use crate::events::{ApiStyle, Event};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

// ── Wire-level types ──────────────────────────────────────────────

/// One observed round-trip probe time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LatencySample {
    /// When the sample was taken (epoch ms).
    pub timestamp_ms: i64,
    /// Measured round-trip time (ms).
    pub latency_ms: u64,
    /// Provider the probe was sent to.
    pub provider: ApiStyle,
}

/// Messages the connection task delivers to the session loop.
#[derive(Debug)]
pub enum Upstream {
    /// The socket (re)opened. Fired once per successful connect.
    Connected,
    /// A parsed inbound event.
    Event(Event),
    /// A liveness probe completed.
    Latency(LatencySample),
    /// The link is gone for good: either closed on purpose or the
    /// reconnect budget ran out.
    Closed,
}

enum OutboundFrame {
    Json(String),
    Close,
}

/// Endpoint coordinates for one vendor.
#[derive(Debug, Clone)]
pub struct VendorEndpoint {
    pub url: String,
    pub api_key: String,
    pub model: String,
}

/// Timing knobs shared by both vendors.
#[derive(Debug, Clone)]
pub struct LinkTuning {
    pub ping_interval_ms: u64,
    pub connect_timeout_ms: u64,
    pub reconnect_initial_backoff_ms: u64,
    pub reconnect_max_backoff_ms: u64,
    pub reconnect_max_attempts: u32,
}

impl LinkTuning {
    pub fn from_config(config: &Config) -> Self {
        Self {
            ping_interval_ms: config.ping_interval_ms,
            connect_timeout_ms: config.connect_timeout_ms,
            reconnect_initial_backoff_ms: config.reconnect_initial_backoff_ms,
            reconnect_max_backoff_ms: config.reconnect_max_backoff_ms,
            reconnect_max_attempts: config.reconnect_max_attempts,
        }
    }
}

// ── Connector seam ────────────────────────────────────────────────

/// Builds provider connections. The session graph only sees this trait, so
/// tests can substitute an in-memory link.
pub trait UpstreamConnector: Send + Sync {
    fn connect(&self, provider: ApiStyle) -> ProviderConnection;
}

/// Production connector: real vendor sockets.
pub struct VendorConnector {
    openai: VendorEndpoint,
    gemini: VendorEndpoint,
    tuning: LinkTuning,
}

impl VendorConnector {
    pub fn from_config(config: &Config) -> Self {
        Self {
            openai: VendorEndpoint {
                url: config.openai_realtime_url.clone(),
                api_key: config.openai_api_key.clone(),
                model: config.openai_model.clone(),
            },
            gemini: VendorEndpoint {
                url: config.gemini_live_url.clone(),
                api_key: config.gemini_api_key.clone(),
                model: config.gemini_model.clone(),
            },
            tuning: LinkTuning::from_config(config),
        }
    }

    pub fn new(openai: VendorEndpoint, gemini: VendorEndpoint, tuning: LinkTuning) -> Self {
        Self {
            openai,
            gemini,
            tuning,
        }
    }
}

impl UpstreamConnector for VendorConnector {
    fn connect(&self, provider: ApiStyle) -> ProviderConnection {
        let endpoint = match provider {
            ApiStyle::OpenAi => self.openai.clone(),
            ApiStyle::Gemini => self.gemini.clone(),
        };
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let closing = Arc::new(AtomicBool::new(false));

        let tuning = self.tuning.clone();
        let task_closing = Arc::clone(&closing);
        tokio::spawn(async move {
            run_link(provider, endpoint, tuning, outbound_rx, events_tx, task_closing).await;
        });

        ProviderConnection::from_parts(provider, outbound_tx, events_rx, closing)
    }
}

// ── Connection handle ─────────────────────────────────────────────

/// Session-side handle to a provider link.
pub struct ProviderConnection {
    provider: ApiStyle,
    outbound_tx: mpsc::UnboundedSender<OutboundFrame>,
    events_rx: mpsc::UnboundedReceiver<Upstream>,
    closing: Arc<AtomicBool>,
}

impl ProviderConnection {
    fn from_parts(
        provider: ApiStyle,
        outbound_tx: mpsc::UnboundedSender<OutboundFrame>,
        events_rx: mpsc::UnboundedReceiver<Upstream>,
        closing: Arc<AtomicBool>,
    ) -> Self {
        Self {
            provider,
            outbound_tx,
            events_rx,
            closing,
        }
    }

    pub fn provider(&self) -> ApiStyle {
        self.provider
    }

    /// Next message from the link task. `None` once the task is gone.
    pub async fn recv(&mut self) -> Option<Upstream> {
        self.events_rx.recv().await
    }

    /// Outbound graph node feeding this link.
    pub fn sink(&self) -> UpstreamSink {
        UpstreamSink {
            outbound_tx: self.outbound_tx.clone(),
            closing: Arc::clone(&self.closing),
        }
    }

    /// Self-initiated close: no reconnect, the handle turns inert.
    pub fn close(&self) {
        self.closing.store(true, Ordering::SeqCst);
        let _ = self.outbound_tx.send(OutboundFrame::Close);
    }
}

/// Bus node serialising events onto the upstream socket.
///
/// After `close` (or while the link is down) frames are dropped silently.
pub struct UpstreamSink {
    outbound_tx: mpsc::UnboundedSender<OutboundFrame>,
    closing: Arc<AtomicBool>,
}

impl BusNode for UpstreamSink {
    fn name(&self) -> &'static str {
        "upstream"
    }

    fn receive(&mut self, event: &Event) -> Result<()> {
        if self.closing.load(Ordering::SeqCst) {
            return Ok(());
        }
        match serde_json::to_string(&event.payload) {
            Ok(json) => {
                let _ = self.outbound_tx.send(OutboundFrame::Json(json));
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to serialise outbound event");
            }
        }
        Ok(())
    }
}

// ── Link task ─────────────────────────────────────────────────────

async fn run_link(
    provider: ApiStyle,
    endpoint: VendorEndpoint,
    tuning: LinkTuning,
    mut outbound_rx: mpsc::UnboundedReceiver<OutboundFrame>,
    events_tx: mpsc::UnboundedSender<Upstream>,
    closing: Arc<AtomicBool>,
) {
    let mut failures: u32 = 0;
    let mut backoff_ms = tuning.reconnect_initial_backoff_ms;

    'link: loop {
        if closing.load(Ordering::SeqCst) {
            break;
        }

        // Frames produced while disconnected are dropped, not replayed.
        loop {
            match outbound_rx.try_recv() {
                Ok(OutboundFrame::Json(_)) => continue,
                Ok(OutboundFrame::Close) => break 'link,
                Err(mpsc::error::TryRecvError::Empty) => break,
                Err(mpsc::error::TryRecvError::Disconnected) => break 'link,
            }
        }

        let connect = open_socket(provider, &endpoint);
        let timeout = Duration::from_millis(tuning.connect_timeout_ms);
        match tokio::time::timeout(timeout, connect).await {
            Ok(Ok(ws)) => {
                failures = 0;
                backoff_ms = tuning.reconnect_initial_backoff_ms;
                tracing::info!(provider = %provider, "Upstream connected");
                if events_tx.send(Upstream::Connected).is_err() {
                    break;
                }
                let solicited =
                    pump(ws, provider, &tuning, &mut outbound_rx, &events_tx, &closing).await;
                if solicited || closing.load(Ordering::SeqCst) {
                    break;
                }
                tracing::warn!(provider = %provider, "Upstream closed unexpectedly, reconnecting");
                // Immediate reconnect attempt; backoff only applies once
                // connects start failing.
                continue;
            }
            Ok(Err(e)) => {
                tracing::error!(provider = %provider, error = %e, "Upstream connect failed");
            }
            Err(_) => {
                tracing::error!(
                    provider = %provider,
                    timeout_ms = tuning.connect_timeout_ms,
                    "Upstream connect timed out"
                );
            }
        }

        failures += 1;
        if failures >= tuning.reconnect_max_attempts {
            tracing::error!(
                provider = %provider,
                attempts = failures,
                "Upstream reconnect budget exhausted"
            );
            let _ = events_tx.send(Upstream::Closed);
            break;
        }
        tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
        backoff_ms = (backoff_ms.saturating_mul(2)).min(tuning.reconnect_max_backoff_ms);
    }

    tracing::debug!(provider = %provider, "Upstream link terminated");
}

/// Drive one open socket until it closes. Returns true when the close was
/// requested by this side.
async fn pump(
    mut ws: WsStream,
    provider: ApiStyle,
    tuning: &LinkTuning,
    outbound_rx: &mut mpsc::UnboundedReceiver<OutboundFrame>,
    events_tx: &mpsc::UnboundedSender<Upstream>,
    closing: &Arc<AtomicBool>,
) -> bool {
    let mut ping = tokio::time::interval(Duration::from_millis(tuning.ping_interval_ms.max(1)));
    ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    // The first tick of an interval fires immediately; the socket just
    // opened, so skip it.
    ping.tick().await;

    loop {
        tokio::select! {
            frame = outbound_rx.recv() => match frame {
                Some(OutboundFrame::Json(json)) => {
                    if let Err(e) = ws.send(WsMessage::Text(json)).await {
                        tracing::warn!(provider = %provider, error = %e, "Upstream send failed");
                        return closing.load(Ordering::SeqCst);
                    }
                }
                Some(OutboundFrame::Close) | None => {
                    let _ = ws.close(None).await;
                    return true;
                }
            },
            _ = ping.tick() => {
                let payload = now_epoch_ms().to_be_bytes().to_vec();
                if ws.send(WsMessage::Ping(payload)).await.is_err() {
                    return closing.load(Ordering::SeqCst);
                }
            }
            msg = ws.next() => match msg {
                Some(Ok(WsMessage::Text(text))) => {
                    forward_frame(provider, text.as_str(), events_tx);
                }
                Some(Ok(WsMessage::Binary(data))) => {
                    // Some vendors frame JSON control messages as Binary.
                    if data.first() == Some(&b'{') {
                        if let Ok(text) = std::str::from_utf8(&data) {
                            forward_frame(provider, text, events_tx);
                            continue;
                        }
                    }
                    tracing::warn!(
                        provider = %provider,
                        len = data.len(),
                        "Skipping non-JSON binary frame"
                    );
                }
                Some(Ok(WsMessage::Pong(data))) => {
                    if let Ok(bytes) = <[u8; 8]>::try_from(data.as_slice()) {
                        let sent_ms = i64::from_be_bytes(bytes);
                        let now = now_epoch_ms();
                        let latency_ms = now.saturating_sub(sent_ms).max(0) as u64;
                        let _ = events_tx.send(Upstream::Latency(LatencySample {
                            timestamp_ms: now,
                            latency_ms,
                            provider,
                        }));
                    }
                }
                Some(Ok(WsMessage::Close(frame))) => {
                    tracing::info!(provider = %provider, close_frame = ?frame, "Upstream closed");
                    return closing.load(Ordering::SeqCst);
                }
                Some(Ok(WsMessage::Ping(_) | WsMessage::Frame(_))) => {
                    // Pings are answered by tungstenite itself.
                }
                Some(Err(e)) => {
                    tracing::error!(provider = %provider, error = %e, "Upstream socket error");
                    return closing.load(Ordering::SeqCst);
                }
                None => {
                    return closing.load(Ordering::SeqCst);
                }
            }
        }
    }
}

fn forward_frame(provider: ApiStyle, text: &str, events_tx: &mpsc::UnboundedSender<Upstream>) {
    match serde_json::from_str::<Value>(text) {
        Ok(payload) => {
            let _ = events_tx.send(Upstream::Event(Event::new(provider, payload)));
        }
        Err(e) => {
            tracing::error!(provider = %provider, error = %e, "Malformed upstream frame dropped");
        }
    }
}

async fn open_socket(provider: ApiStyle, endpoint: &VendorEndpoint) -> Result<WsStream> {
    match provider {
        ApiStyle::OpenAi => {
            let url = format!("{}?model={}", endpoint.url, endpoint.model);
            let mut request = url
                .into_client_request()
                .map_err(|e| anyhow::anyhow!("Building upstream request: {e}"))?;
            request.headers_mut().insert(
                "Authorization",
                format!("Bearer {}", endpoint.api_key)
                    .parse()
                    .map_err(|e| anyhow::anyhow!("Invalid auth header: {e}"))?,
            );
            request.headers_mut().insert(
                "OpenAI-Beta",
                "realtime=v1"
                    .parse()
                    .map_err(|e| anyhow::anyhow!("Invalid header: {e}"))?,
            );
            let (ws, _response) = tokio_tungstenite::connect_async(request).await?;
            Ok(ws)
        }
        ApiStyle::Gemini => {
            let url = format!("{}?key={}", endpoint.url, endpoint.api_key);
            let (ws, _response) = tokio_tungstenite::connect_async(url).await?;
            Ok(ws)
        }
    }
}

fn now_epoch_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

// ── Test connector ────────────────────────────────────────────────


// ── Tests ─────────────────────────────────────────────────────────
