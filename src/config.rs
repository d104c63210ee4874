//! Process configuration for the voxswitch gateway.
//!
//! All knobs come from environment variables with sensible defaults, and the
//! loaded snapshot is injected into the server and each session pipeline.
//! Nothing reads the environment after startup.

use std::collections::HashMap;
use std::path::PathBuf;

/// Default latency threshold before a provider switch is considered (ms).
const DEFAULT_LATENCY_THRESHOLD_MS: u64 = 500;

/// Default number of consecutive over-threshold samples that trigger a switch.
const DEFAULT_SWITCH_AFTER_SAMPLES: usize = 3;

/// Minimum wall-clock gap between upstream liveness probes (ms).
const DEFAULT_PING_INTERVAL_MS: u64 = 5_000;

/// Upstream connect timeout (ms).
const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 5_000;

/// First reconnect delay after an unsolicited upstream close (ms).
const DEFAULT_RECONNECT_INITIAL_BACKOFF_MS: u64 = 500;

/// Reconnect backoff ceiling (ms).
const DEFAULT_RECONNECT_MAX_BACKOFF_MS: u64 = 30_000;

/// Give up on an upstream after this many consecutive failed connects.
const DEFAULT_RECONNECT_MAX_ATTEMPTS: u32 = 10;

/// Process-wide configuration snapshot.
#[derive(Debug, Clone)]
pub struct Config {
    /// Bind host for the client-facing gateway.
    pub host: String,
    /// Bind port for the client-facing gateway.
    pub port: u16,
    /// Comma-separated `accountId=key` pairs consulted before the database.
    pub account_keys: String,
    /// Latency threshold for the switch policy (ms).
    pub latency_threshold_ms: u64,
    /// Consecutive over-threshold samples required to switch providers.
    pub switch_after_samples: usize,
    /// Liveness probe interval (ms).
    pub ping_interval_ms: u64,
    /// Upstream connect timeout (ms).
    pub connect_timeout_ms: u64,
    /// First reconnect backoff delay (ms).
    pub reconnect_initial_backoff_ms: u64,
    /// Reconnect backoff ceiling (ms).
    pub reconnect_max_backoff_ms: u64,
    /// Maximum consecutive failed upstream connects before giving up.
    pub reconnect_max_attempts: u32,
    /// OpenAI realtime API key.
    pub openai_api_key: String,
    /// Gemini live API key.
    pub gemini_api_key: String,
    /// OpenAI realtime WebSocket endpoint.
    pub openai_realtime_url: String,
    /// Gemini live WebSocket endpoint.
    pub gemini_live_url: String,
    /// Model served on the OpenAI upstream.
    pub openai_model: String,
    /// Model served on the Gemini upstream.
    pub gemini_model: String,
    /// SQLite database path; `None` disables the database-backed store.
    pub db_path: Option<PathBuf>,
    /// Base directory for the file-tree persistence backend.
    pub data_dir: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8490,
            account_keys: String::new(),
            latency_threshold_ms: DEFAULT_LATENCY_THRESHOLD_MS,
            switch_after_samples: DEFAULT_SWITCH_AFTER_SAMPLES,
            ping_interval_ms: DEFAULT_PING_INTERVAL_MS,
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
            reconnect_initial_backoff_ms: DEFAULT_RECONNECT_INITIAL_BACKOFF_MS,
            reconnect_max_backoff_ms: DEFAULT_RECONNECT_MAX_BACKOFF_MS,
            reconnect_max_attempts: DEFAULT_RECONNECT_MAX_ATTEMPTS,
            openai_api_key: String::new(),
            gemini_api_key: String::new(),
            openai_realtime_url: "wss://api.openai.com/v1/realtime".to_string(),
            gemini_live_url:
                "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent"
                    .to_string(),
            openai_model: "gpt-4o-realtime-preview".to_string(),
            gemini_model: "gemini-2.5-flash-native-audio-preview-12-2025".to_string(),
            db_path: None,
            data_dir: PathBuf::from("./data"),
        }
    }
}

impl Config {
    /// Load the configuration from `VOXSWITCH_*` environment variables,
    /// falling back to defaults for anything unset.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            host: env_string("VOXSWITCH_HOST", defaults.host),
            port: env_parse("VOXSWITCH_PORT", defaults.port),
            account_keys: env_string("VOXSWITCH_ACCOUNT_KEYS", defaults.account_keys),
            latency_threshold_ms: env_parse(
                "VOXSWITCH_LATENCY_THRESHOLD_MS",
                defaults.latency_threshold_ms,
            ),
            switch_after_samples: env_parse(
                "VOXSWITCH_SWITCH_AFTER_SAMPLES",
                defaults.switch_after_samples,
            ),
            ping_interval_ms: env_parse("VOXSWITCH_PING_INTERVAL_MS", defaults.ping_interval_ms),
            connect_timeout_ms: env_parse(
                "VOXSWITCH_CONNECT_TIMEOUT_MS",
                defaults.connect_timeout_ms,
            ),
            reconnect_initial_backoff_ms: env_parse(
                "VOXSWITCH_RECONNECT_INITIAL_BACKOFF_MS",
                defaults.reconnect_initial_backoff_ms,
            ),
            reconnect_max_backoff_ms: env_parse(
                "VOXSWITCH_RECONNECT_MAX_BACKOFF_MS",
                defaults.reconnect_max_backoff_ms,
            ),
            reconnect_max_attempts: env_parse(
                "VOXSWITCH_RECONNECT_MAX_ATTEMPTS",
                defaults.reconnect_max_attempts,
            ),
            openai_api_key: env_string("VOXSWITCH_OPENAI_API_KEY", defaults.openai_api_key),
            gemini_api_key: env_string("VOXSWITCH_GEMINI_API_KEY", defaults.gemini_api_key),
            openai_realtime_url: env_string(
                "VOXSWITCH_OPENAI_REALTIME_URL",
                defaults.openai_realtime_url,
            ),
            gemini_live_url: env_string("VOXSWITCH_GEMINI_LIVE_URL", defaults.gemini_live_url),
            openai_model: env_string("VOXSWITCH_OPENAI_MODEL", defaults.openai_model),
            gemini_model: env_string("VOXSWITCH_GEMINI_MODEL", defaults.gemini_model),
            db_path: std::env::var("VOXSWITCH_DB_PATH").ok().map(PathBuf::from),
            data_dir: std::env::var("VOXSWITCH_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
        }
    }

    /// Parse the `accountId=key` pairs from the inline configuration string.
    ///
    /// Malformed entries are skipped with a warning; an empty string yields an
    /// empty map.
    pub fn inline_account_keys(&self) -> HashMap<String, String> {
        let mut keys = HashMap::new();
        for pair in self.account_keys.split(',') {
            let pair = pair.trim();
            if pair.is_empty() {
                continue;
            }
            match pair.split_once('=') {
                Some((account, key)) if !account.is_empty() && !key.is_empty() => {
                    keys.insert(account.trim().to_string(), key.trim().to_string());
                }
                _ => {
                    tracing::warn!(entry = pair, "Skipping malformed account key entry");
                }
            }
        }
        keys
    }
}

fn env_string(name: &str, default: String) -> String {
    std::env::var(name).unwrap_or(default)
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    match std::env::var(name) {
        Ok(raw) => raw.parse().unwrap_or(default),
        Err(_) => default,
    }
}

// ── Tests ──────────────────────────────────────────────────────────
