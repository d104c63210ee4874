//! voxswitch: a real-time voice AI switching gateway.
//!
//! Clients stream audio and events over one persistent WebSocket in either
//! supported vendor dialect; the gateway routes the session to an upstream
//! vendor (not necessarily the same one), translating events in both
//! directions. When upstream latency degrades past a policy threshold, the
//! session fails over to the alternate vendor mid-conversation: the
//! connection and its flanking translators are swapped atomically and the
//! merged session configuration, enriched with the conversation so far, is
//! replayed so the dialogue continues where it left off.
//!
//! ## Architecture
//! - `events` - dialect tags, event model, per-dialect classifiers
//! - `bus` - synchronous ordered fan-out between session graph nodes
//! - `translate` - identity and cross-dialect translators
//! - `provider` - upstream vendor links: liveness probing, reconnect
//! - `session` - config store, checkpointer, switch policy, pipeline
//! - `persist` - storage contract with file, SQLite, and in-memory backends
//! - `auth` / `server` - handshake verification and the client-facing server

pub mod auth;
pub mod bus;
pub mod config;
pub mod events;
pub mod persist;
pub mod provider;
pub mod server;
pub mod session;
pub mod translate;

pub use config::Config;
pub use events::{ApiStyle, Event};
pub use session::{Pipeline, SessionParams};
