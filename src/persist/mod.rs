//! Durable storage contract and the per-session write queue.
//!
//! The gateway consumes storage through the [`Persistence`] trait: a small
//! keyed-entity surface (`append`/`overwrite`/`read`/`delete`/`exists` keyed
//! by account, entity kind, and session) plus a record-oriented surface for
//! account and usage rows. Session components never block the audio path on
//! storage: writes go through a [`PersistQueue`], a single worker that drains
//! jobs in submission order and logs failures instead of propagating them.

pub mod file;
pub mod memory;
pub mod sqlite;

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

pub use file::FileStore;
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// Aggregated usage for an account over a time range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsageTotals {
    pub total_tokens: i64,
}

/// Storage backend contract.
///
/// Implementations are internally concurrency-safe; a handle may be shared
/// by every session in the process (`is_shared() == true`) or owned by a
/// single session and closed with it.
#[async_trait]
pub trait Persistence: Send + Sync {
    async fn append(
        &self,
        account_id: &str,
        entity: &str,
        session_id: &str,
        content: &str,
    ) -> Result<()>;

    async fn overwrite(
        &self,
        account_id: &str,
        entity: &str,
        session_id: &str,
        content: &str,
    ) -> Result<()>;

    async fn read(&self, account_id: &str, entity: &str, session_id: &str)
        -> Result<Option<String>>;

    async fn delete(&self, account_id: &str, entity: &str, session_id: &str) -> Result<()>;

    async fn exists(&self, account_id: &str, entity: &str, session_id: &str) -> Result<bool>;

    /// Insert a record into a named table. Supported tables are backend
    /// specific; unsupported tables are an error the caller logs.
    async fn insert(&self, table: &str, data: &Value) -> Result<()>;

    async fn update(&self, table: &str, data: &Value, filter: &Value) -> Result<()>;

    async fn read_record(&self, table: &str, filter: &Value) -> Result<Option<Value>>;

    async fn delete_record(&self, table: &str, filter: &Value) -> Result<()>;

    /// Sum recorded usage for an account, optionally bounded by epoch-ms
    /// timestamps. `None` when no usage rows match.
    async fn usage_sum(
        &self,
        account_id: &str,
        from_ms: Option<i64>,
        to_ms: Option<i64>,
    ) -> Result<Option<UsageTotals>>;

    /// Block until previously accepted writes are durable.
    async fn flush(&self) -> Result<()>;

    /// Release backend resources. Idempotent.
    async fn cleanup(&self) -> Result<()>;

    /// Whether this handle is a process-wide singleton. Shared handles are
    /// left open when a session ends.
    fn is_shared(&self) -> bool;
}

// ── Ordered fire-and-forget write queue ───────────────────────────

enum Job {
    Append {
        account_id: String,
        entity: String,
        session_id: String,
        content: String,
    },
    Overwrite {
        account_id: String,
        entity: String,
        session_id: String,
        content: String,
    },
    Flush(oneshot::Sender<()>),
}

/// Per-session write queue.
///
/// Jobs are drained by one worker task in submission order, which is what
/// keeps transcript appends ordered without making the event path wait on
/// storage. Dropping every clone of the queue lets the worker drain whatever
/// is still buffered and exit.
#[derive(Clone)]
pub struct PersistQueue {
    tx: mpsc::UnboundedSender<Job>,
}

impl PersistQueue {
    pub fn new(store: Arc<dyn Persistence>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                match job {
                    Job::Append {
                        account_id,
                        entity,
                        session_id,
                        content,
                    } => {
                        if let Err(e) = store
                            .append(&account_id, &entity, &session_id, &content)
                            .await
                        {
                            tracing::error!(
                                account_id,
                                entity,
                                session_id,
                                error = %e,
                                "Persistence append failed"
                            );
                        }
                    }
                    Job::Overwrite {
                        account_id,
                        entity,
                        session_id,
                        content,
                    } => {
                        if let Err(e) = store
                            .overwrite(&account_id, &entity, &session_id, &content)
                            .await
                        {
                            tracing::error!(
                                account_id,
                                entity,
                                session_id,
                                error = %e,
                                "Persistence overwrite failed"
                            );
                        }
                    }
                    Job::Flush(ack) => {
                        if let Err(e) = store.flush().await {
                            tracing::error!(error = %e, "Persistence flush failed");
                        }
                        let _ = ack.send(());
                    }
                }
            }
        });
        Self { tx }
    }

    /// Queue an append. Never blocks; a closed queue drops the write.
    pub fn append(&self, account_id: &str, entity: &str, session_id: &str, content: &str) {
        let _ = self.tx.send(Job::Append {
            account_id: account_id.to_string(),
            entity: entity.to_string(),
            session_id: session_id.to_string(),
            content: content.to_string(),
        });
    }

    /// Queue an overwrite. Never blocks; a closed queue drops the write.
    pub fn overwrite(&self, account_id: &str, entity: &str, session_id: &str, content: &str) {
        let _ = self.tx.send(Job::Overwrite {
            account_id: account_id.to_string(),
            entity: entity.to_string(),
            session_id: session_id.to_string(),
            content: content.to_string(),
        });
    }

    /// Wait until every job queued before this call has been applied.
    pub async fn drain(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.tx.send(Job::Flush(ack_tx)).is_ok() {
            let _ = ack_rx.await;
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────
