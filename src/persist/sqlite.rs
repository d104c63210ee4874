//! SQLite persistence backend.
//!
//! One connection behind a mutex, WAL mode, shared by every session in the
//! process. Entities land in a single keyed table; accounts and usage get
//! typed tables so the record operations stay parameterised SQL rather than
//! string-built queries.

use std::path::Path;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::{json, Value};

use super::{Persistence, UsageTotals};
use crate::auth::AccountManager;

/// Process-wide SQLite-backed store.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) the database at the given path.
    pub fn new(db_path: &Path) -> Result<Self> {
        let conn = Connection::open(db_path)
            .with_context(|| format!("Opening database {}", db_path.display()))?;
        Self::init(conn)
    }

    /// Open an in-memory database (tests and ephemeral runs).
    pub fn in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;",
        )?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS entities (
                account_id TEXT NOT NULL,
                entity TEXT NOT NULL,
                session_id TEXT NOT NULL,
                content TEXT NOT NULL,
                PRIMARY KEY (account_id, entity, session_id)
            );

            CREATE TABLE IF NOT EXISTS accounts (
                account_id TEXT PRIMARY KEY,
                account_key TEXT NOT NULL,
                created_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS usage (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                account_id TEXT NOT NULL,
                session_id TEXT NOT NULL,
                total_tokens INTEGER NOT NULL,
                created_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_usage_account ON usage(account_id, created_at);",
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

fn filter_account_id(filter: &Value) -> Result<&str> {
    filter
        .get("account_id")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| anyhow::anyhow!("Filter requires account_id"))
}

fn now_epoch_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[async_trait]
impl Persistence for SqliteStore {
    async fn append(
        &self,
        account_id: &str,
        entity: &str,
        session_id: &str,
        content: &str,
    ) -> Result<()> {
        self.conn.lock().execute(
            "INSERT INTO entities (account_id, entity, session_id, content)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT (account_id, entity, session_id)
             DO UPDATE SET content = entities.content || excluded.content",
            params![account_id, entity, session_id, content],
        )?;
        Ok(())
    }

    async fn overwrite(
        &self,
        account_id: &str,
        entity: &str,
        session_id: &str,
        content: &str,
    ) -> Result<()> {
        self.conn.lock().execute(
            "INSERT OR REPLACE INTO entities (account_id, entity, session_id, content)
             VALUES (?1, ?2, ?3, ?4)",
            params![account_id, entity, session_id, content],
        )?;
        Ok(())
    }

    async fn read(
        &self,
        account_id: &str,
        entity: &str,
        session_id: &str,
    ) -> Result<Option<String>> {
        let content = self
            .conn
            .lock()
            .query_row(
                "SELECT content FROM entities
                 WHERE account_id = ?1 AND entity = ?2 AND session_id = ?3",
                params![account_id, entity, session_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(content)
    }

    async fn delete(&self, account_id: &str, entity: &str, session_id: &str) -> Result<()> {
        self.conn.lock().execute(
            "DELETE FROM entities
             WHERE account_id = ?1 AND entity = ?2 AND session_id = ?3",
            params![account_id, entity, session_id],
        )?;
        Ok(())
    }

    async fn exists(&self, account_id: &str, entity: &str, session_id: &str) -> Result<bool> {
        let found: Option<i64> = self
            .conn
            .lock()
            .query_row(
                "SELECT 1 FROM entities
                 WHERE account_id = ?1 AND entity = ?2 AND session_id = ?3",
                params![account_id, entity, session_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    async fn insert(&self, table: &str, data: &Value) -> Result<()> {
        match table {
            "accounts" => {
                let account_id = data
                    .get("account_id")
                    .and_then(Value::as_str)
                    .filter(|s| !s.is_empty())
                    .ok_or_else(|| anyhow::anyhow!("Account record requires account_id"))?;
                let account_key = data
                    .get("account_key")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                self.conn.lock().execute(
                    "INSERT OR REPLACE INTO accounts (account_id, account_key, created_at)
                     VALUES (?1, ?2, ?3)",
                    params![account_id, account_key, now_epoch_ms()],
                )?;
            }
            "usage" => {
                let account_id = data
                    .get("account_id")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                let session_id = data
                    .get("session_id")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                let total_tokens = data
                    .get("total_tokens")
                    .and_then(Value::as_i64)
                    .unwrap_or(0);
                let created_at = data
                    .get("created_at")
                    .and_then(Value::as_i64)
                    .unwrap_or_else(now_epoch_ms);
                self.conn.lock().execute(
                    "INSERT INTO usage (account_id, session_id, total_tokens, created_at)
                     VALUES (?1, ?2, ?3, ?4)",
                    params![account_id, session_id, total_tokens, created_at],
                )?;
            }
            other => bail!("Unknown table: {other}"),
        }
        Ok(())
    }

    async fn update(&self, table: &str, data: &Value, filter: &Value) -> Result<()> {
        if table != "accounts" {
            bail!("Unknown table: {table}");
        }
        let account_id = filter_account_id(filter)?;
        let account_key = data
            .get("account_key")
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow::anyhow!("Account update requires account_key"))?;
        let changed = self.conn.lock().execute(
            "UPDATE accounts SET account_key = ?1 WHERE account_id = ?2",
            params![account_key, account_id],
        )?;
        if changed == 0 {
            bail!("No account record: {account_id}");
        }
        Ok(())
    }

    async fn read_record(&self, table: &str, filter: &Value) -> Result<Option<Value>> {
        if table != "accounts" {
            bail!("Unknown table: {table}");
        }
        let account_id = filter_account_id(filter)?;
        let record = self
            .conn
            .lock()
            .query_row(
                "SELECT account_id, account_key, created_at FROM accounts WHERE account_id = ?1",
                params![account_id],
                |row| {
                    Ok(json!({
                        "account_id": row.get::<_, String>(0)?,
                        "account_key": row.get::<_, String>(1)?,
                        "created_at": row.get::<_, i64>(2)?,
                    }))
                },
            )
            .optional()?;
        Ok(record)
    }

    async fn delete_record(&self, table: &str, filter: &Value) -> Result<()> {
        if table != "accounts" {
            bail!("Unknown table: {table}");
        }
        let account_id = filter_account_id(filter)?;
        self.conn.lock().execute(
            "DELETE FROM accounts WHERE account_id = ?1",
            params![account_id],
        )?;
        Ok(())
    }

    async fn usage_sum(
        &self,
        account_id: &str,
        from_ms: Option<i64>,
        to_ms: Option<i64>,
    ) -> Result<Option<UsageTotals>> {
        let from = from_ms.unwrap_or(i64::MIN);
        let to = to_ms.unwrap_or(i64::MAX);
        let total: Option<i64> = self.conn.lock().query_row(
            "SELECT SUM(total_tokens) FROM usage
             WHERE account_id = ?1 AND created_at >= ?2 AND created_at <= ?3",
            params![account_id, from, to],
            |row| row.get(0),
        )?;
        Ok(total.map(|total_tokens| UsageTotals { total_tokens }))
    }

    async fn flush(&self) -> Result<()> {
        Ok(())
    }

    // Shared singleton: sessions never close it, process shutdown drops it.
    async fn cleanup(&self) -> Result<()> {
        Ok(())
    }

    fn is_shared(&self) -> bool {
        true
    }
}

#[async_trait]
impl AccountManager for SqliteStore {
    async fn account_key(&self, account_id: &str) -> Result<Option<String>> {
        let key = self
            .conn
            .lock()
            .query_row(
                "SELECT account_key FROM accounts WHERE account_id = ?1",
                params![account_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(key)
    }
}

// ── Tests ─────────────────────────────────────────────────────────
