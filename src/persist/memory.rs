//! In-memory persistence backend.
//!
//! Used for development runs without a data directory and throughout the
//! test suite. Record tables mirror the SQLite backend closely enough for
//! the usage endpoint to work.

use std::collections::HashMap;

use anyhow::{bail, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;

use super::{Persistence, UsageTotals};

#[derive(Default)]
struct Inner {
    entities: HashMap<(String, String, String), String>,
    accounts: HashMap<String, Value>,
    usage: Vec<Value>,
}

/// Volatile storage backend.
pub struct MemoryStore {
    inner: Mutex<Inner>,
    shared: bool,
}

impl MemoryStore {
    /// Process-wide shared store (default).
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            shared: true,
        }
    }

    /// Store owned by a single session, closed with it.
    pub fn exclusive() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            shared: false,
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn key(account_id: &str, entity: &str, session_id: &str) -> (String, String, String) {
    (
        account_id.to_string(),
        entity.to_string(),
        session_id.to_string(),
    )
}

#[async_trait]
impl Persistence for MemoryStore {
    async fn append(
        &self,
        account_id: &str,
        entity: &str,
        session_id: &str,
        content: &str,
    ) -> Result<()> {
        self.inner
            .lock()
            .entities
            .entry(key(account_id, entity, session_id))
            .or_default()
            .push_str(content);
        Ok(())
    }

    async fn overwrite(
        &self,
        account_id: &str,
        entity: &str,
        session_id: &str,
        content: &str,
    ) -> Result<()> {
        self.inner
            .lock()
            .entities
            .insert(key(account_id, entity, session_id), content.to_string());
        Ok(())
    }

    async fn read(
        &self,
        account_id: &str,
        entity: &str,
        session_id: &str,
    ) -> Result<Option<String>> {
        Ok(self
            .inner
            .lock()
            .entities
            .get(&key(account_id, entity, session_id))
            .cloned())
    }

    async fn delete(&self, account_id: &str, entity: &str, session_id: &str) -> Result<()> {
        self.inner
            .lock()
            .entities
            .remove(&key(account_id, entity, session_id));
        Ok(())
    }

    async fn exists(&self, account_id: &str, entity: &str, session_id: &str) -> Result<bool> {
        Ok(self
            .inner
            .lock()
            .entities
            .contains_key(&key(account_id, entity, session_id)))
    }

    async fn insert(&self, table: &str, data: &Value) -> Result<()> {
        let mut inner = self.inner.lock();
        match table {
            "accounts" => {
                let account_id = data
                    .get("account_id")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                if account_id.is_empty() {
                    bail!("account record requires account_id");
                }
                inner.accounts.insert(account_id, data.clone());
            }
            "usage" => inner.usage.push(data.clone()),
            other => bail!("Unknown table: {other}"),
        }
        Ok(())
    }

    async fn update(&self, table: &str, data: &Value, filter: &Value) -> Result<()> {
        if table != "accounts" {
            bail!("Unknown table: {table}");
        }
        let account_id = filter
            .get("account_id")
            .and_then(Value::as_str)
            .unwrap_or_default();
        let mut inner = self.inner.lock();
        match inner.accounts.get_mut(account_id) {
            Some(record) => {
                if let (Some(record), Some(data)) = (record.as_object_mut(), data.as_object()) {
                    for (k, v) in data {
                        record.insert(k.clone(), v.clone());
                    }
                }
                Ok(())
            }
            None => bail!("No account record: {account_id}"),
        }
    }

    async fn read_record(&self, table: &str, filter: &Value) -> Result<Option<Value>> {
        if table != "accounts" {
            bail!("Unknown table: {table}");
        }
        let account_id = filter
            .get("account_id")
            .and_then(Value::as_str)
            .unwrap_or_default();
        Ok(self.inner.lock().accounts.get(account_id).cloned())
    }

    async fn delete_record(&self, table: &str, filter: &Value) -> Result<()> {
        if table != "accounts" {
            bail!("Unknown table: {table}");
        }
        let account_id = filter
            .get("account_id")
            .and_then(Value::as_str)
            .unwrap_or_default();
        self.inner.lock().accounts.remove(account_id);
        Ok(())
    }

    async fn usage_sum(
        &self,
        account_id: &str,
        from_ms: Option<i64>,
        to_ms: Option<i64>,
    ) -> Result<Option<UsageTotals>> {
        let inner = self.inner.lock();
        let mut total = 0i64;
        let mut matched = false;
        for row in &inner.usage {
            if row.get("account_id").and_then(Value::as_str) != Some(account_id) {
                continue;
            }
            let at = row.get("created_at").and_then(Value::as_i64).unwrap_or(0);
            if from_ms.is_some_and(|from| at < from) || to_ms.is_some_and(|to| at > to) {
                continue;
            }
            matched = true;
            total += row.get("total_tokens").and_then(Value::as_i64).unwrap_or(0);
        }
        Ok(matched.then_some(UsageTotals {
            total_tokens: total,
        }))
    }

    async fn flush(&self) -> Result<()> {
        Ok(())
    }

    async fn cleanup(&self) -> Result<()> {
        Ok(())
    }

    fn is_shared(&self) -> bool {
        self.shared
    }
}

// ── Tests ─────────────────────────────────────────────────────────
