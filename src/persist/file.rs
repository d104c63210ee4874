//! File-tree persistence backend.
//!
//! Entities live at `<base>/<account>/<entity>/<session>`. Every path
//! component is validated before touching the filesystem so a hostile
//! session id cannot escape the base directory. This backend is created per
//! session and closed with it; record tables require the database backend.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use tokio::io::AsyncWriteExt;

use super::{Persistence, UsageTotals};

/// Per-session file-tree backend.
pub struct FileStore {
    base: PathBuf,
}

impl FileStore {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    fn entry_path(&self, account_id: &str, entity: &str, session_id: &str) -> Result<PathBuf> {
        Ok(self
            .base
            .join(safe_component(account_id)?)
            .join(safe_component(entity)?)
            .join(safe_component(session_id)?))
    }
}

/// Reject path components that are empty, dotted, or carry separators.
fn safe_component(component: &str) -> Result<&str> {
    if component.is_empty() {
        bail!("Empty path component");
    }
    if component.starts_with('.') {
        bail!("Path component may not start with a dot: {component}");
    }
    if !component
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    {
        bail!("Path component contains unsafe characters: {component}");
    }
    Ok(component)
}

async fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("Creating {}", parent.display()))?;
    }
    Ok(())
}

#[async_trait]
impl Persistence for FileStore {
    async fn append(
        &self,
        account_id: &str,
        entity: &str,
        session_id: &str,
        content: &str,
    ) -> Result<()> {
        let path = self.entry_path(account_id, entity, session_id)?;
        ensure_parent(&path).await?;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .with_context(|| format!("Opening {}", path.display()))?;
        file.write_all(content.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    async fn overwrite(
        &self,
        account_id: &str,
        entity: &str,
        session_id: &str,
        content: &str,
    ) -> Result<()> {
        let path = self.entry_path(account_id, entity, session_id)?;
        ensure_parent(&path).await?;
        tokio::fs::write(&path, content.as_bytes())
            .await
            .with_context(|| format!("Writing {}", path.display()))?;
        Ok(())
    }

    async fn read(
        &self,
        account_id: &str,
        entity: &str,
        session_id: &str,
    ) -> Result<Option<String>> {
        let path = self.entry_path(account_id, entity, session_id)?;
        match tokio::fs::read_to_string(&path).await {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("Reading {}", path.display())),
        }
    }

    async fn delete(&self, account_id: &str, entity: &str, session_id: &str) -> Result<()> {
        let path = self.entry_path(account_id, entity, session_id)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("Deleting {}", path.display())),
        }
    }

    async fn exists(&self, account_id: &str, entity: &str, session_id: &str) -> Result<bool> {
        let path = self.entry_path(account_id, entity, session_id)?;
        Ok(tokio::fs::try_exists(&path).await?)
    }

    async fn insert(&self, table: &str, _data: &Value) -> Result<()> {
        bail!("Record table {table} requires the database backend");
    }

    async fn update(&self, table: &str, _data: &Value, _filter: &Value) -> Result<()> {
        bail!("Record table {table} requires the database backend");
    }

    async fn read_record(&self, table: &str, _filter: &Value) -> Result<Option<Value>> {
        bail!("Record table {table} requires the database backend");
    }

    async fn delete_record(&self, table: &str, _filter: &Value) -> Result<()> {
        bail!("Record table {table} requires the database backend");
    }

    async fn usage_sum(
        &self,
        _account_id: &str,
        _from_ms: Option<i64>,
        _to_ms: Option<i64>,
    ) -> Result<Option<UsageTotals>> {
        bail!("Usage accounting requires the database backend");
    }

    async fn flush(&self) -> Result<()> {
        Ok(())
    }

    async fn cleanup(&self) -> Result<()> {
        Ok(())
    }

    fn is_shared(&self) -> bool {
        false
    }
}

// ── Tests ─────────────────────────────────────────────────────────
