//! voxswitch entry point.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing_subscriber::EnvFilter;

use voxswitch::auth::{AccountKeys, AccountManager};
use voxswitch::config::Config;
use voxswitch::persist::SqliteStore;
use voxswitch::provider::VendorConnector;
use voxswitch::server::{Gateway, StoreMode};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Arc::new(Config::from_env());

    let (store_mode, manager): (StoreMode, Option<Arc<dyn AccountManager>>) =
        match &config.db_path {
            Some(db_path) => {
                let store = Arc::new(
                    SqliteStore::new(db_path)
                        .with_context(|| format!("Opening database {}", db_path.display()))?,
                );
                tracing::info!(db = %db_path.display(), "Using shared SQLite persistence");
                (StoreMode::Shared(store.clone()), Some(store))
            }
            None => {
                tracing::info!(
                    dir = %config.data_dir.display(),
                    "Database disabled, using per-session file persistence"
                );
                (StoreMode::PerSession(config.data_dir.clone()), None)
            }
        };

    let keys = Arc::new(AccountKeys::new(config.inline_account_keys(), manager));
    let connector = Arc::new(VendorConnector::from_config(&config));

    Gateway::new(config, keys, store_mode, connector)
        .serve()
        .await
}
