//! [`JobStore`] implementations.

mod memory;
mod pool;
mod sqlite;

pub use memory::InMemoryJobStore;
pub use pool::DatabasePool;
pub use sqlite::SqliteJobStore;

use crate::config::StoreConfig;
use std::sync::Arc;
use tsuzuki_core::{JobStore, StoreError};

/// Opens the store selected by `config`.
pub async fn open(config: &StoreConfig) -> Result<Arc<dyn JobStore>, StoreError> {
    match config.database_url.as_deref() {
        Some(url) => Ok(Arc::new(SqliteJobStore::connect_with(url, config).await?)),
        None => Ok(Arc::new(InMemoryJobStore::new())),
    }
}
