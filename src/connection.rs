//! Connection handle: owns the shared SQLite store and hands out
//! collection handles. Collections and their tables come into being on
//! first access.

use crate::collection::Collection;
use crate::error::Result;
use crate::fallback::FallbackConfig;
use crate::store::{ConnectionOptions, SqliteStore};
use std::sync::Arc;

pub struct Connection {
    store: Arc<SqliteStore>,
    fallback: FallbackConfig,
}

impl Connection {
    pub fn open(path: &str) -> Result<Self> {
        Self::open_with_options(path, &ConnectionOptions::default())
    }

    pub fn open_with_options(path: &str, options: &ConnectionOptions) -> Result<Self> {
        Ok(Self {
            store: Arc::new(SqliteStore::open(path, options)?),
            fallback: FallbackConfig::default(),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::open_in_memory_with_options(&ConnectionOptions::default())
    }

    pub fn open_in_memory_with_options(options: &ConnectionOptions) -> Result<Self> {
        Ok(Self {
            store: Arc::new(SqliteStore::open_in_memory(options)?),
            fallback: FallbackConfig::default(),
        })
    }

    /// Force the host-code tier for every collection handle created
    /// after this call; independent of the process-wide flag.
    pub fn set_force_fallback(&mut self, on: bool) {
        self.fallback.force_fallback = on;
    }

    pub fn jsonb_supported(&self) -> bool {
        self.store.jsonb_supported()
    }

    /// Collection handle; the backing table is created on first access.
    pub fn collection(&self, name: &str) -> Result<Collection> {
        self.store.ensure_collection(name)?;
        Ok(Collection::new(
            self.store.clone(),
            name.to_string(),
            self.fallback,
        ))
    }

    pub fn list_collection_names(&self) -> Result<Vec<String>> {
        self.store.list_collections()
    }

    pub fn drop_collection(&self, name: &str) -> Result<()> {
        self.store.drop_collection(name)
    }
}
