//! Durable key/value backend for the offline store, backed by native_db.

use anyhow::{anyhow, Result};
use native_db::{native_db, Builder, Database, Models, ToKey};
use native_model::{native_model, Model};
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::debug;

use crate::offline::KeyValueStore;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[native_model(id = 1, version = 1)]
#[native_db]
pub struct StoredEntry {
    #[primary_key]
    pub key: String,
    pub value: Vec<u8>,
    pub updated_at: String,
}

static MODELS: OnceCell<Models> = OnceCell::new();

fn models() -> Result<&'static Models> {
    MODELS.get_or_try_init(|| {
        let mut models = Models::new();
        models.define::<StoredEntry>()?;
        Ok(models)
    })
}

pub struct NativeDbStore {
    database: Database<'static>,
}

impl NativeDbStore {
    /// Opens or creates the database file at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    anyhow!("Failed to create state directory {}: {}", parent.display(), e)
                })?;
            }
        }
        let database = Builder::new().create(models()?, path)?;
        debug!(path = %path.display(), "Opened local state database");
        Ok(Self { database })
    }

    pub fn in_memory() -> Result<Self> {
        let database = Builder::new().create_in_memory(models()?)?;
        Ok(Self { database })
    }
}

impl KeyValueStore for NativeDbStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let r = self.database.r_transaction()?;
        let entry: Option<StoredEntry> = r.get().primary(key.to_string())?;
        Ok(entry.map(|e| e.value))
    }

    fn set(&self, key: &str, value: &[u8]) -> Result<()> {
        let rw = self.database.rw_transaction()?;
        rw.upsert(StoredEntry {
            key: key.to_string(),
            value: value.to_vec(),
            updated_at: chrono::Utc::now().to_rfc3339(),
        })?;
        rw.commit()?;
        Ok(())
    }
}
