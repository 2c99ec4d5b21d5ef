use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{anyhow, Context, Result};
use dictpack_store_sqlite::SqliteStore;
use serde::{Deserialize, Serialize};
use tracing::info;

pub const DEFAULT_CLIENT_ID: &str = "";

const DEFAULT_NAMESPACE_DB_FILE: &str = "word_lists.sqlite3";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CatalogConfig {
    pub data_dir: PathBuf,
    pub payload_dir: PathBuf,
    /// Skip actions whose precondition produced a warning instead of applying them.
    pub strict: bool,
    pub auto_download_updates: bool,
}

impl CatalogConfig {
    /// Config rooted at `data_dir`, with payloads kept under `<data_dir>/payloads`.
    #[must_use]
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        let data_dir = data_dir.into();
        let payload_dir = data_dir.join("payloads");
        Self { data_dir, payload_dir, strict: false, auto_download_updates: false }
    }

    #[must_use]
    pub fn with_payload_dir(mut self, payload_dir: Option<PathBuf>) -> Self {
        if let Some(payload_dir) = payload_dir {
            self.payload_dir = payload_dir;
        }
        self
    }

    #[must_use]
    pub fn with_strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    #[must_use]
    pub fn with_auto_download_updates(mut self, enabled: bool) -> Self {
        self.auto_download_updates = enabled;
        self
    }

    /// Database file backing a client namespace.
    #[must_use]
    pub fn db_path_for(&self, client_id: &str) -> PathBuf {
        if client_id == DEFAULT_CLIENT_ID {
            return self.data_dir.join(DEFAULT_NAMESPACE_DB_FILE);
        }
        self.data_dir.join(format!("word_lists.{}.sqlite3", hex::encode(client_id.as_bytes())))
    }
}

/// One client namespace: a database file plus its single serialized writer connection.
pub struct ClientCatalog {
    client_id: String,
    db_path: PathBuf,
    writer: Mutex<SqliteStore>,
}

impl ClientCatalog {
    fn open(client_id: &str, db_path: PathBuf) -> Result<Self> {
        let mut store = open_for(client_id, &db_path)?;
        store
            .migrate()
            .with_context(|| format!("failed to migrate catalog for client {client_id:?}"))?;
        Ok(Self { client_id: client_id.to_string(), db_path, writer: Mutex::new(store) })
    }

    #[must_use]
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    #[must_use]
    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    /// Fresh connection for reads. WAL keeps it from blocking on the writer.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened.
    pub fn reader(&self) -> Result<SqliteStore> {
        open_for(&self.client_id, &self.db_path)
    }

    /// Exclusive access to the namespace writer.
    ///
    /// # Errors
    /// Returns an error when a previous writer panicked while holding the lock.
    pub fn writer(&self) -> Result<MutexGuard<'_, SqliteStore>> {
        self.writer
            .lock()
            .map_err(|_| anyhow!("catalog writer for client {:?} is poisoned", self.client_id))
    }
}

/// Owns every open client namespace. Built once at startup and shared by handle.
pub struct CatalogRegistry {
    config: CatalogConfig,
    default_catalog: Arc<ClientCatalog>,
    catalogs: Mutex<HashMap<String, Arc<ClientCatalog>>>,
}

impl CatalogRegistry {
    /// Create the data and payload directories and open the default namespace.
    ///
    /// # Errors
    /// Returns an error when directories cannot be created or the default catalog cannot be
    /// opened and migrated.
    pub fn open(config: CatalogConfig) -> Result<Self> {
        fs::create_dir_all(&config.data_dir).with_context(|| {
            format!("failed to create data directory {}", config.data_dir.display())
        })?;
        fs::create_dir_all(&config.payload_dir).with_context(|| {
            format!("failed to create payload directory {}", config.payload_dir.display())
        })?;

        let default_catalog = Arc::new(ClientCatalog::open(
            DEFAULT_CLIENT_ID,
            config.db_path_for(DEFAULT_CLIENT_ID),
        )?);
        info!(data_dir = %config.data_dir.display(), "catalog registry opened");

        Ok(Self { config, default_catalog, catalogs: Mutex::new(HashMap::new()) })
    }

    #[must_use]
    pub fn config(&self) -> &CatalogConfig {
        &self.config
    }

    /// The default namespace, which also owns client bookkeeping.
    #[must_use]
    pub fn default_catalog(&self) -> Arc<ClientCatalog> {
        Arc::clone(&self.default_catalog)
    }

    /// Catalog for `client_id`, created on first contact.
    ///
    /// # Errors
    /// Returns an error when the catalog database cannot be opened or migrated.
    pub fn catalog(&self, client_id: &str) -> Result<Arc<ClientCatalog>> {
        if client_id == DEFAULT_CLIENT_ID {
            return Ok(self.default_catalog());
        }

        let mut catalogs = self.lock_catalogs()?;
        if let Some(catalog) = catalogs.get(client_id) {
            return Ok(Arc::clone(catalog));
        }

        let catalog =
            Arc::new(ClientCatalog::open(client_id, self.config.db_path_for(client_id))?);
        info!(client_id, "client catalog created");
        catalogs.insert(client_id.to_string(), Arc::clone(&catalog));
        Ok(catalog)
    }

    /// Catalog for `client_id` only when its database already exists. Read paths use this so
    /// an unknown namespace never materializes a file.
    ///
    /// # Errors
    /// Returns an error when an existing catalog database cannot be opened.
    pub fn existing_catalog(&self, client_id: &str) -> Result<Option<Arc<ClientCatalog>>> {
        if client_id == DEFAULT_CLIENT_ID {
            return Ok(Some(self.default_catalog()));
        }
        if let Some(catalog) = self.lock_catalogs()?.get(client_id) {
            return Ok(Some(Arc::clone(catalog)));
        }
        if !self.config.db_path_for(client_id).exists() {
            return Ok(None);
        }
        self.catalog(client_id).map(Some)
    }

    /// Drop the cached handle for `client_id`.
    ///
    /// # Errors
    /// Returns an error when the registry lock is poisoned.
    pub fn evict(&self, client_id: &str) -> Result<bool> {
        Ok(self.lock_catalogs()?.remove(client_id).is_some())
    }

    fn lock_catalogs(&self) -> Result<MutexGuard<'_, HashMap<String, Arc<ClientCatalog>>>> {
        self.catalogs.lock().map_err(|_| anyhow!("catalog registry lock is poisoned"))
    }
}

fn open_for(client_id: &str, db_path: &Path) -> Result<SqliteStore> {
    if client_id == DEFAULT_CLIENT_ID {
        SqliteStore::open_default_namespace(db_path)
    } else {
        SqliteStore::open(db_path)
    }
}
