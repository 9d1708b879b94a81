use std::fs;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use redb::{Database, TableDefinition};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

const CONNECTORS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("connectors");

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("io error: {0}")]
    Io(String),
    #[error("backend error: {0}")]
    Backend(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("storage closed")]
    Closed,
}

impl StorageError {
    fn io(err: std::io::Error) -> Self {
        StorageError::Io(err.to_string())
    }

    fn backend(err: impl std::fmt::Display) -> Self {
        StorageError::Backend(err.to_string())
    }

    fn serialization(err: impl std::fmt::Display) -> Self {
        StorageError::Serialization(err.to_string())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StoredConnector {
    pub id: String,
    /// Connector record serialized as JSON.
    pub raw_json: String,
}

/// Persisted connector records keyed by connector id.
pub trait ConnectorStore: Send + Sync {
    /// Insert or overwrite the record stored under `connector.id`.
    fn put_connector(&self, connector: StoredConnector) -> Result<(), StorageError>;

    fn get_connector(&self, id: &str) -> Result<Option<StoredConnector>, StorageError>;

    fn list_connectors(&self) -> Result<Vec<StoredConnector>, StorageError>;

    /// Remove the record; `NotFound` when nothing was stored under `id`.
    fn delete_connector(&self, id: &str) -> Result<(), StorageError>;
}

pub struct MetadataStorage {
    db: Database,
    db_path: PathBuf,
}

impl MetadataStorage {
    /// Open (or create) the metadata database under `base_dir`.
    pub fn open(base_dir: impl AsRef<Path>) -> Result<Self, StorageError> {
        let db_path = Self::db_path(base_dir.as_ref());
        if let Some(parent) = db_path.parent() {
            fs::create_dir_all(parent).map_err(StorageError::io)?;
        }

        let db = if db_path.exists() {
            Database::builder()
                .open(db_path.as_path())
                .map_err(StorageError::backend)?
        } else {
            Database::builder()
                .create(db_path.as_path())
                .map_err(StorageError::backend)?
        };

        let storage = Self { db, db_path };
        storage.ensure_tables()?;
        Ok(storage)
    }

    pub fn path(&self) -> &Path {
        &self.db_path
    }

    fn db_path(base_dir: &Path) -> PathBuf {
        base_dir.join("metadata.redb")
    }

    fn ensure_tables(&self) -> Result<(), StorageError> {
        let txn = self.db.begin_write().map_err(StorageError::backend)?;
        txn.open_table(CONNECTORS_TABLE)
            .map_err(StorageError::backend)?;
        txn.commit().map_err(StorageError::backend)?;
        Ok(())
    }

    fn put_entry<T: Serialize>(
        &self,
        table: TableDefinition<&str, &[u8]>,
        key: &str,
        value: &T,
    ) -> Result<(), StorageError> {
        let encoded = encode_record(value)?;
        let txn = self.db.begin_write().map_err(StorageError::backend)?;
        {
            let mut table = txn.open_table(table).map_err(StorageError::backend)?;
            table
                .insert(key, encoded.as_slice())
                .map_err(StorageError::backend)?;
        }
        txn.commit().map_err(StorageError::backend)?;
        Ok(())
    }

    fn get_entry<T: DeserializeOwned>(
        &self,
        table: TableDefinition<&str, &[u8]>,
        key: &str,
    ) -> Result<Option<T>, StorageError> {
        let txn = self.db.begin_read().map_err(StorageError::backend)?;
        let table = txn.open_table(table).map_err(StorageError::backend)?;
        let result = match table.get(key).map_err(StorageError::backend)? {
            Some(value) => Some(decode_record(value.value())?),
            None => None,
        };
        Ok(result)
    }

    fn delete_entry(
        &self,
        table: TableDefinition<&str, &[u8]>,
        key: &str,
    ) -> Result<(), StorageError> {
        let txn = self.db.begin_write().map_err(StorageError::backend)?;
        {
            let mut table = txn.open_table(table).map_err(StorageError::backend)?;
            let removed = table.remove(key).map_err(StorageError::backend)?;
            if removed.is_none() {
                return Err(StorageError::NotFound(key.to_string()));
            }
        }
        txn.commit().map_err(StorageError::backend)?;
        Ok(())
    }

    fn list_entries<T: DeserializeOwned>(
        &self,
        table: TableDefinition<&str, &[u8]>,
    ) -> Result<Vec<T>, StorageError> {
        let txn = self.db.begin_read().map_err(StorageError::backend)?;
        let table = txn.open_table(table).map_err(StorageError::backend)?;
        let mut items = Vec::new();
        for entry in table.range::<&str>(..).map_err(StorageError::backend)? {
            let (_, value) = entry.map_err(StorageError::backend)?;
            items.push(decode_record(value.value())?);
        }
        Ok(items)
    }
}

impl ConnectorStore for MetadataStorage {
    fn put_connector(&self, connector: StoredConnector) -> Result<(), StorageError> {
        self.put_entry(CONNECTORS_TABLE, &connector.id, &connector)
    }

    fn get_connector(&self, id: &str) -> Result<Option<StoredConnector>, StorageError> {
        self.get_entry(CONNECTORS_TABLE, id)
    }

    fn list_connectors(&self) -> Result<Vec<StoredConnector>, StorageError> {
        self.list_entries(CONNECTORS_TABLE)
    }

    fn delete_connector(&self, id: &str) -> Result<(), StorageError> {
        self.delete_entry(CONNECTORS_TABLE, id)
    }
}

/// Facade over the on-disk namespaces; the metadata database lives under
/// `base_dir/metadata`. Closing releases the database file.
pub struct StorageManager {
    metadata: RwLock<Option<MetadataStorage>>,
    base_dir: PathBuf,
}

impl StorageManager {
    pub fn new(base_dir: impl AsRef<Path>) -> Result<Self, StorageError> {
        let base_dir = base_dir.as_ref().to_path_buf();
        let metadata = MetadataStorage::open(base_dir.join("metadata"))?;
        Ok(Self {
            metadata: RwLock::new(Some(metadata)),
            base_dir,
        })
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn is_open(&self) -> bool {
        self.metadata.read().is_some()
    }

    /// Release the database. Later operations fail with `Closed`.
    pub fn close(&self) {
        self.metadata.write().take();
    }

    fn with_metadata<T>(
        &self,
        op: impl FnOnce(&MetadataStorage) -> Result<T, StorageError>,
    ) -> Result<T, StorageError> {
        let guard = self.metadata.read();
        let metadata = guard.as_ref().ok_or(StorageError::Closed)?;
        op(metadata)
    }
}

impl ConnectorStore for StorageManager {
    fn put_connector(&self, connector: StoredConnector) -> Result<(), StorageError> {
        self.with_metadata(|metadata| metadata.put_connector(connector))
    }

    fn get_connector(&self, id: &str) -> Result<Option<StoredConnector>, StorageError> {
        self.with_metadata(|metadata| metadata.get_connector(id))
    }

    fn list_connectors(&self) -> Result<Vec<StoredConnector>, StorageError> {
        self.with_metadata(|metadata| metadata.list_connectors())
    }

    fn delete_connector(&self, id: &str) -> Result<(), StorageError> {
        self.with_metadata(|metadata| metadata.delete_connector(id))
    }
}

fn encode_record<T: Serialize>(value: &T) -> Result<Vec<u8>, StorageError> {
    bincode::serialize(value).map_err(StorageError::serialization)
}

fn decode_record<T: DeserializeOwned>(raw: &[u8]) -> Result<T, StorageError> {
    bincode::deserialize(raw).map_err(StorageError::serialization)
}
