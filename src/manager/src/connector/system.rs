use bridge::{DeliveryHandle, Module, ModuleDescriptor, ModuleError, ModuleRegistry};
use parking_lot::Mutex;
use rand::distributions::Alphanumeric;
use rand::Rng;
use std::collections::HashMap;
use std::sync::Arc;
use storage::{ConnectorStore, StorageError};

use super::types::{ConnectorRecord, CreateConnectorRequest, PatchConnectorRequest};
use crate::error::SystemError;
use crate::storage_bridge;

/// 12 alphanumeric characters, roughly 71 bits.
pub const CONNECTOR_ID_LEN: usize = 12;
const ID_ALLOCATION_ATTEMPTS: usize = 8;

type SharedModule = Arc<tokio::sync::Mutex<Box<dyn Module>>>;

/// A loaded connector. `module` is `None` when the record's module type
/// could not be resolved; such records stay listed and persisted but inert.
#[derive(Clone)]
struct RuntimeConnector {
    record: ConnectorRecord,
    module: Option<SharedModule>,
}

/// Ties persisted connector records to live module instances.
///
/// The connector map lock is only held across map reads and writes. Module
/// start/stop and storage calls happen under a per-connector operation
/// guard so concurrent requests on one id are serialised.
pub struct ConnectorSystem {
    registry: Arc<ModuleRegistry>,
    store: Arc<dyn ConnectorStore>,
    delivery: DeliveryHandle,
    connectors: Mutex<HashMap<String, RuntimeConnector>>,
    op_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl ConnectorSystem {
    pub fn new(
        registry: Arc<ModuleRegistry>,
        store: Arc<dyn ConnectorStore>,
        delivery: DeliveryHandle,
    ) -> Self {
        Self {
            registry,
            store,
            delivery,
            connectors: Mutex::new(HashMap::new()),
            op_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn list_modules(&self) -> Vec<ModuleDescriptor> {
        self.registry.descriptors()
    }

    /// All loaded connectors ordered by id.
    pub fn list_connectors(&self) -> Vec<ConnectorRecord> {
        let mut records: Vec<_> = self
            .connectors
            .lock()
            .values()
            .map(|runtime| runtime.record.clone())
            .collect();
        records.sort_by(|a, b| a.id.cmp(&b.id));
        records
    }

    pub fn get_connector(&self, id: &str) -> Result<ConnectorRecord, SystemError> {
        self.runtime(id).map(|runtime| runtime.record)
    }

    /// Whether the connector's module type resolved when it was loaded.
    pub fn is_active(&self, id: &str) -> Result<bool, SystemError> {
        self.runtime(id).map(|runtime| runtime.module.is_some())
    }

    pub async fn create_connector(
        &self,
        request: CreateConnectorRequest,
    ) -> Result<ConnectorRecord, SystemError> {
        let module = self.instantiate(&request.module, &request.settings)?;
        let id = self.allocate_id()?;
        let lock = self.op_lock(&id);
        let _guard = lock.lock().await;

        let mut record = request.into_record(id.clone());
        if let Err(err) = self.persist(&record) {
            self.op_locks.lock().remove(&id);
            return Err(err);
        }
        let module: SharedModule = Arc::new(tokio::sync::Mutex::new(module));
        self.connectors.lock().insert(
            id.clone(),
            RuntimeConnector {
                record: record.clone(),
                module: Some(Arc::clone(&module)),
            },
        );
        tracing::info!(connector_id = %id, name = %record.name, module = %record.module, "connector created");

        if record.running {
            if let Err(err) = module.lock().await.start().await {
                tracing::error!(connector_id = %id, error = %err, "connector created but failed to start");
                record.running = false;
                self.update_record(&record);
                self.persist_best_effort(&record);
            }
        }
        Ok(record)
    }

    pub async fn patch_connector(
        &self,
        id: &str,
        request: PatchConnectorRequest,
    ) -> Result<ConnectorRecord, SystemError> {
        let lock = self.op_lock_existing(id)?;
        let _guard = lock.lock().await;

        let current = self.runtime(id)?;
        let mut merged = request.apply_to(&current.record);
        let module = self.instantiate(&merged.module, &merged.settings)?;

        let was_running = current.record.running;
        if was_running {
            if let Some(old) = &current.module {
                if let Err(err) = old.lock().await.stop().await {
                    tracing::warn!(connector_id = %id, error = %err, "failed to stop replaced module");
                }
            }
        }

        if let Err(err) = self.persist(&merged) {
            if was_running {
                if let Some(old) = &current.module {
                    if let Err(start_err) = old.lock().await.start().await {
                        tracing::error!(connector_id = %id, error = %start_err, "failed to restart module after patch failure");
                    }
                }
            }
            return Err(err);
        }

        let module: SharedModule = Arc::new(tokio::sync::Mutex::new(module));
        self.connectors.lock().insert(
            id.to_string(),
            RuntimeConnector {
                record: merged.clone(),
                module: Some(Arc::clone(&module)),
            },
        );
        tracing::info!(connector_id = %id, module = %merged.module, "connector patched");

        if merged.running {
            if let Err(err) = module.lock().await.start().await {
                tracing::error!(connector_id = %id, error = %err, "patched connector failed to start");
                merged.running = false;
                self.update_record(&merged);
                self.persist_best_effort(&merged);
            }
        }
        Ok(merged)
    }

    pub async fn delete_connector(&self, id: &str) -> Result<(), SystemError> {
        let lock = self.op_lock_existing(id)?;
        let _guard = lock.lock().await;

        let mut current = self.runtime(id)?;
        if current.record.running {
            if let Some(module) = &current.module {
                if let Err(err) = module.lock().await.stop().await {
                    tracing::warn!(connector_id = %id, error = %err, "failed to stop connector before delete");
                }
            }
            current.record.running = false;
            self.update_record(&current.record);
        }

        match self.store.delete_connector(id) {
            Ok(()) | Err(StorageError::NotFound(_)) => {}
            Err(err) => return Err(err.into()),
        }
        self.connectors.lock().remove(id);
        self.op_locks.lock().remove(id);
        tracing::info!(connector_id = %id, "connector deleted");
        Ok(())
    }

    /// Start or stop the live module and persist the new running flag.
    /// Both directions re-invoke the module even when already in that state.
    pub async fn set_connector_running_state(
        &self,
        id: &str,
        running: bool,
    ) -> Result<(), SystemError> {
        let lock = self.op_lock_existing(id)?;
        let _guard = lock.lock().await;

        let current = self.runtime(id)?;
        match (&current.module, running) {
            (Some(module), true) => module.lock().await.start().await?,
            (Some(module), false) => module.lock().await.stop().await?,
            (None, true) => {
                return Err(ModuleError::NotFound(current.record.module.clone()).into());
            }
            (None, false) => {}
        }

        let mut record = current.record.clone();
        record.running = running;
        if let Err(err) = self.persist(&record) {
            if let Some(module) = &current.module {
                let reverted = if running {
                    module.lock().await.stop().await
                } else {
                    module.lock().await.start().await
                };
                if let Err(revert_err) = reverted {
                    tracing::error!(connector_id = %id, error = %revert_err, "failed to revert module after state change failure");
                }
            }
            return Err(err);
        }

        self.update_record(&record);
        tracing::info!(connector_id = %id, running, "connector state changed");
        Ok(())
    }

    /// Load every persisted connector, starting those marked running.
    /// Undecodable or unresolvable records are logged and skipped.
    pub async fn load_all(&self) -> Result<usize, SystemError> {
        let stored = self.store.list_connectors()?;
        let mut loaded = 0usize;
        for entry in stored {
            let mut record = match storage_bridge::record_from_stored(&entry) {
                Ok(record) => record,
                Err(err) => {
                    tracing::error!(connector_id = %entry.id, error = %err, "failed to decode stored connector");
                    continue;
                }
            };

            let module = match self.instantiate(&record.module, &record.settings) {
                Ok(module) => Some(Arc::new(tokio::sync::Mutex::new(module))),
                Err(err) => {
                    tracing::error!(
                        connector_id = %record.id,
                        module = %record.module,
                        error = %err,
                        "failed to initialise connector, keeping it inert"
                    );
                    None
                }
            };

            let lock = self.op_lock(&record.id);
            let _guard = lock.lock().await;
            match &module {
                Some(module) if record.running => {
                    if let Err(err) = module.lock().await.start().await {
                        tracing::error!(connector_id = %record.id, error = %err, "failed to start loaded connector");
                        record.running = false;
                    }
                }
                None => record.running = false,
                _ => {}
            }

            tracing::info!(connector_id = %record.id, name = %record.name, running = record.running, "connector loaded");
            self.connectors
                .lock()
                .insert(record.id.clone(), RuntimeConnector { record, module });
            loaded += 1;
        }
        tracing::info!(count = loaded, "connector hydration completed");
        Ok(loaded)
    }

    /// Stop every running module and drop all live instances. Persisted
    /// running flags are left untouched so a restart restores them.
    pub async fn shutdown(&self) {
        let runtimes: Vec<RuntimeConnector> = self.connectors.lock().drain().map(|(_, r)| r).collect();
        for runtime in runtimes {
            let Some(module) = runtime.module else {
                continue;
            };
            if !runtime.record.running {
                continue;
            }
            let result = module.lock().await.stop().await;
            if let Err(err) = result {
                tracing::warn!(connector_id = %runtime.record.id, error = %err, "failed to stop connector during shutdown");
            }
        }
        tracing::info!("connector system stopped");
    }

    fn runtime(&self, id: &str) -> Result<RuntimeConnector, SystemError> {
        self.connectors
            .lock()
            .get(id)
            .cloned()
            .ok_or_else(|| SystemError::connector_not_found(id))
    }

    fn update_record(&self, record: &ConnectorRecord) {
        if let Some(runtime) = self.connectors.lock().get_mut(&record.id) {
            runtime.record = record.clone();
        }
    }

    fn instantiate(
        &self,
        module_type: &str,
        settings: &serde_json::Value,
    ) -> Result<Box<dyn Module>, SystemError> {
        let mut module = self.registry.create(module_type)?;
        module.set_delivery_handle(self.delivery.clone());
        module.settings_changed(settings)?;
        Ok(module)
    }

    fn persist(&self, record: &ConnectorRecord) -> Result<(), SystemError> {
        let stored = storage_bridge::stored_connector_from_record(record)
            .map_err(SystemError::Internal)?;
        self.store.put_connector(stored)?;
        Ok(())
    }

    fn persist_best_effort(&self, record: &ConnectorRecord) {
        if let Err(err) = self.persist(record) {
            tracing::error!(connector_id = %record.id, error = %err, "failed to persist connector");
        }
    }

    fn allocate_id(&self) -> Result<String, SystemError> {
        for _ in 0..ID_ALLOCATION_ATTEMPTS {
            let candidate = random_id();
            if self.connectors.lock().contains_key(&candidate) {
                continue;
            }
            if self.store.get_connector(&candidate)?.is_some() {
                continue;
            }
            return Ok(candidate);
        }
        Err(SystemError::Internal(
            "unable to allocate a unique connector id".to_string(),
        ))
    }

    /// Operation guard for a loaded connector. Unknown ids never get an entry.
    /// The connector map lock is held across the insert so a concurrent
    /// delete either sees the entry or runs before the lookup.
    fn op_lock_existing(&self, id: &str) -> Result<Arc<tokio::sync::Mutex<()>>, SystemError> {
        let connectors = self.connectors.lock();
        if !connectors.contains_key(id) {
            return Err(SystemError::connector_not_found(id));
        }
        Ok(self.op_lock(id))
    }

    fn op_lock(&self, id: &str) -> Arc<tokio::sync::Mutex<()>> {
        Arc::clone(
            self.op_locks
                .lock()
                .entry(id.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))),
        )
    }
}

fn random_id() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(CONNECTOR_ID_LEN)
        .map(char::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use bridge::DeliveryBus;
    use serde_json::json;
    use storage::StorageManager;

    #[tokio::test]
    async fn unknown_ids_leave_no_operation_guards() {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn ConnectorStore> = Arc::new(StorageManager::new(dir.path()).unwrap());
        let bus = DeliveryBus::default();
        let system = ConnectorSystem::new(Arc::new(ModuleRegistry::new()), store, bus.handle());

        for n in 0..200 {
            let id = format!("ghost{n}");
            assert!(matches!(
                system.delete_connector(&id).await,
                Err(SystemError::NotFound(_))
            ));
            assert!(matches!(
                system.set_connector_running_state(&id, true).await,
                Err(SystemError::NotFound(_))
            ));
            assert!(matches!(
                system.set_connector_running_state(&id, false).await,
                Err(SystemError::NotFound(_))
            ));
            let patch: PatchConnectorRequest = serde_json::from_value(json!({"name": "x"})).unwrap();
            assert!(matches!(
                system.patch_connector(&id, patch).await,
                Err(SystemError::NotFound(_))
            ));
        }
        assert!(system.op_locks.lock().is_empty());
    }
}
