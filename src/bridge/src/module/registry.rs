use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;

use super::beeclear::BeeClearModule;
use super::mqtt::MqttModule;
use super::netatmo::NetatmoModule;
use super::{BridgeContext, Module, ModuleDescriptor, ModuleError};

pub type ModuleFactory = Arc<dyn Fn() -> Box<dyn Module> + Send + Sync>;

struct RegisteredModule {
    factory: ModuleFactory,
    descriptor: ModuleDescriptor,
}

/// Registry that resolves module type names to factory functions.
#[derive(Default)]
pub struct ModuleRegistry {
    modules: RwLock<BTreeMap<String, RegisteredModule>>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the MQTT, BeeClear and Netatmo module types.
    pub fn with_builtin_modules(context: BridgeContext) -> Arc<Self> {
        let registry = Arc::new(Self::new());
        registry.register_builtin_modules(context);
        registry
    }

    /// Register `factory` under `type_name`, replacing an earlier registration.
    pub fn register(&self, type_name: impl Into<String>, factory: ModuleFactory) {
        let mut prototype = factory();
        prototype.setup();
        let descriptor = prototype.descriptor();
        self.modules.write().insert(
            type_name.into(),
            RegisteredModule {
                factory,
                descriptor,
            },
        );
    }

    pub fn is_registered(&self, type_name: &str) -> bool {
        self.modules.read().contains_key(type_name)
    }

    /// Fresh, set-up instance of `type_name`. Instances are never shared.
    pub fn create(&self, type_name: &str) -> Result<Box<dyn Module>, ModuleError> {
        let factory = {
            let guard = self.modules.read();
            let entry = guard
                .get(type_name)
                .ok_or_else(|| ModuleError::NotFound(type_name.to_string()))?;
            Arc::clone(&entry.factory)
        };
        let mut module = factory();
        module.setup();
        Ok(module)
    }

    pub fn descriptors(&self) -> Vec<ModuleDescriptor> {
        self.modules
            .read()
            .values()
            .map(|entry| entry.descriptor.clone())
            .collect()
    }

    fn register_builtin_modules(&self, context: BridgeContext) {
        self.register(
            "MQTT",
            Arc::new(move || Box::new(MqttModule::new(context.clone())) as Box<dyn Module>),
        );
        self.register(
            "BeeClear",
            Arc::new(|| Box::new(BeeClearModule::new()) as Box<dyn Module>),
        );
        self.register(
            "Netatmo",
            Arc::new(|| Box::new(NetatmoModule::new()) as Box<dyn Module>),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::ModuleBase;
    use crate::mqtt::connection::ConnectionTuning;
    use crate::mqtt::mock::MockNetwork;
    use async_trait::async_trait;
    use serde_json::Value;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingModule {
        base: ModuleBase,
    }

    #[async_trait]
    impl Module for CountingModule {
        fn base(&self) -> &ModuleBase {
            &self.base
        }
        fn base_mut(&mut self) -> &mut ModuleBase {
            &mut self.base
        }
        fn setup(&mut self) {
            self.base.describe("Counting", "counts instances");
        }
        fn settings_changed(&mut self, _settings: &Value) -> Result<(), ModuleError> {
            Ok(())
        }
        async fn start(&mut self) -> Result<(), ModuleError> {
            Ok(())
        }
        async fn stop(&mut self) -> Result<(), ModuleError> {
            Ok(())
        }
    }

    #[test]
    fn create_returns_fresh_set_up_instances() {
        let registry = ModuleRegistry::new();
        let built = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&built);
        registry.register(
            "Counting",
            Arc::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                Box::new(CountingModule {
                    base: ModuleBase::default(),
                }) as Box<dyn Module>
            }),
        );
        // One prototype for the descriptor.
        assert_eq!(built.load(Ordering::SeqCst), 1);

        let first = registry.create("Counting").unwrap();
        let second = registry.create("Counting").unwrap();
        assert_eq!(built.load(Ordering::SeqCst), 3);
        assert_eq!(first.name(), "Counting");
        assert_eq!(second.description(), "counts instances");
    }

    #[test]
    fn unknown_type_is_not_found() {
        let registry = ModuleRegistry::new();
        let err = registry.create("Nope").err().unwrap();
        assert_eq!(err, ModuleError::NotFound("Nope".to_string()));
    }

    #[test]
    fn builtin_descriptors_are_listed() {
        let context = BridgeContext::new(Arc::new(MockNetwork::new()), ConnectionTuning::default());
        let registry = ModuleRegistry::with_builtin_modules(context);
        let names: Vec<_> = registry
            .descriptors()
            .into_iter()
            .map(|descriptor| descriptor.name)
            .collect();
        assert_eq!(names, vec!["BeeClear", "MQTT", "Netatmo"]);
        assert!(registry.is_registered("MQTT"));
    }
}
