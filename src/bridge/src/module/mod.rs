//! Module contract implemented by every connector type.
//!
//! - A module owns its own settings schema and validates it on
//!   [`Module::settings_changed`].
//! - Shared fields live in [`ModuleBase`], embedded by value in each module.
//! - [`registry::ModuleRegistry`] maps type names to factories producing fresh instances.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

use crate::delivery::DeliveryHandle;
use crate::mqtt::connection::ConnectionTuning;
use crate::mqtt::MqttTransport;

pub mod beeclear;
pub mod mqtt;
pub mod netatmo;
mod poll;
pub mod registry;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ModuleError {
    /// No factory is registered under this type name.
    #[error("module not found: {0}")]
    NotFound(String),
    #[error("invalid settings for module {module}: {reason}")]
    InvalidSettings { module: String, reason: String },
    /// Started before a delivery handle was wired in.
    #[error("module {0} has no delivery handle")]
    MissingDelivery(String),
    #[error("{0}")]
    Other(String),
}

impl ModuleError {
    pub fn invalid_settings(module: &str, reason: impl ToString) -> Self {
        Self::InvalidSettings {
            module: module.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// Fields every module carries.
#[derive(Debug, Clone, Default)]
pub struct ModuleBase {
    pub name: String,
    pub description: String,
    pub delivery: Option<DeliveryHandle>,
}

impl ModuleBase {
    pub fn describe(&mut self, name: &str, description: &str) {
        self.name = name.to_string();
        self.description = description.to_string();
    }

    pub fn delivery(&self) -> Result<DeliveryHandle, ModuleError> {
        self.delivery
            .clone()
            .ok_or_else(|| ModuleError::MissingDelivery(self.name.clone()))
    }
}

/// Public description of a registered module type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleDescriptor {
    pub name: String,
    pub description: String,
}

/// Collaborators handed to modules that open broker connections.
#[derive(Clone)]
pub struct BridgeContext {
    pub transport: Arc<dyn MqttTransport>,
    pub tuning: ConnectionTuning,
}

impl BridgeContext {
    pub fn new(transport: Arc<dyn MqttTransport>, tuning: ConnectionTuning) -> Self {
        Self { transport, tuning }
    }
}

/// A connector processing unit.
///
/// `start` and `stop` may be called repeatedly; implementations guard
/// against duplicate work themselves.
#[async_trait]
pub trait Module: Send + Sync + 'static {
    fn base(&self) -> &ModuleBase;

    fn base_mut(&mut self) -> &mut ModuleBase;

    /// Assign display name and description. Called once at instantiation.
    fn setup(&mut self);

    /// Parse and apply new settings. Called at least once before `start`.
    fn settings_changed(&mut self, settings: &Value) -> Result<(), ModuleError>;

    async fn start(&mut self) -> Result<(), ModuleError>;

    async fn stop(&mut self) -> Result<(), ModuleError>;

    fn name(&self) -> &str {
        &self.base().name
    }

    fn description(&self) -> &str {
        &self.base().description
    }

    fn set_delivery_handle(&mut self, delivery: DeliveryHandle) {
        self.base_mut().delivery = Some(delivery);
    }

    fn descriptor(&self) -> ModuleDescriptor {
        ModuleDescriptor {
            name: self.name().to_string(),
            description: self.description().to_string(),
        }
    }
}
