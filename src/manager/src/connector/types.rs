use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Persistent identity of a connector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectorRecord {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Registered module type name, e.g. `MQTT`.
    pub module: String,
    #[serde(default)]
    pub running: bool,
    /// Opaque to the orchestrator; interpreted by the module.
    #[serde(default)]
    pub settings: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateConnectorRequest {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub module: String,
    #[serde(default)]
    pub running: bool,
    #[serde(default)]
    pub settings: Value,
}

/// Fields left out keep their current value. A supplied `id` is ignored.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PatchConnectorRequest {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub module: Option<String>,
    #[serde(default)]
    pub running: Option<bool>,
    #[serde(default)]
    pub settings: Option<Value>,
}

impl CreateConnectorRequest {
    pub(crate) fn into_record(self, id: String) -> ConnectorRecord {
        ConnectorRecord {
            id,
            name: self.name,
            description: self.description,
            module: self.module,
            running: self.running,
            settings: self.settings,
        }
    }
}

impl PatchConnectorRequest {
    /// Merge onto `current`, keeping its id.
    pub(crate) fn apply_to(self, current: &ConnectorRecord) -> ConnectorRecord {
        ConnectorRecord {
            id: current.id.clone(),
            name: self.name.unwrap_or_else(|| current.name.clone()),
            description: self
                .description
                .unwrap_or_else(|| current.description.clone()),
            module: self.module.unwrap_or_else(|| current.module.clone()),
            running: self.running.unwrap_or(current.running),
            settings: self.settings.unwrap_or_else(|| current.settings.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn patch_keeps_omitted_fields() {
        let current = ConnectorRecord {
            id: "abc".into(),
            name: "meter".into(),
            description: "kitchen".into(),
            module: "BeeClear".into(),
            running: true,
            settings: json!({"bcHost": "http://bc"}),
        };
        let patch: PatchConnectorRequest =
            serde_json::from_value(json!({"id": "other", "name": "renamed"})).unwrap();
        let merged = patch.apply_to(&current);
        assert_eq!(merged.id, "abc");
        assert_eq!(merged.name, "renamed");
        assert!(merged.running);
        assert_eq!(merged.settings, current.settings);
    }

    #[test]
    fn record_json_shape() {
        let record = ConnectorRecord {
            id: "abc".into(),
            name: "n".into(),
            description: "d".into(),
            module: "MQTT".into(),
            running: false,
            settings: json!({"subBrokers": []}),
        };
        assert_eq!(
            serde_json::to_value(&record).unwrap(),
            json!({"id": "abc", "name": "n", "description": "d", "module": "MQTT",
                   "running": false, "settings": {"subBrokers": []}})
        );
    }
}
