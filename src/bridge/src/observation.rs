//! SensorThings observation model carried on the delivery bus.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// A single sensor reading in SensorThings form.
///
/// Every field is optional on the wire; empty fields are omitted when the
/// observation is serialized for the outbound broker.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Observation {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phenomenon_time: Option<String>,
    /// Loosely typed result: number, string or boolean.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_quality: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub valid_time: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub parameters: BTreeMap<String, Value>,
    #[serde(
        default,
        rename = "FeatureOfInterest",
        skip_serializing_if = "Option::is_none"
    )]
    pub feature_of_interest: Option<FeatureOfInterest>,
}

impl Observation {
    pub fn with_result(result: impl Into<Value>) -> Self {
        Self {
            result: Some(result.into()),
            ..Self::default()
        }
    }

    pub fn with_phenomenon_time(mut self, time: impl Into<String>) -> Self {
        self.phenomenon_time = Some(time.into());
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FeatureOfInterest {
    #[serde(default, rename = "@iot.selfLink", skip_serializing_if = "Option::is_none")]
    pub self_link: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, rename = "encodingtype", skip_serializing_if = "Option::is_none")]
    pub encoding_type: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub feature: BTreeMap<String, Value>,
}

/// An observation addressed to an outbound topic.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub topic: String,
    pub observation: Observation,
}

impl Message {
    pub fn new(topic: impl Into<String>, observation: Observation) -> Self {
        Self {
            topic: topic.into(),
            observation,
        }
    }
}
