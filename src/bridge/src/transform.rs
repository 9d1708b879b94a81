//! Inbound payload to observation mapping.

use serde_json::{Map, Number, Value};
use std::collections::HashMap;

use crate::observation::{Message, Observation};
use crate::subscribe::{FieldTarget, StreamMapping};

/// Build the outbound message for one inbound payload.
///
/// Returns `None` when the stream has no mapping or the payload is not a
/// JSON object. A payload without any mapped field still yields a message.
pub fn to_message(stream: &StreamMapping, payload: &[u8]) -> Option<Message> {
    if stream.mapping.is_empty() {
        return None;
    }
    let fields: Map<String, Value> = match serde_json::from_slice(payload) {
        Ok(Value::Object(fields)) => fields,
        Ok(_) => {
            tracing::debug!(topic = %stream.topic_in, "ignoring non-object payload");
            return None;
        }
        Err(err) => {
            tracing::debug!(topic = %stream.topic_in, error = %err, "ignoring malformed payload");
            return None;
        }
    };
    Some(Message::new(
        stream.topic_out.clone(),
        map_observation(&stream.mapping, &fields),
    ))
}

pub fn map_observation(mapping: &HashMap<String, FieldTarget>, fields: &Map<String, Value>) -> Observation {
    let mut observation = Observation::default();
    for (source, target) in mapping {
        let Some(value) = fields.get(source) else {
            continue;
        };
        match target.name.as_str() {
            "result" => {
                observation.result = Some(if target.to_float {
                    coerce_float(value)
                } else {
                    value.clone()
                });
            }
            "phenomenonTime" => observation.phenomenon_time = Some(time_text(value)),
            "resultTime" => observation.result_time = Some(time_text(value)),
            "validTime" => observation.valid_time = Some(time_text(value)),
            "resultQuality" => observation.result_quality = Some(time_text(value)),
            other => {
                observation.parameters.insert(other.to_string(), value.clone());
            }
        }
    }
    observation
}

/// Parse the value as a float, keeping the raw value when that fails.
fn coerce_float(value: &Value) -> Value {
    let parsed = match value {
        Value::String(text) => text.trim().parse::<f64>().ok(),
        Value::Number(number) => number.as_f64(),
        _ => None,
    };
    parsed
        .and_then(Number::from_f64)
        .map(Value::Number)
        .unwrap_or_else(|| value.clone())
}

fn time_text(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn stream(mapping: Value) -> StreamMapping {
        serde_json::from_value(json!({
            "topicIn": "meters/in",
            "topicOut": "v1.0/Datastreams(7)/Observations",
            "mapping": mapping
        }))
        .unwrap()
    }

    #[test]
    fn numeric_string_becomes_float() {
        let stream = stream(json!({"val": {"name": "result", "toFloat": true}}));
        let message = to_message(&stream, br#"{"val":"12.5"}"#).unwrap();
        assert_eq!(message.topic, "v1.0/Datastreams(7)/Observations");
        assert_eq!(message.observation.result, Some(json!(12.5)));
        assert!(message.observation.result.unwrap().is_f64());
    }

    #[test]
    fn unparseable_value_falls_back_to_raw() {
        let stream = stream(json!({"val": {"name": "result", "toFloat": true}}));
        let message = to_message(&stream, br#"{"val":"abc"}"#).unwrap();
        assert_eq!(message.observation.result, Some(json!("abc")));
    }

    #[test]
    fn result_without_coercion_keeps_type() {
        let stream = stream(json!({"on": {"name": "result"}}));
        let message = to_message(&stream, br#"{"on":true}"#).unwrap();
        assert_eq!(message.observation.result, Some(json!(true)));
    }

    #[test]
    fn empty_mapping_produces_nothing() {
        let stream = stream(json!({}));
        assert!(to_message(&stream, br#"{"val":"12.5"}"#).is_none());
    }

    #[test]
    fn malformed_payload_produces_nothing() {
        let stream = stream(json!({"val": {"name": "result"}}));
        assert!(to_message(&stream, b"not json").is_none());
        assert!(to_message(&stream, b"[1,2]").is_none());
    }

    #[test]
    fn time_fields_and_parameters_are_mapped() {
        let stream = stream(json!({
            "val": {"name": "result", "toFloat": true},
            "ts": {"name": "phenomenonTime"},
            "q": {"name": "resultQuality"},
            "unit": {"name": "unit"}
        }));
        let message = to_message(
            &stream,
            br#"{"val":" 3 ","ts":"2024-05-01T10:00:00Z","q":"good","unit":"kWh","ignored":1}"#,
        )
        .unwrap();
        let observation = message.observation;
        assert_eq!(observation.result, Some(json!(3.0)));
        assert_eq!(observation.phenomenon_time.as_deref(), Some("2024-05-01T10:00:00Z"));
        assert_eq!(observation.result_quality.as_deref(), Some("good"));
        assert_eq!(observation.parameters.get("unit"), Some(&json!("kWh")));
        assert_eq!(observation.parameters.len(), 1);
    }

    #[test]
    fn payload_without_mapped_fields_still_emits() {
        let stream = stream(json!({"val": {"name": "result"}}));
        let message = to_message(&stream, br#"{"other":1}"#).unwrap();
        assert_eq!(message.observation, Observation::default());
    }
}
