use crate::connector::ConnectorRecord;
use storage::StoredConnector;

/// Serialize a connector record for storage.
pub fn stored_connector_from_record(record: &ConnectorRecord) -> Result<StoredConnector, String> {
    let raw_json =
        serde_json::to_string(record).map_err(|err| format!("serialize connector {}: {err}", record.id))?;
    Ok(StoredConnector {
        id: record.id.clone(),
        raw_json,
    })
}

/// Rebuild a connector record from stored raw JSON. The storage key wins
/// over any id embedded in the JSON.
pub fn record_from_stored(stored: &StoredConnector) -> Result<ConnectorRecord, String> {
    let mut record: ConnectorRecord = serde_json::from_str(&stored.raw_json)
        .map_err(|err| format!("decode stored connector {}: {err}", stored.id))?;
    record.id = stored.id.clone();
    Ok(record)
}
