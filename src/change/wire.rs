//! Versioned JSON encoding of Nomad changes.
//!
//! Documents carry a `format` marker. The current form (`v2`) addresses
//! stripes and nodes by UID; `v1` documents (index- and name-addressed, no
//! marker) are accepted for read compatibility and re-encode as `v2`.

use crate::change::NomadChange;
use crate::error::{CaravanError, Result};
use crate::model::FormatVersion;
use serde_json::Value;

const FORMAT_FIELD: &str = "format";

/// Encode a change as a V2 document.
pub fn encode(change: &NomadChange) -> Result<Value> {
    let mut value = serde_json::to_value(change)?;
    match value.as_object_mut() {
        Some(object) => {
            object.insert(FORMAT_FIELD.to_string(), Value::String("v2".to_string()));
            Ok(value)
        }
        None => Err(CaravanError::InvalidState(
            "change did not serialize to an object".to_string(),
        )),
    }
}

/// Encode a change as a V2 JSON string.
pub fn encode_to_string(change: &NomadChange) -> Result<String> {
    Ok(serde_json::to_string(&encode(change)?)?)
}

/// Decode a change document, reporting the format it was written in.
/// Documents without a `format` marker are treated as V1.
pub fn decode(value: &Value) -> Result<(NomadChange, FormatVersion)> {
    let format = match value.get(FORMAT_FIELD) {
        None => FormatVersion::V1,
        Some(marker) => serde_json::from_value(marker.clone())?,
    };
    let mut body = value.clone();
    if let Some(object) = body.as_object_mut() {
        object.remove(FORMAT_FIELD);
    }
    let change: NomadChange = serde_json::from_value(body)?;
    Ok((change, format))
}

/// Decode a change document from a JSON string.
pub fn decode_from_str(text: &str) -> Result<(NomadChange, FormatVersion)> {
    decode(&serde_json::from_str(text)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::change::SettingChange;
    use crate::model::applicability::Applicability;
    use crate::model::setting::Setting;
    use crate::model::uid::Uid;

    fn sample_change() -> NomadChange {
        NomadChange::Setting(SettingChange::set(
            Applicability::node(Uid::generate(), Uid::generate()),
            Setting::NodeBackupDir,
            None,
            "/backup",
        ))
    }

    #[test]
    fn test_v2_roundtrip() {
        let change = sample_change();
        let encoded = encode(&change).unwrap();
        assert_eq!(encoded.get("format").unwrap(), "v2");
        let (decoded, format) = decode(&encoded).unwrap();
        assert_eq!(decoded, change);
        assert_eq!(format, FormatVersion::V2);
    }

    #[test]
    fn test_v1_document_read_and_reencoded() {
        let v1 = serde_json::json!({
            "type": "setting",
            "applicability": {"scope": "node", "stripe_id": 1, "node_name": "node-1"},
            "setting": "node-backup-dir",
            "operation": "set",
            "value": "/backup"
        });
        let (change, format) = decode(&v1).unwrap();
        assert_eq!(format, FormatVersion::V1);

        // Re-encoding a V1 read is well-defined and marked v2.
        let reencoded = encode(&change).unwrap();
        assert_eq!(reencoded.get("format").unwrap(), "v2");
        let (again, format) = decode(&reencoded).unwrap();
        assert_eq!(again, change);
        assert_eq!(format, FormatVersion::V2);
    }

    #[test]
    fn test_multi_change_roundtrip() {
        let change = NomadChange::MultiSetting {
            changes: vec![
                SettingChange::set(
                    Applicability::cluster(),
                    Setting::OffheapResources,
                    Some("main".to_string()),
                    "512MB",
                ),
                SettingChange::unset(
                    Applicability::cluster(),
                    Setting::OffheapResources,
                    Some("scratch".to_string()),
                ),
            ],
        };
        let (decoded, _) = decode(&encode(&change).unwrap()).unwrap();
        assert_eq!(decoded, change);
    }
}
