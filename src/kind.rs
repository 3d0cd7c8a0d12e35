use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Result, StoreError};

/// The closed set of record kinds the evaluation engine persists. Each kind
/// owns one partition, named after its namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DataKind {
    Features,
    Segments,
}

/// Full dataset handed to `init`: kind -> key -> record.
pub type AllData = HashMap<DataKind, HashMap<String, StoreItem>>;

impl DataKind {
    pub const ALL: [DataKind; 2] = [DataKind::Features, DataKind::Segments];

    pub fn namespace(&self) -> &'static str {
        match self {
            DataKind::Features => "features",
            DataKind::Segments => "segments",
        }
    }

    /// Serialize an item of this kind to its stored JSON form.
    pub fn encode(&self, item: &StoreItem) -> Result<Vec<u8>> {
        if item.kind() != *self {
            return Err(StoreError::KindMismatch {
                expected: self.namespace(),
                actual: item.kind().namespace(),
                key: item.key().to_string(),
            });
        }
        let encoded = match item {
            StoreItem::Flag(flag) => serde_json::to_vec(flag),
            StoreItem::Segment(segment) => serde_json::to_vec(segment),
        };
        encoded.map_err(|source| StoreError::Encode {
            namespace: self.namespace(),
            key: item.key().to_string(),
            source,
        })
    }

    /// Deserialize a stored value read from this kind's partition.
    pub fn decode(&self, key: &str, bytes: &[u8]) -> Result<StoreItem> {
        let decoded = match self {
            DataKind::Features => serde_json::from_slice(bytes).map(StoreItem::Flag),
            DataKind::Segments => serde_json::from_slice(bytes).map(StoreItem::Segment),
        };
        decoded.map_err(|source| StoreError::Decode {
            namespace: self.namespace(),
            key: key.to_string(),
            source,
        })
    }

    fn decode_value(&self, key: &str, value: Value) -> Result<StoreItem> {
        let decoded = match self {
            DataKind::Features => serde_json::from_value(value).map(StoreItem::Flag),
            DataKind::Segments => serde_json::from_value(value).map(StoreItem::Segment),
        };
        decoded.map_err(|source| StoreError::Decode {
            namespace: self.namespace(),
            key: key.to_string(),
            source,
        })
    }
}

impl fmt::Display for DataKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.namespace())
    }
}

impl FromStr for DataKind {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self> {
        DataKind::ALL
            .into_iter()
            .find(|kind| kind.namespace() == s)
            .ok_or_else(|| StoreError::UnknownKind(s.to_string()))
    }
}

/// A feature flag record. Only `key`, `version` and `deleted` are
/// interpreted; targeting rules and variations ride along in `attributes`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureFlag {
    pub key: String,
    pub version: u64,
    #[serde(default)]
    pub deleted: bool,
    #[serde(flatten)]
    pub attributes: Map<String, Value>,
}

/// A user segment record, stored as opaquely as a flag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    pub key: String,
    pub version: u64,
    #[serde(default)]
    pub deleted: bool,
    #[serde(flatten)]
    pub attributes: Map<String, Value>,
}

/// A versioned record of any kind.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum StoreItem {
    Flag(FeatureFlag),
    Segment(Segment),
}

impl StoreItem {
    /// A deleted placeholder. Deletes are upserts of a tombstone whose
    /// version is above the last one stored for the key.
    pub fn tombstone(kind: DataKind, key: &str, version: u64) -> Self {
        match kind {
            DataKind::Features => StoreItem::Flag(FeatureFlag {
                key: key.to_string(),
                version,
                deleted: true,
                attributes: Map::new(),
            }),
            DataKind::Segments => StoreItem::Segment(Segment {
                key: key.to_string(),
                version,
                deleted: true,
                attributes: Map::new(),
            }),
        }
    }

    pub fn kind(&self) -> DataKind {
        match self {
            StoreItem::Flag(_) => DataKind::Features,
            StoreItem::Segment(_) => DataKind::Segments,
        }
    }

    pub fn key(&self) -> &str {
        match self {
            StoreItem::Flag(flag) => &flag.key,
            StoreItem::Segment(segment) => &segment.key,
        }
    }

    pub fn version(&self) -> u64 {
        match self {
            StoreItem::Flag(flag) => flag.version,
            StoreItem::Segment(segment) => segment.version,
        }
    }

    pub fn is_deleted(&self) -> bool {
        match self {
            StoreItem::Flag(flag) => flag.deleted,
            StoreItem::Segment(segment) => segment.deleted,
        }
    }
}

/// Parse a dataset document of the form
/// `{"features": {"key": {...}}, "segments": {...}}`.
///
/// Namespaces outside the closed kind set are rejected. A namespace may be
/// omitted, in which case `init` leaves its partition alone.
pub fn parse_all_data(bytes: &[u8]) -> Result<AllData> {
    let document: HashMap<String, HashMap<String, Value>> =
        serde_json::from_slice(bytes).map_err(StoreError::Dataset)?;

    let mut all_data = AllData::new();
    for (namespace, records) in document {
        let kind: DataKind = namespace.parse()?;
        let mut items = HashMap::with_capacity(records.len());
        for (key, value) in records {
            let item = kind.decode_value(&key, value)?;
            check_key(&key, &item)?;
            items.insert(key, item);
        }
        all_data.insert(kind, items);
    }
    Ok(all_data)
}

/// A record must be filed under its own key.
pub(crate) fn check_key(map_key: &str, item: &StoreItem) -> Result<()> {
    if item.key() != map_key {
        return Err(StoreError::KeyMismatch {
            namespace: item.kind().namespace(),
            map_key: map_key.to_string(),
            item_key: item.key().to_string(),
        });
    }
    Ok(())
}

/// Parse a single record of the given kind, e.g. from a file on disk.
pub fn parse_item(kind: DataKind, bytes: &[u8]) -> Result<StoreItem> {
    let value: Value = serde_json::from_slice(bytes).map_err(StoreError::Dataset)?;
    let key = value
        .get("key")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    kind.decode_value(&key, value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_namespace_round_trip() {
        for kind in DataKind::ALL {
            assert_eq!(kind.namespace().parse::<DataKind>().unwrap(), kind);
        }
        assert!(matches!(
            "flags".parse::<DataKind>(),
            Err(StoreError::UnknownKind(ref s)) if s == "flags"
        ));
    }

    #[test]
    fn test_decode_keeps_payload_fields() {
        let raw = br#"{"key":"beta","version":3,"on":true,"variations":[true,false]}"#;
        let item = DataKind::Features.decode("beta", raw).unwrap();
        assert_eq!(item.key(), "beta");
        assert_eq!(item.version(), 3);
        assert!(!item.is_deleted());
        let StoreItem::Flag(flag) = &item else {
            panic!("expected a flag, got {:?}", item);
        };
        assert_eq!(flag.attributes.get("on"), Some(&json!(true)));
        assert_eq!(flag.attributes.get("variations"), Some(&json!([true, false])));

        let encoded = DataKind::Features.encode(&item).unwrap();
        let reread: Value = serde_json::from_slice(&encoded).unwrap();
        assert_eq!(reread["variations"], json!([true, false]));
        assert_eq!(reread["deleted"], json!(false));
    }

    #[test]
    fn test_decode_failure_is_serialization_error() {
        let err = DataKind::Segments.decode("s1", b"{not json").unwrap_err();
        assert!(err.is_serialization());
        assert!(matches!(err, StoreError::Decode { namespace: "segments", ref key, .. } if key == "s1"));

        // version is mandatory
        let err = DataKind::Segments.decode("s1", br#"{"key":"s1"}"#).unwrap_err();
        assert!(matches!(err, StoreError::Decode { .. }));
    }

    #[test]
    fn test_encode_rejects_wrong_kind() {
        let item = StoreItem::tombstone(DataKind::Segments, "s1", 1);
        let err = DataKind::Features.encode(&item).unwrap_err();
        assert!(matches!(
            err,
            StoreError::KindMismatch { expected: "features", actual: "segments", .. }
        ));
        assert!(!err.is_serialization());
    }

    #[test]
    fn test_tombstone() {
        let item = StoreItem::tombstone(DataKind::Features, "gone", 9);
        assert_eq!(item.kind(), DataKind::Features);
        assert_eq!(item.key(), "gone");
        assert_eq!(item.version(), 9);
        assert!(item.is_deleted());
    }

    #[test]
    fn test_parse_all_data() {
        let doc = json!({
            "features": {
                "a": {"key": "a", "version": 1, "on": false},
                "b": {"key": "b", "version": 4, "deleted": true}
            },
            "segments": {}
        });
        let all = parse_all_data(doc.to_string().as_bytes()).unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[&DataKind::Features].len(), 2);
        assert!(all[&DataKind::Features]["b"].is_deleted());
        assert!(all[&DataKind::Segments].is_empty());
    }

    #[test]
    fn test_parse_all_data_rejects_unknown_namespace() {
        let doc = json!({"experiments": {}});
        let err = parse_all_data(doc.to_string().as_bytes()).unwrap_err();
        assert!(matches!(err, StoreError::UnknownKind(_)));

        let err = parse_all_data(b"[]").unwrap_err();
        assert!(matches!(err, StoreError::Dataset(_)));
    }

    #[test]
    fn test_parse_all_data_rejects_key_mismatch() {
        let doc = json!({"features": {"a": {"key": "b", "version": 1}}});
        let err = parse_all_data(doc.to_string().as_bytes()).unwrap_err();
        assert!(matches!(
            err,
            StoreError::KeyMismatch { namespace: "features", ref map_key, ref item_key }
                if map_key == "a" && item_key == "b"
        ));
    }

    #[test]
    fn test_parse_item() {
        let item = parse_item(DataKind::Segments, br#"{"key":"beta-users","version":2}"#).unwrap();
        assert_eq!(item.kind(), DataKind::Segments);
        assert_eq!(item.key(), "beta-users");
    }
}
