//! Error types for the feature store

use thiserror::Error;

/// Result type for feature store operations
pub type Result<T> = std::result::Result<T, StoreError>;

/// Everything that can go wrong while reading or writing the store.
///
/// A missing key is never an error; `get` reports it as `Ok(None)`. A stale
/// upsert is not an error either; it resolves to the record already stored.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("failed to encode {namespace} item {key:?}: {source}")]
    Encode {
        namespace: &'static str,
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to decode {namespace} item {key:?}: {source}")]
    Decode {
        namespace: &'static str,
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("malformed dataset: {0}")]
    Dataset(#[source] serde_json::Error),

    #[error("item {key:?} is a {actual} record, expected {expected}")]
    KindMismatch {
        expected: &'static str,
        actual: &'static str,
        key: String,
    },

    #[error("{namespace} item stored under {map_key:?} carries key {item_key:?}")]
    KeyMismatch {
        namespace: &'static str,
        map_key: String,
        item_key: String,
    },

    #[error("unknown data kind: {0}")]
    UnknownKind(String),

    #[error("partition {namespace} holds a key that is not valid UTF-8")]
    CorruptKey { namespace: &'static str },

    #[error("partition pointer for {namespace} is not a generation number")]
    CorruptGeneration { namespace: &'static str },

    #[error("store error: {0}")]
    Store(#[from] sled::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl StoreError {
    /// True when the payload could not be encoded or decoded, as opposed to
    /// the store itself failing.
    pub fn is_serialization(&self) -> bool {
        matches!(
            self,
            StoreError::Encode { .. } | StoreError::Decode { .. } | StoreError::Dataset(_)
        )
    }
}
