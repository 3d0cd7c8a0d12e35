pub mod sled_store;

use std::collections::HashMap;
use std::time::Duration;

use crate::error::Result;
use crate::kind::{AllData, DataKind, StoreItem};

/// Partition holding the initialization marker.
pub const INIT_PARTITION: &str = "init-ld";

/// Sentinel key whose presence means a full dataset has been stored.
pub const INIT_KEY: &str = "init-key";

/// How long the caching layer above a store may keep what it reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheTtl {
    /// Every read goes to the store.
    Disabled,
    /// Cached data never expires.
    Forever,
    Expiring(Duration),
}

impl CacheTtl {
    /// Zero disables caching, a negative value caches forever.
    pub fn from_secs(secs: i64) -> Self {
        match secs {
            0 => CacheTtl::Disabled,
            s if s < 0 => CacheTtl::Forever,
            s => CacheTtl::Expiring(Duration::from_secs(s.unsigned_abs())),
        }
    }
}

/// Storage contract consumed by the flag client's caching wrapper.
///
/// Every method runs as a single transaction against the backing store, so
/// implementations hold no state of their own between calls and must be
/// safe to call from many threads at once.
pub trait PersistentDataStore: Send + Sync {
    /// Replace the contents of every kind present in `all_data` and mark the
    /// store as initialized.
    fn init(&self, all_data: AllData) -> Result<()>;

    /// Look up a single record. `Ok(None)` means the key was never written.
    fn get(&self, kind: DataKind, key: &str) -> Result<Option<StoreItem>>;

    /// Every record of a kind, tombstones included.
    fn get_all(&self, kind: DataKind) -> Result<HashMap<String, StoreItem>>;

    /// Write `item` if its version is strictly greater than the stored one.
    /// Returns the record that is stored once the call completes: `item`
    /// when the write went through, the existing record otherwise.
    fn upsert(&self, kind: DataKind, item: StoreItem) -> Result<StoreItem>;

    /// Whether `init` has completed at least once, in this or any earlier
    /// process sharing the same database.
    fn is_initialized(&self) -> Result<bool>;

    fn cache_ttl(&self) -> CacheTtl;
}
