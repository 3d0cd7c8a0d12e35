//! A persistent feature store for a flag evaluation client, backed by an
//! embedded sled database.
//!
//! The caching wrapper of the client talks to [`PersistentDataStore`]; this
//! crate provides [`SledDataStore`], which keeps one live sled tree per
//! [`DataKind`] and resolves concurrent writes by record version.
//!
//! # Examples
//! ```no_run
//! use sled_feature_store::{DataKind, PersistentDataStore, SledDataStore, StoreConfig};
//!
//! let db = StoreConfig::default().open_db()?;
//! let store = SledDataStore::new(db)?;
//! if store.is_initialized()? {
//!     let flag = store.get(DataKind::Features, "new-checkout")?;
//!     println!("{:?}", flag);
//! }
//! # Ok::<(), sled_feature_store::StoreError>(())
//! ```

pub mod config;
pub mod error;
pub mod kind;
pub mod store;

pub use config::StoreConfig;
pub use error::{Result, StoreError};
pub use kind::{parse_all_data, parse_item, AllData, DataKind, FeatureFlag, Segment, StoreItem};
pub use store::sled_store::{SledDataStore, PARTITIONS_TREE};
pub use store::{CacheTtl, PersistentDataStore, INIT_KEY, INIT_PARTITION};
