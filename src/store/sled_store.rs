use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Instant;

use sled::transaction::{
    ConflictableTransactionError, ConflictableTransactionResult, TransactionError, Transactional,
};
use sled::{Batch, IVec, Tree};

use super::{CacheTtl, PersistentDataStore, INIT_KEY, INIT_PARTITION};
use crate::error::{Result, StoreError};
use crate::kind::{check_key, AllData, DataKind, StoreItem};

const INIT_VALUE: &[u8] = b"1";

/// Tree mapping each kind's namespace to the generation of its live tree.
pub const PARTITIONS_TREE: &str = "partitions";

/// Persistent feature store backed by sled.
///
/// Every data kind is stored in a generation of trees: generation 0 is the
/// tree named after the namespace, generation `n` is `"<namespace>.<n>"`.
/// [`PARTITIONS_TREE`] records which generation is live. `init` fills a fresh
/// generation and switches the pointer in the same transaction that sets the
/// marker in [`INIT_PARTITION`], so readers see either the old dataset or
/// the new one. A generation that is no longer live is never written again.
///
/// The database handle is owned by the caller. Use one `SledDataStore` per
/// database.
pub struct SledDataStore {
    db: sled::Db,
    partitions: Tree,
    init: Tree,
    init_lock: Mutex<()>,
    flush_on_write: bool,
}

/// What an upsert transaction decided.
enum UpsertOutcome {
    Applied,
    Stale(StoreItem),
    /// `init` replaced the partition after the generation was resolved.
    Moved,
}

/// A freshly filled generation waiting for `init` to make it live.
struct NewPartition {
    kind: DataKind,
    generation: u64,
    tree: Tree,
    written: usize,
}

fn partition_name(kind: DataKind, generation: u64) -> String {
    if generation == 0 {
        kind.namespace().to_string()
    } else {
        format!("{}.{}", kind.namespace(), generation)
    }
}

fn decode_generation(kind: DataKind, raw: Option<IVec>) -> Result<u64> {
    match raw {
        None => Ok(0),
        Some(bytes) => {
            let bytes = <[u8; 8]>::try_from(&bytes[..]).map_err(|_| {
                StoreError::CorruptGeneration {
                    namespace: kind.namespace(),
                }
            })?;
            Ok(u64::from_be_bytes(bytes))
        }
    }
}

impl SledDataStore {
    /// Wrap an open database, creating the pointer and marker trees if this
    /// is the first run against it.
    pub fn new(db: sled::Db) -> Result<Self> {
        let partitions = db.open_tree(PARTITIONS_TREE)?;
        let init = db.open_tree(INIT_PARTITION)?;
        Ok(Self {
            db,
            partitions,
            init,
            init_lock: Mutex::new(()),
            flush_on_write: true,
        })
    }

    /// Whether `init` and winning upserts flush to disk before returning.
    pub fn with_flush_on_write(mut self, flush_on_write: bool) -> Self {
        self.flush_on_write = flush_on_write;
        self
    }

    fn generation(&self, kind: DataKind) -> Result<u64> {
        decode_generation(kind, self.partitions.get(kind.namespace())?)
    }

    fn partition(&self, kind: DataKind, generation: u64) -> Result<Tree> {
        Ok(self.db.open_tree(partition_name(kind, generation))?)
    }

    /// Run `read` against the live tree of `kind`. When `init` switched
    /// generations meanwhile the tree may already be dropped, so the read is
    /// repeated against the new one.
    fn read_live<T>(&self, kind: DataKind, read: impl Fn(&Tree) -> Result<T>) -> Result<T> {
        loop {
            let generation = self.generation(kind)?;
            let result = self.partition(kind, generation).and_then(|tree| read(&tree));
            if self.generation(kind)? == generation {
                return result;
            }
            tracing::debug!(
                namespace = kind.namespace(),
                generation,
                "partition replaced during read, retrying"
            );
        }
    }

    fn flush(&self) -> Result<()> {
        if self.flush_on_write {
            self.db.flush()?;
        }
        Ok(())
    }

    /// Write every record of one kind into a new generation.
    fn fill_partition(
        &self,
        kind: DataKind,
        items: &HashMap<String, StoreItem>,
    ) -> Result<NewPartition> {
        let mut batch = Batch::default();
        for (key, item) in items {
            check_key(key, item)?;
            batch.insert(key.as_str(), kind.encode(item)?);
        }

        // generation 0 is the namespace-named tree
        let generation = self.db.generate_id()? + 1;
        let tree = self.partition(kind, generation)?;
        if let Err(e) = tree.apply_batch(batch) {
            self.db.drop_tree(partition_name(kind, generation))?;
            return Err(e.into());
        }
        Ok(NewPartition {
            kind,
            generation,
            tree,
            written: items.len(),
        })
    }

    /// Drop every tree of `kind` except the live generation, including empty
    /// trees that racing readers recreated by opening a dropped name.
    fn drop_retired(&self, kind: DataKind, live: u64) -> Result<usize> {
        let live_name = partition_name(kind, live);
        let prefix = format!("{}.", kind.namespace());
        let mut dropped = 0;
        for name in self.db.tree_names() {
            let Ok(name) = std::str::from_utf8(&name) else {
                continue;
            };
            let ours = name == kind.namespace()
                || name
                    .strip_prefix(&prefix)
                    .is_some_and(|gen| gen.parse::<u64>().is_ok());
            if ours && name != live_name && self.db.drop_tree(name)? {
                dropped += 1;
            }
        }
        Ok(dropped)
    }
}

fn transaction_error(err: TransactionError<StoreError>) -> StoreError {
    match err {
        TransactionError::Abort(e) => e,
        TransactionError::Storage(e) => StoreError::Store(e),
    }
}

impl PersistentDataStore for SledDataStore {
    fn init(&self, all_data: AllData) -> Result<()> {
        let start = Instant::now();
        let _guard = self.init_lock.lock().unwrap_or_else(PoisonError::into_inner);

        let mut filled: Vec<NewPartition> = Vec::with_capacity(all_data.len());
        for (kind, items) in &all_data {
            match self.fill_partition(*kind, items) {
                Ok(partition) => filled.push(partition),
                Err(e) => {
                    for partition in &filled {
                        self.db
                            .drop_tree(partition_name(partition.kind, partition.generation))?;
                    }
                    return Err(e);
                }
            }
        }

        let trees: &[Tree] = &[self.partitions.clone(), self.init.clone()];
        let switched = trees
            .transaction(|views| -> ConflictableTransactionResult<(), StoreError> {
                for partition in &filled {
                    views[0].insert(
                        partition.kind.namespace(),
                        &partition.generation.to_be_bytes()[..],
                    )?;
                }
                views[1].insert(INIT_KEY, INIT_VALUE)?;
                Ok(())
            })
            .map_err(transaction_error);
        if let Err(e) = switched {
            for partition in &filled {
                self.db
                    .drop_tree(partition_name(partition.kind, partition.generation))?;
            }
            return Err(e);
        }
        self.flush()?;

        for partition in &filled {
            let dropped = self.drop_retired(partition.kind, partition.generation)?;
            tracing::info!(
                namespace = partition.kind.namespace(),
                generation = partition.generation,
                written = partition.written,
                stored = partition.tree.len(),
                dropped,
                "initialized partition"
            );
        }
        tracing::info!(
            kinds = filled.len(),
            elapsed_us = start.elapsed().as_micros() as u64,
            "init finished"
        );
        Ok(())
    }

    fn get(&self, kind: DataKind, key: &str) -> Result<Option<StoreItem>> {
        let start = Instant::now();
        let item = self.read_live(kind, |tree| match tree.get(key)? {
            Some(bytes) => Ok(Some(kind.decode(key, &bytes)?)),
            None => Ok(None),
        })?;
        tracing::debug!(
            namespace = kind.namespace(),
            key,
            found = item.is_some(),
            elapsed_us = start.elapsed().as_micros() as u64,
            "get"
        );
        Ok(item)
    }

    fn get_all(&self, kind: DataKind) -> Result<HashMap<String, StoreItem>> {
        self.read_live(kind, |tree| {
            let mut items = HashMap::with_capacity(tree.len());
            for entry in tree.iter() {
                let (raw_key, value) = entry?;
                let key = std::str::from_utf8(&raw_key).map_err(|_| StoreError::CorruptKey {
                    namespace: kind.namespace(),
                })?;
                let item = kind.decode(key, &value)?;
                items.insert(key.to_string(), item);
            }
            Ok(items)
        })
    }

    fn upsert(&self, kind: DataKind, item: StoreItem) -> Result<StoreItem> {
        let encoded = kind.encode(&item)?;
        let key = item.key();

        // Read the pointer, compare and write in one transaction; sled
        // retries the closure if a concurrent writer touched either key.
        let outcome = loop {
            let generation = self.generation(kind)?;
            let trees: &[Tree] = &[self.partitions.clone(), self.partition(kind, generation)?];
            let outcome = trees
                .transaction(|views| -> ConflictableTransactionResult<UpsertOutcome, StoreError> {
                    let live = decode_generation(kind, views[0].get(kind.namespace())?)
                        .map_err(ConflictableTransactionError::Abort)?;
                    if live != generation {
                        return Ok(UpsertOutcome::Moved);
                    }
                    if let Some(bytes) = views[1].get(key)? {
                        let current = kind
                            .decode(key, &bytes)
                            .map_err(ConflictableTransactionError::Abort)?;
                        if current.version() >= item.version() {
                            return Ok(UpsertOutcome::Stale(current));
                        }
                    }
                    views[1].insert(key, encoded.as_slice())?;
                    Ok(UpsertOutcome::Applied)
                })
                .map_err(transaction_error)?;
            match outcome {
                UpsertOutcome::Moved => continue,
                decided => break decided,
            }
        };

        match outcome {
            UpsertOutcome::Moved => unreachable!("moved outcomes are retried"),
            UpsertOutcome::Stale(current) => {
                tracing::debug!(
                    namespace = kind.namespace(),
                    key,
                    incoming = item.version(),
                    stored = current.version(),
                    "upsert rejected as stale"
                );
                Ok(current)
            }
            UpsertOutcome::Applied => {
                self.flush()?;
                tracing::debug!(
                    namespace = kind.namespace(),
                    key,
                    version = item.version(),
                    deleted = item.is_deleted(),
                    "upsert applied"
                );
                Ok(item)
            }
        }
    }

    fn is_initialized(&self) -> Result<bool> {
        Ok(self.init.contains_key(INIT_KEY)?)
    }

    /// Always disabled: every read goes straight to sled.
    fn cache_ttl(&self) -> CacheTtl {
        CacheTtl::Disabled
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partition_name() {
        assert_eq!(partition_name(DataKind::Features, 0), "features");
        assert_eq!(partition_name(DataKind::Segments, 12), "segments.12");
    }

    #[test]
    fn test_decode_generation() {
        assert_eq!(decode_generation(DataKind::Features, None).unwrap(), 0);
        let raw = IVec::from(&7u64.to_be_bytes()[..]);
        assert_eq!(decode_generation(DataKind::Features, Some(raw)).unwrap(), 7);

        let err = decode_generation(DataKind::Segments, Some(IVec::from("x"))).unwrap_err();
        assert!(matches!(
            err,
            StoreError::CorruptGeneration { namespace: "segments" }
        ));
    }
}
