use std::path::Path;
use std::sync::Arc;

use rocksdb::{
    BoundColumnFamily, ColumnFamilyDescriptor, DBWithThreadMode, Direction, IteratorMode,
    MultiThreaded, Options,
};

use crate::errors::{PosError, PosResult};

const CF_INDEXED: &str = "indexed";
const CF_EPOCH: &str = "epoch";

/// Durable per-epoch store with the narrow indexed put/get contract.
///
/// Indexed entries are keyed `(epoch, index, tag)`, plain entries
/// `(epoch, tag)`. Keys are big-endian so iteration order equals numeric
/// order, which the committee read path relies on.
pub struct PosStore {
    db: Arc<DBWithThreadMode<MultiThreaded>>,
}

impl PosStore {
    pub fn open(path: &Path) -> PosResult<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);
        let cf_descriptors = vec![
            ColumnFamilyDescriptor::new(CF_INDEXED, Options::default()),
            ColumnFamilyDescriptor::new(CF_EPOCH, Options::default()),
        ];
        let db = DBWithThreadMode::open_cf_descriptors(&opts, path, cf_descriptors)?;
        Ok(Self { db: Arc::new(db) })
    }

    fn indexed_cf(&self) -> PosResult<Arc<BoundColumnFamily<'_>>> {
        self.db
            .cf_handle(CF_INDEXED)
            .ok_or_else(|| PosError::Config("missing indexed column family".into()))
    }

    fn epoch_cf(&self) -> PosResult<Arc<BoundColumnFamily<'_>>> {
        self.db
            .cf_handle(CF_EPOCH)
            .ok_or_else(|| PosError::Config("missing epoch column family".into()))
    }

    fn indexed_key(epoch: u64, index: u64, tag: &str) -> Vec<u8> {
        let mut key = Vec::with_capacity(16 + tag.len());
        key.extend_from_slice(&epoch.to_be_bytes());
        key.extend_from_slice(&index.to_be_bytes());
        key.extend_from_slice(tag.as_bytes());
        key
    }

    fn epoch_key(epoch: u64, tag: &str) -> Vec<u8> {
        let mut key = Vec::with_capacity(8 + tag.len());
        key.extend_from_slice(&epoch.to_be_bytes());
        key.extend_from_slice(tag.as_bytes());
        key
    }

    pub fn put_with_index(&self, epoch: u64, index: u64, tag: &str, value: &[u8]) -> PosResult<()> {
        let cf = self.indexed_cf()?;
        self.db
            .put_cf(&cf, Self::indexed_key(epoch, index, tag), value)?;
        Ok(())
    }

    pub fn get_with_index(&self, epoch: u64, index: u64, tag: &str) -> PosResult<Option<Vec<u8>>> {
        let cf = self.indexed_cf()?;
        Ok(self.db.get_cf(&cf, Self::indexed_key(epoch, index, tag))?)
    }

    pub fn put(&self, epoch: u64, tag: &str, value: &[u8]) -> PosResult<()> {
        let cf = self.epoch_cf()?;
        self.db.put_cf(&cf, Self::epoch_key(epoch, tag), value)?;
        Ok(())
    }

    pub fn get(&self, epoch: u64, tag: &str) -> PosResult<Option<Vec<u8>>> {
        let cf = self.epoch_cf()?;
        Ok(self.db.get_cf(&cf, Self::epoch_key(epoch, tag))?)
    }

    /// All indexed values of an epoch in `(index, tag)` order.
    pub fn get_storage_byte_array(&self, epoch: u64) -> PosResult<Vec<Vec<u8>>> {
        let cf = self.indexed_cf()?;
        let prefix = epoch.to_be_bytes();
        let mut iterator = self
            .db
            .iterator_cf(&cf, IteratorMode::From(&prefix, Direction::Forward));
        let mut values = Vec::new();
        while let Some(entry) = iterator.next() {
            let (key, value) = entry?;
            if !key.starts_with(&prefix) {
                break;
            }
            values.push(value.to_vec());
        }
        Ok(values)
    }

    /// Indexed values of an epoch restricted to one tag, in index order.
    pub fn get_indexed_by_tag(&self, epoch: u64, tag: &str) -> PosResult<Vec<Vec<u8>>> {
        let cf = self.indexed_cf()?;
        let prefix = epoch.to_be_bytes();
        let mut iterator = self
            .db
            .iterator_cf(&cf, IteratorMode::From(&prefix, Direction::Forward));
        let mut values = Vec::new();
        while let Some(entry) = iterator.next() {
            let (key, value) = entry?;
            if !key.starts_with(&prefix) {
                break;
            }
            if &key[16..] == tag.as_bytes() {
                values.push(value.to_vec());
            }
        }
        Ok(values)
    }
}

impl Clone for PosStore {
    fn clone(&self) -> Self {
        Self {
            db: self.db.clone(),
        }
    }
}
