//! Engine-side table mapping data ids to their owning backend and layout.

use std::collections::HashMap;

use crate::dtype::DType;
use crate::error::{Error, Result};
use crate::shape::Shape;
use crate::tensor::DataId;

/// Metadata for one piece of backend-resident storage.
#[derive(Debug, Clone, PartialEq)]
pub struct DataInfo {
    /// Name of the backend currently owning the bytes.
    pub backend: String,
    pub dtype: DType,
    pub shape: Shape,
    /// Byte-size estimate (encoded bytes for strings).
    pub bytes: usize,
}

/// A data id has at most one owning backend at a time; the owner is updated in
/// place when the data moves.
#[derive(Debug, Default)]
pub struct DataStore {
    entries: HashMap<DataId, DataInfo>,
    num_data_buffers: usize,
}

impl DataStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Metadata for `data_id`. A missing entry means a disposed or
    /// never-created handle.
    pub fn get(&self, data_id: DataId) -> Result<&DataInfo> {
        self.entries.get(&data_id).ok_or(Error::DataNotFound(data_id))
    }

    pub fn get_mut(&mut self, data_id: DataId) -> Result<&mut DataInfo> {
        self.entries
            .get_mut(&data_id)
            .ok_or(Error::DataNotFound(data_id))
    }

    pub fn has(&self, data_id: DataId) -> bool {
        self.entries.contains_key(&data_id)
    }

    /// Register or update a mapping. Returns true when the id was new.
    pub fn set(&mut self, data_id: DataId, info: DataInfo) -> bool {
        let is_new = self.entries.insert(data_id, info).is_none();
        if is_new {
            self.num_data_buffers += 1;
        }
        is_new
    }

    /// Remove a mapping. Only call once the owning backend has freed the bytes.
    pub fn delete(&mut self, data_id: DataId) -> Option<DataInfo> {
        let removed = self.entries.remove(&data_id);
        if removed.is_some() {
            self.num_data_buffers -= 1;
        }
        removed
    }

    /// Point `data_id` at a new owner.
    pub fn set_owner(&mut self, data_id: DataId, backend: &str) -> Result<()> {
        self.get_mut(data_id)?.backend = backend.to_string();
        Ok(())
    }

    /// Drop every entry owned by `backend`. Returns the number of entries and
    /// the bytes they accounted for.
    pub fn purge_backend(&mut self, backend: &str) -> (usize, usize) {
        let mut removed = 0;
        let mut bytes = 0;
        self.entries.retain(|_, info| {
            if info.backend != backend {
                return true;
            }
            removed += 1;
            bytes += info.bytes;
            false
        });
        self.num_data_buffers -= removed;
        (removed, bytes)
    }

    pub fn num_data_buffers(&self) -> usize {
        self.num_data_buffers
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.num_data_buffers = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(backend: &str) -> DataInfo {
        DataInfo {
            backend: backend.to_string(),
            dtype: DType::Float32,
            shape: Shape::new(vec![2]),
            bytes: 8,
        }
    }

    #[test]
    fn test_set_get_delete() {
        let mut store = DataStore::new();
        let id = DataId::next();
        assert!(store.set(id, info("cpu")));
        assert!(!store.set(id, info("cpu")));
        assert_eq!(store.num_data_buffers(), 1);
        assert_eq!(store.get(id).unwrap().backend, "cpu");

        assert!(store.delete(id).is_some());
        assert_eq!(store.num_data_buffers(), 0);
        assert!(matches!(store.get(id), Err(Error::DataNotFound(d)) if d == id));
    }

    #[test]
    fn test_owner_update_and_purge() {
        let mut store = DataStore::new();
        let a = DataId::next();
        let b = DataId::next();
        store.set(a, info("cpu"));
        store.set(b, info("cpu"));
        store.set_owner(a, "gpu").unwrap();
        assert_eq!(store.get(a).unwrap().backend, "gpu");

        assert_eq!(store.purge_backend("cpu"), (1, 8));
        assert!(store.has(a));
        assert!(!store.has(b));
        assert_eq!(store.num_data_buffers(), 1);
    }
}
