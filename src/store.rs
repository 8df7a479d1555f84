//! Persistent mirror of the object catalog (Sled).
//!
//! Each record is stored as a JSON document keyed by its identifier, so a restarted interpreter
//! can resume from the last known positions without re-importing the source file.

use tracing::debug;

use crate::catalog::{ObjectCatalog, ObjectRecord};
use crate::error::StoreError;

const OBJECTS_TREE: &str = "objects";

pub struct CatalogStore {
    db: sled::Db,
    objects: sled::Tree,
}

impl std::fmt::Debug for CatalogStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CatalogStore")
            .field("objects", &self.objects.len())
            .finish()
    }
}

impl CatalogStore {
    /// Opens (or creates) a store on disk.
    pub fn open(path: impl AsRef<std::path::Path>) -> Result<Self, StoreError> {
        Self::from_db(sled::open(path)?)
    }

    /// Wraps an already open Sled handle.
    pub fn from_db(db: sled::Db) -> Result<Self, StoreError> {
        let objects = db.open_tree(OBJECTS_TREE)?;
        Ok(Self { db, objects })
    }

    /// Replaces the stored documents with the full catalog.
    pub fn save_all(&self, catalog: &ObjectCatalog) -> Result<(), StoreError> {
        self.objects.clear()?;
        for record in catalog.records() {
            self.objects
                .insert(record.id.as_bytes(), serde_json::to_vec(record)?)?;
        }
        self.objects.flush()?;
        debug!(objects = catalog.len(), "catalog persisted");
        Ok(())
    }

    pub fn put(&self, record: &ObjectRecord) -> Result<(), StoreError> {
        self.objects
            .insert(record.id.as_bytes(), serde_json::to_vec(record)?)?;
        self.objects.flush()?;
        Ok(())
    }

    pub fn remove(&self, id: &str) -> Result<(), StoreError> {
        self.objects.remove(id.as_bytes())?;
        self.objects.flush()?;
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Rebuilds a catalog from the stored documents, ordered by identifier.
    pub fn load(&self) -> Result<ObjectCatalog, StoreError> {
        let mut records = Vec::with_capacity(self.objects.len());
        for entry in self.objects.iter() {
            let (_, value) = entry?;
            records.push(serde_json::from_slice::<ObjectRecord>(&value)?);
        }
        ObjectCatalog::from_records(records).map_err(|err| StoreError::Corrupt(err.to_string()))
    }
}

impl Drop for CatalogStore {
    fn drop(&mut self) {
        // Ensure pending writes hit disk.
        let _ = self.db.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spatial::Position;

    fn temporary_store() -> CatalogStore {
        let db = sled::Config::new()
            .temporary(true)
            .open()
            .expect("failed to open temporary sled db");
        CatalogStore::from_db(db).expect("objects tree")
    }

    fn catalog() -> ObjectCatalog {
        ObjectCatalog::from_records(vec![
            ObjectRecord::new("b", Position::new(0.2, 0.1)).with_attribute("color", "red"),
            ObjectRecord::new("a", Position::new(0.1, 0.1)).with_attribute("color", "blue"),
        ])
        .expect("unique ids")
    }

    #[test]
    fn save_and_load_round_trip() {
        let store = temporary_store();
        assert!(store.is_empty());
        store.save_all(&catalog()).expect("save");

        let loaded = store.load().expect("load");
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded.get("a"), catalog().get("a"));
        let order: Vec<_> = loaded.records().map(|r| r.id.clone()).collect();
        assert_eq!(order, vec!["a", "b"]);
    }

    #[test]
    fn put_and_remove_write_through() {
        let store = temporary_store();
        store.save_all(&catalog()).expect("save");

        let moved = ObjectRecord::new("a", Position::new(0.5, 0.5));
        store.put(&moved).expect("put");
        store.remove("b").expect("remove");
        store.remove("missing").expect("absent ids are ignored");

        let loaded = store.load().expect("load");
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded.get("a").map(|r| r.position), Some(Position::new(0.5, 0.5)));
    }
}
