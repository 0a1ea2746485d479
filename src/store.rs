//! Alarm persistence
//!
//! Every transition hands the resulting [`AlarmRecord`] to an [`AlarmStore`].
//! [`JsonFileStore`] keeps all records in one versioned JSON document.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::alarm::AlarmRecord;
use crate::error::StoreError;
use crate::AlarmId;

/// Version of the store file format
const STORE_VERSION: u32 = 1;

/// Persistence for alarm records
pub trait AlarmStore: Send + Sync {
    fn load_all(&self) -> Result<Vec<AlarmRecord>, StoreError>;

    fn save(&self, record: &AlarmRecord) -> Result<(), StoreError>;

    fn delete(&self, id: AlarmId) -> Result<(), StoreError>;
}

/// Volatile store, used when nothing should outlive the process
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: Mutex<BTreeMap<AlarmId, AlarmRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: AlarmId) -> Option<AlarmRecord> {
        self.records().get(&id).cloned()
    }

    fn records(&self) -> MutexGuard<'_, BTreeMap<AlarmId, AlarmRecord>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl AlarmStore for MemoryStore {
    fn load_all(&self) -> Result<Vec<AlarmRecord>, StoreError> {
        Ok(self.records().values().cloned().collect())
    }

    fn save(&self, record: &AlarmRecord) -> Result<(), StoreError> {
        self.records().insert(record.id, record.clone());
        Ok(())
    }

    fn delete(&self, id: AlarmId) -> Result<(), StoreError> {
        self.records().remove(&id);
        Ok(())
    }
}

/// On-disk document
#[derive(Debug, Serialize, Deserialize)]
struct StoreDocument {
    version: u32,
    alarms: Vec<AlarmRecord>,
}

/// JSON file store.
///
/// The whole document is rewritten on every change through a temporary file
/// and a rename, so a crash leaves either the old or the new document.
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    records: Mutex<BTreeMap<AlarmId, AlarmRecord>>,
}

impl JsonFileStore {
    /// Open the store at `path`. A missing file is an empty store.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let records = if path.exists() {
            Self::read(&path)?
        } else {
            tracing::info!("No alarm store at {:?}, starting empty", path);
            BTreeMap::new()
        };

        Ok(Self {
            path,
            records: Mutex::new(records),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read(path: &Path) -> Result<BTreeMap<AlarmId, AlarmRecord>, StoreError> {
        let json = std::fs::read_to_string(path).map_err(|source| StoreError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let document: StoreDocument = serde_json::from_str(&json)?;

        if document.version != STORE_VERSION {
            return Err(StoreError::VersionMismatch {
                expected: STORE_VERSION,
                actual: document.version,
            });
        }

        tracing::info!("Loaded {} alarms from {:?}", document.alarms.len(), path);
        Ok(document
            .alarms
            .into_iter()
            .map(|record| (record.id, record))
            .collect())
    }

    fn write(&self, records: &BTreeMap<AlarmId, AlarmRecord>) -> Result<(), StoreError> {
        let io_err = |source| StoreError::Io {
            path: self.path.clone(),
            source,
        };

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }

        let document = StoreDocument {
            version: STORE_VERSION,
            alarms: records.values().cloned().collect(),
        };
        let json = serde_json::to_string_pretty(&document)?;

        let temp_path = self.path.with_extension("tmp");
        std::fs::write(&temp_path, json).map_err(io_err)?;
        std::fs::rename(&temp_path, &self.path).map_err(io_err)?;

        tracing::trace!("Alarm store written to {:?}", self.path);
        Ok(())
    }

    fn records(&self) -> MutexGuard<'_, BTreeMap<AlarmId, AlarmRecord>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl AlarmStore for JsonFileStore {
    fn load_all(&self) -> Result<Vec<AlarmRecord>, StoreError> {
        Ok(self.records().values().cloned().collect())
    }

    fn save(&self, record: &AlarmRecord) -> Result<(), StoreError> {
        let mut records = self.records();
        records.insert(record.id, record.clone());
        self.write(&records)
    }

    fn delete(&self, id: AlarmId) -> Result<(), StoreError> {
        let mut records = self.records();
        if records.remove(&id).is_some() {
            self.write(&records)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alarm::{AlarmConfig, AlarmState, DaysOfWeek};
    use pretty_assertions::assert_eq;
    use tempfile::tempdir;

    fn record(id: AlarmId) -> AlarmRecord {
        let mut record = AlarmRecord::new(id, AlarmConfig::new(6, 30, DaysOfWeek::WEEKDAYS));
        record.state = AlarmState::Scheduled;
        record.next_occurrence = chrono::NaiveDate::from_ymd_opt(2024, 3, 4)
            .unwrap()
            .and_hms_opt(6, 30, 0);
        record
    }

    #[test]
    fn test_memory_store() {
        let store = MemoryStore::new();
        store.save(&record(1)).unwrap();
        store.save(&record(2)).unwrap();
        store.delete(1).unwrap();

        let all = store.load_all().unwrap();
        assert_eq!(all, vec![record(2)]);
        assert_eq!(store.get(1), None);
    }

    #[test]
    fn test_json_store_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data").join("alarms.json");

        let store = JsonFileStore::open(&path).unwrap();
        assert!(store.load_all().unwrap().is_empty());
        store.save(&record(1)).unwrap();
        store.save(&record(4)).unwrap();
        store.delete(1).unwrap();
        assert!(!path.with_extension("tmp").exists());

        let reopened = JsonFileStore::open(&path).unwrap();
        assert_eq!(reopened.load_all().unwrap(), vec![record(4)]);
    }

    #[test]
    fn test_json_store_rejects_other_version() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("alarms.json");
        std::fs::write(&path, r#"{"version": 99, "alarms": []}"#).unwrap();

        assert!(matches!(
            JsonFileStore::open(&path),
            Err(StoreError::VersionMismatch {
                expected: 1,
                actual: 99
            })
        ));
    }

    #[test]
    fn test_json_store_rejects_corrupt_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("alarms.json");
        std::fs::write(&path, "{ not json").unwrap();

        assert!(matches!(JsonFileStore::open(&path), Err(StoreError::Serde(_))));
    }
}
