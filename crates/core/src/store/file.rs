//! File-backed store.
//!
//! Layout under the data directory:
//!
//! ```text
//! results/<id[0..2]>/<id[2..4]>/<id>.json     one JSON document per record
//! keys/<kind>/<h[0..2]>/<h>                   record id for key value with SHA-256 hex h
//! patients/<patient_id>                       presence marks a known patient
//! ```
//!
//! A record is written before its key is claimed. Key files are written to a temporary file
//! and hard-linked into place, so a key file is either absent or complete, and two writers
//! racing on the same key cannot both insert. A key file whose record is gone is stale and is
//! removed on lookup; a record whose key file does not name it is an orphan and is not listed.
//! Records are written to a temporary file and renamed into place, and read-modify-write
//! updates within one process are serialised.

use super::{patient_name_matches, PatientDirectory, ResultStore};
use crate::constants::{KEYS_DIR_NAME, PATIENTS_DIR_NAME, RESULTS_DIR_NAME};
use crate::error::{StoreError, StoreResult};
use crate::model::{
    sort_most_recent_first, Assignment, AssignmentState, Page, RecordKey, ResultBody,
    StoredResult,
};
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

pub struct FileStore {
    root: PathBuf,
    write_lock: Mutex<()>,
}

fn io_error(path: &Path) -> impl FnOnce(io::Error) -> StoreError + '_ {
    move |source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    }
}

impl FileStore {
    /// Open (creating if needed) a store rooted at `root`.
    pub fn open(root: impl Into<PathBuf>) -> StoreResult<Self> {
        let root = root.into();
        for dir in [RESULTS_DIR_NAME, KEYS_DIR_NAME, PATIENTS_DIR_NAME] {
            let path = root.join(dir);
            fs::create_dir_all(&path).map_err(io_error(&path))?;
        }
        Ok(Self {
            root,
            write_lock: Mutex::new(()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn lock_writes(&self) -> StoreResult<MutexGuard<'_, ()>> {
        self.write_lock
            .lock()
            .map_err(|_| StoreError::Unavailable("file store write lock poisoned".into()))
    }

    fn record_path(&self, id: Uuid) -> PathBuf {
        let canonical = id.simple().to_string();
        self.root
            .join(RESULTS_DIR_NAME)
            .join(&canonical[0..2])
            .join(&canonical[2..4])
            .join(format!("{canonical}.json"))
    }

    fn key_path(&self, key: &RecordKey) -> PathBuf {
        let hash = hex::encode(Sha256::digest(key.value.as_bytes()));
        self.root
            .join(KEYS_DIR_NAME)
            .join(key.kind.as_str())
            .join(&hash[0..2])
            .join(hash)
    }

    fn patient_path(&self, patient_id: &str) -> StoreResult<PathBuf> {
        let valid = !patient_id.is_empty()
            && !patient_id.starts_with('.')
            && patient_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'));
        if !valid {
            return Err(StoreError::InvalidIdentifier(patient_id.to_string()));
        }
        Ok(self.root.join(PATIENTS_DIR_NAME).join(patient_id))
    }

    fn read_record(&self, path: &Path) -> StoreResult<Option<StoredResult>> {
        let contents = match fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(io_error(path)(e)),
        };
        serde_json::from_str(&contents)
            .map(Some)
            .map_err(StoreError::Deserialization)
    }

    fn write_record(&self, record: &StoredResult) -> StoreResult<()> {
        let path = self.record_path(record.id);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(io_error(parent))?;
        }

        let json = serde_json::to_string_pretty(record).map_err(StoreError::Serialization)?;
        let tmp = path.with_extension(format!("json.{}.tmp", Uuid::new_v4().simple()));
        fs::write(&tmp, json).map_err(io_error(&tmp))?;
        fs::rename(&tmp, &path).map_err(|e| {
            let _ = fs::remove_file(&tmp);
            io_error(&path)(e)
        })
    }

    /// Claim `key` for `id`. Fails with `DuplicateKey` if another record holds it.
    fn claim_key(&self, key: &RecordKey, id: Uuid) -> StoreResult<()> {
        let path = self.key_path(key);
        let Some(parent) = path.parent() else {
            return Err(StoreError::InvalidIdentifier(key.to_string()));
        };
        fs::create_dir_all(parent).map_err(io_error(parent))?;

        let tmp = parent.join(format!("{}.tmp", Uuid::new_v4().simple()));
        fs::write(&tmp, id.simple().to_string()).map_err(io_error(&tmp))?;
        let linked = fs::hard_link(&tmp, &path);
        let _ = fs::remove_file(&tmp);

        match linked {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                Err(StoreError::DuplicateKey(key.to_string()))
            }
            Err(e) => Err(io_error(&path)(e)),
        }
    }

    /// Record id named by the key file, `None` when there is no key file.
    fn read_key(&self, path: &Path) -> StoreResult<Option<String>> {
        match fs::read_to_string(path) {
            Ok(id) => Ok(Some(id.trim().to_string())),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_error(path)(e)),
        }
    }

    fn remove_stale_key(&self, path: &Path, key: &RecordKey) -> StoreResult<()> {
        tracing::warn!("removing stale key file for {}", key);
        match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_error(path)(e)),
        }
    }

    /// True when the key file of `record` names `record` itself.
    fn owns_key(&self, record: &StoredResult) -> bool {
        matches!(
            self.read_key(&self.key_path(&record.key)),
            Ok(Some(id)) if Uuid::parse_str(&id).ok() == Some(record.id)
        )
    }

    /// Every readable record. Unreadable files are logged and skipped.
    fn all_records(&self) -> StoreResult<Vec<StoredResult>> {
        let results_dir = self.root.join(RESULTS_DIR_NAME);
        let mut records = Vec::new();

        let s1_iter = match fs::read_dir(&results_dir) {
            Ok(it) => it,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(records),
            Err(e) => return Err(io_error(&results_dir)(e)),
        };

        for s1 in s1_iter.flatten() {
            let Ok(s2_iter) = fs::read_dir(s1.path()) else {
                continue;
            };
            for s2 in s2_iter.flatten() {
                let Ok(files) = fs::read_dir(s2.path()) else {
                    continue;
                };
                for file in files.flatten() {
                    let path = file.path();
                    if path.extension().and_then(|e| e.to_str()) != Some("json") {
                        continue;
                    }
                    match self.read_record(&path) {
                        Ok(Some(record)) if self.owns_key(&record) => records.push(record),
                        Ok(Some(record)) => {
                            tracing::debug!("skipping orphan record {}", record.id)
                        }
                        Ok(None) => {}
                        Err(e) => {
                            tracing::warn!("skipping unreadable record {}: {}", path.display(), e)
                        }
                    }
                }
            }
        }

        Ok(records)
    }

    fn collect_page(
        &self,
        page: Page,
        keep: impl Fn(&StoredResult) -> bool,
    ) -> StoreResult<Vec<StoredResult>> {
        let mut matching: Vec<StoredResult> =
            self.all_records()?.into_iter().filter(|r| keep(r)).collect();
        sort_most_recent_first(&mut matching);
        Ok(page.apply(matching))
    }
}

impl ResultStore for FileStore {
    fn find_by_key(&self, key: &RecordKey) -> StoreResult<Option<StoredResult>> {
        let path = self.key_path(key);
        let Some(id) = self.read_key(&path)? else {
            return Ok(None);
        };

        let record = match Uuid::parse_str(&id) {
            Ok(id) => self.find_by_id(id)?,
            Err(_) => None,
        };
        if record.is_none() {
            self.remove_stale_key(&path, key)?;
        }
        Ok(record)
    }

    fn find_by_id(&self, id: Uuid) -> StoreResult<Option<StoredResult>> {
        self.read_record(&self.record_path(id))
    }

    fn insert(&self, record: StoredResult) -> StoreResult<StoredResult> {
        self.write_record(&record)?;
        if let Err(e) = self.claim_key(&record.key, record.id) {
            let _ = fs::remove_file(self.record_path(record.id));
            return Err(e);
        }
        Ok(record)
    }

    fn replace_body(
        &self,
        id: Uuid,
        body: ResultBody,
        updated_at: DateTime<Utc>,
    ) -> StoreResult<StoredResult> {
        let _guard = self.lock_writes()?;
        let mut record = self.find_by_id(id)?.ok_or(StoreError::NotFound(id))?;
        record.body = body;
        record.updated_at = updated_at;
        self.write_record(&record)?;
        Ok(record)
    }

    fn replace_assignment(
        &self,
        id: Uuid,
        expected: AssignmentState,
        assignment: Assignment,
        updated_at: DateTime<Utc>,
    ) -> StoreResult<StoredResult> {
        let _guard = self.lock_writes()?;
        let mut record = self.find_by_id(id)?.ok_or(StoreError::NotFound(id))?;
        if record.assignment.state != expected {
            return Err(StoreError::StateChanged {
                id,
                expected,
                found: record.assignment.state,
            });
        }
        record.assignment = assignment;
        record.updated_at = updated_at;
        self.write_record(&record)?;
        Ok(record)
    }

    fn list_by_state(&self, state: AssignmentState, page: Page) -> StoreResult<Vec<StoredResult>> {
        self.collect_page(page, |r| r.assignment.state == state)
    }

    fn search_by_patient_name(&self, needle: &str, page: Page) -> StoreResult<Vec<StoredResult>> {
        let needle = needle.trim().to_lowercase();
        self.collect_page(page, |r| patient_name_matches(r, &needle))
    }
}

impl PatientDirectory for FileStore {
    fn patient_exists(&self, patient_id: &str) -> StoreResult<bool> {
        match self.patient_path(patient_id) {
            Ok(path) => Ok(path.exists()),
            Err(StoreError::InvalidIdentifier(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn register_patient(&self, patient_id: &str) -> StoreResult<()> {
        let path = self.patient_path(patient_id)?;
        fs::write(&path, b"").map_err(io_error(&path))
    }
}
