//! Persistence collaborators.
//!
//! The ingestion core owns no storage of its own. It reaches persisted results through
//! [`ResultStore`] and checks patient existence through [`PatientDirectory`]. Two backends are
//! provided: [`MemoryStore`] for tests and throwaway runs, and [`FileStore`] which keeps JSON
//! records on disk.
//!
//! Backends are responsible for their own atomicity. In particular `insert` must fail with
//! [`StoreError::DuplicateKey`](crate::error::StoreError::DuplicateKey) rather than create a
//! second record for a key, and the two partial writes (`replace_body` from ingestion,
//! `replace_assignment` from the lifecycle) must each leave the other half of the record as
//! it is in storage at write time.

mod file;
mod memory;

pub use file::FileStore;
pub use memory::MemoryStore;

use crate::config::{CoreConfig, StoreBackend};
use crate::error::StoreResult;
use crate::model::{Assignment, AssignmentState, Page, RecordKey, ResultBody, StoredResult};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use uuid::Uuid;

/// Stored results, addressable by id and by idempotency key.
pub trait ResultStore: Send + Sync {
    fn find_by_key(&self, key: &RecordKey) -> StoreResult<Option<StoredResult>>;

    fn find_by_id(&self, id: Uuid) -> StoreResult<Option<StoredResult>>;

    /// Persist a new record. Fails if its key is already taken.
    fn insert(&self, record: StoredResult) -> StoreResult<StoredResult>;

    /// Swap the ingested body of an existing record and stamp `updated_at`.
    ///
    /// Assignment and creation time are taken from the stored copy at write time, so a
    /// concurrent assignment is never undone by a re-ingestion.
    fn replace_body(
        &self,
        id: Uuid,
        body: ResultBody,
        updated_at: DateTime<Utc>,
    ) -> StoreResult<StoredResult>;

    /// Replace the assignment of an existing record and stamp `updated_at`, provided the
    /// stored assignment is still in state `expected`.
    ///
    /// Fails with [`StoreError::StateChanged`](crate::error::StoreError::StateChanged) when
    /// another writer moved the record first. The body is taken from the stored copy.
    fn replace_assignment(
        &self,
        id: Uuid,
        expected: AssignmentState,
        assignment: Assignment,
        updated_at: DateTime<Utc>,
    ) -> StoreResult<StoredResult>;

    /// Records in `state`, most recently changed first.
    fn list_by_state(&self, state: AssignmentState, page: Page) -> StoreResult<Vec<StoredResult>>;

    /// Records whose instrument-reported patient name contains `needle`, ignoring case.
    fn search_by_patient_name(&self, needle: &str, page: Page) -> StoreResult<Vec<StoredResult>>;
}

/// Lookup of system patients.
pub trait PatientDirectory: Send + Sync {
    fn patient_exists(&self, patient_id: &str) -> StoreResult<bool>;

    /// Make `patient_id` known to [`patient_exists`](Self::patient_exists).
    fn register_patient(&self, patient_id: &str) -> StoreResult<()>;
}

/// Shared handles to the configured backend.
#[derive(Clone)]
pub struct Stores {
    pub results: Arc<dyn ResultStore>,
    pub patients: Arc<dyn PatientDirectory>,
}

impl Stores {
    pub fn new(results: Arc<dyn ResultStore>, patients: Arc<dyn PatientDirectory>) -> Self {
        Self { results, patients }
    }

    /// Open the backend selected in `cfg`.
    pub fn open(cfg: &CoreConfig) -> StoreResult<Self> {
        match cfg.store_backend() {
            StoreBackend::Memory => {
                let store = Arc::new(MemoryStore::new());
                Ok(Self::new(store.clone(), store))
            }
            StoreBackend::File => {
                let store = Arc::new(FileStore::open(cfg.data_dir())?);
                Ok(Self::new(store.clone(), store))
            }
        }
    }
}

/// True when `record` matches a case-insensitive patient name search.
pub(crate) fn patient_name_matches(record: &StoredResult, needle_lower: &str) -> bool {
    record
        .body
        .patient_name()
        .is_some_and(|name| name.to_lowercase().contains(needle_lower))
}
