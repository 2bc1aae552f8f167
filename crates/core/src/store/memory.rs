use super::{patient_name_matches, PatientDirectory, ResultStore};
use crate::error::{StoreError, StoreResult};
use crate::model::{
    sort_most_recent_first, Assignment, AssignmentState, Page, RecordKey, ResultBody,
    StoredResult,
};
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use uuid::Uuid;

#[derive(Default)]
struct Inner {
    records: HashMap<Uuid, StoredResult>,
    keys: HashMap<RecordKey, Uuid>,
    patients: HashSet<String>,
}

/// Process-local store. Contents are lost when the process exits.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> StoreResult<RwLockReadGuard<'_, Inner>> {
        self.inner
            .read()
            .map_err(|_| StoreError::Unavailable("memory store lock poisoned".into()))
    }

    fn write(&self) -> StoreResult<RwLockWriteGuard<'_, Inner>> {
        self.inner
            .write()
            .map_err(|_| StoreError::Unavailable("memory store lock poisoned".into()))
    }

    fn collect_page(
        &self,
        page: Page,
        keep: impl Fn(&StoredResult) -> bool,
    ) -> StoreResult<Vec<StoredResult>> {
        let inner = self.read()?;
        let mut matching: Vec<StoredResult> =
            inner.records.values().filter(|r| keep(r)).cloned().collect();
        sort_most_recent_first(&mut matching);
        Ok(page.apply(matching))
    }
}

impl ResultStore for MemoryStore {
    fn find_by_key(&self, key: &RecordKey) -> StoreResult<Option<StoredResult>> {
        let inner = self.read()?;
        Ok(inner
            .keys
            .get(key)
            .and_then(|id| inner.records.get(id))
            .cloned())
    }

    fn find_by_id(&self, id: Uuid) -> StoreResult<Option<StoredResult>> {
        Ok(self.read()?.records.get(&id).cloned())
    }

    fn insert(&self, record: StoredResult) -> StoreResult<StoredResult> {
        let mut inner = self.write()?;
        if inner.keys.contains_key(&record.key) {
            return Err(StoreError::DuplicateKey(record.key.to_string()));
        }
        inner.keys.insert(record.key.clone(), record.id);
        inner.records.insert(record.id, record.clone());
        Ok(record)
    }

    fn replace_body(
        &self,
        id: Uuid,
        body: ResultBody,
        updated_at: DateTime<Utc>,
    ) -> StoreResult<StoredResult> {
        let mut inner = self.write()?;
        let Some(existing) = inner.records.get_mut(&id) else {
            return Err(StoreError::NotFound(id));
        };
        existing.body = body;
        existing.updated_at = updated_at;
        Ok(existing.clone())
    }

    fn replace_assignment(
        &self,
        id: Uuid,
        expected: AssignmentState,
        assignment: Assignment,
        updated_at: DateTime<Utc>,
    ) -> StoreResult<StoredResult> {
        let mut inner = self.write()?;
        let Some(existing) = inner.records.get_mut(&id) else {
            return Err(StoreError::NotFound(id));
        };
        if existing.assignment.state != expected {
            return Err(StoreError::StateChanged {
                id,
                expected,
                found: existing.assignment.state,
            });
        }
        existing.assignment = assignment;
        existing.updated_at = updated_at;
        Ok(existing.clone())
    }

    fn list_by_state(&self, state: AssignmentState, page: Page) -> StoreResult<Vec<StoredResult>> {
        self.collect_page(page, |r| r.assignment.state == state)
    }

    fn search_by_patient_name(&self, needle: &str, page: Page) -> StoreResult<Vec<StoredResult>> {
        let needle = needle.trim().to_lowercase();
        self.collect_page(page, |r| patient_name_matches(r, &needle))
    }
}

impl PatientDirectory for MemoryStore {
    fn patient_exists(&self, patient_id: &str) -> StoreResult<bool> {
        Ok(self.read()?.patients.contains(patient_id))
    }

    fn register_patient(&self, patient_id: &str) -> StoreResult<()> {
        self.write()?.patients.insert(patient_id.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Sample;
    use chrono::Duration;

    fn record(sample_number: &str, patient: Option<&str>) -> StoredResult {
        let mut sample = Sample {
            sample_number: sample_number.into(),
            test_date: Utc::now(),
            instrument_id: "DEV".into(),
            parameters: Vec::new(),
            demographics: Default::default(),
            raw_source_line: String::new(),
        };
        sample.demographics.name = patient.map(str::to_string);
        StoredResult::new(ResultBody::Sample(sample), Utc::now())
    }

    #[test]
    fn test_insert_rejects_duplicate_key() {
        let store = MemoryStore::new();
        store.insert(record("S-1", None)).expect("first insert");
        let err = store
            .insert(record("S-1", None))
            .expect_err("second insert should fail");
        assert!(matches!(err, StoreError::DuplicateKey(_)));
    }

    #[test]
    fn test_replace_assignment_checks_expected_state() {
        let store = MemoryStore::new();
        let err = store
            .replace_assignment(
                Uuid::new_v4(),
                AssignmentState::Unassigned,
                Assignment::default(),
                Utc::now(),
            )
            .expect_err("unknown record");
        assert!(matches!(err, StoreError::NotFound(_)));

        let original = store.insert(record("S-1", None)).expect("insert");
        let assigned = Assignment {
            state: AssignmentState::Assigned,
            patient_id: Some("P-1".into()),
            ..Default::default()
        };
        store
            .replace_assignment(
                original.id,
                AssignmentState::Unassigned,
                assigned.clone(),
                Utc::now(),
            )
            .expect("first assignment");

        let err = store
            .replace_assignment(original.id, AssignmentState::Unassigned, assigned, Utc::now())
            .expect_err("state already moved");
        assert!(matches!(
            err,
            StoreError::StateChanged {
                found: AssignmentState::Assigned,
                ..
            }
        ));
    }

    #[test]
    fn test_list_by_state_is_most_recent_first() {
        let store = MemoryStore::new();
        let base = Utc::now();
        for (i, number) in ["S-1", "S-2", "S-3"].into_iter().enumerate() {
            let mut r = record(number, None);
            r.updated_at = base + Duration::seconds(i as i64);
            store.insert(r).expect("insert");
        }

        let listed = store
            .list_by_state(AssignmentState::Unassigned, Page::new(2, 0))
            .expect("list");
        let keys: Vec<_> = listed.iter().map(|r| r.key.value.as_str()).collect();
        assert_eq!(keys, vec!["S-3", "S-2"]);

        let assigned = store
            .list_by_state(AssignmentState::Assigned, Page::default())
            .expect("list");
        assert!(assigned.is_empty());
    }

    #[test]
    fn test_search_by_patient_name_ignores_case() {
        let store = MemoryStore::new();
        store
            .insert(record("S-1", Some("Mai Tran")))
            .expect("insert");
        store
            .insert(record("S-2", Some("Binh Le")))
            .expect("insert");
        store.insert(record("S-3", None)).expect("insert");

        let found = store
            .search_by_patient_name("TRAN", Page::default())
            .expect("search");
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].key.value, "S-1");
    }

    #[test]
    fn test_replace_body_keeps_assignment_and_creation_time() {
        let store = MemoryStore::new();
        let original = store.insert(record("S-1", None)).expect("insert");

        store
            .replace_assignment(
                original.id,
                AssignmentState::Unassigned,
                Assignment {
                    state: AssignmentState::Assigned,
                    patient_id: Some("P-1".into()),
                    ..Default::default()
                },
                original.updated_at,
            )
            .expect("assign");

        let later = original.updated_at + Duration::minutes(1);
        let replaced = store
            .replace_body(original.id, record("S-1", Some("Mai Tran")).body, later)
            .expect("replace body");
        assert_eq!(replaced.assignment.state, AssignmentState::Assigned);
        assert_eq!(replaced.assignment.patient_id.as_deref(), Some("P-1"));
        assert_eq!(replaced.created_at, original.created_at);
        assert_eq!(replaced.updated_at, later);
        assert_eq!(replaced.body.patient_name(), Some("Mai Tran"));

        let err = store
            .replace_body(Uuid::new_v4(), original.body, later)
            .expect_err("unknown record");
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[test]
    fn test_registered_patients_exist() {
        let store = MemoryStore::new();
        assert!(!store.patient_exists("P-1").expect("lookup"));
        store.register_patient("P-1").expect("register");
        assert!(store.patient_exists("P-1").expect("lookup"));
    }
}
