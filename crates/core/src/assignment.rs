//! Patient-assignment lifecycle.
//!
//! Results arrive from instruments without a reliable link to a system patient. This service
//! moves a stored result forward through
//!
//! ```text
//! Unassigned --assign--> Assigned --verify--> Verified
//! ```
//!
//! Only the transitions in [`TRANSITIONS`] exist. There is no way back to `Unassigned`, and an
//! already assigned result cannot be assigned again. Each transition stamps its timestamp and
//! actor in the same store write that changes the state, and that write fails if another caller
//! moved the result first.

use crate::error::{AssignmentError, AssignmentResult, StoreError};
use crate::model::{Assignment, AssignmentState, Page, StoredResult};
use crate::store::{PatientDirectory, ResultStore};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use uuid::Uuid;

/// Every permitted `(from, to)` state change.
pub const TRANSITIONS: &[(AssignmentState, AssignmentState)] = &[
    (AssignmentState::Unassigned, AssignmentState::Assigned),
    (AssignmentState::Assigned, AssignmentState::Verified),
];

impl AssignmentState {
    pub fn can_transition_to(self, next: AssignmentState) -> bool {
        TRANSITIONS.contains(&(self, next))
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

#[derive(Clone)]
pub struct AssignmentService {
    results: Arc<dyn ResultStore>,
    patients: Arc<dyn PatientDirectory>,
}

impl AssignmentService {
    pub fn new(results: Arc<dyn ResultStore>, patients: Arc<dyn PatientDirectory>) -> Self {
        Self { results, patients }
    }

    /// Unassigned results, most recently changed first.
    pub fn list_unassigned(&self, page: Page) -> AssignmentResult<Vec<StoredResult>> {
        self.list_by_state(AssignmentState::Unassigned, page)
    }

    pub fn list_by_state(
        &self,
        state: AssignmentState,
        page: Page,
    ) -> AssignmentResult<Vec<StoredResult>> {
        Ok(self.results.list_by_state(state, page)?)
    }

    /// Results whose instrument-reported patient name contains `needle`, ignoring case.
    pub fn search_by_patient_name(
        &self,
        needle: &str,
        page: Page,
    ) -> AssignmentResult<Vec<StoredResult>> {
        if needle.trim().is_empty() {
            return Err(AssignmentError::InvalidInput(
                "search text cannot be empty".into(),
            ));
        }
        Ok(self.results.search_by_patient_name(needle, page)?)
    }

    /// Link a result to a patient.
    ///
    /// # Errors
    ///
    /// - [`AssignmentError::ResultNotFound`] / [`AssignmentError::PatientNotFound`] if either
    ///   side does not exist.
    /// - [`AssignmentError::InvalidTransition`] if the result is not unassigned.
    ///
    /// Nothing is written when an error is returned.
    pub fn assign(
        &self,
        result_id: Uuid,
        patient_id: &str,
        assigned_by: Option<String>,
        notes: Option<String>,
    ) -> AssignmentResult<StoredResult> {
        self.assign_at(result_id, patient_id, assigned_by, notes, Utc::now())
    }

    pub fn assign_at(
        &self,
        result_id: Uuid,
        patient_id: &str,
        assigned_by: Option<String>,
        notes: Option<String>,
        now: DateTime<Utc>,
    ) -> AssignmentResult<StoredResult> {
        let record = self
            .results
            .find_by_id(result_id)?
            .ok_or(AssignmentError::ResultNotFound(result_id))?;

        let patient_id = patient_id.trim();
        if patient_id.is_empty() || !self.patients.patient_exists(patient_id)? {
            return Err(AssignmentError::PatientNotFound(patient_id.to_string()));
        }

        let current = record.assignment.state;
        let next = AssignmentState::Assigned;
        if !current.can_transition_to(next) {
            return Err(AssignmentError::InvalidTransition {
                from: current,
                to: next,
            });
        }

        let assignment = Assignment {
            state: next,
            patient_id: Some(patient_id.to_string()),
            assigned_at: Some(now),
            assigned_by: non_blank(assigned_by),
            notes: non_blank(notes),
            ..record.assignment
        };

        let saved = self.write_assignment(result_id, current, next, assignment, now)?;
        tracing::info!("assigned result {} to patient {}", saved.id, patient_id);
        Ok(saved)
    }

    /// Mark an assigned result as verified.
    ///
    /// # Errors
    ///
    /// - [`AssignmentError::ResultNotFound`] if the result does not exist.
    /// - [`AssignmentError::InvalidTransition`] unless the result is assigned.
    pub fn verify(
        &self,
        result_id: Uuid,
        verified_by: Option<String>,
    ) -> AssignmentResult<StoredResult> {
        self.verify_at(result_id, verified_by, Utc::now())
    }

    pub fn verify_at(
        &self,
        result_id: Uuid,
        verified_by: Option<String>,
        now: DateTime<Utc>,
    ) -> AssignmentResult<StoredResult> {
        let record = self
            .results
            .find_by_id(result_id)?
            .ok_or(AssignmentError::ResultNotFound(result_id))?;

        let current = record.assignment.state;
        let next = AssignmentState::Verified;
        if !current.can_transition_to(next) {
            return Err(AssignmentError::InvalidTransition {
                from: current,
                to: next,
            });
        }

        let assignment = Assignment {
            state: next,
            verified_at: Some(now),
            verified_by: non_blank(verified_by),
            ..record.assignment
        };

        let saved = self.write_assignment(result_id, current, next, assignment, now)?;
        tracing::info!("verified result {}", saved.id);
        Ok(saved)
    }

    /// Store `assignment` only if the result is still in `current`.
    fn write_assignment(
        &self,
        result_id: Uuid,
        current: AssignmentState,
        next: AssignmentState,
        assignment: Assignment,
        now: DateTime<Utc>,
    ) -> AssignmentResult<StoredResult> {
        match self
            .results
            .replace_assignment(result_id, current, assignment, now)
        {
            Ok(saved) => Ok(saved),
            Err(StoreError::StateChanged { found, .. }) => {
                Err(AssignmentError::InvalidTransition { from: found, to: next })
            }
            Err(StoreError::NotFound(_)) => Err(AssignmentError::ResultNotFound(result_id)),
            Err(e) => Err(e.into()),
        }
    }
}
