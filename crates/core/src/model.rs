//! Persisted and in-flight domain records.
//!
//! A [`Sample`] is what the batch analyzer produces per observation request; an
//! [`AnalyzerResult`] is what the single-result analyzer produces per message. Both are stored
//! as a [`StoredResult`] under a [`RecordKey`] that namespaces the two key spaces.

use crate::constants::{DEFAULT_PAGE_LIMIT, MAX_PAGE_LIMIT};
use crate::error::ConfigError;
use chrono::{DateTime, Utc};
use lis_hl7::AnalyzerResult;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// One named measurement within a sample.
///
/// `result` stays text even for numeric analytes so qualifiers such as `"< 5.00"` survive.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Parameter {
    pub name: String,
    pub result: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference_range: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_flag: Option<String>,
}

/// Patient details reported by the instrument. Every field is optional.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatientDemographics {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub age: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sex: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference_group: Option<String>,
}

/// Batch analyzer result: every parameter measured for one sample number.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub sample_number: String,
    pub test_date: DateTime<Utc>,
    pub instrument_id: String,
    pub parameters: Vec<Parameter>,
    #[serde(default)]
    pub demographics: PatientDemographics,
    /// The `OBR` line that opened the sample.
    pub raw_source_line: String,
}

/// Which analyzer class produced a record. Keys of different kinds never collide.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultKind {
    /// Keyed by sample number.
    Sample,
    /// Keyed by barcode.
    Analyzer,
}

impl ResultKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ResultKind::Sample => "sample",
            ResultKind::Analyzer => "analyzer",
        }
    }
}

impl fmt::Display for ResultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Idempotency key of a stored result.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RecordKey {
    pub kind: ResultKind,
    pub value: String,
}

impl RecordKey {
    pub fn new(kind: ResultKind, value: impl Into<String>) -> Self {
        Self {
            kind,
            value: value.into(),
        }
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.value)
    }
}

/// The ingested payload of a stored result.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum ResultBody {
    Sample(Sample),
    Analyzer(AnalyzerResult),
}

impl ResultBody {
    pub fn key(&self) -> RecordKey {
        match self {
            ResultBody::Sample(sample) => {
                RecordKey::new(ResultKind::Sample, sample.sample_number.trim())
            }
            ResultBody::Analyzer(result) => {
                RecordKey::new(ResultKind::Analyzer, result.barcode.trim())
            }
        }
    }

    /// Name of the patient as reported by the instrument, if any.
    pub fn patient_name(&self) -> Option<&str> {
        let name = match self {
            ResultBody::Sample(sample) => sample.demographics.name.as_deref(),
            ResultBody::Analyzer(result) => Some(result.patient_name.as_str()),
        };
        name.filter(|n| !n.trim().is_empty())
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingStatus {
    #[default]
    Processed,
}

/// Where a stored result is in the patient-assignment lifecycle.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssignmentState {
    #[default]
    Unassigned,
    Assigned,
    Verified,
}

impl AssignmentState {
    pub fn as_str(self) -> &'static str {
        match self {
            AssignmentState::Unassigned => "unassigned",
            AssignmentState::Assigned => "assigned",
            AssignmentState::Verified => "verified",
        }
    }
}

impl fmt::Display for AssignmentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AssignmentState {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "unassigned" => Ok(AssignmentState::Unassigned),
            "assigned" => Ok(AssignmentState::Assigned),
            "verified" => Ok(AssignmentState::Verified),
            other => Err(ConfigError::InvalidInput(format!(
                "unknown assignment state '{other}'"
            ))),
        }
    }
}

/// Link between a stored result and a system patient.
///
/// Everything except `state` is unset while the result is unassigned.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Assignment {
    pub state: AssignmentState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patient_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verified_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verified_by: Option<String>,
}

/// A persisted result record.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StoredResult {
    pub id: Uuid,
    pub key: RecordKey,
    pub body: ResultBody,
    #[serde(default)]
    pub status: ProcessingStatus,
    #[serde(default)]
    pub assignment: Assignment,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl StoredResult {
    /// A fresh, unassigned record for `body`.
    pub fn new(body: ResultBody, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            key: body.key(),
            body,
            status: ProcessingStatus::Processed,
            assignment: Assignment::default(),
            created_at: now,
            updated_at: now,
        }
    }
}

/// Pagination window for listing queries.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Page {
    limit: usize,
    offset: usize,
}

impl Page {
    /// Build a page; `limit` is clamped to `1..=MAX_PAGE_LIMIT`.
    pub fn new(limit: usize, offset: usize) -> Self {
        Self {
            limit: limit.clamp(1, MAX_PAGE_LIMIT),
            offset,
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Apply the window to an already ordered sequence.
    pub fn apply<T>(&self, items: impl IntoIterator<Item = T>) -> Vec<T> {
        items
            .into_iter()
            .skip(self.offset)
            .take(self.limit)
            .collect()
    }
}

impl Default for Page {
    fn default() -> Self {
        Self::new(DEFAULT_PAGE_LIMIT, 0)
    }
}

/// Order records most recently changed first, ties broken by id for a stable order.
pub fn sort_most_recent_first(records: &mut [StoredResult]) {
    records.sort_by(|a, b| {
        b.updated_at
            .cmp(&a.updated_at)
            .then_with(|| a.id.cmp(&b.id))
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_namespaced_by_kind() {
        let sample = RecordKey::new(ResultKind::Sample, "123");
        let barcode = RecordKey::new(ResultKind::Analyzer, "123");
        assert_ne!(sample, barcode);
        assert_eq!(sample.to_string(), "sample:123");
    }

    #[test]
    fn page_clamps_limit() {
        assert_eq!(Page::new(0, 0).limit(), 1);
        assert_eq!(Page::new(10_000, 0).limit(), MAX_PAGE_LIMIT);
        assert_eq!(Page::new(2, 1).apply(vec![1, 2, 3, 4]), vec![2, 3]);
        assert_eq!(Page::new(5, 10).apply(vec![1, 2, 3]), Vec::<i32>::new());
    }

    #[test]
    fn assignment_state_round_trips_through_text() {
        for state in [
            AssignmentState::Unassigned,
            AssignmentState::Assigned,
            AssignmentState::Verified,
        ] {
            assert_eq!(state.as_str().parse::<AssignmentState>().ok(), Some(state));
        }
        assert!("pending".parse::<AssignmentState>().is_err());
    }

    #[test]
    fn stored_result_serialises_body_with_kind_tag() {
        let body = ResultBody::Analyzer(AnalyzerResult {
            barcode: "BC-1".into(),
            result: "1.0".into(),
            ..Default::default()
        });
        let record = StoredResult::new(body, Utc::now());
        let json = serde_json::to_value(&record).expect("serialise record");
        assert_eq!(json["body"]["kind"], "analyzer");
        assert_eq!(json["assignment"]["state"], "unassigned");

        let back: StoredResult = serde_json::from_value(json).expect("deserialise record");
        assert_eq!(back, record);
    }
}
