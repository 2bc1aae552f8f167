//! Patient demographic extraction.
//!
//! Batch analyzers report demographics in two places: the `PID` segment, and side-channel
//! `OBX` lines (age, reference group) mixed in with the measurements. This module decides which
//! `OBX` lines are side-channel data so they are diverted into [`PatientDemographics`] and never
//! stored as parameters.

use crate::model::PatientDemographics;
use lis_hl7::{parse_age, ObservationResultSegment, PatientIdSegment};

/// Labels (normalised) that carry the patient's reference group.
const REFERENCE_GROUP_LABELS: &[&str] = &["refgroup", "referencegroup", "01002"];

/// Labels (normalised) that carry the patient's age.
const AGE_LABELS: &[&str] = &["age", "305250"];

/// Labels (normalised) of instrument settings reported as observations.
const NON_MEASUREMENT_LABELS: &[&str] = &[
    "mode",
    "takemode",
    "08001",
    "bloodmode",
    "08002",
    "testmode",
    "08003",
    "remark",
    "01001",
];

/// Value type of encapsulated data (histograms, scattergrams).
const ENCAPSULATED_DATA: &str = "ED";

/// What an `OBX` line means for the open sample.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ObservationTag {
    /// Divert into `demographics.reference_group`.
    ReferenceGroup,
    /// Divert into `demographics.age`.
    Age,
    /// Instrument setting or binary payload; drop.
    NonMeasurement,
    /// A real measurement; becomes a parameter.
    Measurement,
}

/// Classify an observation by its code or name, ignoring case, spaces and punctuation.
pub fn classify(obx: &ObservationResultSegment) -> ObservationTag {
    let labels = [normalise_label(&obx.code), normalise_label(&obx.name)];
    let matches = |set: &[&str]| {
        labels
            .iter()
            .any(|label| !label.is_empty() && set.contains(&label.as_str()))
    };

    if matches(REFERENCE_GROUP_LABELS) {
        ObservationTag::ReferenceGroup
    } else if matches(AGE_LABELS) {
        ObservationTag::Age
    } else if matches(NON_MEASUREMENT_LABELS)
        || obx.value_type.eq_ignore_ascii_case(ENCAPSULATED_DATA)
    {
        ObservationTag::NonMeasurement
    } else {
        ObservationTag::Measurement
    }
}

fn normalise_label(label: &str) -> String {
    label
        .chars()
        .filter(char::is_ascii_alphanumeric)
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

impl PatientDemographics {
    /// Demographics carried by a `PID` segment.
    ///
    /// PID-7 is read as an age only when it looks like one; birth dates are ignored.
    pub fn from_patient_id(pid: &PatientIdSegment) -> Self {
        Self {
            name: pid.name.clone(),
            age: parse_age(&pid.age_or_birth),
            sex: pid.sex.clone(),
            reference_group: None,
        }
    }

    /// Fold a side-channel observation into these demographics.
    ///
    /// Returns `false` when `tag` is not a demographic tag.
    pub fn absorb(&mut self, tag: ObservationTag, value: &str) -> bool {
        match tag {
            ObservationTag::ReferenceGroup => {
                let value = value.trim();
                self.reference_group = (!value.is_empty()).then(|| value.to_string());
                true
            }
            ObservationTag::Age => {
                self.age = parse_age(value);
                true
            }
            ObservationTag::NonMeasurement | ObservationTag::Measurement => false,
        }
    }
}
