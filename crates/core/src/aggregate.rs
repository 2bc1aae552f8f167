//! Sample aggregation for batch analyzers.
//!
//! A batch analyzer sends one text blob holding any number of samples. Each `OBR` opens a
//! sample and the `OBX` lines after it are that sample's observations. [`SampleAggregator`] is
//! the explicit accumulator for one ingestion call:
//!
//! - `Idle`: no sample open. `OBX` lines are skipped.
//! - `Accumulating`: one open sample collecting parameters.
//!
//! `PID` and `MSH` data is staged and carried across consecutive samples until a newer
//! segment replaces it. A sample that collected no parameters is dropped when it closes.
//!
//! The aggregator never persists anything. [`SampleAggregator::push`] hands back the sample it
//! closed so the caller can persist it before feeding the next segment, which keeps
//! persistence failures fatal at the point they happen.

use crate::constants::AUTO_KEY_PREFIX;
use crate::demographics::{classify, ObservationTag};
use crate::model::{Parameter, PatientDemographics, Sample};
use chrono::{DateTime, Utc};
use lis_hl7::{
    parse_hl7_timestamp, tokenize, HeaderSegment, ObservationRequestSegment,
    ObservationResultSegment, PatientIdSegment, RawSegment, Segment,
};

/// Normalise an observation value for storage.
///
/// Numeric (`NM`) values get a decimal comma replaced with a period. Everything else is kept
/// verbatim apart from outer whitespace.
pub fn normalize_result(value_type: &str, value: &str) -> String {
    let value = value.trim();
    if value_type.trim().eq_ignore_ascii_case("NM") {
        value.replace(',', ".")
    } else {
        value.to_string()
    }
}

impl Parameter {
    /// Build a parameter from a measurement observation.
    pub fn from_observation(obx: &ObservationResultSegment) -> Self {
        Self {
            name: obx.display_name().to_string(),
            result: normalize_result(&obx.value_type, &obx.value),
            unit: obx.unit.clone(),
            reference_range: obx.reference_range.clone(),
            status_flag: obx.abnormal_flags.clone(),
        }
    }
}

/// Accumulator that groups a segment stream into samples.
#[derive(Debug)]
pub struct SampleAggregator {
    now: DateTime<Utc>,
    default_instrument_id: String,
    open: Option<Sample>,
    staged_demographics: PatientDemographics,
    staged_instrument_id: Option<String>,
    auto_keys_issued: usize,
}

impl SampleAggregator {
    /// Create an aggregator for one ingestion call.
    ///
    /// `now` stands in for unparseable test dates and seeds generated sample numbers.
    pub fn new(now: DateTime<Utc>, default_instrument_id: impl Into<String>) -> Self {
        Self {
            now,
            default_instrument_id: default_instrument_id.into(),
            open: None,
            staged_demographics: PatientDemographics::default(),
            staged_instrument_id: None,
            auto_keys_issued: 0,
        }
    }

    /// True while a sample is open.
    pub fn is_accumulating(&self) -> bool {
        self.open.is_some()
    }

    /// Feed one segment. Returns the sample this segment closed, if it has parameters.
    ///
    /// Segments that do not decode are skipped with a warning.
    pub fn push(&mut self, segment: &RawSegment) -> Option<Sample> {
        let decoded = match segment.decode() {
            Ok(decoded) => decoded,
            Err(e) => {
                tracing::warn!("skipping segment: {} ({})", e, segment.raw());
                return None;
            }
        };

        match decoded {
            Segment::Header(msh) => {
                self.stage_header(&msh);
                None
            }
            Segment::PatientId(pid) => {
                self.stage_patient(&pid);
                None
            }
            Segment::ObservationRequest(obr) => {
                let closed = self.close_open();
                self.open = Some(self.open_sample(&obr, segment.raw()));
                closed
            }
            Segment::ObservationResult(obx) => {
                self.add_observation(&obx);
                None
            }
        }
    }

    /// End of stream. Returns the open sample if it has parameters.
    pub fn finish(mut self) -> Option<Sample> {
        self.close_open()
    }

    fn stage_header(&mut self, msh: &HeaderSegment) {
        self.staged_instrument_id = msh.device_id().map(str::to_string);
        if let Some(sample) = self.open.as_mut().filter(|s| s.parameters.is_empty()) {
            sample.instrument_id = self
                .staged_instrument_id
                .clone()
                .unwrap_or_else(|| self.default_instrument_id.clone());
        }
    }

    fn stage_patient(&mut self, pid: &PatientIdSegment) {
        self.staged_demographics = PatientDemographics::from_patient_id(pid);
        if let Some(sample) = self.open.as_mut().filter(|s| s.parameters.is_empty()) {
            sample.demographics = self.staged_demographics.clone();
        }
    }

    fn close_open(&mut self) -> Option<Sample> {
        let sample = self.open.take()?;
        if sample.parameters.is_empty() {
            tracing::debug!(
                "discarding sample {} with no parameters",
                sample.sample_number
            );
            return None;
        }
        Some(sample)
    }

    fn open_sample(&mut self, obr: &ObservationRequestSegment, raw: &str) -> Sample {
        let sample_number = match obr.sample_number() {
            Some(number) => number.to_string(),
            None => self.next_auto_key(),
        };

        let test_date = obr
            .observation_time()
            .and_then(parse_hl7_timestamp)
            .unwrap_or_else(|| {
                tracing::debug!("sample {} has no usable test date", sample_number);
                self.now
            });

        Sample {
            sample_number,
            test_date,
            instrument_id: self
                .staged_instrument_id
                .clone()
                .unwrap_or_else(|| self.default_instrument_id.clone()),
            parameters: Vec::new(),
            demographics: self.staged_demographics.clone(),
            raw_source_line: raw.to_string(),
        }
    }

    fn add_observation(&mut self, obx: &ObservationResultSegment) {
        let Some(sample) = self.open.as_mut() else {
            tracing::warn!(
                "skipping OBX {} outside of an observation request",
                obx.display_name()
            );
            return;
        };

        let tag = classify(obx);
        if sample.demographics.absorb(tag, &obx.value) {
            self.staged_demographics.absorb(tag, &obx.value);
            return;
        }
        if tag == ObservationTag::NonMeasurement || obx.value.trim().is_empty() {
            return;
        }

        sample.parameters.push(Parameter::from_observation(obx));
    }

    fn next_auto_key(&mut self) -> String {
        self.auto_keys_issued += 1;
        let base = format!("{AUTO_KEY_PREFIX}{}", self.now.timestamp_millis());
        if self.auto_keys_issued == 1 {
            base
        } else {
            format!("{base}_{}", self.auto_keys_issued)
        }
    }
}

/// Group a whole text blob into samples. Pure; used where nothing needs persisting in between.
pub fn aggregate(
    text: &str,
    now: DateTime<Utc>,
    default_instrument_id: &str,
) -> Vec<Sample> {
    let mut aggregator = SampleAggregator::new(now, default_instrument_id);
    let mut samples: Vec<Sample> = tokenize(text)
        .iter()
        .filter_map(|segment| aggregator.push(segment))
        .collect();
    samples.extend(aggregator.finish());
    samples
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 8, 0, 0)
            .single()
            .expect("valid test time")
    }

    const CBC_BATCH: &str = "MSH|^~\\&|BC-5380|MINDRAY|||20240601075900||ORU^R01|1|P|2.3.1\r\
PID|1||P-77^^^^MR||Tran^Mai||34|F\r\
OBR|1|REQ-1|S-1001|00001^Automated Count^99MRC|||20240601075500\r\
OBX|1|IS|08001^Take Mode^99MRC||O||||||F\r\
OBX|2|IS|01002^Ref Group^99MRC||Adult Female||||||F\r\
OBX|3|NM|6690-2^WBC^LN||6,54|10*9/L|4.00-10.00|N|||F\r\
OBX|4|NM|30525-0^Age^LN||34|yr|||||F\r\
OBX|5|ED|15000^WBC Histogram^99MRC||^Image^BMP^Base64^Qk1=||||||F\r\
OBX|6|NM|718-7^HGB^LN||110,9|g/L|115-150|L|||F\r\
OBR|2|REQ-2|S-1002|00001^Automated Count^99MRC|||20240601075700\r\
OBX|1|NM|6690-2^WBC^LN||7.1|10*9/L|4.00-10.00|N|||F\r";

    #[test]
    fn test_groups_observations_under_their_request() {
        let samples = aggregate(CBC_BATCH, now(), "UNKNOWN");
        assert_eq!(samples.len(), 2);
        assert_eq!(samples[0].sample_number, "S-1001");
        assert_eq!(samples[0].parameters.len(), 2);
        assert_eq!(samples[1].sample_number, "S-1002");
        assert_eq!(samples[1].parameters.len(), 1);
    }

    #[test]
    fn test_malformed_observation_is_skipped_mid_sample() {
        let text = "OBR|1||S-1\r\
OBX|1|NM|WBC^WBC||6,5\r\
OBX|2|NM|HGB\r\
OBX|3|NM|||5\r\
OBX|4|NM|PLT^PLT||250\r\
OBR|2||S-2\r\
OBX|1|NM|RBC^RBC||4,2\r";
        let samples = aggregate(text, now(), "UNKNOWN");
        assert_eq!(samples.len(), 2);

        let first: Vec<_> = samples[0]
            .parameters
            .iter()
            .map(|p| p.name.as_str())
            .collect();
        assert_eq!(samples[0].sample_number, "S-1");
        assert_eq!(first, vec!["WBC", "PLT"]);

        assert_eq!(samples[1].sample_number, "S-2");
        assert_eq!(samples[1].parameters.len(), 1);
        assert_eq!(samples[1].parameters[0].name, "RBC");
        assert_eq!(samples[1].parameters[0].result, "4.2");
    }

    #[test]
    fn test_empty_samples_are_dropped() {
        let text = "OBR|1||S-1\rOBR|2||S-2\rOBX|1|NM|A^A||1\rOBR|3||S-3\rOBX|1|NM|B^B||\r";
        let samples = aggregate(text, now(), "UNKNOWN");
        let numbers: Vec<_> = samples.iter().map(|s| s.sample_number.as_str()).collect();
        assert_eq!(numbers, vec!["S-2"]);
    }

    #[test]
    fn test_diverts_demographic_observations() {
        let samples = aggregate(CBC_BATCH, now(), "UNKNOWN");
        let first = &samples[0];

        let names: Vec<_> = first.parameters.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["WBC", "HGB"]);
        assert_eq!(
            first.demographics.reference_group.as_deref(),
            Some("Adult Female")
        );
        assert_eq!(first.demographics.age, Some(34));
        assert_eq!(first.demographics.name.as_deref(), Some("Mai Tran"));
        assert_eq!(first.demographics.sex.as_deref(), Some("F"));
    }

    #[test]
    fn test_normalises_decimal_comma_for_numeric_values_only() {
        let samples = aggregate(CBC_BATCH, now(), "UNKNOWN");
        assert_eq!(samples[0].parameters[0].result, "6.54");
        assert_eq!(samples[0].parameters[1].result, "110.9");

        assert_eq!(normalize_result("NM", " 110,9 "), "110.9");
        assert_eq!(normalize_result("ST", "1,2 mmol"), "1,2 mmol");
        assert_eq!(normalize_result("NM", "< 5,00"), "< 5.00");
    }

    #[test]
    fn test_parameter_carries_unit_range_and_flag() {
        let samples = aggregate(CBC_BATCH, now(), "UNKNOWN");
        let hgb = &samples[0].parameters[1];
        assert_eq!(hgb.unit.as_deref(), Some("g/L"));
        assert_eq!(hgb.reference_range.as_deref(), Some("115-150"));
        assert_eq!(hgb.status_flag.as_deref(), Some("L"));
    }

    #[test]
    fn test_header_and_dates() {
        let samples = aggregate(CBC_BATCH, now(), "UNKNOWN");
        assert_eq!(samples[0].instrument_id, "MINDRAY");
        assert_eq!(
            samples[0].test_date,
            Utc.with_ymd_and_hms(2024, 6, 1, 7, 55, 0)
                .single()
                .expect("valid time")
        );
        assert!(samples[0].raw_source_line.starts_with("OBR|1|REQ-1|S-1001"));
    }

    #[test]
    fn test_staged_demographics_carry_to_next_sample() {
        let samples = aggregate(CBC_BATCH, now(), "UNKNOWN");
        assert_eq!(samples[1].demographics.name.as_deref(), Some("Mai Tran"));
        assert_eq!(
            samples[1].demographics.reference_group.as_deref(),
            Some("Adult Female")
        );
        assert_eq!(samples[1].instrument_id, "MINDRAY");
    }

    #[test]
    fn test_patient_after_request_applies_until_first_parameter() {
        let text = "OBR|1||S-1\r\
PID|1||P-1||Doe^Jane||40|F\r\
OBX|1|NM|A^A||1\r\
PID|2||P-2||Roe^Rick||50|M\r\
OBX|2|NM|B^B||2\r\
OBR|2||S-2\r\
OBX|1|NM|C^C||3\r";
        let samples = aggregate(text, now(), "UNKNOWN");
        assert_eq!(samples[0].demographics.name.as_deref(), Some("Jane Doe"));
        assert_eq!(samples[0].parameters.len(), 2);
        assert_eq!(samples[1].demographics.name.as_deref(), Some("Rick Roe"));
        assert_eq!(samples[1].demographics.age, Some(50));
    }

    #[test]
    fn test_new_patient_replaces_staged_demographics() {
        let text = "PID|1||P-1||Doe^Jane\r\
OBR|1||S-1\r\
OBX|1|IS|01002^Ref Group||Adult\r\
OBX|2|NM|A^A||1\r\
PID|2||P-2||Roe^Rick\r\
OBR|2||S-2\r\
OBX|1|NM|B^B||2\r";
        let samples = aggregate(text, now(), "UNKNOWN");
        assert_eq!(samples[1].demographics.name.as_deref(), Some("Rick Roe"));
        assert_eq!(samples[1].demographics.reference_group, None);
    }

    #[test]
    fn test_generated_sample_numbers_are_unique_within_a_call() {
        let text = "OBR|1||\rOBX|1|NM|A^A||1\rOBR|2||\rOBX|1|NM|B^B||2\r";
        let samples = aggregate(text, now(), "UNKNOWN");
        let millis = now().timestamp_millis();
        assert_eq!(samples[0].sample_number, format!("AUTO_{millis}"));
        assert_eq!(samples[1].sample_number, format!("AUTO_{millis}_2"));
    }

    #[test]
    fn test_malformed_date_falls_back_to_now() {
        let samples = aggregate("OBR|1||S-1|||garbage\rOBX|1|NM|A^A||1", now(), "DEV");
        assert_eq!(samples[0].test_date, now());
        assert_eq!(samples[0].instrument_id, "DEV");
    }

    #[test]
    fn test_observation_before_any_request_is_skipped() {
        let mut aggregator = SampleAggregator::new(now(), "UNKNOWN");
        for segment in tokenize("OBX|1|NM|A^A||1\rOBX|1|NM|B^B") {
            assert!(aggregator.push(&segment).is_none());
        }
        assert!(!aggregator.is_accumulating());
        assert!(aggregator.finish().is_none());
    }

    #[test]
    fn test_push_returns_the_sample_a_request_closes() {
        let mut aggregator = SampleAggregator::new(now(), "UNKNOWN");
        let segments = tokenize("OBR|1||S-1\rOBX|1|NM|A^A||1\rOBR|2||S-2");

        assert!(aggregator.push(&segments[0]).is_none());
        assert!(aggregator.push(&segments[1]).is_none());
        let closed = aggregator.push(&segments[2]).expect("S-1 should close");
        assert_eq!(closed.sample_number, "S-1");
        assert!(aggregator.is_accumulating());
        assert!(aggregator.finish().is_none());
    }

    #[test]
    fn test_end_to_end_wbc_with_side_channel_lines() {
        let text = "OBR|1||S-42|||20240601070000\n\
OBX|1|NM|6690-2^WBC^LN||5,2|10*9/L|4-10|N\n\
OBX|2|IS|01002^Ref Group^99MRC||Child\n\
OBX|3|IS|08003^Test Mode^99MRC||CBC+DIFF\n";
        let samples = aggregate(text, now(), "UNKNOWN");
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].parameters.len(), 1);
        assert_eq!(samples[0].parameters[0].name, "WBC");
        assert_eq!(samples[0].parameters[0].result, "5.2");
        assert_eq!(samples[0].demographics.reference_group.as_deref(), Some("Child"));
    }
}
