//! Canonical single-result shape and the pseudo-HL7 mapper.
//!
//! Single-result analyzers (cartridge-based point-of-care devices) report one test per
//! message, either as a JSON object already in canonical form or as pseudo-HL7 text.
//! [`map_hl7`] produces the same [`AnalyzerResult`] a JSON payload with equivalent data
//! would deserialise into.
//!
//! The mapper is tolerant by construction: missing segments leave fields at their defaults
//! and a value that cannot be coerced nulls only that one field.

use crate::segment::{tokenize, Segment};
use crate::timestamp::parse_hl7_timestamp;
use chrono::{DateTime, Utc};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize};

/// Largest value accepted as an age in years. Larger numbers are birth dates or noise.
const MAX_PLAUSIBLE_AGE: u32 = 150;

/// Canonical result for single-result analyzers.
///
/// Every field has a default so partial JSON payloads still decode; the persistence
/// gateway decides whether the result is complete enough to store.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AnalyzerResult {
    #[serde(deserialize_with = "lenient_string")]
    pub device_id: String,
    /// Sample barcode; the idempotency key for this analyzer class.
    #[serde(deserialize_with = "lenient_string")]
    pub barcode: String,
    #[serde(deserialize_with = "lenient_string")]
    pub patient_id: String,
    #[serde(deserialize_with = "lenient_string")]
    pub patient_name: String,
    #[serde(deserialize_with = "lenient_age")]
    pub patient_age: Option<u32>,
    #[serde(deserialize_with = "lenient_string")]
    pub patient_sex: String,
    #[serde(deserialize_with = "lenient_string")]
    pub test_type: String,
    #[serde(deserialize_with = "lenient_string")]
    pub test_name: String,
    #[serde(deserialize_with = "lenient_string")]
    pub result: String,
    #[serde(deserialize_with = "lenient_string")]
    pub unit: String,
    #[serde(deserialize_with = "lenient_string")]
    pub reference_range: String,
    #[serde(deserialize_with = "lenient_bound")]
    pub reference_min: Option<f64>,
    #[serde(deserialize_with = "lenient_bound")]
    pub reference_max: Option<f64>,
    #[serde(deserialize_with = "lenient_string")]
    pub flag: String,
    #[serde(deserialize_with = "lenient_string")]
    pub cartridge_type: String,
    #[serde(deserialize_with = "lenient_string")]
    pub lot_number: String,
    pub test_date: Option<DateTime<Utc>>,
    /// Copy of the payload as received, kept for audit.
    #[serde(skip_serializing_if = "String::is_empty", deserialize_with = "lenient_string")]
    pub raw_message: String,
}

/// Accept text, numbers and booleans as their text form and `null` as `""`.
///
/// Objects and arrays are still rejected.
fn lenient_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::Null => Ok(String::new()),
        serde_json::Value::String(s) => Ok(s),
        serde_json::Value::Number(n) => Ok(n.to_string()),
        serde_json::Value::Bool(b) => Ok(b.to_string()),
        other => Err(D::Error::custom(format!(
            "expected a string or number, found {}",
            json_kind(&other)
        ))),
    }
}

/// Accept a number or a numeric string as a reference bound; other text becomes `None`.
fn lenient_bound<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::Null => Ok(None),
        serde_json::Value::Number(n) => Ok(n.as_f64().filter(|v| v.is_finite())),
        serde_json::Value::String(s) => Ok(parse_bound(&s)),
        other => Err(D::Error::custom(format!(
            "expected a number, found {}",
            json_kind(&other)
        ))),
    }
}

fn json_kind(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "a boolean",
        serde_json::Value::Number(_) => "a number",
        serde_json::Value::String(_) => "a string",
        serde_json::Value::Array(_) => "an array",
        serde_json::Value::Object(_) => "an object",
    }
}

/// Accept a number or a numeric string; anything else becomes `None` instead of failing the
/// whole payload.
fn lenient_age<'de, D>(deserializer: D) -> Result<Option<u32>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    Ok(match value {
        serde_json::Value::Number(n) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64))
            .and_then(|n| u32::try_from(n).ok())
            .filter(|n| *n <= MAX_PLAUSIBLE_AGE),
        serde_json::Value::String(s) => parse_age(&s),
        _ => None,
    })
}

/// Parse an age in years from instrument text.
///
/// Reads the leading run of digits (`"26"`, `"26 yr"`, `"26.5"` all give 26). Returns `None`
/// for non-numeric input or values above a plausible human age.
pub fn parse_age(raw: &str) -> Option<u32> {
    let raw = raw.trim();
    let digits_len = raw.bytes().take_while(u8::is_ascii_digit).count();
    raw[..digits_len]
        .parse::<u32>()
        .ok()
        .filter(|age| *age <= MAX_PLAUSIBLE_AGE)
}

/// Split a reference range such as `"0.5-10"` into numeric bounds.
///
/// The separator is the first `-` after the first character, so a negative lower bound
/// survives. Each half that does not parse as a number yields `None`.
pub fn parse_reference_range(raw: &str) -> (Option<f64>, Option<f64>) {
    let raw = raw.trim();
    let separator = raw
        .char_indices()
        .skip(1)
        .find(|(_, c)| *c == '-')
        .map(|(i, _)| i);

    match separator {
        Some(i) => (parse_bound(&raw[..i]), parse_bound(&raw[i + 1..])),
        None => (None, None),
    }
}

fn parse_bound(raw: &str) -> Option<f64> {
    raw.trim()
        .replace(',', ".")
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
}

/// Map a pseudo-HL7 single-result message to the canonical shape.
///
/// The first observation carrying a value is taken as the result; later observations are
/// ignored. Malformed lines are skipped with a warning.
pub fn map_hl7(text: &str) -> AnalyzerResult {
    let mut out = AnalyzerResult::default();
    let mut have_result = false;
    let mut request_time = None;
    let mut header_time = None;

    for raw in tokenize(text) {
        let segment = match raw.decode() {
            Ok(segment) => segment,
            Err(e) => {
                tracing::warn!("skipping segment: {} ({})", e, raw.raw());
                continue;
            }
        };

        match segment {
            Segment::Header(msh) => {
                if let Some(device_id) = msh.device_id() {
                    out.device_id = device_id.to_string();
                }
                header_time = parse_hl7_timestamp(&msh.timestamp);
            }
            Segment::PatientId(pid) => {
                out.patient_id = pid.patient_id;
                out.patient_name = pid.name.unwrap_or_default();
                out.patient_age = parse_age(&pid.age_or_birth);
                out.patient_sex = pid.sex.unwrap_or_default();
            }
            Segment::ObservationRequest(obr) => {
                if let Some(barcode) = obr.sample_number() {
                    out.barcode = barcode.to_string();
                }
                request_time = obr.observation_time().and_then(parse_hl7_timestamp);
                out.cartridge_type = if obr.service_name.is_empty() {
                    obr.service_code
                } else {
                    obr.service_name
                };
            }
            Segment::ObservationResult(obx) => {
                if have_result || obx.value.is_empty() {
                    continue;
                }
                have_result = true;

                out.test_type = obx.code.clone();
                out.test_name = obx.display_name().to_string();
                out.result = if obx.is_numeric() {
                    obx.value.replace(',', ".")
                } else {
                    obx.value
                };
                out.unit = obx.unit.unwrap_or_default();
                out.reference_range = obx.reference_range.unwrap_or_default();
                (out.reference_min, out.reference_max) =
                    parse_reference_range(&out.reference_range);
                out.flag = obx.abnormal_flags.unwrap_or_default();
                out.lot_number = obx.equipment_id.unwrap_or_default();
            }
        }
    }

    out.test_date = request_time.or(header_time);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const CRP_MESSAGE: &str = "MSH|^~\\&|FIA|ICHROMA-01|||20240502101500||ORU^R01|77|P|2.5\r\
PID|1||P-100||Nguyen^An||34|F\r\
OBR|1||BC-9001|CRP^CRP Cartridge|||20240502101200\r\
OBX|1|NM|CRP^C-Reactive Protein^L||12,4|mg/L|0-10|H|||F|||||||LOT-55\r";

    #[test]
    fn maps_full_message() {
        let result = map_hl7(CRP_MESSAGE);
        assert_eq!(result.device_id, "ICHROMA-01");
        assert_eq!(result.barcode, "BC-9001");
        assert_eq!(result.patient_id, "P-100");
        assert_eq!(result.patient_name, "An Nguyen");
        assert_eq!(result.patient_age, Some(34));
        assert_eq!(result.patient_sex, "F");
        assert_eq!(result.test_type, "CRP");
        assert_eq!(result.test_name, "C-Reactive Protein");
        assert_eq!(result.result, "12.4");
        assert_eq!(result.unit, "mg/L");
        assert_eq!(result.reference_range, "0-10");
        assert_eq!(result.reference_min, Some(0.0));
        assert_eq!(result.reference_max, Some(10.0));
        assert_eq!(result.flag, "H");
        assert_eq!(result.cartridge_type, "CRP Cartridge");
        assert_eq!(result.lot_number, "LOT-55");
        assert_eq!(
            result.test_date.map(|d| d.to_rfc3339()).as_deref(),
            Some("2024-05-02T10:12:00+00:00")
        );
    }

    #[test]
    fn missing_segments_leave_defaults() {
        let result = map_hl7("OBX|1|ST|HCG^hCG||Positive");
        assert_eq!(result.result, "Positive");
        assert_eq!(result.device_id, "");
        assert_eq!(result.barcode, "");
        assert_eq!(result.patient_age, None);
        assert_eq!(result.test_date, None);
    }

    #[test]
    fn non_numeric_age_nulls_only_that_field() {
        let result = map_hl7("PID|1||P-1||Doe^Jo||unknown|M\rOBX|1|NM|GLU^Glucose||5.4");
        assert_eq!(result.patient_age, None);
        assert_eq!(result.patient_name, "Jo Doe");
        assert_eq!(result.result, "5.4");
    }

    #[test]
    fn first_valued_observation_wins() {
        let result = map_hl7("OBX|1|NM|A^A||\rOBX|2|NM|B^B||2.0\rOBX|3|NM|C^C||3.0");
        assert_eq!(result.test_name, "B");
        assert_eq!(result.result, "2.0");
    }

    #[test]
    fn header_time_is_used_without_request_time() {
        let result = map_hl7("MSH|^~\\&|FIA|DEV|||20240101120000\rOBX|1|NM|A^A||1");
        assert_eq!(
            result.test_date.map(|d| d.to_rfc3339()).as_deref(),
            Some("2024-01-01T12:00:00+00:00")
        );
    }

    #[test]
    fn reference_range_bounds() {
        assert_eq!(parse_reference_range("3.5-5.1"), (Some(3.5), Some(5.1)));
        assert_eq!(parse_reference_range("-2-2"), (Some(-2.0), Some(2.0)));
        assert_eq!(parse_reference_range("<5"), (None, None));
        assert_eq!(parse_reference_range("neg-pos"), (None, None));
        assert_eq!(parse_reference_range("0-high"), (Some(0.0), None));
        assert_eq!(parse_reference_range(""), (None, None));
    }

    #[test]
    fn age_parsing() {
        assert_eq!(parse_age("26"), Some(26));
        assert_eq!(parse_age(" 26 yr"), Some(26));
        assert_eq!(parse_age("26.5"), Some(26));
        assert_eq!(parse_age("adult"), None);
        assert_eq!(parse_age("19800101"), None);
        assert_eq!(parse_age(""), None);
    }

    #[test]
    fn json_numbers_and_nulls_become_text() {
        let parsed: AnalyzerResult = serde_json::from_str(
            r#"{"barcode":12345,"result":12.4,"patientName":null,"unit":null,"referenceMin":"0,5","referenceMax":10}"#,
        )
        .expect("decode json");
        assert_eq!(parsed.barcode, "12345");
        assert_eq!(parsed.result, "12.4");
        assert_eq!(parsed.patient_name, "");
        assert_eq!(parsed.unit, "");
        assert_eq!(parsed.reference_min, Some(0.5));
        assert_eq!(parsed.reference_max, Some(10.0));
    }

    #[test]
    fn json_nested_values_are_rejected() {
        let err = serde_json::from_str::<AnalyzerResult>(r#"{"result":{"value":1}}"#)
            .expect_err("object is not a result value");
        assert!(err.to_string().contains("an object"));
    }

    #[test]
    fn json_age_is_lenient() {
        let parsed: AnalyzerResult =
            serde_json::from_str(r#"{"result":"1","patientAge":"abc"}"#).expect("decode json");
        assert_eq!(parsed.patient_age, None);

        let parsed: AnalyzerResult =
            serde_json::from_str(r#"{"result":"1","patientAge":41}"#).expect("decode json");
        assert_eq!(parsed.patient_age, Some(41));
    }
}
