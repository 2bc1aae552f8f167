//! Segment tokenizer and typed segment views.
//!
//! Analyzers deliver pseudo-HL7 text with inconsistent terminators (`\r`, `\n`, `\r\n`, or
//! none at all between segments) and occasional transport control bytes. [`tokenize`] turns
//! such a blob into classified [`RawSegment`]s; it never interprets field meaning.
//!
//! Field semantics live in the `decode_*` functions below, one per tag. Every positional
//! index used anywhere in the workspace is defined here.
//!
//! Field indices are those of the pipe-split line, so index 0 is the tag itself. For `MSH`
//! the field separator is `MSH-1`, which shifts every `MSH-n` to index `n - 1`.

use crate::{Hl7Error, Hl7Result};

pub const FIELD_SEPARATOR: char = '|';
pub const COMPONENT_SEPARATOR: char = '^';

const EMBEDDED_TAGS: [&str; 4] = ["MSH|", "PID|", "OBR|", "OBX|"];

// ============================================================================
// Raw segments
// ============================================================================

/// Classification of a line by its leading tag.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SegmentKind {
    /// `MSH` message header.
    Header,
    /// `PID` patient identification.
    PatientId,
    /// `OBR` observation request; opens a sample.
    ObservationRequest,
    /// `OBX` observation result; one measured (or side-channel) value.
    ObservationResult,
}

impl SegmentKind {
    pub fn tag(self) -> &'static str {
        match self {
            SegmentKind::Header => "MSH",
            SegmentKind::PatientId => "PID",
            SegmentKind::ObservationRequest => "OBR",
            SegmentKind::ObservationResult => "OBX",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "MSH" => Some(SegmentKind::Header),
            "PID" => Some(SegmentKind::PatientId),
            "OBR" => Some(SegmentKind::ObservationRequest),
            "OBX" => Some(SegmentKind::ObservationResult),
            _ => None,
        }
    }
}

/// One classified line of the stream, fields kept in order and uninterpreted.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RawSegment {
    kind: SegmentKind,
    fields: Vec<String>,
    raw: String,
}

impl RawSegment {
    pub fn kind(&self) -> SegmentKind {
        self.kind
    }

    /// All pipe-delimited fields, including the tag at index 0.
    pub fn fields(&self) -> &[String] {
        &self.fields
    }

    /// The line as it appeared after terminator normalisation.
    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// Trimmed field at `index`, or `""` when the instrument omitted it.
    pub fn field(&self, index: usize) -> &str {
        self.fields.get(index).map(|f| f.trim()).unwrap_or("")
    }

    /// Trimmed `^`-separated component of a field, or `""` when absent.
    pub fn component(&self, index: usize, component: usize) -> &str {
        self.field(index)
            .split(COMPONENT_SEPARATOR)
            .nth(component)
            .map(str::trim)
            .unwrap_or("")
    }

    /// Decode this segment into its typed view.
    ///
    /// # Errors
    ///
    /// Returns [`Hl7Error::MalformedSegment`] if the line does not carry the fields its tag
    /// requires. Callers are expected to skip such lines rather than abort.
    pub fn decode(&self) -> Hl7Result<Segment> {
        match self.kind {
            SegmentKind::Header => decode_header(self).map(Segment::Header),
            SegmentKind::PatientId => decode_patient_id(self).map(Segment::PatientId),
            SegmentKind::ObservationRequest => {
                decode_observation_request(self).map(Segment::ObservationRequest)
            }
            SegmentKind::ObservationResult => {
                decode_observation_result(self).map(Segment::ObservationResult)
            }
        }
    }

    fn require_fields(&self, min: usize) -> Hl7Result<()> {
        if self.fields.len() < min {
            return Err(Hl7Error::MalformedSegment {
                tag: self.kind.tag(),
                reason: format!("expected at least {min} fields, found {}", self.fields.len()),
            });
        }
        Ok(())
    }
}

/// Split a raw text blob into classified segments.
///
/// Carriage returns are treated as terminators, other control characters (MLLP framing bytes,
/// NULs) are dropped, and a line break is forced before any known tag that appears mid-line.
/// Lines with an unrecognised tag are dropped silently.
pub fn tokenize(text: &str) -> Vec<RawSegment> {
    let normalised = normalise_terminators(text);
    normalised.lines().filter_map(classify_line).collect()
}

fn normalise_terminators(text: &str) -> String {
    let cleaned: String = text
        .chars()
        .filter_map(|c| match c {
            '\r' | '\n' => Some('\n'),
            '\t' => Some(c),
            c if c.is_control() => None,
            c => Some(c),
        })
        .collect();

    let mut out = String::with_capacity(cleaned.len() + 16);
    for line in cleaned.split('\n') {
        let mut rest = line;
        while let Some(pos) = find_embedded_tag(rest) {
            out.push_str(&rest[..pos]);
            out.push('\n');
            rest = &rest[pos..];
        }
        out.push_str(rest);
        out.push('\n');
    }
    out
}

/// Position of the first known tag that starts somewhere other than the line start.
fn find_embedded_tag(line: &str) -> Option<usize> {
    EMBEDDED_TAGS
        .iter()
        .flat_map(|tag| line.match_indices(tag).map(|(pos, _)| pos))
        .filter(|&pos| pos > 0 && !line.as_bytes()[pos - 1].is_ascii_alphanumeric())
        .min()
}

fn classify_line(line: &str) -> Option<RawSegment> {
    let line = line.trim_matches(|c: char| c.is_whitespace() || c == '\u{feff}');
    let (tag, _) = line.split_once(FIELD_SEPARATOR)?;
    let kind = SegmentKind::from_tag(tag.trim())?;

    Some(RawSegment {
        kind,
        fields: line.split(FIELD_SEPARATOR).map(str::to_string).collect(),
        raw: line.to_string(),
    })
}

// ============================================================================
// Typed segments
// ============================================================================

/// A decoded segment.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Segment {
    Header(HeaderSegment),
    PatientId(PatientIdSegment),
    ObservationRequest(ObservationRequestSegment),
    ObservationResult(ObservationResultSegment),
}

/// `MSH` fields the ingestion paths care about.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HeaderSegment {
    /// MSH-3.
    pub sending_application: String,
    /// MSH-4.
    pub sending_facility: String,
    /// MSH-7, undecoded.
    pub timestamp: String,
    /// MSH-10.
    pub control_id: String,
}

impl HeaderSegment {
    /// Instrument identifier: the sending facility, falling back to the sending application.
    pub fn device_id(&self) -> Option<&str> {
        [&self.sending_facility, &self.sending_application]
            .into_iter()
            .map(String::as_str)
            .find(|s| !s.is_empty())
    }
}

/// `PID` fields.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PatientIdSegment {
    /// PID-3 first component, falling back to PID-2.
    pub patient_id: String,
    /// PID-5 rendered as `"first last"`.
    pub name: Option<String>,
    /// PID-7, undecoded. Some analyzers put an age here, others a birth date.
    pub age_or_birth: String,
    /// PID-8.
    pub sex: Option<String>,
}

/// `OBR` fields.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObservationRequestSegment {
    /// OBR-2 first component.
    pub placer_number: String,
    /// OBR-3 first component.
    pub filler_number: String,
    /// OBR-4 identifier.
    pub service_code: String,
    /// OBR-4 text.
    pub service_name: String,
    /// OBR-6, undecoded.
    pub requested_at: String,
    /// OBR-7, undecoded.
    pub observed_at: String,
}

impl ObservationRequestSegment {
    /// Sample number: filler number, falling back to placer number.
    pub fn sample_number(&self) -> Option<&str> {
        [&self.filler_number, &self.placer_number]
            .into_iter()
            .map(String::as_str)
            .find(|s| !s.is_empty())
    }

    /// Raw observation timestamp: OBR-7, falling back to OBR-6.
    pub fn observation_time(&self) -> Option<&str> {
        [&self.observed_at, &self.requested_at]
            .into_iter()
            .map(String::as_str)
            .find(|s| !s.is_empty())
    }
}

/// `OBX` fields.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObservationResultSegment {
    /// OBX-2 (`NM`, `ST`, `IS`, `ED`, ...).
    pub value_type: String,
    /// OBX-3 identifier.
    pub code: String,
    /// OBX-3 text.
    pub name: String,
    /// OBX-3 coding system.
    pub coding_system: String,
    /// OBX-5, outer whitespace trimmed.
    pub value: String,
    /// OBX-6.
    pub unit: Option<String>,
    /// OBX-7.
    pub reference_range: Option<String>,
    /// OBX-8.
    pub abnormal_flags: Option<String>,
    /// OBX-18 first component.
    pub equipment_id: Option<String>,
}

impl ObservationResultSegment {
    /// Observation text, falling back to the identifier.
    pub fn display_name(&self) -> &str {
        if self.name.is_empty() {
            &self.code
        } else {
            &self.name
        }
    }

    pub fn is_numeric(&self) -> bool {
        self.value_type.eq_ignore_ascii_case("NM")
    }
}

fn non_empty(value: &str) -> Option<String> {
    let value = value.trim();
    (!value.is_empty()).then(|| value.to_string())
}

/// Render a `last^first` composite name as `"first last"`.
///
/// Returns `None` when both components are empty.
pub fn composite_name(field: &str) -> Option<String> {
    let mut parts = field.split(COMPONENT_SEPARATOR).map(str::trim);
    let last = parts.next().unwrap_or("");
    let first = parts.next().unwrap_or("");

    let name = [first, last]
        .into_iter()
        .filter(|p| !p.is_empty())
        .collect::<Vec<_>>()
        .join(" ");

    (!name.is_empty()).then_some(name)
}

fn decode_header(seg: &RawSegment) -> Hl7Result<HeaderSegment> {
    seg.require_fields(3)?;
    if !seg.field(1).starts_with(COMPONENT_SEPARATOR) {
        return Err(Hl7Error::MalformedSegment {
            tag: "MSH",
            reason: format!("unexpected encoding characters '{}'", seg.field(1)),
        });
    }

    Ok(HeaderSegment {
        sending_application: seg.component(2, 0).to_string(),
        sending_facility: seg.component(3, 0).to_string(),
        timestamp: seg.field(6).to_string(),
        control_id: seg.field(9).to_string(),
    })
}

fn decode_patient_id(seg: &RawSegment) -> Hl7Result<PatientIdSegment> {
    seg.require_fields(2)?;

    let patient_id = [seg.component(3, 0), seg.component(2, 0)]
        .into_iter()
        .find(|s| !s.is_empty())
        .unwrap_or("")
        .to_string();

    Ok(PatientIdSegment {
        patient_id,
        name: composite_name(seg.field(5)),
        age_or_birth: seg.field(7).to_string(),
        sex: non_empty(seg.field(8)),
    })
}

fn decode_observation_request(seg: &RawSegment) -> Hl7Result<ObservationRequestSegment> {
    seg.require_fields(3)?;

    Ok(ObservationRequestSegment {
        placer_number: seg.component(2, 0).to_string(),
        filler_number: seg.component(3, 0).to_string(),
        service_code: seg.component(4, 0).to_string(),
        service_name: seg.component(4, 1).to_string(),
        requested_at: seg.field(6).to_string(),
        observed_at: seg.field(7).to_string(),
    })
}

fn decode_observation_result(seg: &RawSegment) -> Hl7Result<ObservationResultSegment> {
    seg.require_fields(6)?;

    let code = seg.component(3, 0);
    let name = seg.component(3, 1);
    if code.is_empty() && name.is_empty() {
        return Err(Hl7Error::MalformedSegment {
            tag: "OBX",
            reason: "observation identifier (OBX-3) is empty".into(),
        });
    }

    Ok(ObservationResultSegment {
        value_type: seg.field(2).to_string(),
        code: code.to_string(),
        name: name.to_string(),
        coding_system: seg.component(3, 2).to_string(),
        value: seg.field(5).to_string(),
        unit: non_empty(seg.field(6)),
        reference_range: non_empty(seg.field(7)),
        abnormal_flags: non_empty(seg.field(8)),
        equipment_id: non_empty(seg.component(18, 0)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_on_any_terminator_and_drops_unknown_lines() {
        let text = "MSH|^~\\&|Mindray|BC-5380\rPID|1||\r\nPV1|1\nOBR|1||S1\rOBX|1|NM|6690-2^WBC^LN||6.5";
        let kinds: Vec<_> = tokenize(text).iter().map(RawSegment::kind).collect();
        assert_eq!(
            kinds,
            vec![
                SegmentKind::Header,
                SegmentKind::PatientId,
                SegmentKind::ObservationRequest,
                SegmentKind::ObservationResult,
            ]
        );
    }

    #[test]
    fn strips_framing_bytes_and_breaks_embedded_tags() {
        let text = "\u{0b}OBR|1||S1|OBX|1|NM|WBC^WBC||6.5|10^9/L\u{1c}\r";
        let segments = tokenize(text);
        assert_eq!(segments.len(), 2);
        assert_eq!(segments[0].kind(), SegmentKind::ObservationRequest);
        assert_eq!(segments[0].field(3), "S1");
        assert_eq!(segments[1].raw(), "OBX|1|NM|WBC^WBC||6.5|10^9/L");
    }

    #[test]
    fn does_not_break_inside_words() {
        let segments = tokenize("OBX|1|ST|NOTE^Note||XOBX|");
        assert_eq!(segments.len(), 1);
    }

    #[test]
    fn keeps_field_order_verbatim() {
        let segments = tokenize("OBX|1|NM|718-7^HGB^LN||13,5|g/dL|12-16|N");
        let fields = segments[0].fields();
        assert_eq!(fields[0], "OBX");
        assert_eq!(fields[5], "13,5");
        assert_eq!(fields[7], "12-16");
    }

    #[test]
    fn decodes_observation_result() {
        let seg = &tokenize("OBX|7|NM|6690-2^WBC^LN||110,9|10*9/L|4.0-10.0|H|||F")[0];
        let Segment::ObservationResult(obx) = seg.decode().expect("decode obx") else {
            panic!("expected OBX");
        };
        assert_eq!(obx.code, "6690-2");
        assert_eq!(obx.display_name(), "WBC");
        assert_eq!(obx.coding_system, "LN");
        assert_eq!(obx.value, "110,9");
        assert_eq!(obx.unit.as_deref(), Some("10*9/L"));
        assert_eq!(obx.reference_range.as_deref(), Some("4.0-10.0"));
        assert_eq!(obx.abnormal_flags.as_deref(), Some("H"));
        assert!(obx.is_numeric());
    }

    #[test]
    fn short_observation_result_is_malformed() {
        let seg = &tokenize("OBX|1|NM|WBC")[0];
        let err = seg.decode().expect_err("should be malformed");
        assert!(matches!(err, Hl7Error::MalformedSegment { tag: "OBX", .. }));
    }

    #[test]
    fn observation_without_identifier_is_malformed() {
        let seg = &tokenize("OBX|1|NM|||5.0")[0];
        assert!(seg.decode().is_err());
    }

    #[test]
    fn decodes_patient_and_composite_name() {
        let seg = &tokenize("PID|1||12345^^^^MR||Doe^John||42|M")[0];
        let Segment::PatientId(pid) = seg.decode().expect("decode pid") else {
            panic!("expected PID");
        };
        assert_eq!(pid.patient_id, "12345");
        assert_eq!(pid.name.as_deref(), Some("John Doe"));
        assert_eq!(pid.age_or_birth, "42");
        assert_eq!(pid.sex.as_deref(), Some("M"));
    }

    #[test]
    fn composite_name_handles_missing_parts() {
        assert_eq!(composite_name("^Jane").as_deref(), Some("Jane"));
        assert_eq!(composite_name("Smith").as_deref(), Some("Smith"));
        assert_eq!(composite_name("^"), None);
        assert_eq!(composite_name(""), None);
    }

    #[test]
    fn request_sample_number_falls_back_to_placer() {
        let seg = &tokenize("OBR|1|P-77||CBC^Blood count")[0];
        let Segment::ObservationRequest(obr) = seg.decode().expect("decode obr") else {
            panic!("expected OBR");
        };
        assert_eq!(obr.sample_number(), Some("P-77"));
        assert_eq!(obr.service_name, "Blood count");
        assert_eq!(obr.observation_time(), None);
    }

    #[test]
    fn header_device_id_prefers_facility() {
        let seg = &tokenize("MSH|^~\\&|Mindray|BC-5380|||20240101||ORU^R01|42|P|2.3.1")[0];
        let Segment::Header(msh) = seg.decode().expect("decode msh") else {
            panic!("expected MSH");
        };
        assert_eq!(msh.device_id(), Some("BC-5380"));
        assert_eq!(msh.timestamp, "20240101");
        assert_eq!(msh.control_id, "42");
    }

    #[test]
    fn header_with_bad_encoding_characters_is_malformed() {
        let seg = &tokenize("MSH|xx|App")[0];
        assert!(seg.decode().is_err());
    }
}
