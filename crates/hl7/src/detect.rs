//! Format detection for single-result payloads.

use crate::canonical::{map_hl7, AnalyzerResult};
use crate::{Hl7Error, Hl7Result};
use serde_json::Value;

/// A payload after detection.
#[derive(Clone, Debug, PartialEq)]
pub enum Payload<'a> {
    /// The payload parsed as JSON and is treated as already canonical.
    Json(Value),
    /// Anything else is treated as pseudo-HL7 text.
    Hl7(&'a str),
}

/// Decide whether a payload is JSON or pseudo-HL7.
///
/// Detection never fails; it only branches. Surrounding whitespace and transport control
/// bytes are ignored when attempting the JSON parse.
pub fn detect(payload: &str) -> Payload<'_> {
    let trimmed = payload.trim_matches(|c: char| c.is_whitespace() || c.is_control());
    match serde_json::from_str::<Value>(trimmed) {
        Ok(value) => Payload::Json(value),
        Err(_) => Payload::Hl7(payload),
    }
}

/// Detect the payload format and produce the canonical result.
///
/// `raw_message` is left empty; the caller decides what to keep for audit.
///
/// # Errors
///
/// Returns [`Hl7Error::InvalidJson`] if the payload is JSON but does not fit the canonical
/// shape (for example an array, or a field of the wrong type). The error carries the path to
/// the offending field. Pseudo-HL7 payloads never fail here.
pub fn decode_payload(payload: &str) -> Hl7Result<AnalyzerResult> {
    match detect(payload) {
        Payload::Json(value) => from_json(value),
        Payload::Hl7(text) => Ok(map_hl7(text)),
    }
}

fn from_json(value: Value) -> Hl7Result<AnalyzerResult> {
    serde_path_to_error::deserialize::<_, AnalyzerResult>(value).map_err(|err| {
        let path = err.path().to_string();
        let path = if path.is_empty() || path == "." {
            "<root>".to_string()
        } else {
            path
        };
        Hl7Error::InvalidJson {
            path,
            message: err.into_inner().to_string(),
        }
    })
}
