//! Pseudo-HL7 wire/boundary support for laboratory analyzers.
//!
//! This crate provides **wire models** and **format/translation helpers** for raw analyzer
//! output:
//! - line tokenization and classification of `MSH|`, `PID|`, `OBR|`, `OBX|` segments
//! - one typed decoder per segment tag, so positional field access stays in one place
//! - the canonical single-result shape shared by the JSON and pseudo-HL7 variants
//! - format detection for single-result payloads
//!
//! This crate does not persist anything and has no notion of samples being "complete".
//! Grouping segments into samples belongs to `lis-core`.

pub mod canonical;
pub mod detect;
pub mod segment;
pub mod timestamp;

// Re-export facades
pub use canonical::{map_hl7, parse_age, parse_reference_range, AnalyzerResult};
pub use detect::{decode_payload, detect, Payload};
pub use segment::{
    composite_name, tokenize, HeaderSegment, ObservationRequestSegment, ObservationResultSegment,
    PatientIdSegment, RawSegment, Segment, SegmentKind,
};
pub use timestamp::parse_hl7_timestamp;

/// Errors returned by the `lis-hl7` boundary crate.
#[derive(Debug, thiserror::Error)]
pub enum Hl7Error {
    #[error("malformed {tag} segment: {reason}")]
    MalformedSegment { tag: &'static str, reason: String },

    #[error("canonical result mismatch at {path}: {message}")]
    InvalidJson { path: String, message: String },
}

/// Type alias for Results that can fail with a [`Hl7Error`].
pub type Hl7Result<T> = Result<T, Hl7Error>;
