//! # LIS Core
//!
//! Core business logic for laboratory analyzer result ingestion.
//!
//! This crate contains the domain model and the operations on it:
//! - grouping batch-analyzer segment streams into samples, with demographic diversion
//! - idempotent persistence of samples and single-analyzer results through [`UpsertGateway`]
//! - the patient-assignment lifecycle
//! - in-memory and file-backed stores behind the [`ResultStore`] and [`PatientDirectory`] seams
//!
//! **No transport concerns**: TCP sessions, HTTP servers and CLIs belong in `lis-listener`,
//! `api-rest` and `lis-cli`. Wire decoding belongs in `lis-hl7`.

pub mod aggregate;
pub mod assignment;
pub mod config;
pub mod constants;
pub mod demographics;
pub mod error;
pub mod gateway;
pub mod ingest;
pub mod model;
pub mod store;

pub use aggregate::{aggregate, normalize_result, SampleAggregator};
pub use assignment::{AssignmentService, TRANSITIONS};
pub use config::{CoreConfig, StoreBackend};
pub use demographics::{classify, ObservationTag};
pub use error::{
    AssignmentError, AssignmentResult, ConfigError, ConfigResult, IngestError, IngestResult,
    StoreError, StoreResult,
};
pub use gateway::UpsertGateway;
pub use ingest::IngestionService;
pub use model::{
    Assignment, AssignmentState, Page, Parameter, PatientDemographics, ProcessingStatus,
    RecordKey, ResultBody, ResultKind, Sample, StoredResult,
};
pub use store::{FileStore, MemoryStore, PatientDirectory, ResultStore, Stores};

pub use lis_hl7::AnalyzerResult;
