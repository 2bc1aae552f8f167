use crate::model::AssignmentState;
use uuid::Uuid;

/// Failures of the persistence collaborator.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("storage unavailable: {0}")]
    Unavailable(String),
    #[error("a record with key {0} already exists")]
    DuplicateKey(String),
    #[error("record {0} not found")]
    NotFound(Uuid),
    #[error("invalid identifier '{0}'")]
    InvalidIdentifier(String),
    #[error("record {id} is {found}, expected {expected}")]
    StateChanged {
        id: Uuid,
        expected: AssignmentState,
        found: AssignmentState,
    },
    #[error("storage I/O failed (path: {path}): {source}", path = path.display())]
    Io {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to serialize record: {0}")]
    Serialization(serde_json::Error),
    #[error("failed to deserialize record: {0}")]
    Deserialization(serde_json::Error),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Failures of one ingestion call.
///
/// `Decode` and `InvalidInput` are per-payload problems. `Store` is fatal to the call: in the
/// batch path it stops processing of any sample not yet flushed.
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("failed to decode payload: {0}")]
    Decode(#[from] lis_hl7::Hl7Error),
    #[error("persistence failed: {0}")]
    Store(#[from] StoreError),
}

pub type IngestResult<T> = std::result::Result<T, IngestError>;

/// Failures of the assignment lifecycle. None of these leave a partial mutation behind.
#[derive(Debug, thiserror::Error)]
pub enum AssignmentError {
    #[error("result {0} not found")]
    ResultNotFound(Uuid),
    #[error("patient {0} not found")]
    PatientNotFound(String),
    #[error("cannot move a result from {from} to {to}")]
    InvalidTransition {
        from: AssignmentState,
        to: AssignmentState,
    },
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("persistence failed: {0}")]
    Store(#[from] StoreError),
}

pub type AssignmentResult<T> = std::result::Result<T, AssignmentError>;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    InvalidInput(String),
}

pub type ConfigResult<T> = std::result::Result<T, ConfigError>;
