//! Idempotent persistence of ingested results.
//!
//! Every ingestion path ends here. The gateway looks a result up by its [`RecordKey`] and either
//! replaces the body of the existing record or inserts a new, unassigned one. Re-sending the
//! same sample number or barcode therefore never creates a second record. A re-ingest writes
//! only the body, so an assignment made in between is kept.

use crate::error::{IngestError, IngestResult};
use crate::model::{ResultBody, Sample, StoredResult};
use crate::store::ResultStore;
use chrono::{DateTime, Utc};
use lis_hl7::AnalyzerResult;
use std::sync::Arc;

#[derive(Clone)]
pub struct UpsertGateway {
    store: Arc<dyn ResultStore>,
}

impl UpsertGateway {
    pub fn new(store: Arc<dyn ResultStore>) -> Self {
        Self { store }
    }

    /// Persist a batch-analyzer sample keyed by its sample number.
    ///
    /// # Errors
    ///
    /// - [`IngestError::InvalidInput`] if the sample number is blank or there are no parameters.
    /// - [`IngestError::Store`] if the store fails.
    pub fn upsert_sample(&self, sample: Sample, now: DateTime<Utc>) -> IngestResult<StoredResult> {
        if sample.sample_number.trim().is_empty() {
            return Err(IngestError::InvalidInput("sample number is empty".into()));
        }
        if sample.parameters.is_empty() {
            return Err(IngestError::InvalidInput(format!(
                "sample {} has no parameters",
                sample.sample_number
            )));
        }
        self.upsert(ResultBody::Sample(sample), now)
    }

    /// Persist a single-result analyzer reading keyed by its barcode.
    ///
    /// # Errors
    ///
    /// - [`IngestError::InvalidInput`] if the barcode or the result value is blank.
    /// - [`IngestError::Store`] if the store fails.
    pub fn upsert_result(
        &self,
        result: AnalyzerResult,
        now: DateTime<Utc>,
    ) -> IngestResult<StoredResult> {
        if result.barcode.trim().is_empty() {
            return Err(IngestError::InvalidInput("barcode is empty".into()));
        }
        if result.result.trim().is_empty() {
            return Err(IngestError::InvalidInput(format!(
                "result for barcode {} has no value",
                result.barcode
            )));
        }
        self.upsert(ResultBody::Analyzer(result), now)
    }

    fn upsert(&self, body: ResultBody, now: DateTime<Utc>) -> IngestResult<StoredResult> {
        let key = body.key();
        match self.store.find_by_key(&key)? {
            Some(existing) => {
                let saved = self.store.replace_body(existing.id, body, now)?;
                tracing::info!("updated result {} ({})", saved.id, saved.key);
                Ok(saved)
            }
            None => {
                let saved = self.store.insert(StoredResult::new(body, now))?;
                tracing::info!("stored result {} ({})", saved.id, saved.key);
                Ok(saved)
            }
        }
    }
}
