//! Ingestion entry points.
//!
//! - [`IngestionService::ingest_batch`]: one pseudo-HL7 blob from a batch analyzer, holding any
//!   number of samples.
//! - [`IngestionService::ingest_single`]: one message from a single-result analyzer, either
//!   canonical JSON or pseudo-HL7.
//!
//! Both paths skip malformed segments and stop at the first persistence failure. Samples
//! flushed before that failure stay persisted.

use crate::aggregate::SampleAggregator;
use crate::config::CoreConfig;
use crate::constants::AUTO_KEY_PREFIX;
use crate::error::IngestResult;
use crate::gateway::UpsertGateway;
use crate::model::StoredResult;
use crate::store::ResultStore;
use chrono::{DateTime, Utc};
use lis_hl7::{decode_payload, tokenize};
use std::sync::Arc;
use uuid::Uuid;

#[derive(Clone)]
pub struct IngestionService {
    cfg: Arc<CoreConfig>,
    gateway: UpsertGateway,
}

impl IngestionService {
    pub fn new(cfg: Arc<CoreConfig>, store: Arc<dyn ResultStore>) -> Self {
        Self {
            cfg,
            gateway: UpsertGateway::new(store),
        }
    }

    /// Ingest a batch-analyzer blob and return every persisted sample, in stream order.
    ///
    /// # Errors
    ///
    /// Returns the first [`IngestError::Store`](crate::error::IngestError::Store) encountered;
    /// samples after it are not processed.
    pub fn ingest_batch(&self, text: &str) -> IngestResult<Vec<StoredResult>> {
        self.ingest_batch_at(text, Utc::now())
    }

    /// [`ingest_batch`](Self::ingest_batch) with an explicit clock reading.
    pub fn ingest_batch_at(
        &self,
        text: &str,
        now: DateTime<Utc>,
    ) -> IngestResult<Vec<StoredResult>> {
        let mut aggregator = SampleAggregator::new(now, self.cfg.default_instrument_id());
        let mut persisted = Vec::new();

        for segment in tokenize(text) {
            if let Some(sample) = aggregator.push(&segment) {
                persisted.push(self.gateway.upsert_sample(sample, now)?);
            }
        }
        if let Some(sample) = aggregator.finish() {
            persisted.push(self.gateway.upsert_sample(sample, now)?);
        }

        tracing::info!("batch ingestion persisted {} sample(s)", persisted.len());
        Ok(persisted)
    }

    /// Ingest one single-result analyzer message.
    ///
    /// Returns `Ok(None)` when the message carries no result value; such messages are
    /// discarded without error. A missing barcode is replaced by a generated one, a missing
    /// device id by the configured default, and a missing test date by the current time.
    ///
    /// # Errors
    ///
    /// - [`IngestError::Decode`](crate::error::IngestError::Decode) if the payload is JSON of
    ///   the wrong shape.
    /// - [`IngestError::Store`](crate::error::IngestError::Store) if persistence fails.
    pub fn ingest_single(&self, payload: &str) -> IngestResult<Option<StoredResult>> {
        self.ingest_single_at(payload, Utc::now())
    }

    /// [`ingest_single`](Self::ingest_single) with an explicit clock reading.
    pub fn ingest_single_at(
        &self,
        payload: &str,
        now: DateTime<Utc>,
    ) -> IngestResult<Option<StoredResult>> {
        let mut result = decode_payload(payload)?;

        if result.result.trim().is_empty() {
            tracing::info!("discarding message without a result value");
            return Ok(None);
        }
        if result.barcode.trim().is_empty() {
            result.barcode = auto_barcode(now);
        }
        if result.device_id.trim().is_empty() {
            result.device_id = self.cfg.default_instrument_id().to_string();
        }
        if result.test_date.is_none() {
            result.test_date = Some(now);
        }
        result.raw_message = payload.to_string();

        self.gateway.upsert_result(result, now).map(Some)
    }
}

/// Generated barcode for a message that names none. Unique per call even within one
/// millisecond.
fn auto_barcode(now: DateTime<Utc>) -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{AUTO_KEY_PREFIX}{}_{}", now.timestamp_millis(), &suffix[..8])
}
