//! Constants used throughout the ingestion core.

/// Default directory for the file-backed store when no explicit directory is configured.
pub const DEFAULT_DATA_DIR: &str = "lis_data";

/// Directory name for persisted result records.
pub const RESULTS_DIR_NAME: &str = "results";

/// Directory name for the key → record id index.
pub const KEYS_DIR_NAME: &str = "keys";

/// Directory name for known patient identifiers.
pub const PATIENTS_DIR_NAME: &str = "patients";

/// Instrument identifier used when neither the payload nor the header names one.
pub const DEFAULT_INSTRUMENT_ID: &str = "UNKNOWN";

/// Prefix of generated sample numbers and barcodes.
pub const AUTO_KEY_PREFIX: &str = "AUTO_";

/// Page size used when a caller does not ask for one.
pub const DEFAULT_PAGE_LIMIT: usize = 50;

/// Upper bound on a single page of results.
pub const MAX_PAGE_LIMIT: usize = 500;
