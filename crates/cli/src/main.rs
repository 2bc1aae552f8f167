use clap::{Parser, Subcommand};
use lis_core::config::default_instrument_from_env_value;
use lis_core::constants::{DEFAULT_DATA_DIR, DEFAULT_PAGE_LIMIT};
use lis_core::{
    AssignmentService, AssignmentState, CoreConfig, IngestionService, Page, PatientDirectory,
    ResultBody, StoreBackend, StoredResult, Stores,
};
use std::path::PathBuf;
use std::sync::Arc;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "lis")]
#[command(about = "Laboratory analyzer result ingestion CLI")]
struct Cli {
    /// Data directory of the file store
    #[arg(long, env = "LIS_DATA_DIR", default_value = DEFAULT_DATA_DIR, global = true)]
    data_dir: PathBuf,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Ingest a batch-analyzer export file
    IngestBatch {
        /// File holding pseudo-HL7 text
        file: PathBuf,
    },
    /// Ingest one single-result analyzer message (JSON or pseudo-HL7)
    IngestResult {
        /// File holding the message
        file: PathBuf,
    },
    /// List unassigned results, most recent first
    Unassigned {
        #[arg(long, default_value_t = DEFAULT_PAGE_LIMIT)]
        limit: usize,
        #[arg(long, default_value_t = 0)]
        offset: usize,
    },
    /// List results in an assignment state
    List {
        /// unassigned, assigned or verified
        #[arg(long, default_value = "unassigned")]
        state: String,
        #[arg(long, default_value_t = DEFAULT_PAGE_LIMIT)]
        limit: usize,
        #[arg(long, default_value_t = 0)]
        offset: usize,
    },
    /// Search results by instrument-reported patient name
    Search {
        name: String,
        #[arg(long, default_value_t = DEFAULT_PAGE_LIMIT)]
        limit: usize,
        #[arg(long, default_value_t = 0)]
        offset: usize,
    },
    /// Register a patient id as known to the patient directory
    RegisterPatient { patient_id: String },
    /// Assign a result to a patient
    Assign {
        result_id: Uuid,
        patient_id: String,
        /// Who made the assignment
        #[arg(long)]
        by: Option<String>,
        /// Free-text notes
        #[arg(long)]
        notes: Option<String>,
    },
    /// Verify an assigned result
    Verify {
        result_id: Uuid,
        /// Who verified the result
        #[arg(long)]
        by: Option<String>,
    },
}

fn print_record(record: &StoredResult) {
    let (summary, patient) = match &record.body {
        ResultBody::Sample(sample) => (
            format!("{} parameter(s)", sample.parameters.len()),
            sample.demographics.name.clone().unwrap_or_default(),
        ),
        ResultBody::Analyzer(result) => (
            format!("{} = {} {}", result.test_name, result.result, result.unit),
            result.patient_name.clone(),
        ),
    };
    println!(
        "ID: {}, Key: {}, State: {}, Patient: {}, Result: {}, Updated: {}",
        record.id,
        record.key,
        record.assignment.state,
        if patient.is_empty() { "-" } else { patient.as_str() },
        summary.trim(),
        record.updated_at.to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
    );
}

fn print_records(records: &[StoredResult]) {
    if records.is_empty() {
        println!("No results found.");
    } else {
        for record in records {
            print_record(record);
        }
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let cfg = Arc::new(CoreConfig::new(
        cli.data_dir.clone(),
        StoreBackend::File,
        default_instrument_from_env_value(std::env::var("LIS_DEFAULT_INSTRUMENT").ok()),
    )?);
    let stores = Stores::open(&cfg)?;
    let ingestion = IngestionService::new(cfg.clone(), stores.results.clone());
    let assignment = AssignmentService::new(stores.results.clone(), stores.patients.clone());

    match cli.command {
        Some(Commands::IngestBatch { file }) => {
            let text = std::fs::read_to_string(&file)?;
            match ingestion.ingest_batch(&text) {
                Ok(saved) => {
                    println!("Ingested {} sample(s) from {}", saved.len(), file.display());
                    print_records(&saved);
                }
                Err(e) => eprintln!("Error ingesting batch: {}", e),
            }
        }
        Some(Commands::IngestResult { file }) => {
            let payload = std::fs::read_to_string(&file)?;
            match ingestion.ingest_single(&payload) {
                Ok(Some(saved)) => print_record(&saved),
                Ok(None) => println!("Message carried no result value; nothing stored."),
                Err(e) => eprintln!("Error ingesting result: {}", e),
            }
        }
        Some(Commands::Unassigned { limit, offset }) => {
            match assignment.list_unassigned(Page::new(limit, offset)) {
                Ok(records) => print_records(&records),
                Err(e) => eprintln!("Error listing results: {}", e),
            }
        }
        Some(Commands::List {
            state,
            limit,
            offset,
        }) => {
            let state: AssignmentState = state.parse()?;
            match assignment.list_by_state(state, Page::new(limit, offset)) {
                Ok(records) => print_records(&records),
                Err(e) => eprintln!("Error listing results: {}", e),
            }
        }
        Some(Commands::Search {
            name,
            limit,
            offset,
        }) => match assignment.search_by_patient_name(&name, Page::new(limit, offset)) {
            Ok(records) => print_records(&records),
            Err(e) => eprintln!("Error searching results: {}", e),
        },
        Some(Commands::RegisterPatient { patient_id }) => {
            match stores.patients.register_patient(&patient_id) {
                Ok(()) => println!("Registered patient: {}", patient_id),
                Err(e) => eprintln!("Error registering patient: {}", e),
            }
        }
        Some(Commands::Assign {
            result_id,
            patient_id,
            by,
            notes,
        }) => match assignment.assign(result_id, &patient_id, by, notes) {
            Ok(saved) => println!("Assigned result {} to patient {}", saved.id, patient_id),
            Err(e) => eprintln!("Error assigning result: {}", e),
        },
        Some(Commands::Verify { result_id, by }) => match assignment.verify(result_id, by) {
            Ok(saved) => println!("Verified result {}", saved.id),
            Err(e) => eprintln!("Error verifying result: {}", e),
        },
        None => {
            println!("Use --help for usage information");
        }
    }

    Ok(())
}
