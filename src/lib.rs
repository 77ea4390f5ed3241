//! # Financial Statement Ingestor
//!
//! Turns monthly financial statement PDFs of construction projects ("obras")
//! into validated accounting records, using a language model for the
//! extraction and a relational store for the results.
//!
//! ## Core Concepts
//!
//! - **Competency**: the month a statement covers, always `MM/YYYY`
//! - **Project code**: identifier of one project (`616`, `BCO`, ...)
//! - **Pooled contribution**: capital paid into a shared pool and allocated to
//!   each project in proportion to its share of the month's total expenses
//! - **Balance check**: closing = opening + revenues - expenses, within 1.00;
//!   divergence flags the record for audit but never blocks it
//! - **Movements**: one stored amount per (competency, project, movement type),
//!   overwritten when a statement is processed again
//!
//! ## Example
//!
//! ```rust,ignore
//! use financial_statement_ingestor::*;
//! use std::sync::Arc;
//!
//! let config = IngestorConfig::from_env();
//! let extractor = FinancialExtractor::new(Arc::new(OpenAiClient::new(&config)?));
//! let store = Arc::new(SqliteStore::open(&config.database_path)?);
//! let processor = BatchProcessor::new(extractor, store, &config);
//!
//! let documents = vec![UploadedDocument::new("posicao_616.pdf", std::fs::read("posicao_616.pdf")?)];
//! let report = processor
//!     .process_batch(documents, &ExtractionOptions::new(ModelId::Gpt5), None)
//!     .await;
//! println!("{} processed, {} failed", report.processed.len(), report.failed.len());
//! ```

pub mod config;
pub mod error;
pub mod ingestion;
pub mod llm;
pub mod normalizer;
pub mod pipeline;
pub mod schema;
pub mod store;
pub mod utils;
pub mod validator;

#[cfg(feature = "server")]
pub mod server;

pub use config::{IngestorConfig, ModelId};
pub use error::{IngestError, Result};
pub use ingestion::{
    extract_pdf_text, validate_upload, PdfTextExtractor, TextExtractor, UploadedDocument,
};
pub use llm::{
    ExtractionEvent, ExtractionOptions, FinancialExtractor, FinishReason, ModelInvoker,
    ModelRequest, OpenAiClient, UnifiedResponse,
};
pub use normalizer::{extract_json_payload, parse_model_output};
pub use pipeline::{BatchProcessor, BatchReport, DocumentOutcome, FailedDocument, ProcessedDocument};
pub use schema::*;
pub use store::{movements_for, Movement, MovementStore, SqliteStore, UploadStatus};
pub use validator::{validate_extraction, RecordValidator, ValidationPolicy};

use log::{debug, info};

/// Offline half of the pipeline: a raw model completion in, validated records
/// out.
pub struct StatementProcessor;

impl StatementProcessor {
    pub fn process(raw_completion: &str) -> Result<Vec<FinancialStatementExtraction>> {
        Self::process_with_policy(raw_completion, ValidationPolicy::default())
    }

    pub fn process_with_policy(
        raw_completion: &str,
        policy: ValidationPolicy,
    ) -> Result<Vec<FinancialStatementExtraction>> {
        debug!("Normalizing completion of {} chars", raw_completion.len());
        let payload = parse_model_output(raw_completion)?;
        let records = RecordValidator::new(policy).validate(&payload)?;

        let flagged = records.iter().filter(|r| r.requires_audit()).count();
        info!(
            "Validated {} record(s), {} requiring audit",
            records.len(),
            flagged
        );
        Ok(records)
    }
}

pub fn process_completion(raw_completion: &str) -> Result<Vec<FinancialStatementExtraction>> {
    StatementProcessor::process(raw_completion)
}
