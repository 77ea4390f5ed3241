use crate::config::ModelId;
use crate::error::{IngestError, Result};
use crate::ingestion::{PdfTextExtractor, TextExtractor, UploadedDocument};
use crate::llm::client::ModelInvoker;
use crate::llm::prompts::{build_prompt, build_prompt_with_schema, SYSTEM_INSTRUCTION};
use crate::llm::types::*;
use crate::normalizer::parse_model_output;
use crate::schema::{FinancialStatementExtraction, RawExtraction};
use crate::validator::RecordValidator;
use log::{info, warn};
use std::sync::Arc;
use tokio::sync::mpsc::Sender;

/// Per-call choices supplied by the inbound boundary.
#[derive(Debug, Clone)]
pub struct ExtractionOptions {
    pub model: ModelId,
    pub document_type_hint: Option<String>,
    /// Requested output budget; clamped to the model ceiling.
    pub max_output_tokens: Option<u32>,
}

impl ExtractionOptions {
    pub fn new(model: ModelId) -> Self {
        Self {
            model,
            document_type_hint: None,
            max_output_tokens: None,
        }
    }

    pub fn with_document_type_hint(mut self, hint: impl Into<String>) -> Self {
        self.document_type_hint = Some(hint.into());
        self
    }

    pub fn with_max_output_tokens(mut self, tokens: u32) -> Self {
        self.max_output_tokens = Some(tokens);
        self
    }
}

/// Runs one document through text extraction, prompting, model invocation,
/// normalization and validation. Persisting is left to the caller.
pub struct FinancialExtractor {
    invoker: Arc<dyn ModelInvoker>,
    text_extractor: Arc<dyn TextExtractor>,
    validator: RecordValidator,
    default_output_tokens: u32,
    embed_schema: bool,
}

impl FinancialExtractor {
    pub fn new(invoker: Arc<dyn ModelInvoker>) -> Self {
        Self {
            invoker,
            text_extractor: Arc::new(PdfTextExtractor),
            validator: RecordValidator::default(),
            default_output_tokens: 6000,
            embed_schema: false,
        }
    }

    pub fn with_text_extractor(mut self, extractor: Arc<dyn TextExtractor>) -> Self {
        self.text_extractor = extractor;
        self
    }

    pub fn with_validator(mut self, validator: RecordValidator) -> Self {
        self.validator = validator;
        self
    }

    /// Budget used when the caller does not request one.
    pub fn with_default_output_tokens(mut self, tokens: u32) -> Self {
        self.default_output_tokens = tokens;
        self
    }

    /// Appends the record JSON schema to the prompt.
    pub fn with_schema_in_prompt(mut self, enabled: bool) -> Self {
        self.embed_schema = enabled;
        self
    }

    pub async fn extract(
        &self,
        document: UploadedDocument,
        options: &ExtractionOptions,
        progress: Option<Sender<ExtractionEvent>>,
    ) -> Result<Vec<FinancialStatementExtraction>> {
        let filename = document.filename;
        self.send_event(
            &progress,
            ExtractionEvent::Starting {
                filename: filename.clone(),
            },
        )
        .await;
        self.send_event(
            &progress,
            ExtractionEvent::ExtractingText {
                filename: filename.clone(),
            },
        )
        .await;

        let text_extractor = Arc::clone(&self.text_extractor);
        let bytes = document.bytes;
        let text = tokio::task::spawn_blocking(move || text_extractor.extract_text(&bytes))
            .await
            .map_err(|e| IngestError::UnreadablePdf(format!("text extraction aborted: {}", e)));

        let text = match text.and_then(|inner| inner) {
            Ok(text) => text,
            Err(e) => {
                self.fail(&progress, &filename, &e).await;
                return Err(e);
            }
        };
        info!("{}: extracted {} characters of text", filename, text.len());

        self.extract_from_text(&filename, &text, options, progress)
            .await
    }

    /// Same pipeline starting from text that is already extracted.
    pub async fn extract_from_text(
        &self,
        filename: &str,
        text: &str,
        options: &ExtractionOptions,
        progress: Option<Sender<ExtractionEvent>>,
    ) -> Result<Vec<FinancialStatementExtraction>> {
        match self.run(filename, text, options, &progress).await {
            Ok(records) => {
                self.send_event(
                    &progress,
                    ExtractionEvent::Success {
                        filename: filename.to_string(),
                        records: records.len(),
                    },
                )
                .await;
                Ok(records)
            }
            Err(e) => {
                self.fail(&progress, filename, &e).await;
                Err(e)
            }
        }
    }

    async fn run(
        &self,
        filename: &str,
        text: &str,
        options: &ExtractionOptions,
        progress: &Option<Sender<ExtractionEvent>>,
    ) -> Result<Vec<FinancialStatementExtraction>> {
        let prompt = if self.embed_schema {
            build_prompt_with_schema(
                text,
                options.document_type_hint.as_deref(),
                &RawExtraction::schema_as_json()?,
            )
        } else {
            build_prompt(text, options.document_type_hint.as_deref())
        };

        let request = ModelRequest::new(
            SYSTEM_INSTRUCTION,
            prompt,
            options.model,
            Some(options.max_output_tokens.unwrap_or(self.default_output_tokens)),
        );

        self.send_event(
            progress,
            ExtractionEvent::InvokingModel {
                filename: filename.to_string(),
                model: options.model,
            },
        )
        .await;
        let response = self.invoker.invoke(&request).await?;

        self.send_event(
            progress,
            ExtractionEvent::Normalizing {
                filename: filename.to_string(),
            },
        )
        .await;
        let payload = parse_model_output(&response.content)?;

        self.send_event(
            progress,
            ExtractionEvent::Validating {
                filename: filename.to_string(),
            },
        )
        .await;
        let records = self.validator.validate(&payload)?;

        for record in records.iter().filter(|r| r.requires_audit()) {
            warn!(
                "{}: project {} ({}) requires audit",
                filename, record.project_code, record.competency
            );
            self.send_event(
                progress,
                ExtractionEvent::AuditRequired {
                    filename: filename.to_string(),
                    project_code: record.project_code.clone(),
                },
            )
            .await;
        }

        info!(
            "{}: validated {} record(s) with {}",
            filename,
            records.len(),
            options.model
        );
        Ok(records)
    }

    async fn fail(
        &self,
        progress: &Option<Sender<ExtractionEvent>>,
        filename: &str,
        error: &IngestError,
    ) {
        warn!("{}: extraction failed: {}", filename, error);
        self.send_event(
            progress,
            ExtractionEvent::Failed {
                filename: filename.to_string(),
                reason: error.to_string(),
            },
        )
        .await;
    }

    async fn send_event(&self, sender: &Option<Sender<ExtractionEvent>>, event: ExtractionEvent) {
        if let Some(tx) = sender {
            let _ = tx.send(event).await;
        }
    }
}
