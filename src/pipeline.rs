use crate::config::IngestorConfig;
use crate::error::{IngestError, Result};
use crate::ingestion::{validate_upload, UploadedDocument};
use crate::llm::extractor::{ExtractionOptions, FinancialExtractor};
use crate::llm::types::ExtractionEvent;
use crate::schema::FinancialStatementExtraction;
use crate::store::{MovementStore, UploadStatus};
use futures::stream::{FuturesUnordered, StreamExt};
use log::{error, info, warn};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::Sender;
use tokio::sync::Semaphore;

/// Result of one document's pipeline, correlated by filename.
#[derive(Debug)]
pub struct DocumentOutcome {
    pub filename: String,
    pub result: Result<Vec<FinancialStatementExtraction>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProcessedDocument {
    pub filename: String,
    pub requires_audit: bool,
    pub records: Vec<FinancialStatementExtraction>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FailedDocument {
    pub filename: String,
    pub kind: &'static str,
    pub message: String,
}

/// Per-document outcomes of a batch, in completion order.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchReport {
    pub processed: Vec<ProcessedDocument>,
    pub failed: Vec<FailedDocument>,
}

impl BatchReport {
    pub fn push(&mut self, outcome: DocumentOutcome) {
        match outcome.result {
            Ok(records) => self.processed.push(ProcessedDocument {
                requires_audit: records.iter().any(FinancialStatementExtraction::requires_audit),
                filename: outcome.filename,
                records,
            }),
            Err(e) => self.failed.push(FailedDocument {
                kind: e.kind(),
                message: format!("{}: {}", outcome.filename, e),
                filename: outcome.filename,
            }),
        }
    }

    pub fn any_processed(&self) -> bool {
        !self.processed.is_empty()
    }

    pub fn total(&self) -> usize {
        self.processed.len() + self.failed.len()
    }
}

/// Runs documents through extraction and persistence with a bounded number of
/// pipelines in flight. The bound is shared by every batch using this
/// processor.
pub struct BatchProcessor {
    extractor: Arc<FinancialExtractor>,
    store: Arc<dyn MovementStore>,
    permits: Arc<Semaphore>,
    document_timeout: Duration,
    max_file_size: usize,
}

impl BatchProcessor {
    pub fn new(
        extractor: FinancialExtractor,
        store: Arc<dyn MovementStore>,
        config: &IngestorConfig,
    ) -> Self {
        Self {
            extractor: Arc::new(extractor.with_default_output_tokens(config.extraction_output_tokens)),
            store,
            permits: Arc::new(Semaphore::new(config.max_concurrency.max(1))),
            document_timeout: config.document_timeout,
            max_file_size: config.max_file_size,
        }
    }

    pub fn store(&self) -> &Arc<dyn MovementStore> {
        &self.store
    }

    /// One document, end to end. Failures are recorded in the uploads log and
    /// returned, never raised.
    pub async fn process_document(
        &self,
        document: UploadedDocument,
        options: &ExtractionOptions,
        progress: Option<Sender<ExtractionEvent>>,
    ) -> DocumentOutcome {
        let filename = document.filename.clone();
        let result = self.run_document(document, options, progress).await;

        if let Err(e) = &result {
            warn!("{} failed ({}): {}", filename, e.kind(), e);
            if let Err(store_err) = self
                .store
                .record_upload(&filename, None, UploadStatus::Error)
                .await
            {
                error!("Could not log failed upload {}: {}", filename, store_err);
            }
        }

        DocumentOutcome { filename, result }
    }

    async fn run_document(
        &self,
        document: UploadedDocument,
        options: &ExtractionOptions,
        progress: Option<Sender<ExtractionEvent>>,
    ) -> Result<Vec<FinancialStatementExtraction>> {
        validate_upload(&document.filename, document.bytes.len(), self.max_file_size)?;

        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| IngestError::ModelInvocation("worker pool is shut down".to_string()))?;

        let filename = document.filename.clone();
        let extraction = self.extractor.extract(document, options, progress.clone());
        let records = tokio::time::timeout(self.document_timeout, extraction)
            .await
            .map_err(|_| IngestError::Timeout(self.document_timeout.as_secs()))??;

        // Outside the deadline: a blocking store write cannot be cancelled.
        if let Some(tx) = &progress {
            let _ = tx
                .send(ExtractionEvent::Persisting {
                    filename: filename.clone(),
                    records: records.len(),
                })
                .await;
        }
        let written = self.store.persist_document(&filename, &records).await?;
        info!("{}: persisted {} movement(s)", filename, written);
        Ok(records)
    }

    /// Fans a batch out over the worker pool. One document's failure never
    /// affects its siblings.
    pub async fn process_batch(
        &self,
        documents: Vec<UploadedDocument>,
        options: &ExtractionOptions,
        progress: Option<Sender<ExtractionEvent>>,
    ) -> BatchReport {
        info!(
            "Processing batch of {} document(s) with {}",
            documents.len(),
            options.model
        );

        let mut in_flight: FuturesUnordered<_> = documents
            .into_iter()
            .map(|doc| self.process_document(doc, options, progress.clone()))
            .collect();

        let mut report = BatchReport::default();
        while let Some(outcome) = in_flight.next().await {
            report.push(outcome);
        }

        info!(
            "Batch finished: {} processed, {} failed",
            report.processed.len(),
            report.failed.len()
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModelId;
    use crate::ingestion::TextExtractor;
    use crate::llm::client::ModelInvoker;
    use crate::llm::types::{FinishReason, ModelRequest, UnifiedResponse};
    use crate::store::SqliteStore;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Utf8Text;

    impl TextExtractor for Utf8Text {
        fn extract_text(&self, bytes: &[u8]) -> Result<String> {
            Ok(String::from_utf8_lossy(bytes).into_owned())
        }
    }

    /// Echoes the project code found at the end of the prompt and tracks peak
    /// concurrency.
    struct Tracking {
        active: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl ModelInvoker for Tracking {
        async fn invoke(&self, request: &ModelRequest) -> Result<UnifiedResponse> {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.active.fetch_sub(1, Ordering::SeqCst);

            let code = request
                .user_content
                .rsplit(' ')
                .next()
                .unwrap_or_default()
                .to_string();
            Ok(UnifiedResponse {
                content: format!(
                    "[{{\"competency\": \"09/2025\", \"project_code\": \"{}\"}}]",
                    code
                ),
                finish_reason: FinishReason::Stop,
                model: request.model,
            })
        }
    }

    struct Stalled;

    #[async_trait]
    impl ModelInvoker for Stalled {
        async fn invoke(&self, _request: &ModelRequest) -> Result<UnifiedResponse> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Err(IngestError::ModelInvocation("unreachable".to_string()))
        }
    }

    /// Store whose document writes outlast the document deadline.
    struct SlowStore {
        inner: SqliteStore,
        delay: Duration,
    }

    #[async_trait]
    impl MovementStore for SlowStore {
        async fn upsert_movement(&self, movement: crate::store::Movement) -> Result<()> {
            self.inner.upsert_movement(movement).await
        }

        async fn record_upload(
            &self,
            filename: &str,
            competency: Option<&str>,
            status: UploadStatus,
        ) -> Result<()> {
            self.inner.record_upload(filename, competency, status).await
        }

        async fn persist_document(
            &self,
            filename: &str,
            records: &[FinancialStatementExtraction],
        ) -> Result<usize> {
            tokio::time::sleep(self.delay).await;
            self.inner.persist_document(filename, records).await
        }
    }

    fn processor(invoker: Arc<dyn ModelInvoker>, config: &IngestorConfig) -> BatchProcessor {
        let extractor = FinancialExtractor::new(invoker).with_text_extractor(Arc::new(Utf8Text));
        let store: Arc<dyn MovementStore> = Arc::new(SqliteStore::open_in_memory().unwrap());
        BatchProcessor::new(extractor, store, config)
    }

    #[tokio::test]
    async fn test_concurrency_is_bounded() {
        let invoker = Arc::new(Tracking {
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        });
        let config = IngestorConfig {
            max_concurrency: 2,
            ..IngestorConfig::default()
        };
        let batch = processor(invoker.clone(), &config);

        let documents = (1..=6)
            .map(|i| UploadedDocument::new(format!("obra_{}.pdf", i), format!("Obra 60{}", i).into_bytes()))
            .collect();
        let report = batch
            .process_batch(documents, &ExtractionOptions::new(ModelId::Gpt5), None)
            .await;

        assert_eq!(report.processed.len(), 6);
        assert!(report.failed.is_empty());
        assert!(invoker.peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_invalid_uploads_are_reported_not_raised() {
        let invoker = Arc::new(Tracking {
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        });
        let batch = processor(invoker, &IngestorConfig::default());

        let documents = vec![
            UploadedDocument::new("planilha.xlsx", b"a,b,c".to_vec()),
            UploadedDocument::new("obra.pdf", b"Obra 616".to_vec()),
        ];
        let report = batch
            .process_batch(documents, &ExtractionOptions::new(ModelId::Gpt4o), None)
            .await;

        assert_eq!(report.processed.len(), 1);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].filename, "planilha.xlsx");
        assert_eq!(report.failed[0].kind, "invalid_upload");
        assert!(report.failed[0].message.contains("planilha.xlsx"));
    }

    #[tokio::test]
    async fn test_document_timeout() {
        let config = IngestorConfig {
            document_timeout: Duration::from_millis(50),
            ..IngestorConfig::default()
        };
        let batch = processor(Arc::new(Stalled), &config);

        let outcome = batch
            .process_document(
                UploadedDocument::new("lento.pdf", b"Obra 616".to_vec()),
                &ExtractionOptions::new(ModelId::Gpt5),
                None,
            )
            .await;

        let err = outcome.result.unwrap_err();
        assert_eq!(err.kind(), "timeout");
    }

    #[tokio::test]
    async fn test_document_deadline_does_not_cover_the_store_write() {
        let config = IngestorConfig {
            document_timeout: Duration::from_millis(200),
            ..IngestorConfig::default()
        };
        let sqlite = SqliteStore::open_in_memory().unwrap();
        let store = Arc::new(SlowStore {
            inner: sqlite.clone(),
            delay: Duration::from_millis(400),
        });
        let invoker = Arc::new(Tracking {
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        });
        let extractor = FinancialExtractor::new(invoker).with_text_extractor(Arc::new(Utf8Text));
        let batch = BatchProcessor::new(extractor, store, &config);

        let outcome = batch
            .process_document(
                UploadedDocument::new("obra_616.pdf", b"Obra 616".to_vec()),
                &ExtractionOptions::new(ModelId::Gpt5),
                None,
            )
            .await;

        assert_eq!(outcome.result.unwrap().len(), 1);
        assert_eq!(
            sqlite.last_upload_status("obra_616.pdf").await.unwrap().as_deref(),
            Some("processed")
        );
        assert_eq!(sqlite.counts().await.unwrap().uploads, 1);
    }
}
