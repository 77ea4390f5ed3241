//! HTTP boundary: multipart uploads in, per-document outcomes out.

use crate::config::{IngestorConfig, ModelId};
use crate::error::{IngestError, Result};
use crate::ingestion::UploadedDocument;
use crate::llm::client::OpenAiClient;
use crate::llm::extractor::{ExtractionOptions, FinancialExtractor};
use crate::pipeline::{BatchProcessor, BatchReport};
use crate::store::{MovementStore, SqliteStore};
use axum::extract::{DefaultBodyLimit, Multipart, Query, State};
use axum::http::{header, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use log::{error, info, warn};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tower_http::cors::CorsLayer;

/// Upper bound on files accepted in one batch request body.
const MAX_FILES_PER_REQUEST: usize = 20;

#[derive(Clone)]
pub struct AppState {
    pub processor: Arc<BatchProcessor>,
    pub store: SqliteStore,
    pub config: Arc<IngestorConfig>,
}

impl AppState {
    pub fn new(config: IngestorConfig) -> Result<Self> {
        let store = SqliteStore::open(&config.database_path)?;
        let client = OpenAiClient::new(&config)?;
        let extractor = FinancialExtractor::new(Arc::new(client));
        let processor = BatchProcessor::new(
            extractor,
            Arc::new(store.clone()) as Arc<dyn MovementStore>,
            &config,
        );

        Ok(Self {
            processor: Arc::new(processor),
            store,
            config: Arc::new(config),
        })
    }
}

pub fn router(state: AppState) -> Router {
    let body_limit = state
        .config
        .max_file_size
        .saturating_mul(MAX_FILES_PER_REQUEST);

    Router::new()
        .route("/api/health", get(health))
        .route("/api/upload", post(upload_batch))
        .route("/api/analyze-pdf", post(analyze_pdf))
        .route("/api/movements", get(list_movements))
        .route("/api/summary", get(summary))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(cors_layer(&state.config.allowed_origins))
        .with_state(state)
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let origins: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|o| match o.parse::<HeaderValue>() {
            Ok(value) => Some(value),
            Err(e) => {
                warn!("Ignoring invalid CORS origin '{}': {}", o, e);
                None
            }
        })
        .collect();

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
}

/// Binds the configured address and serves until the process stops.
pub async fn serve(config: IngestorConfig) -> Result<()> {
    if !config.has_api_key() {
        warn!("OPENAI_API_KEY is not set; every extraction will fail");
    }
    let bind_address = config.bind_address.clone();
    let app = router(AppState::new(config)?);

    let listener = tokio::net::TcpListener::bind(&bind_address).await?;
    info!("Listening on {}", bind_address);
    axum::serve(listener, app).await?;
    Ok(())
}

/// Fields gathered from a multipart form, in whatever order they arrive.
#[derive(Default)]
struct UploadForm {
    files: Vec<UploadedDocument>,
    model: Option<String>,
    document_type: Option<String>,
    max_tokens: Option<u32>,
}

impl UploadForm {
    async fn read(mut multipart: Multipart, file_field: &str) -> std::result::Result<Self, Response> {
        let mut form = UploadForm::default();

        loop {
            let field = match multipart.next_field().await {
                Ok(Some(field)) => field,
                Ok(None) => break,
                Err(e) => return Err(error_response(StatusCode::BAD_REQUEST, e.to_string())),
            };
            let name = field.name().unwrap_or_default().to_string();

            if name == file_field {
                let filename = field.file_name().unwrap_or_default().to_string();
                let bytes = field.bytes().await.map_err(|e| {
                    error_response(
                        StatusCode::BAD_REQUEST,
                        format!("{}: could not read upload: {}", filename, e),
                    )
                })?;
                form.files.push(UploadedDocument::new(filename, bytes.to_vec()));
                continue;
            }

            let value = field
                .text()
                .await
                .map_err(|e| error_response(StatusCode::BAD_REQUEST, e.to_string()))?;
            let value = value.trim().to_string();
            match name.as_str() {
                "model" if !value.is_empty() => form.model = Some(value),
                "document_type" | "tipo_documento" if !value.is_empty() => {
                    form.document_type = Some(value)
                }
                "max_tokens" => form.max_tokens = value.parse().ok(),
                _ => {}
            }
        }

        Ok(form)
    }

    fn options(&self, default_model: ModelId) -> ExtractionOptions {
        ExtractionOptions {
            model: ModelId::resolve(self.model.as_deref(), default_model),
            document_type_hint: self.document_type.clone(),
            max_output_tokens: self.max_tokens,
        }
    }
}

async fn health(State(state): State<AppState>) -> Response {
    match state.store.counts().await {
        Ok(counts) => Json(json!({
            "status": "healthy",
            "database": "connected",
            "model": state.config.default_model,
            "api_key_configured": state.config.has_api_key(),
            "total_movements": counts.movements,
            "total_uploads": counts.uploads,
        }))
        .into_response(),
        Err(e) => {
            error!("Health check failed: {}", e);
            error_response(StatusCode::SERVICE_UNAVAILABLE, e.to_string())
        }
    }
}

async fn upload_batch(State(state): State<AppState>, multipart: Multipart) -> Response {
    let form = match UploadForm::read(multipart, "files").await {
        Ok(form) => form,
        Err(response) => return response,
    };
    if form.files.is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "No files were sent".to_string());
    }

    let options = form.options(state.config.default_model);
    let report = state
        .processor
        .process_batch(form.files, &options, None)
        .await;

    let status = batch_status(&report);
    (status, Json(batch_body(&report, options.model))).into_response()
}

async fn analyze_pdf(State(state): State<AppState>, multipart: Multipart) -> Response {
    let mut form = match UploadForm::read(multipart, "file").await {
        Ok(form) => form,
        Err(response) => return response,
    };
    let Some(document) = form.files.pop() else {
        return error_response(StatusCode::BAD_REQUEST, "No file was sent".to_string());
    };

    let options = form.options(ModelId::Gpt4o);
    let outcome = state
        .processor
        .process_document(document, &options, None)
        .await;

    match outcome.result {
        Ok(records) => Json(json!({
            "status": "success",
            "filename": outcome.filename,
            "model": options.model,
            "data": records,
        }))
        .into_response(),
        Err(e) => {
            let message = format!("{}: {}", outcome.filename, e);
            let mut response = error_response(status_for(&e), message);
            if let Ok(kind) = HeaderValue::from_str(e.kind()) {
                response.headers_mut().insert("x-error-kind", kind);
            }
            response
        }
    }
}

#[derive(Debug, Deserialize)]
struct MovementFilter {
    competency: Option<String>,
    project_code: Option<String>,
}

async fn list_movements(
    State(state): State<AppState>,
    Query(filter): Query<MovementFilter>,
) -> Response {
    match state
        .store
        .list_movements(filter.competency.as_deref(), filter.project_code.as_deref())
        .await
    {
        Ok(rows) => Json(json!({
            "status": "success",
            "count": rows.len(),
            "data": rows,
        }))
        .into_response(),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

async fn summary(State(state): State<AppState>) -> Response {
    match state.store.project_summary().await {
        Ok(summary) => Json(json!({ "status": "success", "summary": summary })).into_response(),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

/// 200 when at least one document made it through, 400 otherwise.
pub fn batch_status(report: &BatchReport) -> StatusCode {
    if report.any_processed() {
        StatusCode::OK
    } else {
        StatusCode::BAD_REQUEST
    }
}

pub fn batch_body(report: &BatchReport, model: ModelId) -> serde_json::Value {
    let status = match (report.processed.is_empty(), report.failed.is_empty()) {
        (false, true) => "success",
        (false, false) => "partial",
        _ => "error",
    };

    json!({
        "status": status,
        "model": model,
        "message": format!(
            "{} document(s) processed, {} failed",
            report.processed.len(),
            report.failed.len()
        ),
        "processed": report.processed,
        "errors": report.failed,
    })
}

/// Status code for a single-document failure.
pub fn status_for(error: &IngestError) -> StatusCode {
    match error {
        IngestError::ModelInvocation(_) => StatusCode::BAD_GATEWAY,
        IngestError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        IngestError::Storage(_) | IngestError::Io(_) | IngestError::Serialization(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
        _ => StatusCode::BAD_REQUEST,
    }
}

fn error_response(status: StatusCode, message: String) -> Response {
    (status, Json(json!({ "status": "error", "message": message }))).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::DocumentOutcome;

    fn failure(filename: &str, error: IngestError) -> DocumentOutcome {
        DocumentOutcome {
            filename: filename.to_string(),
            result: Err(error),
        }
    }

    #[test]
    fn test_batch_status_codes() {
        let mut report = BatchReport::default();
        report.push(failure("a.pdf", IngestError::UnreadablePdf("empty".into())));
        assert_eq!(batch_status(&report), StatusCode::BAD_REQUEST);
        assert_eq!(batch_body(&report, ModelId::Gpt5)["status"], "error");

        report.push(DocumentOutcome {
            filename: "b.pdf".to_string(),
            result: Ok(Vec::new()),
        });
        assert_eq!(batch_status(&report), StatusCode::OK);
        let body = batch_body(&report, ModelId::Gpt5);
        assert_eq!(body["status"], "partial");
        assert_eq!(body["model"], "gpt-5");
        assert_eq!(body["errors"][0]["kind"], "unreadable_pdf");
        assert_eq!(body["errors"][0]["message"], "a.pdf: Unreadable PDF: empty");
    }

    #[test]
    fn test_single_document_status_codes() {
        assert_eq!(
            status_for(&IngestError::ModelInvocation("boom".into())),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            status_for(&IngestError::MissingRequiredField {
                field: "competency",
                index: 0
            }),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_for(&IngestError::UnreadablePdf("scan".into())),
            StatusCode::BAD_REQUEST
        );
    }

    #[test]
    fn test_invalid_cors_origins_are_skipped() {
        let _layer = cors_layer(&["http://localhost:3000".to_string(), "bad\norigin".to_string()]);
    }
}
