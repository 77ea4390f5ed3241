use thiserror::Error;

#[derive(Error, Debug)]
pub enum IngestError {
    #[error("Unreadable PDF: {0}")]
    UnreadablePdf(String),

    #[error("Model invocation failed: {0}")]
    ModelInvocation(String),

    #[error("Model output is not valid JSON: {reason}. Output: {snippet}")]
    UnparsableModelOutput { reason: String, snippet: String },

    #[error("Missing required field '{field}' in extracted record #{index}")]
    MissingRequiredField { field: &'static str, index: usize },

    #[error("Invalid upload '{filename}': {reason}")]
    InvalidUpload { filename: String, reason: String },

    #[error("Invalid competency period '{0}': expected MM/YYYY")]
    InvalidCompetency(String),

    #[error("Document processing timed out after {0} seconds")]
    Timeout(u64),

    #[error("Storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl IngestError {
    /// Stable tag used when reporting per-document failures.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::UnreadablePdf(_) => "unreadable_pdf",
            Self::ModelInvocation(_) => "model_invocation_error",
            Self::UnparsableModelOutput { .. } => "unparsable_model_output",
            Self::MissingRequiredField { .. } => "missing_required_field",
            Self::InvalidUpload { .. } => "invalid_upload",
            Self::InvalidCompetency(_) => "invalid_competency",
            Self::Timeout(_) => "timeout",
            Self::Storage(_) => "storage_error",
            Self::Serialization(_) => "serialization_error",
            Self::Io(_) => "io_error",
        }
    }
}

impl From<reqwest::Error> for IngestError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::ModelInvocation(format!("request timed out: {}", err))
        } else {
            Self::ModelInvocation(err.to_string())
        }
    }
}

pub type Result<T> = std::result::Result<T, IngestError>;
