use crate::config::ModelId;
use serde::{Deserialize, Serialize};

/// Progress notifications emitted while a document moves through the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ExtractionEvent {
    Starting { filename: String },
    ExtractingText { filename: String },
    InvokingModel { filename: String, model: ModelId },
    Normalizing { filename: String },
    Validating { filename: String },
    AuditRequired { filename: String, project_code: String },
    Persisting { filename: String, records: usize },
    Success { filename: String, records: usize },
    Failed { filename: String, reason: String },
}

/// Everything a call shape needs to issue one completion.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelRequest {
    pub system_instruction: String,
    pub user_content: String,
    pub model: ModelId,
    pub max_output_tokens: u32,
}

impl ModelRequest {
    pub fn new(
        system_instruction: impl Into<String>,
        user_content: impl Into<String>,
        model: ModelId,
        requested_tokens: Option<u32>,
    ) -> Self {
        Self {
            system_instruction: system_instruction.into(),
            user_content: user_content.into(),
            model,
            max_output_tokens: model.clamp_tokens(requested_tokens),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    Length,
    ContentFilter,
    Other,
}

impl FinishReason {
    pub fn from_api(reason: Option<&str>) -> Self {
        match reason {
            Some("stop") | Some("completed") | None => Self::Stop,
            Some("length") | Some("max_output_tokens") => Self::Length,
            Some("content_filter") => Self::ContentFilter,
            Some(_) => Self::Other,
        }
    }
}

/// The common response contract both call shapes are adapted into.
#[derive(Debug, Clone, PartialEq)]
pub struct UnifiedResponse {
    pub content: String,
    pub finish_reason: FinishReason,
    pub model: ModelId,
}

// --- Unified-input (responses) wire format ---

#[derive(Debug, Serialize)]
pub(crate) struct ResponsesRequest<'a> {
    pub model: &'a str,
    pub input: String,
    pub max_output_tokens: u32,
    pub reasoning: ReasoningOptions,
    pub text: TextOptions,
}

#[derive(Debug, Serialize)]
pub(crate) struct ReasoningOptions {
    pub effort: &'static str,
}

#[derive(Debug, Serialize)]
pub(crate) struct TextOptions {
    pub verbosity: &'static str,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ResponsesResponse {
    #[serde(default)]
    pub output_text: Option<String>,
    #[serde(default)]
    pub output: Vec<ResponsesOutputItem>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub incomplete_details: Option<IncompleteDetails>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ResponsesOutputItem {
    #[serde(default)]
    pub content: Vec<ResponsesContentPart>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ResponsesContentPart {
    #[serde(default)]
    pub text: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct IncompleteDetails {
    #[serde(default)]
    pub reason: Option<String>,
}

impl ResponsesResponse {
    /// Aggregated `output_text` when the backend provides it, otherwise the
    /// concatenated text parts of every output item.
    pub fn text(&self) -> String {
        if let Some(text) = self.output_text.as_deref().filter(|t| !t.trim().is_empty()) {
            return text.to_string();
        }
        self.output
            .iter()
            .flat_map(|item| item.content.iter())
            .filter_map(|part| part.text.as_deref())
            .collect::<Vec<_>>()
            .join("")
    }

    pub fn finish_reason(&self) -> FinishReason {
        match self.status.as_deref() {
            Some("incomplete") => FinishReason::from_api(
                self.incomplete_details
                    .as_ref()
                    .and_then(|d| d.reason.as_deref())
                    .or(Some("incomplete")),
            ),
            other => FinishReason::from_api(other),
        }
    }
}

// --- Message-list (chat completions) wire format ---

#[derive(Debug, Clone, Serialize)]
pub(crate) struct ChatMessage<'a> {
    pub role: &'static str,
    pub content: &'a str,
}

#[derive(Debug, Serialize)]
pub(crate) struct ChatRequest<'a> {
    pub model: &'a str,
    pub messages: Vec<ChatMessage<'a>>,
    pub temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_completion_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ChatResponse {
    #[serde(default)]
    pub choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ChatChoice {
    pub message: ChatChoiceMessage,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ChatChoiceMessage {
    #[serde(default)]
    pub content: Option<String>,
}
