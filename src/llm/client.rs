use crate::config::{IngestorConfig, ModelId};
use crate::error::{IngestError, Result};
use crate::llm::types::*;
use async_trait::async_trait;
use log::{debug, info, warn};
use reqwest::Client;
use serde::Serialize;
use std::time::{Duration, Instant};

/// Anything able to turn a prompt into a completion. The pipeline depends on
/// this trait only, so tests can script responses without a network.
#[async_trait]
pub trait ModelInvoker: Send + Sync {
    async fn invoke(&self, request: &ModelRequest) -> Result<UnifiedResponse>;
}

/// Authenticated HTTP access shared by both call shapes.
#[derive(Clone)]
pub struct ApiTransport {
    client: Client,
    api_key: String,
    base_url: String,
}

impl ApiTransport {
    async fn post_json<T: Serialize + ?Sized>(&self, path: &str, payload: &T) -> Result<String> {
        let url = format!("{}/{}", self.base_url.trim_end_matches('/'), path);
        let res = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(payload)
            .send()
            .await?;

        let status = res.status();
        let body = res.text().await?;
        if !status.is_success() {
            return Err(IngestError::ModelInvocation(format!(
                "API error (status {}): {}",
                status,
                upstream_message(&body)
            )));
        }
        Ok(body)
    }
}

/// One way of talking to a model family.
#[async_trait]
pub trait CallShape: Send + Sync {
    fn name(&self) -> &'static str;

    async fn call(&self, transport: &ApiTransport, request: &ModelRequest)
        -> Result<UnifiedResponse>;
}

/// Current-generation models: system and user content travel as one input,
/// with low reasoning effort and high verbosity.
pub struct UnifiedInputShape;

#[async_trait]
impl CallShape for UnifiedInputShape {
    fn name(&self) -> &'static str {
        "unified-input"
    }

    async fn call(
        &self,
        transport: &ApiTransport,
        request: &ModelRequest,
    ) -> Result<UnifiedResponse> {
        let payload = ResponsesRequest {
            model: request.model.as_str(),
            input: format!(
                "INSTRUCTIONS:\n{}\n\nCONTENT:\n{}",
                request.system_instruction, request.user_content
            ),
            max_output_tokens: request.max_output_tokens,
            reasoning: ReasoningOptions { effort: "low" },
            text: TextOptions { verbosity: "high" },
        };

        let body = transport.post_json("responses", &payload).await?;
        let parsed: ResponsesResponse = serde_json::from_str(&body).map_err(|e| {
            IngestError::ModelInvocation(format!("Unexpected response body: {}", e))
        })?;

        Ok(UnifiedResponse {
            content: parsed.text(),
            finish_reason: parsed.finish_reason(),
            model: request.model,
        })
    }
}

/// Legacy chat models: role-tagged messages. Newer backends want
/// `max_completion_tokens`, older ones only know `max_tokens`.
pub struct MessageListShape {
    pub temperature: f32,
}

impl Default for MessageListShape {
    fn default() -> Self {
        Self { temperature: 0.7 }
    }
}

impl MessageListShape {
    async fn send(
        &self,
        transport: &ApiTransport,
        request: &ModelRequest,
        legacy_limit: bool,
    ) -> Result<String> {
        let (max_completion_tokens, max_tokens) = if legacy_limit {
            (None, Some(request.max_output_tokens))
        } else {
            (Some(request.max_output_tokens), None)
        };

        let payload = ChatRequest {
            model: request.model.as_str(),
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: &request.system_instruction,
                },
                ChatMessage {
                    role: "user",
                    content: &request.user_content,
                },
            ],
            temperature: self.temperature,
            max_completion_tokens,
            max_tokens,
        };

        transport.post_json("chat/completions", &payload).await
    }
}

#[async_trait]
impl CallShape for MessageListShape {
    fn name(&self) -> &'static str {
        "message-list"
    }

    async fn call(
        &self,
        transport: &ApiTransport,
        request: &ModelRequest,
    ) -> Result<UnifiedResponse> {
        let body = match self.send(transport, request, false).await {
            Ok(body) => body,
            Err(IngestError::ModelInvocation(msg)) if rejects_token_parameter(&msg) => {
                warn!(
                    "{} rejected max_completion_tokens, retrying with max_tokens",
                    request.model
                );
                self.send(transport, request, true).await?
            }
            Err(e) => return Err(e),
        };

        let parsed: ChatResponse = serde_json::from_str(&body).map_err(|e| {
            IngestError::ModelInvocation(format!("Unexpected response body: {}", e))
        })?;
        let choice = parsed.choices.into_iter().next().ok_or_else(|| {
            IngestError::ModelInvocation("Empty choices list".to_string())
        })?;

        Ok(UnifiedResponse {
            content: choice.message.content.unwrap_or_default(),
            finish_reason: FinishReason::from_api(choice.finish_reason.as_deref()),
            model: request.model,
        })
    }
}

/// OpenAI-compatible client dispatching each request to the call shape its
/// model requires.
pub struct OpenAiClient {
    transport: ApiTransport,
    unified: UnifiedInputShape,
    message_list: MessageListShape,
    request_timeout: Duration,
}

impl OpenAiClient {
    pub fn new(config: &IngestorConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| IngestError::ModelInvocation(format!("HTTP client setup failed: {}", e)))?;

        Ok(Self {
            transport: ApiTransport {
                client,
                api_key: config.api_key.clone(),
                base_url: config.api_base_url.clone(),
            },
            unified: UnifiedInputShape,
            message_list: MessageListShape::default(),
            request_timeout: config.request_timeout,
        })
    }

    pub fn shape_for(&self, model: ModelId) -> &dyn CallShape {
        if model.uses_unified_input() {
            &self.unified
        } else {
            &self.message_list
        }
    }
}

#[async_trait]
impl ModelInvoker for OpenAiClient {
    async fn invoke(&self, request: &ModelRequest) -> Result<UnifiedResponse> {
        if self.transport.api_key.trim().is_empty() {
            return Err(IngestError::ModelInvocation(
                "API key not configured (set OPENAI_API_KEY)".to_string(),
            ));
        }

        let shape = self.shape_for(request.model);
        info!(
            "Invoking {} via {} call ({} prompt chars, max {} output tokens)",
            request.model,
            shape.name(),
            request.user_content.len(),
            request.max_output_tokens
        );
        let started = Instant::now();

        let response = tokio::time::timeout(self.request_timeout, shape.call(&self.transport, request))
            .await
            .map_err(|_| {
                IngestError::ModelInvocation(format!(
                    "{} did not answer within {} seconds",
                    request.model,
                    self.request_timeout.as_secs()
                ))
            })??;

        debug!(
            "{} answered in {:.1}s ({} chars, {:?})",
            request.model,
            started.elapsed().as_secs_f64(),
            response.content.len(),
            response.finish_reason
        );

        ensure_content(response)
    }
}

/// Empty completions are failures, never an empty record set.
pub fn ensure_content(response: UnifiedResponse) -> Result<UnifiedResponse> {
    if response.content.trim().is_empty() {
        return Err(IngestError::ModelInvocation(format!(
            "{} returned an empty response (finish reason: {:?})",
            response.model, response.finish_reason
        )));
    }
    if response.finish_reason == FinishReason::Length {
        warn!(
            "{} stopped at the output token limit; the JSON may be truncated",
            response.model
        );
    }
    Ok(response)
}

fn rejects_token_parameter(message: &str) -> bool {
    let lower = message.to_lowercase();
    lower.contains("max_completion_tokens")
        || (lower.contains("unsupported") && lower.contains("parameter"))
}

/// Pulls `error.message` out of an OpenAI-style error body, falling back to
/// the raw body.
fn upstream_message(body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| {
            v.get("error")
                .and_then(|e| e.get("message"))
                .and_then(|m| m.as_str())
                .map(str::to_string)
        })
        .unwrap_or_else(|| body.trim().to_string())
}
