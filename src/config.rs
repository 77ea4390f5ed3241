use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_API_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_DATABASE_PATH: &str = "data/historico.db";

/// Models the extraction pipeline accepts. Anything else resolves to the
/// configured default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ModelId {
    #[serde(rename = "gpt-5")]
    Gpt5,
    #[serde(rename = "gpt-4o")]
    Gpt4o,
    #[serde(rename = "gpt-4")]
    Gpt4,
    #[serde(rename = "gpt-3.5-turbo")]
    Gpt35Turbo,
}

impl ModelId {
    pub const ALL: [ModelId; 4] = [Self::Gpt5, Self::Gpt4o, Self::Gpt4, Self::Gpt35Turbo];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Gpt5 => "gpt-5",
            Self::Gpt4o => "gpt-4o",
            Self::Gpt4 => "gpt-4",
            Self::Gpt35Turbo => "gpt-3.5-turbo",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        let name = name.trim();
        Self::ALL.into_iter().find(|m| m.as_str() == name)
    }

    /// Unknown or missing names fall back to `default`.
    pub fn resolve(name: Option<&str>, default: ModelId) -> Self {
        match name.map(Self::parse) {
            Some(Some(model)) => model,
            Some(None) => {
                log::warn!(
                    "Model '{}' is not supported, using {}",
                    name.unwrap_or_default(),
                    default.as_str()
                );
                default
            }
            None => default,
        }
    }

    /// Current-generation models take a single combined input with reasoning
    /// controls; older ones take a list of role-tagged chat messages.
    pub fn uses_unified_input(&self) -> bool {
        self.as_str().starts_with("gpt-5")
    }

    pub fn default_output_tokens(&self) -> u32 {
        if self.uses_unified_input() {
            6000
        } else {
            2000
        }
    }

    pub fn max_output_tokens(&self) -> u32 {
        if self.uses_unified_input() {
            12000
        } else {
            4000
        }
    }

    pub fn clamp_tokens(&self, requested: Option<u32>) -> u32 {
        requested
            .unwrap_or_else(|| self.default_output_tokens())
            .clamp(1, self.max_output_tokens())
    }
}

impl std::fmt::Display for ModelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Construction-time configuration, passed explicitly to the client, the
/// pipeline and the HTTP server.
#[derive(Debug, Clone)]
pub struct IngestorConfig {
    pub api_key: String,
    pub api_base_url: String,
    pub default_model: ModelId,
    /// Wall-clock bound for one model invocation.
    pub request_timeout: Duration,
    /// Wall-clock bound for one document's whole pipeline.
    pub document_timeout: Duration,
    /// Tokens requested for an extraction, clamped to the model ceiling.
    pub extraction_output_tokens: u32,
    pub max_concurrency: usize,
    pub max_file_size: usize,
    pub database_path: PathBuf,
    pub bind_address: String,
    pub allowed_origins: Vec<String>,
}

impl Default for IngestorConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            default_model: ModelId::Gpt5,
            request_timeout: Duration::from_secs(90),
            document_timeout: Duration::from_secs(300),
            extraction_output_tokens: 6000,
            max_concurrency: 3,
            max_file_size: 50 * 1024 * 1024,
            database_path: PathBuf::from(DEFAULT_DATABASE_PATH),
            bind_address: "0.0.0.0:8080".to_string(),
            allowed_origins: vec![
                "http://localhost:3000".to_string(),
                "http://localhost:5173".to_string(),
                "http://localhost:8080".to_string(),
            ],
        }
    }
}

impl IngestorConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            ..Self::default()
        }
    }

    /// Reads overrides from the process environment. Unparseable values keep
    /// the default.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(key) = env::var("OPENAI_API_KEY") {
            config.api_key = key;
        }
        if let Ok(url) = env::var("OPENAI_BASE_URL") {
            config.api_base_url = url.trim_end_matches('/').to_string();
        }
        if let Ok(model) = env::var("INGESTOR_MODEL") {
            config.default_model = ModelId::resolve(Some(&model), config.default_model);
        }
        if let Some(secs) = parse_var::<u64>("OPENAI_TIMEOUT") {
            config.request_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_var::<u64>("DOCUMENT_TIMEOUT") {
            config.document_timeout = Duration::from_secs(secs);
        }
        if let Some(tokens) = parse_var::<u32>("EXTRACTION_MAX_TOKENS") {
            config.extraction_output_tokens = tokens;
        }
        if let Some(limit) = parse_var::<usize>("MAX_CONCURRENCY") {
            config.max_concurrency = limit.max(1);
        }
        if let Some(size) = parse_var::<usize>("MAX_FILE_SIZE") {
            config.max_file_size = size;
        }
        if let Ok(path) = env::var("DATABASE_PATH") {
            config.database_path = PathBuf::from(path);
        }
        if let Ok(addr) = env::var("BIND_ADDRESS") {
            config.bind_address = addr;
        }
        if let Ok(origins) = env::var("ALLOWED_ORIGINS") {
            config.allowed_origins = origins
                .split(',')
                .map(|o| o.trim().to_string())
                .filter(|o| !o.is_empty())
                .collect();
        }

        config
    }

    pub fn has_api_key(&self) -> bool {
        !self.api_key.trim().is_empty()
    }
}

fn parse_var<T: std::str::FromStr>(name: &str) -> Option<T> {
    let raw = env::var(name).ok()?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            log::warn!("Ignoring invalid value for {}: '{}'", name, raw);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_resolution_falls_back() {
        assert_eq!(ModelId::resolve(Some("gpt-4o"), ModelId::Gpt5), ModelId::Gpt4o);
        assert_eq!(ModelId::resolve(Some("claude"), ModelId::Gpt5), ModelId::Gpt5);
        assert_eq!(ModelId::resolve(None, ModelId::Gpt4o), ModelId::Gpt4o);
    }

    #[test]
    fn test_token_budget_is_clamped_per_model() {
        assert_eq!(ModelId::Gpt5.clamp_tokens(None), 6000);
        assert_eq!(ModelId::Gpt5.clamp_tokens(Some(50_000)), 12000);
        assert_eq!(ModelId::Gpt4o.clamp_tokens(None), 2000);
        assert_eq!(ModelId::Gpt4o.clamp_tokens(Some(6000)), 4000);
        assert_eq!(ModelId::Gpt35Turbo.clamp_tokens(Some(0)), 1);
    }

    #[test]
    fn test_call_shape_by_prefix() {
        assert!(ModelId::Gpt5.uses_unified_input());
        assert!(!ModelId::Gpt4.uses_unified_input());
    }
}
