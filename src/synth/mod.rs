//! Query synthesis: one model call (with bounded retries) followed by
//! candidate extraction.
mod extract;
mod model;
mod safety;

pub use extract::extract_candidate;
pub(crate) use extract::mask_literals;
pub use model::{
    build_model, AnthropicModel, CompletionRequest, LanguageModel, ModelEndpoint, ModelProvider, OpenAiModel,
    ANTHROPIC_BASE_URL, OPENAI_BASE_URL,
};
pub use safety::{validate, QueryCandidate, SafetyMode, ValidatedCandidate};

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::backend::Backend;
use crate::error::{ModelError, SynthesisError};
use crate::prompt::Prompt;

pub const DEFAULT_MAX_TOKENS: u32 = 1024;
pub const DEFAULT_MODEL_RETRIES: u32 = 2;
pub const DEFAULT_BACKOFF: Duration = Duration::from_millis(250);
pub const DEFAULT_MODEL_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq)]
pub struct SynthesizerConfig {
    /// 0.0 requests minimum-variance output.
    pub temperature: f32,
    pub max_tokens: u32,
    pub seed: Option<u64>,
    /// Extra attempts after a retryable model failure.
    pub max_retries: u32,
    /// First backoff delay; doubles per attempt.
    pub backoff: Duration,
    pub timeout: Duration,
}

impl Default for SynthesizerConfig {
    fn default() -> Self {
        Self {
            temperature: 0.0,
            max_tokens: DEFAULT_MAX_TOKENS,
            seed: None,
            max_retries: DEFAULT_MODEL_RETRIES,
            backoff: DEFAULT_BACKOFF,
            timeout: DEFAULT_MODEL_TIMEOUT,
        }
    }
}

pub struct Synthesizer {
    model: Arc<dyn LanguageModel>,
    config: SynthesizerConfig,
}

impl Synthesizer {
    pub fn new(model: Arc<dyn LanguageModel>, config: SynthesizerConfig) -> Self {
        Self { model, config }
    }

    pub fn model_name(&self) -> &str {
        self.model.name()
    }

    pub async fn synthesize(&self, prompt: &Prompt, backend: Backend) -> Result<QueryCandidate, SynthesisError> {
        let request = CompletionRequest {
            system: prompt.system.clone(),
            user: prompt.user.clone(),
            temperature: self.config.temperature,
            max_tokens: self.config.max_tokens,
            seed: self.config.seed,
        };
        let response = self.complete_with_retry(&request).await?;
        debug!(model = self.model.name(), chars = response.len(), "model responded");
        let text = extract_candidate(&response, backend)?;
        Ok(QueryCandidate::generated(backend, text))
    }

    async fn complete_with_retry(&self, request: &CompletionRequest) -> Result<String, ModelError> {
        let mut attempt = 0;
        loop {
            let outcome = match tokio::time::timeout(self.config.timeout, self.model.complete(request)).await {
                Ok(outcome) => outcome,
                Err(_) => Err(ModelError::Timeout(self.config.timeout.as_secs())),
            };
            match outcome {
                Ok(response) => return Ok(response),
                Err(e) if e.is_retryable() && attempt < self.config.max_retries => {
                    let delay = self.config.backoff.saturating_mul(1 << attempt.min(16));
                    warn!(
                        model = self.model.name(),
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "model call failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
