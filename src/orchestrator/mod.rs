//! Request pipeline: schema → prompt → synthesis → validation → execution.
//!
//! Each request runs its stages strictly in order; the only state shared
//! between requests is the schema cache and the pooled connectors.
mod state;

pub use state::{RequestState, RequestTracker, Transition};

use anyhow::Context;
use futures::future::{BoxFuture, FutureExt};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

use crate::backend::{Backend, BackendDescriptor, DialectFamily};
use crate::config::{Config, DEFAULT_SYNTAX_RETRY_BUDGET};
use crate::connector::{ConnectionProfile, ConnectorFactory, ConnectorRegistry, Row};
use crate::error::{ConnectorError, ErrorRecord, ExecutionError, FailureKind};
use crate::executor::{ExecutionResult, Executor};
use crate::prompt::{build_prompt, PriorAttempt, PromptBudget, PromptInput};
use crate::schema::{SchemaCache, SchemaDescriptor};
use crate::synth::{build_model, validate, SafetyMode, Synthesizer};

/// A caller's request.
#[derive(Debug, Clone, Deserialize)]
pub struct TranslateRequest {
    pub text: String,
    /// When given, must match the backend's family.
    #[serde(default)]
    pub dialect_family: Option<DialectFamily>,
    pub backend: Backend,
    /// Profile name; defaults to the first profile configured for `backend`.
    #[serde(default)]
    pub profile: Option<String>,
    #[serde(default)]
    pub execute: bool,
}

impl TranslateRequest {
    pub fn new(text: impl Into<String>, backend: Backend) -> Self {
        Self {
            text: text.into(),
            dialect_family: Some(backend.family()),
            backend,
            profile: None,
            execute: false,
        }
    }

    pub fn with_profile(mut self, profile: impl Into<String>) -> Self {
        self.profile = Some(profile.into());
        self
    }

    pub fn executing(mut self) -> Self {
        self.execute = true;
        self
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ResponseMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub row_count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub elapsed_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stale_schema: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub truncated: Option<bool>,
    /// Corrected attempts made after syntax errors.
    pub retries: u32,
    /// Deny-list reason when advisory mode let the candidate through.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub safety_warning: Option<String>,
    pub final_state: RequestState,
    pub transitions: Vec<Transition>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TranslateResponse {
    /// Generated query text; present whenever a candidate was produced.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
    pub executed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub results: Option<Vec<Row>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorRecord>,
    pub metadata: ResponseMetadata,
}

impl TranslateResponse {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RefreshResponse {
    pub success: bool,
    pub collections_found: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorRecord>,
}

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub syntax_retry_budget: u32,
    pub safety: SafetyMode,
    pub budget: PromptBudget,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            syntax_retry_budget: DEFAULT_SYNTAX_RETRY_BUDGET,
            safety: SafetyMode::Gate,
            budget: PromptBudget::default(),
        }
    }
}

/// What a finished request carries into its response.
#[derive(Default)]
struct Outcome {
    query: Option<String>,
    result: Option<ExecutionResult>,
    error: Option<ErrorRecord>,
    stale_schema: Option<bool>,
    retries: u32,
    safety_warning: Option<String>,
}

pub struct Orchestrator {
    profiles: Vec<ConnectionProfile>,
    factory: Arc<dyn ConnectorFactory>,
    cache: SchemaCache,
    synthesizer: Synthesizer,
    executor: Executor,
    settings: OrchestratorSettings,
    next_request_id: AtomicU64,
}

impl Orchestrator {
    pub fn new(
        profiles: Vec<ConnectionProfile>,
        factory: Arc<dyn ConnectorFactory>,
        cache: SchemaCache,
        synthesizer: Synthesizer,
        executor: Executor,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            profiles,
            factory,
            cache,
            synthesizer,
            executor,
            settings,
            next_request_id: AtomicU64::new(1),
        }
    }

    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let model = build_model(config.model.endpoint()).context("Failed to build language model client")?;
        let factory = Arc::new(ConnectorRegistry::new(config.execution.connector_settings()));
        let synthesizer = Synthesizer::new(model, config.model.synthesizer());
        info!(
            model = synthesizer.model_name(),
            profiles = config.profiles.len(),
            "orchestrator configured"
        );
        Ok(Self::new(
            config.profiles.clone(),
            factory,
            config.schema_cache(),
            synthesizer,
            Executor::new(config.execution.limits()),
            OrchestratorSettings {
                syntax_retry_budget: config.execution.syntax_retry_budget,
                safety: config.safety.mode,
                budget: config.prompt_budget(),
            },
        ))
    }

    pub fn cache(&self) -> &SchemaCache {
        &self.cache
    }

    fn profile_named(&self, name: &str) -> Result<&ConnectionProfile, ErrorRecord> {
        self.profiles
            .iter()
            .find(|p| p.name == name)
            .ok_or_else(|| ErrorRecord::configuration(format!("no profile named \"{name}\"")))
    }

    fn resolve_profile(&self, request: &TranslateRequest) -> Result<&ConnectionProfile, ErrorRecord> {
        if let Some(family) = request.dialect_family {
            if family != request.backend.family() {
                return Err(ErrorRecord::configuration(format!(
                    "backend {} belongs to the {} family, not {}",
                    request.backend,
                    request.backend.family(),
                    family
                )));
            }
        }
        let profile = match &request.profile {
            Some(name) => self.profile_named(name)?,
            None => self
                .profiles
                .iter()
                .find(|p| p.backend == request.backend)
                .ok_or_else(|| {
                    ErrorRecord::configuration(format!("no profile configured for backend {}", request.backend))
                })?,
        };
        if profile.backend != request.backend {
            return Err(ErrorRecord::configuration(format!(
                "profile \"{}\" is for backend {}, not {}",
                profile.name, profile.backend, request.backend
            )));
        }
        Ok(profile)
    }

    pub async fn translate(&self, request: TranslateRequest) -> TranslateResponse {
        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let mut tracker = RequestTracker::new(request_id);
        let outcome = self.run(&request, &mut tracker).await;
        respond(tracker, outcome)
    }

    async fn run(&self, request: &TranslateRequest, tracker: &mut RequestTracker) -> Outcome {
        let mut outcome = Outcome::default();

        if request.text.trim().is_empty() {
            tracker.advance("orchestrator", RequestState::SchemaFailed);
            outcome.error = Some(ErrorRecord::configuration("the request text is empty"));
            return outcome;
        }
        let profile = match self.resolve_profile(request) {
            Ok(profile) => profile,
            Err(record) => {
                tracker.advance("orchestrator", RequestState::SchemaFailed);
                outcome.error = Some(record);
                return outcome;
            }
        };

        let key = profile.cache_key();
        let lookup = self.cache.get_or_introspect(&key, self.introspector(profile)).await;
        let schema = match lookup {
            Ok(lookup) => {
                outcome.stale_schema = Some(lookup.is_stale());
                lookup.schema()
            }
            Err(e) => {
                debug!(cache_key = %key, error = %e, "schema unavailable");
                tracker.advance("schema_cache", RequestState::SchemaFailed);
                outcome.error = Some(ErrorRecord::from_schema_failure(&e));
                return outcome;
            }
        };
        tracker.advance("schema_cache", RequestState::SchemaReady);

        let mut prior: Option<PriorAttempt> = None;
        loop {
            let prompt = build_prompt(&PromptInput {
                request: &request.text,
                schema: &schema,
                backend: request.backend,
                prior: prior.as_ref(),
                budget: self.settings.budget,
            });

            let candidate = match self.synthesizer.synthesize(&prompt, request.backend).await {
                Ok(candidate) => candidate,
                Err(e) => {
                    debug!(error = %e, "synthesis failed");
                    tracker.advance("synthesizer", RequestState::SynthesisFailed);
                    outcome.error = Some(ErrorRecord::from_synthesis(&e));
                    outcome.query = prior.map(|p| p.candidate);
                    return outcome;
                }
            };
            tracker.advance("synthesizer", RequestState::CandidateGenerated);
            outcome.query = Some(candidate.text().to_string());

            let validated = match validate(candidate, self.settings.safety) {
                Ok(validated) => validated,
                Err(rejected) => {
                    info!(reason = %rejected.reason, "candidate rejected by deny-list");
                    tracker.advance("validator", RequestState::SynthesisFailed);
                    outcome.error = Some(ErrorRecord::from_rejection(&rejected));
                    return outcome;
                }
            };
            outcome.safety_warning = validated.warning().map(str::to_string);

            if !request.execute {
                tracker.advance("orchestrator", RequestState::ReturnedUnexecuted);
                return outcome;
            }

            let connector = match self.factory.connector(profile).await {
                Ok(connector) => connector,
                Err(e) => {
                    debug!(profile = %profile.name, error = %e, "connector unavailable");
                    tracker.advance("connector", RequestState::ExecutionFailed);
                    let error = ExecutionError {
                        kind: e.kind,
                        candidate: validated.into_text(),
                        backend_message: e.message,
                    };
                    outcome.error = Some(ErrorRecord::from_execution(&error, outcome.retries));
                    outcome.query = Some(error.candidate);
                    return outcome;
                }
            };

            match self.executor.execute(validated, connector.as_ref()).await {
                Ok(result) => {
                    tracker.advance("executor", RequestState::Executed);
                    outcome.result = Some(result);
                    return outcome;
                }
                Err(e) => {
                    tracker.advance("executor", RequestState::ExecutionFailed);
                    if e.kind == FailureKind::Syntax && outcome.retries < self.settings.syntax_retry_budget {
                        outcome.retries += 1;
                        info!(retry = outcome.retries, "backend rejected candidate, retrying with error context");
                        prior = Some(PriorAttempt {
                            candidate: e.candidate,
                            error: e.backend_message,
                        });
                        continue;
                    }
                    outcome.error = Some(ErrorRecord::from_execution(&e, outcome.retries));
                    outcome.query = Some(e.candidate);
                    return outcome;
                }
            }
        }
    }

    /// Fetch closure for the schema cache. The connector is only obtained
    /// when the cache actually needs to introspect.
    fn introspector(
        &self,
        profile: &ConnectionProfile,
    ) -> impl FnOnce() -> BoxFuture<'static, Result<SchemaDescriptor, ConnectorError>> {
        let factory = Arc::clone(&self.factory);
        let profile = profile.clone();
        move || {
            async move {
                let connector = factory.connector(&profile).await?;
                connector.introspect_schema().await
            }
            .boxed()
        }
    }

    /// Force a fresh introspection for the named profile.
    pub async fn refresh_schema(&self, profile_name: &str) -> RefreshResponse {
        let failed = |error: ErrorRecord| RefreshResponse {
            success: false,
            collections_found: 0,
            error: Some(error),
        };
        let profile = match self.profile_named(profile_name) {
            Ok(profile) => profile,
            Err(record) => return failed(record),
        };
        match self.cache.refresh(&profile.cache_key(), self.introspector(profile)).await {
            Ok(entry) => RefreshResponse {
                success: true,
                collections_found: entry.schema.collection_count(),
                error: None,
            },
            Err(e) => failed(ErrorRecord::from_schema_failure(&e)),
        }
    }

    /// Close pooled connections. Cached schemas are kept.
    pub async fn shutdown(&self) {
        self.factory.close_all().await;
    }

    /// Supported backends and their static descriptors.
    pub fn backends(&self) -> &'static [BackendDescriptor] {
        crate::backend::descriptors()
    }

    /// Drop the cached schema for the named profile.
    pub fn invalidate_schema(&self, profile_name: &str) -> Result<(), ErrorRecord> {
        let profile = self.profile_named(profile_name)?;
        self.cache.invalidate(&profile.cache_key());
        Ok(())
    }
}

fn respond(tracker: RequestTracker, outcome: Outcome) -> TranslateResponse {
    let final_state = tracker.state();
    let elapsed_ms = tracker.elapsed_ms();
    let executed = final_state == RequestState::Executed;
    let (results, row_count, truncated) = match outcome.result {
        Some(result) => (Some(result.rows), Some(result.row_count), Some(result.truncated)),
        None => (None, None, None),
    };
    TranslateResponse {
        query: outcome.query,
        executed,
        results,
        error: outcome.error,
        metadata: ResponseMetadata {
            row_count,
            elapsed_ms: Some(elapsed_ms),
            stale_schema: outcome.stale_schema,
            truncated,
            retries: outcome.retries,
            safety_warning: outcome.safety_warning,
            final_state,
            transitions: tracker.into_transitions(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_translate_request_deserializes_with_defaults() {
        let request: TranslateRequest = serde_json::from_value(json!({
            "text": "list orders",
            "backend": "postgres"
        }))
        .unwrap();
        assert!(!request.execute);
        assert!(request.profile.is_none());
        assert!(request.dialect_family.is_none());

        let request: TranslateRequest = serde_json::from_value(json!({
            "text": "friends of Ada",
            "dialect_family": "graph",
            "backend": "neo4j",
            "execute": true
        }))
        .unwrap();
        assert_eq!(request.dialect_family, Some(DialectFamily::Graph));
        assert!(request.execute);
    }

    #[test]
    fn test_response_omits_absent_fields() {
        let mut tracker = RequestTracker::new(1);
        tracker.advance("schema_cache", RequestState::SchemaReady);
        tracker.advance("synthesizer", RequestState::CandidateGenerated);
        tracker.advance("orchestrator", RequestState::ReturnedUnexecuted);
        let response = respond(
            tracker,
            Outcome {
                query: Some("SELECT 1".into()),
                stale_schema: Some(false),
                ..Outcome::default()
            },
        );
        let value = serde_json::to_value(&response).unwrap();
        assert_eq!(value["query"], "SELECT 1");
        assert_eq!(value["executed"], false);
        assert!(value.get("results").is_none());
        assert!(value.get("error").is_none());
        assert_eq!(value["metadata"]["final_state"], "RETURNED_UNEXECUTED");
        assert_eq!(value["metadata"]["transitions"].as_array().unwrap().len(), 4);
    }
}
