//! Typed bridge to an LLM provider, realizing the AgentBridge (C6) of the
//! information market (§4.6).
//!
//! `AgentBridge` is the only component that sees the LLM provider; every
//! other component speaks the typed schemas in this crate
//! ([`InspectionDecision`] for the inspection engine, [`BotOfferDraft`] for
//! LLM-backed bot sellers). Credentials passed via [`CredentialScope`] are
//! set for the duration of one call and restored afterward.
//!
//! Adapted from an OpenRouter chat-completions client: the request/response
//! envelope and retry policy are unchanged in shape; the payload is a strict
//! JSON-schema response instead of free-form tool calls.

pub mod api;

use std::time::{Duration, Instant};

use async_trait::async_trait;
use infonomy_core::error::AgentError;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

pub use api::RetryConfig;

/// Chat completions endpoint. Any OpenAI/OpenRouter-compatible provider can
/// be pointed at via `AgentBridge::with_base_url`.
pub const DEFAULT_CHAT_URL: &str = "https://openrouter.ai/api/v1/chat/completions";

/// Environment variable `CredentialScope` overrides to apply a caller's own
/// provider credential for the duration of one call, instead of the
/// process-wide key `AgentBridge` was constructed with.
pub const API_KEY_ENV: &str = "OPENROUTER_API_KEY";

/// Generate a JSON Schema `serde_json::Value` from a type that implements
/// `schemars::JsonSchema`. Bridges strong Rust types to the
/// `response_format: { type: "json_schema", ... }` field the provider expects.
pub fn json_schema_for<T: JsonSchema>() -> serde_json::Value {
    let schema = schemars::schema_for!(T);
    serde_json::to_value(schema)
        .unwrap_or_else(|_| serde_json::json!({"type": "object", "properties": {}}))
}

// ── Message / request types ─────────────────────────────────────────

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Message {
    pub role: MessageRole,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: content.into(),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub enum ResponseFormatType {
    #[serde(rename = "json_schema")]
    JsonSchema,
}

#[derive(Serialize, Clone, Debug)]
pub struct JsonSchemaSpec {
    pub name: String,
    pub strict: bool,
    pub schema: serde_json::Value,
}

#[derive(Serialize, Clone, Debug)]
pub struct ResponseFormat {
    #[serde(rename = "type")]
    pub fmt_type: ResponseFormatType,
    pub json_schema: JsonSchemaSpec,
}

#[derive(Serialize, Debug, Clone)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<Message>,
    pub max_tokens: u32,
    pub temperature: f32,
    pub response_format: ResponseFormat,
}

#[derive(Deserialize, Debug, Clone)]
pub struct UsageInfo {
    pub prompt_tokens: Option<u32>,
    pub completion_tokens: Option<u32>,
}

#[derive(Deserialize, Debug)]
struct RawChoice {
    message: RawMessage,
}

#[derive(Deserialize, Debug)]
struct RawMessage {
    content: Option<String>,
}

#[derive(Deserialize, Debug)]
struct RawApiError {
    message: String,
}

#[derive(Deserialize, Debug)]
struct RawChatResponse {
    choices: Option<Vec<RawChoice>>,
    usage: Option<UsageInfo>,
    error: Option<RawApiError>,
}

/// A parsed chat completion: raw text content plus token usage.
#[derive(Debug, Clone)]
pub struct ChatCompletion {
    pub content: Option<String>,
    pub usage: Option<UsageInfo>,
}

// ── Credential scoping (§4.6 contract) ──────────────────────────────

/// Scopes a per-call credential override to the lifetime of this guard:
/// sets the named environment variable on construction, restores whatever
/// was there before (or removes it) on drop. Used so one buyer's API key
/// never leaks into another call's environment.
pub struct CredentialScope {
    var: String,
    previous: Option<String>,
}

impl CredentialScope {
    pub fn set(var: impl Into<String>, value: &str) -> Self {
        let var = var.into();
        let previous = std::env::var(&var).ok();
        // SAFETY: scoped to one in-flight agent call; callers don't run two
        // overlapping calls with different credentials against the same
        // variable at once.
        unsafe {
            std::env::set_var(&var, value);
        }
        Self { var, previous }
    }
}

impl Drop for CredentialScope {
    fn drop(&mut self) {
        unsafe {
            match &self.previous {
                Some(v) => std::env::set_var(&self.var, v),
                None => std::env::remove_var(&self.var),
            }
        }
    }
}

// ── InspectionAgent seam ─────────────────────────────────────────────

/// The engine/dispatcher-facing surface of [`AgentBridge`], object-safe so
/// tests can swap in a scripted fake instead of a real `reqwest::Client`
/// (mirrors `infonomy_store::Store`'s own test-double seam).
#[async_trait]
pub trait InspectionAgent: Send + Sync {
    async fn decide_inspection(
        &self,
        request: InspectionPrompt,
        max_validation_retries: u32,
        credential: Option<&str>,
    ) -> Result<ValidatedDecision, AgentError>;

    async fn draft_bot_offer(
        &self,
        request: BotOfferPrompt,
        credential: Option<&str>,
    ) -> Result<BotOfferDraft, AgentError>;
}

#[async_trait]
impl InspectionAgent for AgentBridge {
    async fn decide_inspection(
        &self,
        request: InspectionPrompt,
        max_validation_retries: u32,
        credential: Option<&str>,
    ) -> Result<ValidatedDecision, AgentError> {
        AgentBridge::decide_inspection(self, request, max_validation_retries, credential).await
    }

    async fn draft_bot_offer(
        &self,
        request: BotOfferPrompt,
        credential: Option<&str>,
    ) -> Result<BotOfferDraft, AgentError> {
        AgentBridge::draft_bot_offer(self, request, credential).await
    }
}

// ── AgentBridge ──────────────────────────────────────────────────────

/// Async HTTP client for the LLM provider's chat-completions endpoint.
pub struct AgentBridge {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    retry: RetryConfig,
}

impl AgentBridge {
    pub fn new(api_key: impl Into<String>) -> Result<Self, AgentError> {
        Self::with_base_url(api_key, DEFAULT_CHAT_URL, RetryConfig::with_retries(4))
    }

    pub fn with_base_url(
        api_key: impl Into<String>,
        base_url: impl Into<String>,
        retry: RetryConfig,
    ) -> Result<Self, AgentError> {
        let client = reqwest::Client::builder()
            .user_agent("infonomy-agent/0.1")
            .timeout(Duration::from_secs(120))
            .build()
            .map_err(|e| AgentError::Request(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.into(),
            api_key: api_key.into(),
            retry,
        })
    }

    /// Send one chat completion request, retrying transient failures.
    async fn chat(&self, body: &ChatRequest) -> Result<ChatCompletion, AgentError> {
        let mut attempt = 0;
        loop {
            match self.chat_once(body).await {
                Ok(completion) => return Ok(completion),
                Err(err) if attempt < self.retry.max_retries && api::retry::is_transient_error(&err) => {
                    let delay = self.retry.delay_for_attempt(attempt);
                    warn!("agent call transient failure (attempt {attempt}): {err}; retrying in {delay:?}");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(AgentError::Request(err)),
            }
        }
    }

    async fn chat_once(&self, body: &ChatRequest) -> Result<ChatCompletion, String> {
        debug!(
            "agent request: model={}, messages={}, max_tokens={}",
            body.model,
            body.messages.len(),
            body.max_tokens
        );
        let start = Instant::now();

        let api_key = std::env::var(API_KEY_ENV).unwrap_or_else(|_| self.api_key.clone());
        let resp = self
            .client
            .post(&self.base_url)
            .header("Authorization", format!("Bearer {api_key}"))
            .json(body)
            .send()
            .await
            .map_err(|e| format!("request failed: {e}"))?;

        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| format!("failed to read response: {e}"))?;
        trace!("agent response: HTTP {} in {:.1}s", status, start.elapsed().as_secs_f64());

        if !status.is_success() {
            return Err(format!("agent API HTTP {status}: {text}"));
        }

        let parsed: RawChatResponse =
            serde_json::from_str(&text).map_err(|e| format!("failed to parse response: {e}"))?;

        if let Some(err) = parsed.error {
            return Err(format!("agent API error: {}", err.message));
        }

        let content = parsed
            .choices
            .and_then(|c| c.into_iter().next())
            .and_then(|c| c.message.content);

        Ok(ChatCompletion {
            content,
            usage: parsed.usage,
        })
    }

    /// Run the inspection decision call (§4.5 step 3): present the context,
    /// offers, and known info; parse and validate the structured response,
    /// re-prompting with the validation error on failure up to
    /// `max_validation_retries` times.
    pub async fn decide_inspection(
        &self,
        request: InspectionPrompt,
        max_validation_retries: u32,
        credential: Option<&str>,
    ) -> Result<ValidatedDecision, AgentError> {
        let _scope = credential.map(|c| CredentialScope::set(API_KEY_ENV, c));
        let schema = json_schema_for::<InspectionDecision>();
        let system_prompt = request.system_prompt.clone().unwrap_or_else(|| INSPECTION_SYSTEM_PROMPT.to_string());
        let mut messages = vec![Message::system(system_prompt), Message::user(request.render())];

        let mut retries_left = max_validation_retries;
        loop {
            let body = ChatRequest {
                model: request.model.clone(),
                messages: messages.clone(),
                max_tokens: request.max_tokens,
                temperature: request.temperature,
                response_format: ResponseFormat {
                    fmt_type: ResponseFormatType::JsonSchema,
                    json_schema: JsonSchemaSpec {
                        name: "inspection_decision".into(),
                        strict: true,
                        schema: schema.clone(),
                    },
                },
            };

            let completion = self.chat(&body).await?;
            let raw = completion.content.unwrap_or_default();
            match serde_json::from_str::<InspectionDecision>(&raw)
                .map_err(|e| e.to_string())
                .and_then(|d| d.validate(&request))
            {
                Ok(decision) => return Ok(decision),
                Err(validation_err) => {
                    if retries_left == 0 {
                        return Err(AgentError::SchemaInvalid(validation_err));
                    }
                    retries_left -= 1;
                    messages.push(Message::user(format!(
                        "Your previous response was invalid: {validation_err}. \
                         Respond again with a corrected JSON object."
                    )));
                }
            }
        }
    }

    /// Run the bot-seller offer-drafting call (§4.4), for LLM-backed bots.
    pub async fn draft_bot_offer(
        &self,
        request: BotOfferPrompt,
        credential: Option<&str>,
    ) -> Result<BotOfferDraft, AgentError> {
        let _scope = credential.map(|c| CredentialScope::set(API_KEY_ENV, c));
        let schema = json_schema_for::<BotOfferDraft>();
        let body = ChatRequest {
            model: request.model.clone(),
            messages: vec![
                Message::system(request.llm_prompt.clone()),
                Message::user(request.render()),
            ],
            max_tokens: request.max_tokens,
            temperature: request.temperature,
            response_format: ResponseFormat {
                fmt_type: ResponseFormatType::JsonSchema,
                json_schema: JsonSchemaSpec {
                    name: "bot_offer_draft".into(),
                    strict: true,
                    schema,
                },
            },
        };

        let completion = self.chat(&body).await?;
        let raw = completion.content.unwrap_or_default();
        let mut draft: BotOfferDraft =
            serde_json::from_str(&raw).map_err(|e| AgentError::SchemaInvalid(e.to_string()))?;
        draft.price = draft.price.min(request.max_budget);
        Ok(draft)
    }
}

const INSPECTION_SYSTEM_PROMPT: &str = "\
You are an information buyer's delegated inspection agent in an information \
market. You will be shown a decision context, a list of priced info offers, \
and the info already known. Respond with exactly one of: a list of offer ids \
to purchase (within budget), or a follow-up query with a budget carved from \
what remains. Respond with JSON only, matching the given schema.";

/// Everything the inspection-decision prompt needs to render (§4.5 step 3).
#[derive(Debug, Clone)]
pub struct InspectionPrompt {
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f32,
    pub context_query: Option<String>,
    pub context_pages: Vec<String>,
    pub is_recursive: bool,
    pub offers: Vec<PromptOffer>,
    pub known_info: Vec<PromptOffer>,
    pub budget_remaining: f64,
    /// Buyer-configured system prompt (`BuyerProfile::default_agent_prompt`),
    /// overriding `INSPECTION_SYSTEM_PROMPT` when set.
    pub system_prompt: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PromptOffer {
    pub id: i64,
    pub private_info: String,
    pub public_info: Option<String>,
    pub price: f64,
}

impl InspectionPrompt {
    fn render(&self) -> String {
        serde_json::json!({
            "query": self.context_query,
            "context_pages": self.context_pages,
            "is_recursive": self.is_recursive,
            "budget_remaining": self.budget_remaining,
            "known_info": self.known_info,
            "offers": self.offers,
        })
        .to_string()
    }

    fn offer_ids(&self) -> std::collections::HashSet<i64> {
        self.offers.iter().map(|o| o.id).collect()
    }
}

/// Raw structured response from the inspection call, before validation.
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
pub struct InspectionDecision {
    pub chosen_offer_ids: Option<Vec<i64>>,
    pub followup_query: Option<String>,
    pub followup_query_budget: Option<f64>,
    pub followup_target_human_seller_ids: Option<Vec<i64>>,
    pub followup_target_bot_seller_ids: Option<Vec<i64>>,
}

impl InspectionDecision {
    /// Validate against §4.5 step 3: exactly one branch, ids a subset of the
    /// offers shown, and budget respected.
    fn validate(self, request: &InspectionPrompt) -> Result<ValidatedDecision, String> {
        let has_chosen = self
            .chosen_offer_ids
            .as_ref()
            .is_some_and(|ids| !ids.is_empty());
        let has_followup = self.followup_query.is_some();

        match (has_chosen, has_followup) {
            (false, false) => Err("neither chosen_offer_ids nor followup_query was provided".into()),
            (true, true) => Err("both chosen_offer_ids and followup_query were provided".into()),
            (true, false) => {
                let ids = self.chosen_offer_ids.unwrap();
                let available = request.offer_ids();
                if let Some(bad) = ids.iter().find(|id| !available.contains(id)) {
                    return Err(format!("offer id {bad} is not among the offers shown"));
                }
                let offers_by_id: std::collections::HashMap<i64, f64> =
                    request.offers.iter().map(|o| (o.id, o.price)).collect();
                let total: f64 = ids.iter().filter_map(|id| offers_by_id.get(id)).sum();
                if total > request.budget_remaining {
                    return Err(format!(
                        "chosen offers cost {total} which exceeds the remaining budget {}",
                        request.budget_remaining
                    ));
                }
                Ok(ValidatedDecision::Purchase { chosen_offer_ids: ids })
            }
            (false, true) => {
                let budget = self.followup_query_budget.ok_or_else(|| {
                    "followup_query_budget must be provided when followup_query is provided".to_string()
                })?;
                if !(0.0..=request.budget_remaining).contains(&budget) {
                    return Err(format!(
                        "followup_query_budget {budget} must be within [0, {}]",
                        request.budget_remaining
                    ));
                }
                Ok(ValidatedDecision::Followup {
                    query: self.followup_query.unwrap(),
                    budget,
                    target_human_seller_ids: self.followup_target_human_seller_ids,
                    target_bot_seller_ids: self.followup_target_bot_seller_ids,
                })
            }
        }
    }
}

/// The validated outcome of an inspection-decision call.
#[derive(Debug, Clone)]
pub enum ValidatedDecision {
    Purchase {
        chosen_offer_ids: Vec<i64>,
    },
    Followup {
        query: String,
        budget: f64,
        target_human_seller_ids: Option<Vec<i64>>,
        target_bot_seller_ids: Option<Vec<i64>>,
    },
}

/// Everything an LLM-backed bot-seller's offer-drafting prompt needs (§4.4).
#[derive(Debug, Clone)]
pub struct BotOfferPrompt {
    pub model: String,
    pub llm_prompt: String,
    pub max_tokens: u32,
    pub temperature: f32,
    pub context_query: Option<String>,
    pub context_pages: Vec<String>,
    pub priority: i16,
    pub max_budget: f64,
}

impl BotOfferPrompt {
    fn render(&self) -> String {
        serde_json::json!({
            "query": self.context_query,
            "context_pages": self.context_pages,
            "priority": self.priority,
            "max_budget": self.max_budget,
        })
        .to_string()
    }
}

/// Structured reply from an LLM-backed bot seller.
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
pub struct BotOfferDraft {
    pub private_info: String,
    pub public_info: String,
    pub price: f64,
}

/// Scripted [`InspectionAgent`] fake for tests, gated behind `test-util` so
/// downstream crates can depend on it from their own tests without pulling
/// it into production builds (mirrors `infonomy-store`'s `test_double`).
#[cfg(any(test, feature = "test-util"))]
pub mod test_util {
    use super::{async_trait, AgentError, BotOfferDraft, BotOfferPrompt, InspectionAgent, InspectionPrompt, ValidatedDecision};
    use std::sync::Mutex;

    /// One scripted turn for `ScriptedAgent::decide_inspection`. `PurchaseAllShown`
    /// resolves against whatever offers the live request carries, so a test
    /// doesn't need to know an offer's id before the step that creates it runs.
    pub enum ScriptedDecision {
        Fixed(ValidatedDecision),
        PurchaseAllShown,
    }

    /// Returns each scripted decision/draft in order, one per call;
    /// `AgentError::RetriesExhausted` once the script runs dry.
    #[derive(Default)]
    pub struct ScriptedAgent {
        inspections: Mutex<Vec<ScriptedDecision>>,
        offers: Mutex<Vec<BotOfferDraft>>,
    }

    impl ScriptedAgent {
        pub fn new(inspections: Vec<ScriptedDecision>) -> Self {
            Self { inspections: Mutex::new(inspections), offers: Mutex::new(Vec::new()) }
        }

        pub fn with_offers(self, offers: Vec<BotOfferDraft>) -> Self {
            Self { offers: Mutex::new(offers), ..self }
        }
    }

    #[async_trait]
    impl InspectionAgent for ScriptedAgent {
        async fn decide_inspection(
            &self,
            request: InspectionPrompt,
            _max_validation_retries: u32,
            _credential: Option<&str>,
        ) -> Result<ValidatedDecision, AgentError> {
            let next = {
                let mut script = self.inspections.lock().unwrap();
                if script.is_empty() {
                    return Err(AgentError::RetriesExhausted);
                }
                script.remove(0)
            };
            Ok(match next {
                ScriptedDecision::Fixed(d) => d,
                ScriptedDecision::PurchaseAllShown => ValidatedDecision::Purchase {
                    chosen_offer_ids: request.offers.iter().map(|o| o.id).collect(),
                },
            })
        }

        async fn draft_bot_offer(
            &self,
            _request: BotOfferPrompt,
            _credential: Option<&str>,
        ) -> Result<BotOfferDraft, AgentError> {
            let mut script = self.offers.lock().unwrap();
            if script.is_empty() {
                return Err(AgentError::RetriesExhausted);
            }
            Ok(script.remove(0))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_request() -> InspectionPrompt {
        InspectionPrompt {
            model: "test-model".into(),
            max_tokens: 100,
            temperature: 0.0,
            context_query: Some("test".into()),
            context_pages: vec![],
            is_recursive: false,
            offers: vec![
                PromptOffer { id: 1, private_info: "a".into(), public_info: None, price: 10.0 },
                PromptOffer { id: 2, private_info: "b".into(), public_info: None, price: 20.0 },
            ],
            known_info: vec![],
            budget_remaining: 40.0,
            system_prompt: None,
        }
    }

    #[test]
    fn rejects_empty_decision() {
        let decision = InspectionDecision {
            chosen_offer_ids: None,
            followup_query: None,
            followup_query_budget: None,
            followup_target_human_seller_ids: None,
            followup_target_bot_seller_ids: None,
        };
        assert!(decision.validate(&sample_request()).is_err());
    }

    #[test]
    fn rejects_both_branches() {
        let decision = InspectionDecision {
            chosen_offer_ids: Some(vec![1]),
            followup_query: Some("q".into()),
            followup_query_budget: Some(5.0),
            followup_target_human_seller_ids: None,
            followup_target_bot_seller_ids: None,
        };
        assert!(decision.validate(&sample_request()).is_err());
    }

    #[test]
    fn rejects_ids_outside_offers() {
        let decision = InspectionDecision {
            chosen_offer_ids: Some(vec![99]),
            followup_query: None,
            followup_query_budget: None,
            followup_target_human_seller_ids: None,
            followup_target_bot_seller_ids: None,
        };
        assert!(decision.validate(&sample_request()).is_err());
    }

    #[test]
    fn rejects_over_budget_purchase() {
        let decision = InspectionDecision {
            chosen_offer_ids: Some(vec![1, 2]),
            followup_query: None,
            followup_query_budget: None,
            followup_target_human_seller_ids: None,
            followup_target_bot_seller_ids: None,
        };
        let mut req = sample_request();
        req.budget_remaining = 15.0;
        assert!(decision.validate(&req).is_err());
    }

    #[test]
    fn accepts_valid_purchase() {
        let decision = InspectionDecision {
            chosen_offer_ids: Some(vec![1, 2]),
            followup_query: None,
            followup_query_budget: None,
            followup_target_human_seller_ids: None,
            followup_target_bot_seller_ids: None,
        };
        let result = decision.validate(&sample_request()).unwrap();
        assert!(matches!(result, ValidatedDecision::Purchase { chosen_offer_ids } if chosen_offer_ids == vec![1, 2]));
    }

    #[test]
    fn followup_requires_budget() {
        let decision = InspectionDecision {
            chosen_offer_ids: None,
            followup_query: Some("more context?".into()),
            followup_query_budget: None,
            followup_target_human_seller_ids: None,
            followup_target_bot_seller_ids: None,
        };
        assert!(decision.validate(&sample_request()).is_err());
    }

    #[test]
    fn followup_budget_must_fit_remaining() {
        let decision = InspectionDecision {
            chosen_offer_ids: None,
            followup_query: Some("more context?".into()),
            followup_query_budget: Some(1000.0),
            followup_target_human_seller_ids: None,
            followup_target_bot_seller_ids: None,
        };
        assert!(decision.validate(&sample_request()).is_err());
    }

    #[test]
    fn credential_scope_restores_previous_value() {
        unsafe {
            std::env::set_var("INFONOMY_TEST_CRED", "old");
        }
        {
            let _scope = CredentialScope::set("INFONOMY_TEST_CRED", "new");
            assert_eq!(std::env::var("INFONOMY_TEST_CRED").unwrap(), "new");
        }
        assert_eq!(std::env::var("INFONOMY_TEST_CRED").unwrap(), "old");
        unsafe {
            std::env::remove_var("INFONOMY_TEST_CRED");
        }
    }
}
