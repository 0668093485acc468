//! Local LLM responses

use std::fmt::Write;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::EMPTY_QUERY_REPLY;
use crate::config::ResponseConfig;
use crate::error::PlanError;
use crate::rag::Snippet;

/// Sequences that end a completion
pub const STOP_SEQUENCES: &[&str] = &["User:", "\n"];

/// One completion request
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompletionRequest {
    pub prompt: String,
    #[serde(rename = "n_predict")]
    pub max_tokens: usize,
    pub temperature: f32,
    pub stop: Vec<String>,
}

/// A bounded-context text completion engine
#[async_trait]
pub trait InferenceEngine: Send + Sync {
    /// Complete `request.prompt`
    ///
    /// # Errors
    ///
    /// Returns `PlanError::EngineUnavailable` if the engine cannot answer
    async fn complete(&self, request: CompletionRequest) -> Result<String, PlanError>;
}

/// Client for a llama.cpp server on the local machine
pub struct LlamaServerEngine {
    client: reqwest::Client,
    endpoint: String,
}

#[derive(Deserialize)]
struct CompletionResponse {
    content: String,
}

impl LlamaServerEngine {
    /// Create a client for `endpoint`, e.g. `http://127.0.0.1:8080`
    ///
    /// # Errors
    ///
    /// Returns `PlanError::EngineUnavailable` if the HTTP client cannot be built
    pub fn new(endpoint: &str) -> Result<Self, PlanError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(2))
            .build()
            .map_err(|e| PlanError::EngineUnavailable(format!("http client: {e}")))?;
        Ok(Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl InferenceEngine for LlamaServerEngine {
    async fn complete(&self, request: CompletionRequest) -> Result<String, PlanError> {
        #[derive(Serialize)]
        struct Body<'a> {
            #[serde(flatten)]
            request: &'a CompletionRequest,
            cache_prompt: bool,
        }

        let url = format!("{}/completion", self.endpoint);
        tracing::debug!(url = %url, prompt_chars = request.prompt.len(), "requesting completion");

        let response = self
            .client
            .post(&url)
            .json(&Body {
                request: &request,
                cache_prompt: true,
            })
            .send()
            .await
            .map_err(|e| PlanError::EngineUnavailable(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(PlanError::EngineUnavailable(format!("{status}: {body}")));
        }

        let parsed: CompletionResponse = response
            .json()
            .await
            .map_err(|e| PlanError::EngineUnavailable(e.to_string()))?;
        Ok(parsed.content)
    }
}

/// Prompted LLM planner with optional retrieved context
pub struct LlmPlanner {
    engine: Option<Box<dyn InferenceEngine>>,
    system_prompt: String,
    assistant_name: String,
    context_size: usize,
    max_tokens: usize,
    temperature: f32,
}

impl LlmPlanner {
    /// Build with an explicit engine
    #[must_use]
    pub fn new(engine: Box<dyn InferenceEngine>, config: &ResponseConfig) -> Self {
        Self::with_engine(Some(engine), config)
    }

    fn with_engine(engine: Option<Box<dyn InferenceEngine>>, config: &ResponseConfig) -> Self {
        Self {
            engine,
            system_prompt: config.system_prompt.clone(),
            assistant_name: config.assistant_name.clone(),
            context_size: config.context_size,
            max_tokens: config.max_tokens,
            temperature: config.temperature,
        }
    }

    /// Build against the configured local server
    ///
    /// If `model_path` is set but missing, or the client cannot be built,
    /// the planner stays unloaded and every request reports the engine as
    /// unavailable.
    #[must_use]
    pub fn from_config(config: &ResponseConfig) -> Self {
        if let Some(model) = config.model_path.as_ref().filter(|m| !m.exists()) {
            tracing::error!(model = %model.display(), "LLM model file not found, planner unloaded");
            return Self::with_engine(None, config);
        }
        match LlamaServerEngine::new(&config.endpoint) {
            Ok(engine) => {
                tracing::info!(endpoint = %config.endpoint, "LLM planner ready");
                Self::new(Box::new(engine), config)
            }
            Err(e) => {
                tracing::error!(error = %e, "LLM client unavailable, planner unloaded");
                Self::with_engine(None, config)
            }
        }
    }

    /// Whether an engine is loaded
    #[must_use]
    pub const fn is_loaded(&self) -> bool {
        self.engine.is_some()
    }

    /// Generate a reply
    ///
    /// # Errors
    ///
    /// Returns `PlanError::EngineUnavailable` when the engine is missing or
    /// fails, and `PlanError::NoMatch` when it answers with nothing
    pub async fn plan(&self, text: &str, context: Option<&[Snippet]>) -> Result<String, PlanError> {
        let Some(engine) = &self.engine else {
            return Err(PlanError::EngineUnavailable("model not loaded".to_string()));
        };
        if text.trim().is_empty() {
            return Ok(EMPTY_QUERY_REPLY.to_string());
        }

        let request = CompletionRequest {
            prompt: self.build_prompt(text, context.unwrap_or_default()),
            max_tokens: self.max_tokens,
            temperature: self.temperature,
            stop: STOP_SEQUENCES.iter().map(ToString::to_string).collect(),
        };

        let raw = engine.complete(request).await?;
        let reply = truncate_to_tokens(&clean_reply(&raw), self.max_tokens);
        if reply.is_empty() {
            return Err(PlanError::NoMatch);
        }
        tracing::debug!(chars = reply.len(), "LLM reply generated");
        Ok(reply)
    }

    /// Assemble the prompt, fitting snippets into the context window
    #[must_use]
    pub fn build_prompt(&self, text: &str, snippets: &[Snippet]) -> String {
        let text = text.trim();
        let fixed = estimate_tokens(&self.system_prompt)
            + estimate_tokens(text)
            + estimate_tokens(&self.assistant_name)
            + 8;
        let mut budget = self
            .context_size
            .saturating_sub(self.max_tokens)
            .saturating_sub(fixed);

        let mut context = String::new();
        for snippet in snippets {
            let line = format!("- {}: {}", snippet.title, snippet.content.replace('\n', " "));
            let cost = estimate_tokens(&line) + 1;
            if cost > budget {
                tracing::debug!(title = %snippet.title, "snippet dropped, context window full");
                break;
            }
            budget -= cost;
            let _ = writeln!(context, "{line}");
        }

        let mut prompt = self.system_prompt.trim().to_string();
        if !context.is_empty() {
            let _ = write!(prompt, "\n\nRelevant information:\n{}", context.trim_end());
        }
        let _ = write!(prompt, "\n\nUser: {text}\n{}:", self.assistant_name);
        prompt
    }
}

/// Rough token estimation (4 chars per token)
#[must_use]
pub const fn estimate_tokens(text: &str) -> usize {
    text.len() / 4
}

/// Cut at the first stop sequence and trim
fn clean_reply(raw: &str) -> String {
    let mut reply = raw.trim_start();
    for stop in STOP_SEQUENCES {
        if let Some(idx) = reply.find(stop) {
            reply = &reply[..idx];
        }
    }
    reply.trim().to_string()
}

/// Keep at most `max_tokens` worth of text, ending on a word boundary
#[must_use]
pub fn truncate_to_tokens(text: &str, max_tokens: usize) -> String {
    let max_chars = max_tokens.saturating_mul(4);
    if text.len() <= max_chars {
        return text.to_string();
    }
    let mut end = max_chars;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    let cut = &text[..end];
    let cut = cut.rfind(char::is_whitespace).map_or(cut, |i| &cut[..i]);
    cut.trim_end().to_string()
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::config::Config;

    struct Canned {
        reply: Result<String, PlanError>,
        seen: Arc<Mutex<Vec<CompletionRequest>>>,
    }

    #[async_trait]
    impl InferenceEngine for Canned {
        async fn complete(&self, request: CompletionRequest) -> Result<String, PlanError> {
            self.seen.lock().unwrap().push(request);
            self.reply.clone()
        }
    }

    fn planner(reply: Result<String, PlanError>) -> (LlmPlanner, Arc<Mutex<Vec<CompletionRequest>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut config = Config::default().response_generator;
        config.system_prompt = "You are Dia.".to_string();
        let engine = Canned {
            reply,
            seen: Arc::clone(&seen),
        };
        (LlmPlanner::new(Box::new(engine), &config), seen)
    }

    fn snippet(title: &str, content: &str) -> Snippet {
        Snippet {
            title: title.to_string(),
            content: content.to_string(),
            score: 1.0,
        }
    }

    #[test]
    fn test_prompt_without_context() {
        let (p, _) = planner(Ok(String::new()));
        assert_eq!(
            p.build_prompt("  hello ", &[]),
            "You are Dia.\n\nUser: hello\nDia:"
        );
    }

    #[test]
    fn test_prompt_with_context() {
        let (p, _) = planner(Ok(String::new()));
        let prompt = p.build_prompt("boiling point?", &[snippet("Physics", "Water boils at 100 C.")]);
        assert!(prompt.contains("Relevant information:\n- Physics: Water boils at 100 C."));
        assert!(prompt.ends_with("User: boiling point?\nDia:"));
    }

    #[test]
    fn test_prompt_drops_snippets_over_budget() {
        let (mut p, _) = planner(Ok(String::new()));
        p.context_size = 150;
        p.max_tokens = 100;
        let big = "x".repeat(400);
        let prompt = p.build_prompt("q", &[snippet("Small", "fits"), snippet("Big", &big)]);
        assert!(prompt.contains("Small"));
        assert!(!prompt.contains("Big"));
    }

    #[test]
    fn test_truncate_to_tokens() {
        assert_eq!(truncate_to_tokens("short", 10), "short");
        assert_eq!(truncate_to_tokens("one two three four", 3), "one two");
    }

    #[test]
    fn test_clean_reply_stops() {
        assert_eq!(clean_reply("  Sure thing.\nUser: more"), "Sure thing.");
        assert_eq!(clean_reply("Hi User: x"), "Hi");
    }

    #[tokio::test]
    async fn test_plan_sends_budget_and_stops() {
        let (p, seen) = planner(Ok(" It is sunny. ".to_string()));
        let reply = p.plan("weather?", None).await.unwrap();
        assert_eq!(reply, "It is sunny.");

        let requests = seen.lock().unwrap();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].max_tokens, 100);
        assert_eq!(requests[0].stop, vec!["User:", "\n"]);
    }

    #[tokio::test]
    async fn test_plan_engine_error_propagates() {
        let (p, _) = planner(Err(PlanError::EngineUnavailable("down".to_string())));
        let err = p.plan("hi", None).await.unwrap_err();
        assert!(matches!(err, PlanError::EngineUnavailable(_)));
    }

    #[tokio::test]
    async fn test_plan_empty_reply_is_no_match() {
        let (p, _) = planner(Ok("\n".to_string()));
        assert_eq!(p.plan("hi", None).await, Err(PlanError::NoMatch));
    }

    #[tokio::test]
    async fn test_missing_model_unloads() {
        let mut config = Config::default().response_generator;
        config.model_path = Some("/nonexistent/model.gguf".into());
        let p = LlmPlanner::from_config(&config);
        assert!(!p.is_loaded());
        assert!(matches!(
            p.plan("hi", None).await,
            Err(PlanError::EngineUnavailable(_))
        ));
    }

    #[test]
    fn test_configured_endpoint_loads() {
        let mut config = Config::default().response_generator;
        config.endpoint = "http://127.0.0.1:8080/".to_string();
        assert!(LlmPlanner::from_config(&config).is_loaded());
        assert_eq!(
            LlamaServerEngine::new(&config.endpoint).unwrap().endpoint,
            "http://127.0.0.1:8080"
        );
    }

    #[tokio::test]
    async fn test_unreachable_server_is_unavailable() {
        let engine = LlamaServerEngine::new("http://127.0.0.1:9").unwrap();
        let err = engine
            .complete(CompletionRequest {
                prompt: "hi".to_string(),
                max_tokens: 4,
                temperature: 0.1,
                stop: Vec::new(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, PlanError::EngineUnavailable(_)));
    }
}
