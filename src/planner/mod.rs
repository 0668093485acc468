//! Response planning
//!
//! Turns a transcript into the text the assistant will speak, either from
//! keyword rules or a local LLM.

mod llm;
mod rules;

use crate::config::{EngineType, ResponseConfig};
use crate::error::PlanError;
use crate::rag::Snippet;

pub use llm::{
    CompletionRequest, InferenceEngine, LlamaServerEngine, LlmPlanner, STOP_SEQUENCES,
    estimate_tokens, truncate_to_tokens,
};
pub use rules::{FALLBACK_RULE, Rule, RulesPlanner, default_rules, normalize};

/// Reply when the transcript has no words
pub const EMPTY_QUERY_REPLY: &str = "I didn't catch that. Could you please repeat?";

/// The configured response engine
pub enum ResponsePlanner {
    Rules(RulesPlanner),
    Llm(LlmPlanner),
}

impl ResponsePlanner {
    /// Build the engine selected by `engine_type`
    #[must_use]
    pub fn from_config(config: &ResponseConfig) -> Self {
        match config.engine_type {
            EngineType::Rules => Self::Rules(RulesPlanner::load(
                config.rules_resource.as_deref(),
                &config.fallback_reply,
            )),
            EngineType::Llm => Self::Llm(LlmPlanner::from_config(config)),
        }
    }

    /// Engine in use
    #[must_use]
    pub const fn kind(&self) -> EngineType {
        match self {
            Self::Rules(_) => EngineType::Rules,
            Self::Llm(_) => EngineType::Llm,
        }
    }

    /// Whether this engine uses retrieved context
    #[must_use]
    pub const fn wants_context(&self) -> bool {
        matches!(self, Self::Llm(_))
    }

    /// Produce a reply for `text`
    ///
    /// The rules engine ignores `context`.
    ///
    /// # Errors
    ///
    /// Returns `PlanError` when no reply could be produced
    pub async fn plan(&self, text: &str, context: Option<&[Snippet]>) -> Result<String, PlanError> {
        match self {
            Self::Rules(rules) => rules.plan(text),
            Self::Llm(llm) => llm.plan(text, context).await,
        }
    }
}

impl From<RulesPlanner> for ResponsePlanner {
    fn from(planner: RulesPlanner) -> Self {
        Self::Rules(planner)
    }
}

impl From<LlmPlanner> for ResponsePlanner {
    fn from(planner: LlmPlanner) -> Self {
        Self::Llm(planner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    #[tokio::test]
    async fn test_default_engine_is_rules() {
        let planner = ResponsePlanner::from_config(&Config::default().response_generator);
        assert_eq!(planner.kind(), EngineType::Rules);
        assert!(!planner.wants_context());
        let reply = planner.plan("hello there", None).await.unwrap();
        assert!(!reply.is_empty());
    }

    #[tokio::test]
    async fn test_llm_engine_selected() {
        let mut config = Config::default().response_generator;
        config.engine_type = EngineType::Llm;
        let planner = ResponsePlanner::from_config(&config);
        assert_eq!(planner.kind(), EngineType::Llm);
        assert!(planner.wants_context());
    }
}
