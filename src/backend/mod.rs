pub mod mock;
pub mod openai;

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::models::{Action, RuleSource};

/// Adapter boundary for the external classification and completion APIs.
/// Transient transport failures are retried inside implementations; every
/// error surfaced here is terminal for the evaluation that triggered it.
#[async_trait]
pub trait ModerationBackend: Send + Sync {
    fn name(&self) -> &str;
    async fn classify_text(&self, text: &str) -> Result<Classification, BackendError>;
    async fn classify_image(&self, image: &str) -> Result<Classification, BackendError>;
    async fn complete_chat(&self, request: CompletionRequest)
        -> Result<ChatCompletion, BackendError>;
    async fn synthesize_rule(
        &self,
        request: SynthesisRequest,
    ) -> Result<SynthesizedRule, BackendError>;
}

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("backend unavailable: {0}")]
    Unavailable(String),
    #[error("backend timeout: {0}")]
    Timeout(String),
    #[error("backend rejected request: {0}")]
    Rejected(String),
    #[error("backend invalid response: {0}")]
    InvalidResponse(String),
}

#[derive(Debug, Clone, Default)]
pub struct Classification {
    pub flagged: bool,
    pub categories: HashMap<String, bool>,
    pub category_scores: HashMap<String, f64>,
}

impl Classification {
    pub fn flagged_categories(&self) -> Vec<String> {
        let mut flagged = self
            .categories
            .iter()
            .filter(|(_, hit)| **hit)
            .map(|(category, _)| category.clone())
            .collect::<Vec<_>>();
        flagged.sort();
        flagged
    }
}

#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub model: String,
    pub messages: Vec<Value>,
    pub max_completion_tokens: Option<u32>,
    pub json_response: bool,
}

#[derive(Debug, Clone)]
pub struct ChatCompletion {
    pub content: String,
    pub finish_reason: String,
    pub total_tokens: u32,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

#[derive(Debug, Clone)]
pub struct SynthesisRequest {
    pub rule_text: String,
    pub source: RuleSource,
    pub desired_action: Action,
}

/// Raw synthesizer output. Fields are untrusted until the rule service
/// validates them against the target layer.
#[derive(Debug, Clone)]
pub struct SynthesizedRule {
    pub rule_type: String,
    pub layer: String,
    pub category: Option<String>,
    pub regex: Option<String>,
    pub priority: i64,
}
