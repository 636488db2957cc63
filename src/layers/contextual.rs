use std::{collections::BTreeSet, sync::Arc};

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

use crate::{
    backend::{ChatCompletion, CompletionRequest, ModerationBackend},
    errors::EngineError,
    layers::ModerationLayer,
    models::{Action, LayerKind, MessageEnvelope, ModerationRule, ModerationVerdict},
    registry::RuleRegistry,
};

const DEFAULT_MODEL: &str = "gpt-5-nano";
const MAX_COMPLETION_TOKENS: u32 = 2048;
const MAX_ATTACHED_IMAGES: usize = 4;

const SYSTEM_PROMPT: &str = "\
Strict moderation. Output format: single JSON only.\n\
{\"violation\":bool,\"category\":str,\"severity\":str,\"action\":str,\"reason\":str}\n\
Allowed actions: warn, delete, mute, ban, none (lowercase).\n\
You will receive the list of active moderation rules (category, configured action, human description).\n\
Flag content only when it clearly violates one of those descriptions and return that exact category.\n\
If none apply, respond with violation=false and action='none'.\n\
No text before/after JSON. No explanations. No markdown. No reasoning.";

/// Contextual LLM stage. Asks a chat model for a structured verdict scoped
/// to the configured contextual rules; the rule's configured action always
/// overrides the model's suggestion.
pub struct ContextualLayer {
    backend: Arc<dyn ModerationBackend>,
    registry: Arc<RuleRegistry>,
    model: String,
    permits: Semaphore,
}

impl ContextualLayer {
    pub fn new(
        backend: Arc<dyn ModerationBackend>,
        registry: Arc<RuleRegistry>,
        concurrency: usize,
    ) -> Result<Self, EngineError> {
        if concurrency == 0 {
            return Err(EngineError::Config(
                "contextual concurrency must be at least 1".to_owned(),
            ));
        }
        Ok(Self {
            backend,
            registry,
            model: DEFAULT_MODEL.to_owned(),
            permits: Semaphore::new(concurrency),
        })
    }

    fn build_user_payload(&self, message: &MessageEnvelope, rules: &[ModerationRule]) -> String {
        let context = &message.context;
        let mut lines = vec![
            "Moderation context:".to_owned(),
            format!("chat_id: {}", context.chat_id),
            format!("user_id: {}", context.user_id),
            format!("message_id: {}", context.message_id),
            format!("timestamp: {}", context.timestamp.to_rfc3339()),
        ];
        if let Some(username) = &context.username {
            lines.push(format!("username: @{username}"));
        }

        let categorized: Vec<&ModerationRule> =
            rules.iter().filter(|rule| rule.category.is_some()).collect();
        if !categorized.is_empty() {
            lines.push(String::new());
            lines.push("Active moderation rules (category — action — description):".to_owned());
            let mut sorted = categorized.clone();
            sorted.sort_by(|left, right| {
                (left.category.as_deref().unwrap_or(""), left.action.name())
                    .cmp(&(right.category.as_deref().unwrap_or(""), right.action.name()))
            });
            for rule in &sorted {
                let description = if rule.description.is_empty() {
                    "no description"
                } else {
                    rule.description.as_str()
                };
                lines.push(format!(
                    "- {} — {} — {}",
                    rule.category.as_deref().unwrap_or(""),
                    rule.action,
                    description
                ));
            }
            let categories: BTreeSet<String> = sorted
                .iter()
                .filter_map(|rule| rule.category.as_deref())
                .map(|category| category.to_lowercase())
                .collect();
            lines.push(String::new());
            lines.push(
                "Allowed categories (use one only if the message clearly violates the matching rule):"
                    .to_owned(),
            );
            lines.push(categories.into_iter().collect::<Vec<_>>().join(", "));
        }

        lines.push(String::new());
        lines.push("Message:".to_owned());
        let text = message.content_text();
        lines.push(if text.is_empty() {
            "<empty>".to_owned()
        } else {
            text.to_owned()
        });
        if !message.images.is_empty() {
            lines.push(String::new());
            lines.push(format!(
                "Images present: {} (content attached separately for analysis)",
                message.images.len()
            ));
        }
        lines.join("\n")
    }

    fn extract_json(content: &str) -> Option<Value> {
        let stripped = content.trim().trim_matches(|c: char| c == '`' || c.is_whitespace());
        if stripped.is_empty() {
            return None;
        }
        if let Ok(value) = serde_json::from_str::<Value>(stripped) {
            return Some(value);
        }
        let start = stripped.find('{')?;
        let end = stripped.rfind('}')?;
        if end <= start {
            return None;
        }
        serde_json::from_str(&stripped[start..=end]).ok()
    }

    async fn resolve_rule(&self, category: &str, chat_id: i64) -> Option<ModerationRule> {
        let rules = self
            .registry
            .get_rules_for_layer(LayerKind::Contextual, Some(chat_id))
            .await;
        let mut best: Option<ModerationRule> = None;
        for rule in rules {
            let exact = rule
                .category
                .as_deref()
                .is_some_and(|name| name.eq_ignore_ascii_case(category));
            let aliased = rule
                .metadata
                .get("aliases")
                .and_then(Value::as_array)
                .is_some_and(|aliases| {
                    aliases
                        .iter()
                        .filter_map(Value::as_str)
                        .any(|alias| alias.eq_ignore_ascii_case(category))
                });
            if !exact && !aliased {
                continue;
            }
            match &best {
                Some(current) if rule.priority <= current.priority => {}
                _ => best = Some(rule),
            }
        }
        best
    }

    async fn request_completion(
        &self,
        message: &MessageEnvelope,
        payload: String,
    ) -> Option<ChatCompletion> {
        let mut user_content = vec![json!({"type": "text", "text": payload})];
        for image in message.images.iter().take(MAX_ATTACHED_IMAGES) {
            user_content.push(json!({"type": "image_url", "image_url": {"url": image}}));
        }
        let request = CompletionRequest {
            model: self.model.clone(),
            messages: vec![
                json!({"role": "system", "content": SYSTEM_PROMPT}),
                json!({"role": "user", "content": user_content}),
            ],
            max_completion_tokens: Some(MAX_COMPLETION_TOKENS),
            json_response: true,
        };

        let _permit = self.permits.acquire().await.ok()?;
        debug!(
            message_id = message.context.message_id,
            model = %self.model,
            "contextual request"
        );
        match self.backend.complete_chat(request).await {
            Ok(completion) => Some(completion),
            Err(api_error) => {
                error!(
                    error = %api_error,
                    message_id = message.context.message_id,
                    "contextual api error"
                );
                None
            }
        }
    }
}

#[async_trait]
impl ModerationLayer for ContextualLayer {
    fn kind(&self) -> LayerKind {
        LayerKind::Contextual
    }

    fn priority(&self) -> u32 {
        30
    }

    async fn evaluate(&self, message: &MessageEnvelope) -> Option<ModerationVerdict> {
        let message_id = message.context.message_id;
        if message.content_text().is_empty() && message.images.is_empty() {
            debug!(message_id, "contextual skip, no content");
            return None;
        }

        let rules = self
            .registry
            .get_rules_for_layer(LayerKind::Contextual, Some(message.context.chat_id))
            .await;
        let payload = self.build_user_payload(message, &rules);
        let completion = self.request_completion(message, payload).await?;

        if completion.finish_reason == "length" {
            warn!(
                message_id,
                total_tokens = completion.total_tokens,
                "contextual response truncated, discarding"
            );
            return None;
        }

        let Some(data) = Self::extract_json(&completion.content) else {
            error!(
                message_id,
                response = %completion.content.chars().take(200).collect::<String>(),
                finish_reason = %completion.finish_reason,
                "contextual response is not valid JSON"
            );
            return None;
        };

        if !data.get("violation").and_then(Value::as_bool).unwrap_or(false) {
            debug!(message_id, "contextual not flagged");
            return None;
        }

        let category = data
            .get("category")
            .and_then(Value::as_str)
            .unwrap_or("other")
            .to_lowercase();
        let severity = data
            .get("severity")
            .and_then(Value::as_str)
            .map(str::to_lowercase)
            .unwrap_or_else(|| category.clone());
        let suggested_action =
            Action::normalize(data.get("action").and_then(Value::as_str).unwrap_or("warn"));

        let Some(rule) = self.resolve_rule(&category, message.context.chat_id).await else {
            warn!(
                category = %category,
                severity = %severity,
                suggested_action = %suggested_action,
                message_id,
                "contextual violation matched no configured rule"
            );
            return None;
        };

        info!(
            rule_code = %rule.rule_id,
            category = %category,
            configured_action = %rule.action,
            message_id,
            "contextual violation"
        );
        let reason = data
            .get("reason")
            .and_then(Value::as_str)
            .filter(|reason| !reason.is_empty())
            .map(ToOwned::to_owned)
            .unwrap_or_else(|| rule.description.clone());
        let mut details = Map::new();
        details.insert("raw".to_owned(), data);
        details.insert("total_tokens".to_owned(), Value::from(completion.total_tokens));
        details.insert(
            "prompt_tokens".to_owned(),
            Value::from(completion.prompt_tokens),
        );
        details.insert(
            "completion_tokens".to_owned(),
            Value::from(completion.completion_tokens),
        );
        details.insert("gpt_severity".to_owned(), Value::String(severity));
        if let Some(duration) = rule.action_duration_seconds {
            details.insert("action_duration_seconds".to_owned(), Value::from(duration));
        }

        Some(ModerationVerdict {
            layer: LayerKind::Contextual,
            rule_code: rule.rule_id,
            priority: rule.priority,
            action: rule.action,
            reason,
            violated: true,
            details,
        })
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::backend::mock::MockBackend;
    use crate::models::{ChatContext, RuleSource, RuleType, ViolationPriority};

    fn envelope(text: &str, images: Vec<String>) -> MessageEnvelope {
        MessageEnvelope {
            context: ChatContext {
                chat_id: 100,
                user_id: 10,
                message_id: 1,
                timestamp: Utc::now(),
                username: Some("tester".to_owned()),
                language_code: None,
            },
            text: Some(text.to_owned()),
            caption: None,
            media_type: None,
            images,
            metadata: Map::new(),
        }
    }

    fn contextual_rule(rule_id: &str, category: &str) -> ModerationRule {
        ModerationRule {
            rule_id: rule_id.to_owned(),
            description: "hate speech policy".to_owned(),
            action: Action::Ban,
            source: RuleSource::Admin,
            layer: LayerKind::Contextual,
            rule_type: RuleType::Contextual,
            chat_id: None,
            pattern: None,
            category: Some(category.to_owned()),
            priority: ViolationPriority::Hate,
            action_duration_seconds: None,
            metadata: Map::new(),
        }
    }

    fn completion(content: &str) -> ChatCompletion {
        ChatCompletion {
            content: content.to_owned(),
            finish_reason: "stop".to_owned(),
            total_tokens: 42,
            prompt_tokens: 30,
            completion_tokens: 12,
        }
    }

    async fn layer_with(rules: Vec<ModerationRule>, backend: Arc<MockBackend>) -> ContextualLayer {
        let registry = Arc::new(RuleRegistry::new());
        registry.seed(rules).await;
        ContextualLayer::new(backend, registry, 1).expect("valid concurrency")
    }

    #[tokio::test]
    async fn maps_response_to_rule_via_alias() {
        let backend = Arc::new(MockBackend::new());
        backend.push_completion(Ok(completion(
            r#"{"violation":true,"category":"harassment","severity":"hate","action":"ban","reason":"explicit harassment"}"#,
        )));
        let mut rule = contextual_rule("gpt-1", "hate");
        rule.metadata
            .insert("aliases".to_owned(), json!(["harassment"]));
        let layer = layer_with(vec![rule], backend).await;

        let verdict = layer
            .evaluate(&envelope("contextual abuse", Vec::new()))
            .await
            .expect("verdict expected");

        assert_eq!(verdict.rule_code, "gpt-1");
        assert_eq!(verdict.action, Action::Ban);
        assert_eq!(verdict.priority, ViolationPriority::Hate);
        assert_eq!(verdict.reason, "explicit harassment");
        assert_eq!(verdict.details["gpt_severity"], "hate");
    }

    #[tokio::test]
    async fn malformed_json_yields_no_verdict() {
        let backend = Arc::new(MockBackend::new());
        backend.push_completion(Ok(completion("non-json response")));
        let layer = layer_with(Vec::new(), backend).await;

        assert!(layer
            .evaluate(&envelope("message", Vec::new()))
            .await
            .is_none());
    }

    #[tokio::test]
    async fn json_is_recovered_from_surrounding_noise() {
        let backend = Arc::new(MockBackend::new());
        backend.push_completion(Ok(completion(
            "Sure, here you go: {\"violation\":true,\"category\":\"hate\",\"severity\":\"hate\",\"action\":\"ban\",\"reason\":\"slur\"} done",
        )));
        let layer = layer_with(vec![contextual_rule("gpt-1", "hate")], backend).await;

        let verdict = layer.evaluate(&envelope("text", Vec::new())).await;
        assert!(verdict.is_some());
    }

    #[tokio::test]
    async fn truncated_response_is_discarded() {
        let backend = Arc::new(MockBackend::new());
        let mut truncated = completion(
            r#"{"violation":true,"category":"hate","severity":"hate","action":"ban","reason":"x"}"#,
        );
        truncated.finish_reason = "length".to_owned();
        backend.push_completion(Ok(truncated));
        let layer = layer_with(vec![contextual_rule("gpt-1", "hate")], backend).await;

        assert!(layer.evaluate(&envelope("text", Vec::new())).await.is_none());
    }

    #[tokio::test]
    async fn violation_without_matching_rule_is_dropped() {
        let backend = Arc::new(MockBackend::new());
        backend.push_completion(Ok(completion(
            r#"{"violation":true,"category":"advertising","severity":"spam","action":"warn","reason":"ad"}"#,
        )));
        let layer = layer_with(vec![contextual_rule("gpt-1", "hate")], backend).await;

        assert!(layer.evaluate(&envelope("buy now", Vec::new())).await.is_none());
    }

    #[tokio::test]
    async fn image_only_messages_are_evaluated_with_image_note() {
        let backend = Arc::new(MockBackend::new());
        backend.push_completion(Ok(completion(
            r#"{"violation":true,"category":"hate","severity":"hate","action":"ban","reason":"violent image"}"#,
        )));
        let layer = layer_with(
            vec![contextual_rule("gpt-1", "hate")],
            backend.clone(),
        )
        .await;

        let mut message = envelope("", vec!["data:image/png;base64,AAAA".to_owned()]);
        message.text = None;
        let verdict = layer.evaluate(&message).await;
        assert!(verdict.is_some());

        let request = backend.last_completion_request().expect("request captured");
        let user_message = request
            .messages
            .iter()
            .find(|message| message["role"] == "user")
            .expect("user message present");
        let text_block = user_message["content"][0]["text"]
            .as_str()
            .expect("text block");
        assert!(text_block.contains("Images present: 1"));
        assert!(text_block.contains("<empty>"));
        assert_eq!(
            user_message["content"][1]["image_url"]["url"],
            "data:image/png;base64,AAAA"
        );
    }

    #[tokio::test]
    async fn skips_when_no_text_and_no_images() {
        let backend = Arc::new(MockBackend::new());
        let layer = layer_with(vec![contextual_rule("gpt-1", "hate")], backend.clone()).await;

        let mut message = envelope("", Vec::new());
        message.text = None;
        assert!(layer.evaluate(&message).await.is_none());
        assert!(backend.recorded_calls().is_empty());
    }
}
