use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::sync::Semaphore;
use tracing::{debug, error, info};

use crate::{
    backend::{Classification, ModerationBackend},
    errors::EngineError,
    layers::ModerationLayer,
    models::{LayerKind, MessageEnvelope, ModerationRule, ModerationVerdict},
    registry::RuleRegistry,
};

/// External category classifier. A flag alone enforces nothing; a verdict
/// requires a configured rule whose category was flagged.
pub struct CategoryLayer {
    backend: Arc<dyn ModerationBackend>,
    registry: Arc<RuleRegistry>,
    permits: Semaphore,
}

impl CategoryLayer {
    pub fn new(
        backend: Arc<dyn ModerationBackend>,
        registry: Arc<RuleRegistry>,
        concurrency: usize,
    ) -> Result<Self, EngineError> {
        if concurrency == 0 {
            return Err(EngineError::Config(
                "category concurrency must be at least 1".to_owned(),
            ));
        }
        Ok(Self {
            backend,
            registry,
            permits: Semaphore::new(concurrency),
        })
    }

    async fn classify_text(&self, text: &str, message_id: i64) -> Option<Classification> {
        let _permit = self.permits.acquire().await.ok()?;
        debug!(message_id, "category text request");
        match self.backend.classify_text(text).await {
            Ok(classification) => Some(classification),
            Err(api_error) => {
                error!(error = %api_error, message_id, "category api error");
                None
            }
        }
    }

    async fn classify_image(&self, image: &str, message_id: i64) -> Option<Classification> {
        let _permit = self.permits.acquire().await.ok()?;
        debug!(message_id, "category image request");
        match self.backend.classify_image(image).await {
            Ok(classification) => Some(classification),
            Err(api_error) => {
                error!(error = %api_error, message_id, "category api error");
                None
            }
        }
    }

    async fn build_verdict(
        &self,
        classification: Option<Classification>,
        message: &MessageEnvelope,
        source: &str,
        extra_details: Map<String, Value>,
    ) -> Option<ModerationVerdict> {
        let classification = classification?;
        if !classification.flagged {
            return None;
        }

        let flagged = classification.flagged_categories();
        let rule = self
            .select_rule(&flagged, message.context.chat_id)
            .await;
        let Some(rule) = rule else {
            info!(categories = ?flagged, "category flagged without matching rule");
            return None;
        };

        info!(
            rule_id = %rule.rule_id,
            category = rule.category.as_deref(),
            message_id = message.context.message_id,
            source,
            "category flagged"
        );
        let mut details = Map::new();
        details.insert(
            "categories".to_owned(),
            serde_json::to_value(&classification.categories).unwrap_or(Value::Null),
        );
        details.insert(
            "scores".to_owned(),
            serde_json::to_value(&classification.category_scores).unwrap_or(Value::Null),
        );
        details.insert("source".to_owned(), Value::String(source.to_owned()));
        details.extend(extra_details);
        details.insert(
            "matched_category".to_owned(),
            Value::String(rule.category.clone().unwrap_or_default()),
        );
        if let Some(duration) = rule.action_duration_seconds {
            details.insert("action_duration_seconds".to_owned(), Value::from(duration));
        }

        Some(ModerationVerdict {
            layer: LayerKind::Category,
            rule_code: rule.rule_id,
            priority: rule.priority,
            action: rule.action,
            reason: rule.description,
            violated: true,
            details,
        })
    }

    async fn select_rule(&self, flagged: &[String], chat_id: i64) -> Option<ModerationRule> {
        let rules = self
            .registry
            .get_rules_for_layer(LayerKind::Category, Some(chat_id))
            .await;
        let mut best: Option<ModerationRule> = None;
        for rule in rules {
            let Some(category) = rule.category.as_deref() else {
                continue;
            };
            if !flagged.iter().any(|hit| hit == category) {
                continue;
            }
            match &best {
                Some(current) if rule.priority <= current.priority => {}
                _ => best = Some(rule),
            }
        }
        best
    }
}

#[async_trait]
impl ModerationLayer for CategoryLayer {
    fn kind(&self) -> LayerKind {
        LayerKind::Category
    }

    fn priority(&self) -> u32 {
        20
    }

    async fn evaluate(&self, message: &MessageEnvelope) -> Option<ModerationVerdict> {
        let text = message.content_text();
        let message_id = message.context.message_id;

        if !text.is_empty() {
            let classification = self.classify_text(text, message_id).await;
            let mut extra = Map::new();
            extra.insert(
                "text_excerpt".to_owned(),
                Value::String(text.chars().take(120).collect()),
            );
            if let Some(verdict) = self
                .build_verdict(classification, message, "text", extra)
                .await
            {
                return Some(verdict);
            }
        }

        for image in &message.images {
            let classification = self.classify_image(image, message_id).await;
            let mut extra = Map::new();
            extra.insert("image_reference".to_owned(), Value::String(image.clone()));
            if let Some(verdict) = self
                .build_verdict(classification, message, "image", extra)
                .await
            {
                return Some(verdict);
            }
        }

        if text.is_empty() && message.images.is_empty() {
            debug!(message_id, "category skip, no content");
        } else {
            debug!(message_id, "category not flagged");
        }
        None
    }
}
