use std::sync::Arc;

use serde_json::{json, Map, Value};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    backend::{ModerationBackend, SynthesisRequest, SynthesizedRule},
    errors::EngineError,
    models::{Action, LayerKind, ModerationRule, RuleSource, RuleType, ViolationPriority},
    registry::RuleRegistry,
    storage::StorageGateway,
};

/// Categories the external classifier is known to emit. Category-layer
/// rules outside this set cannot be served and are demoted.
pub const OFFICIAL_CATEGORIES: [&str; 13] = [
    "hate",
    "hate/threatening",
    "harassment",
    "harassment/threatening",
    "self-harm",
    "self-harm/intent",
    "self-harm/instructions",
    "sexual",
    "sexual/minors",
    "violence",
    "violence/graphic",
    "illicit",
    "illicit/violent",
];

pub fn is_official_category(category: &str) -> bool {
    OFFICIAL_CATEGORIES.contains(&category)
}

/// Admin input for a new rule. Fields left `None` are filled in by the
/// rule synthesizer; provided fields always win.
#[derive(Debug, Clone)]
pub struct RuleDraft {
    pub description: String,
    pub action: Action,
    pub source: RuleSource,
    pub chat_id: Option<i64>,
    pub action_duration_seconds: Option<i64>,
    pub layer: Option<LayerKind>,
    pub rule_type: Option<RuleType>,
    pub pattern: Option<String>,
    pub category: Option<String>,
    pub priority: Option<ViolationPriority>,
}

impl RuleDraft {
    pub fn new(description: impl Into<String>, action: Action, source: RuleSource) -> Self {
        Self {
            description: description.into(),
            action,
            source,
            chat_id: None,
            action_duration_seconds: None,
            layer: None,
            rule_type: None,
            pattern: None,
            category: None,
            priority: None,
        }
    }

    fn needs_synthesis(&self) -> bool {
        self.layer.is_none()
            || self.rule_type.is_none()
            || self.pattern.is_none()
            || self.category.is_none()
    }
}

/// Orchestrates rule mutations against both the registry and the store.
/// The add path serializes through one mutex so the two never diverge.
pub struct RuleService {
    registry: Arc<RuleRegistry>,
    storage: Arc<dyn StorageGateway>,
    synthesizer: Arc<dyn ModerationBackend>,
    lock: Mutex<()>,
}

impl RuleService {
    pub fn new(
        registry: Arc<RuleRegistry>,
        storage: Arc<dyn StorageGateway>,
        synthesizer: Arc<dyn ModerationBackend>,
    ) -> Self {
        Self {
            registry,
            storage,
            synthesizer,
            lock: Mutex::new(()),
        }
    }

    /// Loads every stored rule and atomically seeds the registry.
    pub async fn bootstrap(&self) -> Result<usize, EngineError> {
        let rules = self.storage.list_rules().await?;
        let count = rules.len();
        self.registry.seed(rules).await;
        info!(count, "rules bootstrapped");
        Ok(count)
    }

    pub async fn add_rule(&self, draft: RuleDraft) -> Result<ModerationRule, EngineError> {
        let _guard = self.lock.lock().await;
        info!(
            source = draft.source.name(),
            action = %draft.action,
            chat_id = draft.chat_id,
            "rule add requested"
        );

        let synthesized = if draft.needs_synthesis() {
            let candidate = self
                .synthesizer
                .synthesize_rule(SynthesisRequest {
                    rule_text: draft.description.clone(),
                    source: draft.source,
                    desired_action: draft.action,
                })
                .await?;
            debug!(
                layer = %candidate.layer,
                rule_type = %candidate.rule_type,
                category = candidate.category.as_deref(),
                has_regex = candidate.regex.is_some(),
                priority = candidate.priority,
                "rule synthesis response"
            );
            Some(candidate)
        } else {
            None
        };

        let rule = build_rule(&draft, synthesized.as_ref());
        self.storage.upsert_rule(&rule).await?;
        self.registry.add_rule(rule.clone()).await;
        info!(
            rule_id = %rule.rule_id,
            layer = %rule.layer,
            rule_type = rule.rule_type.name(),
            category = rule.category.as_deref(),
            has_pattern = rule.pattern.is_some(),
            priority = rule.priority.rank(),
            chat_id = rule.chat_id,
            "rule added"
        );
        Ok(rule)
    }

    pub async fn remove_rule(&self, rule_id: &str) -> Result<(), EngineError> {
        let _guard = self.lock.lock().await;
        self.storage.delete_rule(rule_id).await?;
        self.registry.remove_rule(rule_id).await;
        info!(rule_id = %rule_id, "rule removed");
        Ok(())
    }

    /// Without a chat id, global rules only; with one, global plus rules
    /// scoped to that chat.
    pub async fn list_rules(
        &self,
        chat_id: Option<i64>,
    ) -> Result<Vec<ModerationRule>, EngineError> {
        let rules = self.storage.list_rules().await?;
        Ok(rules
            .into_iter()
            .filter(|rule| match chat_id {
                None => rule.chat_id.is_none(),
                Some(chat_id) => rule.chat_id.is_none() || rule.chat_id == Some(chat_id),
            })
            .collect())
    }
}

fn build_rule(draft: &RuleDraft, synthesized: Option<&SynthesizedRule>) -> ModerationRule {
    let mut layer = draft.layer.unwrap_or_else(|| {
        resolve_layer(synthesized.map(|candidate| candidate.layer.as_str()).unwrap_or("contextual"))
    });
    let mut rule_type = draft.rule_type.unwrap_or_else(|| {
        resolve_type(
            synthesized
                .map(|candidate| candidate.rule_type.as_str())
                .unwrap_or("contextual"),
        )
    });
    let mut pattern = draft
        .pattern
        .clone()
        .filter(|pattern| !pattern.is_empty())
        .or_else(|| synthesized.and_then(|candidate| candidate.regex.clone()));
    let mut category = draft
        .category
        .clone()
        .filter(|category| !category.is_empty())
        .or_else(|| synthesized.and_then(|candidate| candidate.category.clone()));

    match layer {
        LayerKind::Category | LayerKind::Contextual => {
            if let Some(dropped) = pattern.take() {
                warn!(
                    layer = %layer,
                    pattern = %dropped.chars().take(50).collect::<String>(),
                    "pattern dropped, layer does not use regex patterns"
                );
            }
            if layer == LayerKind::Category
                && !category.as_deref().is_some_and(is_official_category)
            {
                warn!(
                    category = category.as_deref(),
                    "category not in official catalog, demoting to contextual layer"
                );
                layer = LayerKind::Contextual;
                rule_type = RuleType::Contextual;
            }
        }
        LayerKind::Regex => {
            if pattern.is_none() {
                warn!("regex layer requires a pattern, demoting to contextual layer");
                layer = LayerKind::Contextual;
                rule_type = RuleType::Contextual;
            } else {
                category = None;
            }
        }
    }

    let priority = draft.priority.unwrap_or_else(|| {
        ViolationPriority::bucket(synthesized.map(|candidate| candidate.priority).unwrap_or(10))
    });

    let mut metadata: Map<String, Value> = Map::new();
    metadata.insert("auto_generated".to_owned(), json!(true));
    if let Some(duration) = draft.action_duration_seconds {
        metadata.insert("action_duration_seconds".to_owned(), json!(duration));
    }

    ModerationRule {
        rule_id: Uuid::new_v4().to_string(),
        description: draft.description.clone(),
        action: draft.action,
        source: draft.source,
        layer,
        rule_type,
        chat_id: draft.chat_id,
        pattern,
        category,
        priority,
        action_duration_seconds: draft.action_duration_seconds,
        metadata,
    }
}

fn resolve_layer(value: &str) -> LayerKind {
    LayerKind::from_name(value).unwrap_or_else(|| {
        warn!(layer = value, "unknown layer from synthesizer");
        LayerKind::Contextual
    })
}

fn resolve_type(value: &str) -> RuleType {
    RuleType::from_name(value).unwrap_or_else(|| {
        warn!(rule_type = value, "unknown rule type from synthesizer");
        RuleType::Semantic
    })
}
