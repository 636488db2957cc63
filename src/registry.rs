use std::collections::HashMap;

use tokio::sync::Mutex;
use tracing::info;

use crate::models::{LayerKind, ModerationRule};

/// In-memory index of active rules, keyed by layer and chat scope. The
/// store owns durable state; this holds the snapshot the layers read.
/// All operations serialize through one mutex and reads return clones.
#[derive(Default)]
pub struct RuleRegistry {
    rules: Mutex<HashMap<LayerKind, HashMap<Option<i64>, Vec<ModerationRule>>>>,
}

impl RuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Atomically replaces the whole index.
    pub async fn seed(&self, rules: Vec<ModerationRule>) {
        let mut index = self.rules.lock().await;
        index.clear();
        let total = rules.len();
        for rule in rules {
            index
                .entry(rule.layer)
                .or_default()
                .entry(rule.chat_id)
                .or_default()
                .push(rule);
        }
        info!(total, "rule registry seeded");
    }

    pub async fn add_rule(&self, rule: ModerationRule) {
        let mut index = self.rules.lock().await;
        let rule_id = rule.rule_id.clone();
        let layer = rule.layer;
        let chat_id = rule.chat_id;
        index
            .entry(layer)
            .or_default()
            .entry(chat_id)
            .or_default()
            .push(rule);
        info!(rule_id = %rule_id, layer = %layer, chat_id, "rule registered");
    }

    /// Removes every occurrence of the rule id and collapses chat buckets
    /// that become empty.
    pub async fn remove_rule(&self, rule_id: &str) {
        let mut index = self.rules.lock().await;
        for by_chat in index.values_mut() {
            by_chat.retain(|_, rules| {
                rules.retain(|rule| rule.rule_id != rule_id);
                !rules.is_empty()
            });
        }
        info!(rule_id = %rule_id, "rule removed from registry");
    }

    /// Every rule for a layer across all chat scopes. Used for warmup.
    pub async fn all_rules_for_layer(&self, layer: LayerKind) -> Vec<ModerationRule> {
        let index = self.rules.lock().await;
        index
            .get(&layer)
            .map(|by_chat| by_chat.values().flatten().cloned().collect())
            .unwrap_or_default()
    }

    /// Globals first, then the chat-scoped bucket; insertion order within
    /// each bucket.
    pub async fn get_rules_for_layer(
        &self,
        layer: LayerKind,
        chat_id: Option<i64>,
    ) -> Vec<ModerationRule> {
        let index = self.rules.lock().await;
        let Some(by_chat) = index.get(&layer) else {
            return Vec::new();
        };
        let mut combined = by_chat.get(&None).cloned().unwrap_or_default();
        if let Some(chat_id) = chat_id {
            if let Some(scoped) = by_chat.get(&Some(chat_id)) {
                combined.extend(scoped.iter().cloned());
            }
        }
        combined
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Action, RuleSource, RuleType, ViolationPriority};

    fn rule(rule_id: &str, layer: LayerKind, chat_id: Option<i64>) -> ModerationRule {
        ModerationRule {
            rule_id: rule_id.to_owned(),
            description: "test rule".to_owned(),
            action: Action::Warn,
            source: RuleSource::Admin,
            layer,
            rule_type: RuleType::Regex,
            chat_id,
            pattern: None,
            category: None,
            priority: ViolationPriority::Other,
            action_duration_seconds: None,
            metadata: serde_json::Map::new(),
        }
    }

    #[tokio::test]
    async fn returns_global_and_chat_specific_rules() {
        let registry = RuleRegistry::new();
        registry
            .seed(vec![
                rule("global", LayerKind::Regex, None),
                rule("chat", LayerKind::Regex, Some(123)),
            ])
            .await;

        let globals = registry.get_rules_for_layer(LayerKind::Regex, None).await;
        assert_eq!(
            globals.iter().map(|rule| rule.rule_id.as_str()).collect::<Vec<_>>(),
            vec!["global"]
        );

        let scoped = registry
            .get_rules_for_layer(LayerKind::Regex, Some(123))
            .await;
        assert_eq!(
            scoped.iter().map(|rule| rule.rule_id.as_str()).collect::<Vec<_>>(),
            vec!["global", "chat"]
        );
    }

    #[tokio::test]
    async fn repeated_reads_are_idempotent() {
        let registry = RuleRegistry::new();
        registry.seed(vec![rule("only", LayerKind::Category, None)]).await;

        let first = registry.get_rules_for_layer(LayerKind::Category, Some(5)).await;
        let second = registry.get_rules_for_layer(LayerKind::Category, Some(5)).await;
        assert_eq!(first, second);
        assert_eq!(first.len(), 1);
    }

    #[tokio::test]
    async fn remove_rule_collapses_empty_buckets() {
        let registry = RuleRegistry::new();
        registry
            .seed(vec![
                rule("keep", LayerKind::Regex, Some(7)),
                rule("drop", LayerKind::Regex, Some(8)),
            ])
            .await;
        registry.remove_rule("drop").await;

        assert!(registry
            .get_rules_for_layer(LayerKind::Regex, Some(8))
            .await
            .is_empty());
        assert_eq!(
            registry
                .get_rules_for_layer(LayerKind::Regex, Some(7))
                .await
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn layers_are_isolated() {
        let registry = RuleRegistry::new();
        registry.seed(vec![rule("r", LayerKind::Regex, None)]).await;

        assert!(registry
            .get_rules_for_layer(LayerKind::Contextual, None)
            .await
            .is_empty());
    }
}
