use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use regex::{Regex, RegexBuilder};
use serde_json::{Map, Value};
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

use crate::{
    errors::EngineError,
    layers::ModerationLayer,
    models::{LayerKind, MessageEnvelope, ModerationRule, ModerationVerdict},
    registry::RuleRegistry,
};

/// Synchronous pattern matching against the message text. Matching runs on
/// the blocking pool behind a bounded semaphore so a pathological pattern
/// cannot stall the event loop.
pub struct RegexLayer {
    registry: Arc<RuleRegistry>,
    compiled: Mutex<HashMap<String, Regex>>,
    workers: Arc<Semaphore>,
}

impl RegexLayer {
    pub fn new(registry: Arc<RuleRegistry>, workers: usize) -> Result<Self, EngineError> {
        if workers == 0 {
            return Err(EngineError::Config(
                "regex workers must be at least 1".to_owned(),
            ));
        }
        Ok(Self {
            registry,
            compiled: Mutex::new(HashMap::new()),
            workers: Arc::new(Semaphore::new(workers)),
        })
    }

    /// Compiles the rule's pattern if it has not been seen yet. Idempotent;
    /// a pattern that fails to compile is skipped and logged.
    fn compile_rule(&self, rule: &ModerationRule) {
        let Some(pattern) = rule.pattern.as_deref() else {
            return;
        };
        let mut compiled = self.compiled.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if compiled.contains_key(&rule.rule_id) {
            return;
        }
        match RegexBuilder::new(pattern)
            .case_insensitive(true)
            .multi_line(true)
            .build()
        {
            Ok(regex) => {
                compiled.insert(rule.rule_id.clone(), regex);
            }
            Err(parse_error) => {
                warn!(
                    rule_id = %rule.rule_id,
                    error = %parse_error,
                    "skipping rule with uncompilable pattern"
                );
            }
        }
    }

    fn compiled_pairs(&self, rules: &[ModerationRule]) -> Vec<(ModerationRule, Regex)> {
        let compiled = self.compiled.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        rules
            .iter()
            .filter_map(|rule| {
                compiled
                    .get(&rule.rule_id)
                    .map(|regex| (rule.clone(), regex.clone()))
            })
            .collect()
    }
}

#[async_trait]
impl ModerationLayer for RegexLayer {
    fn kind(&self) -> LayerKind {
        LayerKind::Regex
    }

    fn priority(&self) -> u32 {
        10
    }

    async fn warmup(&self) {
        let rules = self.registry.all_rules_for_layer(LayerKind::Regex).await;
        for rule in &rules {
            self.compile_rule(rule);
        }
        info!(rules = rules.len(), "regex layer warmed up");
    }

    async fn evaluate(&self, message: &MessageEnvelope) -> Option<ModerationVerdict> {
        let text = message.content_text();
        if text.is_empty() {
            debug!(message_id = message.context.message_id, "regex skip, no text");
            return None;
        }

        let rules = self
            .registry
            .get_rules_for_layer(LayerKind::Regex, Some(message.context.chat_id))
            .await;
        if rules.is_empty() {
            debug!("regex skip, no rules");
            return None;
        }

        for rule in &rules {
            self.compile_rule(rule);
        }

        let pairs = self.compiled_pairs(&rules);
        let haystack = text.to_owned();
        let permit = self.workers.acquire().await.ok()?;
        let matched = tokio::task::spawn_blocking(move || {
            pairs.into_iter().find_map(|(rule, regex)| {
                regex
                    .find(&haystack)
                    .map(|found| (rule, found.as_str().to_owned()))
            })
        })
        .await;
        drop(permit);

        let matched = match matched {
            Ok(matched) => matched,
            Err(join_error) => {
                error!(error = %join_error, "regex match task failed");
                return None;
            }
        };

        let (rule, matched_text) = match matched {
            Some(hit) => hit,
            None => {
                debug!(message_id = message.context.message_id, "regex no match");
                return None;
            }
        };

        info!(
            rule_id = %rule.rule_id,
            message_id = message.context.message_id,
            user_id = message.context.user_id,
            "regex match"
        );
        let mut details = Map::new();
        details.insert("matched".to_owned(), Value::String(matched_text));
        details.insert(
            "pattern".to_owned(),
            Value::String(rule.pattern.clone().unwrap_or_default()),
        );
        if let Some(duration) = rule.action_duration_seconds {
            details.insert("action_duration_seconds".to_owned(), Value::from(duration));
        }

        Some(ModerationVerdict {
            layer: LayerKind::Regex,
            rule_code: rule.rule_id,
            priority: rule.priority,
            action: rule.action,
            reason: rule.description,
            violated: true,
            details,
        })
    }
}
