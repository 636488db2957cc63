use std::{collections::HashSet, sync::Arc};

use futures_util::future::join_all;
use tracing::{debug, info};

use crate::{
    batcher::MessageBatch,
    layers::ModerationLayer,
    models::{LayerKind, MessageEnvelope, ModerationResult},
};

/// Immutable, priority-ordered sequence of moderation layers with
/// short-circuit evaluation.
pub struct ModerationPipeline {
    layers: Vec<Arc<dyn ModerationLayer>>,
}

impl ModerationPipeline {
    pub fn new(mut layers: Vec<Arc<dyn ModerationLayer>>) -> Self {
        layers.sort_by_key(|layer| layer.priority());
        info!(
            layers = ?layers.iter().map(|layer| layer.kind().name()).collect::<Vec<_>>(),
            "pipeline initialized"
        );
        Self { layers }
    }

    pub async fn warmup(&self) {
        info!("pipeline warmup start");
        join_all(self.layers.iter().map(|layer| layer.warmup())).await;
        info!("pipeline warmup complete");
    }

    pub async fn shutdown(&self) {
        join_all(self.layers.iter().map(|layer| layer.shutdown())).await;
    }

    pub async fn process_message(
        &self,
        message: MessageEnvelope,
        disabled_layers: &HashSet<LayerKind>,
    ) -> ModerationResult {
        debug!(
            message_id = message.context.message_id,
            chat_id = message.context.chat_id,
            "pipeline message start"
        );
        let mut evaluated = Vec::new();
        for layer in &self.layers {
            if disabled_layers.contains(&layer.kind()) {
                debug!(layer = %layer.kind(), "layer skipped, disabled");
                continue;
            }
            evaluated.push(layer.kind());
            let verdict = layer.evaluate(&message).await;
            if let Some(verdict) = verdict {
                if verdict.short_circuit() {
                    info!(
                        message_id = message.context.message_id,
                        layer = %verdict.layer,
                        rule = %verdict.rule_code,
                        action = %verdict.action,
                        "pipeline violation"
                    );
                    return ModerationResult {
                        message,
                        verdict: Some(verdict),
                        evaluated_layers: evaluated,
                    };
                }
            }
        }
        debug!(
            message_id = message.context.message_id,
            evaluated = ?evaluated.iter().map(LayerKind::name).collect::<Vec<_>>(),
            "pipeline message clean"
        );
        ModerationResult {
            message,
            verdict: None,
            evaluated_layers: evaluated,
        }
    }

    /// Evaluates every envelope of the batch concurrently. The returned list
    /// preserves the batch's submission order.
    pub async fn process_batch(
        &self,
        batch: MessageBatch,
        disabled_layers: &HashSet<LayerKind>,
    ) -> Vec<ModerationResult> {
        let size = batch.items.len();
        info!(size, reason = batch.flush_reason.name(), "pipeline batch start");
        let results = join_all(
            batch
                .items
                .into_iter()
                .map(|item| self.process_message(item, disabled_layers)),
        )
        .await;
        let violations = results
            .iter()
            .filter(|result| {
                result
                    .verdict
                    .as_ref()
                    .is_some_and(|verdict| verdict.violated)
            })
            .count();
        info!(size, violations, "pipeline batch complete");
        results
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use chrono::Utc;
    use serde_json::Map;

    use super::*;
    use crate::{
        batcher::FlushReason,
        models::{Action, ChatContext, ModerationVerdict, ViolationPriority},
    };

    struct StubLayer {
        kind: LayerKind,
        priority: u32,
        verdict: Option<ModerationVerdict>,
        calls: AtomicUsize,
    }

    impl StubLayer {
        fn new(kind: LayerKind, priority: u32, verdict: Option<ModerationVerdict>) -> Arc<Self> {
            Arc::new(Self {
                kind,
                priority,
                verdict,
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ModerationLayer for StubLayer {
        fn kind(&self) -> LayerKind {
            self.kind
        }

        fn priority(&self) -> u32 {
            self.priority
        }

        async fn evaluate(&self, _message: &MessageEnvelope) -> Option<ModerationVerdict> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.verdict.clone()
        }
    }

    fn envelope(text: &str) -> MessageEnvelope {
        MessageEnvelope {
            context: ChatContext {
                chat_id: 100,
                user_id: 10,
                message_id: 1,
                timestamp: Utc::now(),
                username: None,
                language_code: None,
            },
            text: Some(text.to_owned()),
            caption: None,
            media_type: None,
            images: Vec::new(),
            metadata: Map::new(),
        }
    }

    fn violation(layer: LayerKind) -> ModerationVerdict {
        ModerationVerdict {
            layer,
            rule_code: "rule".to_owned(),
            priority: ViolationPriority::Threats,
            action: Action::Ban,
            reason: "hit".to_owned(),
            violated: true,
            details: Map::new(),
        }
    }

    #[tokio::test]
    async fn short_circuits_on_first_violation() {
        let trigger = StubLayer::new(LayerKind::Regex, 10, Some(violation(LayerKind::Regex)));
        let spy = StubLayer::new(LayerKind::Category, 20, None);
        let last = StubLayer::new(LayerKind::Contextual, 30, None);
        // Construction order is irrelevant; the pipeline sorts by priority.
        let pipeline = ModerationPipeline::new(vec![spy.clone(), trigger.clone(), last.clone()]);

        let result = pipeline
            .process_message(envelope("boom"), &HashSet::new())
            .await;

        assert_eq!(trigger.calls(), 1);
        assert_eq!(spy.calls(), 0);
        assert_eq!(last.calls(), 0);
        assert_eq!(result.evaluated_layers, vec![LayerKind::Regex]);
        assert_eq!(
            result.verdict.expect("verdict expected").rule_code,
            "rule"
        );
    }

    #[tokio::test]
    async fn evaluates_all_layers_when_clean() {
        let first = StubLayer::new(LayerKind::Regex, 10, None);
        let second = StubLayer::new(LayerKind::Category, 20, None);
        let third = StubLayer::new(LayerKind::Contextual, 30, None);
        let pipeline = ModerationPipeline::new(vec![first.clone(), second.clone(), third.clone()]);

        let result = pipeline
            .process_message(envelope("clean"), &HashSet::new())
            .await;

        assert!(result.verdict.is_none());
        assert_eq!(first.calls(), 1);
        assert_eq!(second.calls(), 1);
        assert_eq!(third.calls(), 1);
        assert_eq!(
            result.evaluated_layers,
            vec![LayerKind::Regex, LayerKind::Category, LayerKind::Contextual]
        );
    }

    #[tokio::test]
    async fn disabled_layers_are_never_invoked() {
        let first = StubLayer::new(LayerKind::Regex, 10, None);
        let second = StubLayer::new(LayerKind::Category, 20, None);
        let third = StubLayer::new(LayerKind::Contextual, 30, None);
        let pipeline = ModerationPipeline::new(vec![first.clone(), second.clone(), third.clone()]);

        let disabled = HashSet::from([LayerKind::Category]);
        let result = pipeline.process_message(envelope("text"), &disabled).await;

        assert_eq!(second.calls(), 0);
        assert_eq!(third.calls(), 1);
        assert_eq!(
            result.evaluated_layers,
            vec![LayerKind::Regex, LayerKind::Contextual]
        );
    }

    #[tokio::test]
    async fn violation_with_none_action_does_not_stop_evaluation() {
        let mut observed = violation(LayerKind::Regex);
        observed.action = Action::None;
        let first = StubLayer::new(LayerKind::Regex, 10, Some(observed));
        let second = StubLayer::new(LayerKind::Category, 20, None);
        let pipeline = ModerationPipeline::new(vec![first.clone(), second.clone()]);

        let result = pipeline
            .process_message(envelope("text"), &HashSet::new())
            .await;

        assert_eq!(second.calls(), 1);
        assert!(result.verdict.is_none());
    }

    #[tokio::test]
    async fn batch_results_preserve_submission_order() {
        let layer = StubLayer::new(LayerKind::Regex, 10, None);
        let pipeline = ModerationPipeline::new(vec![layer]);
        let batch = MessageBatch {
            items: (0..5)
                .map(|index| {
                    let mut message = envelope(&format!("m{index}"));
                    message.context.message_id = index;
                    message
                })
                .collect(),
            created_at: Utc::now(),
            flush_reason: FlushReason::Size,
        };

        let results = pipeline.process_batch(batch, &HashSet::new()).await;
        let ids: Vec<i64> = results
            .iter()
            .map(|result| result.message.context.message_id)
            .collect();
        assert_eq!(ids, vec![0, 1, 2, 3, 4]);
    }
}
