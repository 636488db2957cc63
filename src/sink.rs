use async_trait::async_trait;
use thiserror::Error;
use tracing::info;

use crate::{aggregator::PunishmentDecision, models::ModerationResult};

#[derive(Debug, Error)]
#[error("decision sink failed: {0}")]
pub struct SinkError(pub String);

/// External actuator callback. Invoked at least once per violating message;
/// handlers are expected to be idempotent per (chat, message, action).
#[async_trait]
pub trait DecisionSink: Send + Sync {
    async fn on_decision(
        &self,
        decision: &PunishmentDecision,
        result: &ModerationResult,
    ) -> Result<(), SinkError>;
}

/// Sink that only logs the decision. Default wiring for deployments where
/// the control plane consumes the structured log stream.
#[derive(Debug, Default)]
pub struct TracingSink;

#[async_trait]
impl DecisionSink for TracingSink {
    async fn on_decision(
        &self,
        decision: &PunishmentDecision,
        result: &ModerationResult,
    ) -> Result<(), SinkError> {
        info!(
            action = %decision.action(),
            rule = %decision.verdict.rule_code,
            layer = %decision.verdict.layer,
            chat_id = result.message.context.chat_id,
            user_id = result.message.context.user_id,
            message_id = result.message.context.message_id,
            conflicts = decision.conflicting.len(),
            "enforcement decision"
        );
        Ok(())
    }
}
