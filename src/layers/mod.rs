pub mod category;
pub mod contextual;
pub mod regex;

use async_trait::async_trait;

use crate::models::{LayerKind, MessageEnvelope, ModerationVerdict};

/// One stage of the moderation pipeline. Failures never escape a layer:
/// an evaluation that cannot complete returns no verdict.
#[async_trait]
pub trait ModerationLayer: Send + Sync {
    fn kind(&self) -> LayerKind;

    /// Position in pipeline order; lower runs first.
    fn priority(&self) -> u32;

    async fn evaluate(&self, message: &MessageEnvelope) -> Option<ModerationVerdict>;

    async fn warmup(&self) {}

    async fn shutdown(&self) {}
}
