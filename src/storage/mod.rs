pub mod memory;
pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use thiserror::Error;

use crate::models::{Action, LayerKind, ModerationResult, ModerationRule, ViolationPriority};

/// One appended incident row, mirroring the `moderation_incidents` relation.
#[derive(Debug, Clone)]
pub struct IncidentRecord {
    pub rule_id: String,
    pub layer: LayerKind,
    pub action: Action,
    pub priority: ViolationPriority,
    pub chat_id: i64,
    pub user_id: i64,
    pub message_id: i64,
    pub occurred_at: DateTime<Utc>,
    pub reason: Option<String>,
    pub payload: Value,
}

impl IncidentRecord {
    /// Results without a verdict produce no incident.
    pub fn from_result(result: &ModerationResult) -> Option<Self> {
        let verdict = result.verdict.as_ref()?;
        let context = &result.message.context;
        Some(Self {
            rule_id: verdict.rule_code.clone(),
            layer: verdict.layer,
            action: verdict.action,
            priority: verdict.priority,
            chat_id: context.chat_id,
            user_id: context.user_id,
            message_id: context.message_id,
            occurred_at: context.timestamp,
            reason: Some(verdict.reason.clone()),
            payload: Value::Object(verdict.details.clone()),
        })
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store connection failed: {0}")]
    Connect(String),
    #[error("store not connected")]
    NotConnected,
    #[error("store query failed: {0}")]
    Query(String),
    #[error("stored row malformed: {0}")]
    Corrupt(String),
}

/// Durable repository for rules and incidents. Rule state is owned here;
/// the registry only ever holds a snapshot of it.
#[async_trait]
pub trait StorageGateway: Send + Sync {
    async fn connect(&self) -> Result<(), StoreError>;
    async fn disconnect(&self) -> Result<(), StoreError>;

    async fn list_rules(&self) -> Result<Vec<ModerationRule>, StoreError>;
    async fn upsert_rule(&self, rule: &ModerationRule) -> Result<(), StoreError>;
    async fn delete_rule(&self, rule_id: &str) -> Result<(), StoreError>;

    async fn record_incident(&self, result: &ModerationResult) -> Result<(), StoreError> {
        self.record_batch_results(std::slice::from_ref(result)).await
    }

    async fn record_batch_results(&self, results: &[ModerationResult]) -> Result<(), StoreError>;
}
