use std::sync::Mutex;

use async_trait::async_trait;
use tracing::debug;

use crate::{
    models::{ModerationResult, ModerationRule},
    storage::{IncidentRecord, StorageGateway, StoreError},
};

/// Volatile storage gateway for tests and ephemeral deployments. Upsert
/// semantics match the SQLite gateway.
#[derive(Default)]
pub struct MemoryStorage {
    rules: Mutex<Vec<ModerationRule>>,
    incidents: Mutex<Vec<IncidentRecord>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incidents(&self) -> Vec<IncidentRecord> {
        self.incidents
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

#[async_trait]
impl StorageGateway for MemoryStorage {
    async fn connect(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn list_rules(&self) -> Result<Vec<ModerationRule>, StoreError> {
        Ok(self
            .rules
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone())
    }

    async fn upsert_rule(&self, rule: &ModerationRule) -> Result<(), StoreError> {
        let mut rules = self
            .rules
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        match rules.iter_mut().find(|stored| stored.rule_id == rule.rule_id) {
            Some(stored) => *stored = rule.clone(),
            None => rules.push(rule.clone()),
        }
        Ok(())
    }

    async fn delete_rule(&self, rule_id: &str) -> Result<(), StoreError> {
        self.rules
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .retain(|rule| rule.rule_id != rule_id);
        Ok(())
    }

    async fn record_batch_results(&self, results: &[ModerationResult]) -> Result<(), StoreError> {
        let mut incidents = self
            .incidents
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let before = incidents.len();
        incidents.extend(results.iter().filter_map(IncidentRecord::from_result));
        debug!(appended = incidents.len() - before, "incidents recorded");
        Ok(())
    }
}
