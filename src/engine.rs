use std::{env, sync::Arc, time::Duration};

use tokio::sync::watch;
use tracing::{error, info};

use crate::{
    backend::ModerationBackend,
    batcher::{BatcherConfig, BatcherError, MessageBatcher},
    errors::EngineError,
    layers::{
        category::CategoryLayer, contextual::ContextualLayer, regex::RegexLayer, ModerationLayer,
    },
    metrics::EngineMetrics,
    models::{LayerKind, MessageEnvelope, ModerationRule},
    pipeline::ModerationPipeline,
    registry::RuleRegistry,
    rules::{RuleDraft, RuleService},
    scheduler::{ModerationScheduler, SchedulerConfig},
    sink::DecisionSink,
    storage::StorageGateway,
};

#[derive(Debug, Clone, Copy)]
pub struct EngineConfig {
    pub batcher: BatcherConfig,
    pub scheduler: SchedulerConfig,
    pub regex_workers: usize,
    pub category_concurrency: usize,
    pub contextual_concurrency: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            batcher: BatcherConfig::default(),
            scheduler: SchedulerConfig::default(),
            regex_workers: 6,
            category_concurrency: 8,
            contextual_concurrency: 2,
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let read = |name: &str, fallback: usize| {
            env::var(name)
                .ok()
                .and_then(|value| value.parse::<usize>().ok())
                .unwrap_or(fallback)
        };
        Self {
            batcher: BatcherConfig::from_env(),
            scheduler: SchedulerConfig::from_env(),
            regex_workers: read("MODERATION_REGEX_WORKERS", defaults.regex_workers),
            category_concurrency: read(
                "MODERATION_CATEGORY_CONCURRENCY",
                defaults.category_concurrency,
            ),
            contextual_concurrency: read(
                "MODERATION_CONTEXTUAL_CONCURRENCY",
                defaults.contextual_concurrency,
            ),
        }
    }
}

/// Facade owning the whole moderation core: ingress, pipeline, scheduler,
/// rule service, and storage wiring.
pub struct ModerationEngine {
    batcher: MessageBatcher,
    scheduler: ModerationScheduler,
    pipeline: Arc<ModerationPipeline>,
    rule_service: RuleService,
    storage: Arc<dyn StorageGateway>,
    metrics: Arc<EngineMetrics>,
    ready: watch::Sender<bool>,
}

impl ModerationEngine {
    pub fn new(
        config: EngineConfig,
        backend: Arc<dyn ModerationBackend>,
        storage: Arc<dyn StorageGateway>,
        sink: Option<Arc<dyn DecisionSink>>,
    ) -> Result<Self, EngineError> {
        let metrics = Arc::new(EngineMetrics::new());
        let registry = Arc::new(RuleRegistry::new());
        let rule_service =
            RuleService::new(registry.clone(), storage.clone(), backend.clone());

        let layers: Vec<Arc<dyn ModerationLayer>> = vec![
            Arc::new(RegexLayer::new(registry.clone(), config.regex_workers)?),
            Arc::new(CategoryLayer::new(
                backend.clone(),
                registry.clone(),
                config.category_concurrency,
            )?),
            Arc::new(ContextualLayer::new(
                backend,
                registry,
                config.contextual_concurrency,
            )?),
        ];
        let pipeline = Arc::new(ModerationPipeline::new(layers));

        let batcher = MessageBatcher::new(config.batcher)?;
        let scheduler = ModerationScheduler::new(
            batcher.clone(),
            pipeline.clone(),
            storage.clone(),
            sink,
            metrics.clone(),
            config.scheduler,
        )?;

        let (ready, _) = watch::channel(false);
        Ok(Self {
            batcher,
            scheduler,
            pipeline,
            rule_service,
            storage,
            metrics,
            ready,
        })
    }

    /// Connects the store, seeds the registry, and starts the scheduler.
    /// A store failure here is fatal.
    pub async fn start(&self) -> Result<(), EngineError> {
        self.storage.connect().await?;
        self.rule_service.bootstrap().await?;
        self.scheduler.start().await;
        let _ = self.ready.send(true);
        info!("moderation engine started");
        Ok(())
    }

    pub async fn shutdown(&self) {
        self.scheduler.stop().await;
        self.batcher.stop().await;
        self.pipeline.shutdown().await;
        if let Err(store_error) = self.storage.disconnect().await {
            error!(error = %store_error, "store disconnect failed");
        }
        info!("moderation engine stopped");
    }

    /// Submits an envelope for moderation. Suspends until the engine has
    /// finished starting.
    pub async fn ingest(&self, message: MessageEnvelope) -> Result<(), BatcherError> {
        let mut ready = self.ready.subscribe();
        while !*ready.borrow() {
            if ready.changed().await.is_err() {
                break;
            }
        }
        self.metrics.observe_ingested();
        self.batcher.submit(message).await
    }

    pub async fn add_rule(&self, draft: RuleDraft) -> Result<ModerationRule, EngineError> {
        self.rule_service.add_rule(draft).await
    }

    pub async fn remove_rule(&self, rule_id: &str) -> Result<(), EngineError> {
        self.rule_service.remove_rule(rule_id).await
    }

    pub async fn list_rules(
        &self,
        chat_id: Option<i64>,
    ) -> Result<Vec<ModerationRule>, EngineError> {
        self.rule_service.list_rules(chat_id).await
    }

    pub fn pause_layer(&self, layer: LayerKind, duration: Duration) {
        self.scheduler.pause_layer(layer, duration);
    }

    pub fn resume_layer(&self, layer: LayerKind) {
        self.scheduler.resume_layer(layer);
    }

    pub fn metrics(&self) -> &EngineMetrics {
        &self.metrics
    }
}
