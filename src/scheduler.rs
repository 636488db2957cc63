use std::{
    collections::{HashMap, HashSet},
    env,
    sync::{Arc, Mutex as StdMutex},
    time::Duration,
};

use tokio::{
    sync::{Mutex, Notify, Semaphore},
    task::{JoinHandle, JoinSet},
    time::Instant,
};
use tracing::{debug, error, info, warn};

use crate::{
    aggregator::PunishmentAggregator,
    batcher::{MessageBatch, MessageBatcher},
    errors::EngineError,
    metrics::EngineMetrics,
    models::LayerKind,
    pipeline::ModerationPipeline,
    sink::DecisionSink,
    storage::StorageGateway,
};

#[derive(Debug, Clone, Copy)]
pub struct SchedulerConfig {
    pub max_concurrent_batches: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_batches: 4,
        }
    }
}

impl SchedulerConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let max_concurrent_batches = env::var("MODERATION_CONCURRENT_BATCHES")
            .ok()
            .and_then(|value| value.parse::<usize>().ok())
            .unwrap_or(defaults.max_concurrent_batches);
        Self {
            max_concurrent_batches,
        }
    }
}

/// Consumes batches from the batcher, runs the pipeline under a concurrency
/// bound, and fans every violating result out to storage and the decision
/// sink. Batch failures never stop the consumer loop.
pub struct ModerationScheduler {
    inner: Arc<SchedulerInner>,
    main_task: Mutex<Option<JoinHandle<()>>>,
}

struct SchedulerInner {
    batcher: MessageBatcher,
    pipeline: Arc<ModerationPipeline>,
    storage: Arc<dyn StorageGateway>,
    aggregator: PunishmentAggregator,
    sink: Option<Arc<dyn DecisionSink>>,
    metrics: Arc<EngineMetrics>,
    permits: Arc<Semaphore>,
    disabled_until: StdMutex<HashMap<LayerKind, Instant>>,
    shutdown: Notify,
}

impl ModerationScheduler {
    pub fn new(
        batcher: MessageBatcher,
        pipeline: Arc<ModerationPipeline>,
        storage: Arc<dyn StorageGateway>,
        sink: Option<Arc<dyn DecisionSink>>,
        metrics: Arc<EngineMetrics>,
        config: SchedulerConfig,
    ) -> Result<Self, EngineError> {
        if config.max_concurrent_batches == 0 {
            return Err(EngineError::Config(
                "max_concurrent_batches must be at least 1".to_owned(),
            ));
        }
        Ok(Self {
            inner: Arc::new(SchedulerInner {
                batcher,
                pipeline,
                storage,
                aggregator: PunishmentAggregator::new(),
                sink,
                metrics,
                permits: Arc::new(Semaphore::new(config.max_concurrent_batches)),
                disabled_until: StdMutex::new(HashMap::new()),
                shutdown: Notify::new(),
            }),
            main_task: Mutex::new(None),
        })
    }

    /// Warms up the layers and spawns the consumer task. Idempotent.
    pub async fn start(&self) {
        let mut main_task = self.main_task.lock().await;
        if main_task.is_some() {
            return;
        }
        self.inner.pipeline.warmup().await;
        let inner = self.inner.clone();
        *main_task = Some(tokio::spawn(run(inner)));
        info!("scheduler started");
    }

    /// Signals shutdown and waits for the consumer and any in-flight batch
    /// tasks; their failures are logged, never propagated.
    pub async fn stop(&self) {
        self.inner.shutdown.notify_one();
        if let Some(handle) = self.main_task.lock().await.take() {
            if let Err(join_error) = handle.await {
                error!(error = %join_error, "scheduler consumer ended abnormally");
            }
        }
        info!("scheduler stopped");
    }

    /// Disables a layer until the deadline; an existing later deadline is
    /// kept. The layer resumes automatically once the deadline passes.
    pub fn pause_layer(&self, layer: LayerKind, duration: Duration) {
        let until = Instant::now() + duration;
        let mut disabled = self
            .inner
            .disabled_until
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let entry = disabled.entry(layer).or_insert(until);
        *entry = (*entry).max(until);
        warn!(layer = %layer, duration_secs = duration.as_secs_f64(), "layer paused");
    }

    pub fn resume_layer(&self, layer: LayerKind) {
        let mut disabled = self
            .inner
            .disabled_until
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if disabled.remove(&layer).is_some() {
            info!(layer = %layer, "layer resumed");
        }
    }
}

async fn run(inner: Arc<SchedulerInner>) {
    let mut tasks: JoinSet<()> = JoinSet::new();
    loop {
        tokio::select! {
            _ = inner.shutdown.notified() => break,
            Some(finished) = tasks.join_next(), if !tasks.is_empty() => {
                reap(finished);
            }
            batch = inner.batcher.get() => {
                let batch = match batch {
                    Ok(batch) => batch,
                    Err(_) => break,
                };
                info!(
                    size = batch.items.len(),
                    reason = batch.flush_reason.name(),
                    "batch received"
                );
                let permit = match inner.permits.clone().acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => break,
                };
                let task_inner = inner.clone();
                tasks.spawn(async move {
                    let _permit = permit;
                    process_batch(task_inner, batch).await;
                });
            }
        }
    }
    while let Some(finished) = tasks.join_next().await {
        reap(finished);
    }
}

fn reap(finished: Result<(), tokio::task::JoinError>) {
    if let Err(join_error) = finished {
        error!(error = %join_error, "batch task failed");
    }
}

async fn process_batch(inner: Arc<SchedulerInner>, batch: MessageBatch) {
    let _inflight = inner.metrics.inflight_guard();
    let started = Instant::now();
    let reason = batch.flush_reason;
    let disabled = inner.current_disabled_layers();
    debug!(
        size = batch.items.len(),
        disabled = ?disabled.iter().map(LayerKind::name).collect::<Vec<_>>(),
        "processing batch"
    );

    let results = inner.pipeline.process_batch(batch, &disabled).await;

    // Incidents land before any enforcement for the same batch.
    if let Err(store_error) = inner.storage.record_batch_results(&results).await {
        inner.metrics.observe_store_error();
        error!(error = %store_error, "failed to record incidents");
    }

    for result in &results {
        let Some(decision) = inner.aggregator.decide(std::slice::from_ref(result)) else {
            continue;
        };
        inner.metrics.observe_verdict(&decision.verdict);
        info!(
            action = %decision.action(),
            rule = %decision.verdict.rule_code,
            "scheduler decision"
        );
        if let Some(sink) = &inner.sink {
            if let Err(sink_error) = sink.on_decision(&decision, result).await {
                inner.metrics.observe_sink_error();
                error!(error = %sink_error, "decision sink failed");
            }
        }
    }

    inner
        .metrics
        .observe_batch(reason.name(), started.elapsed().as_secs_f64());
}

impl SchedulerInner {
    /// Snapshot of layers still inside their pause window. Expired entries
    /// are garbage-collected here.
    fn current_disabled_layers(&self) -> HashSet<LayerKind> {
        let now = Instant::now();
        let mut disabled = self
            .disabled_until
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        disabled.retain(|_, until| *until > now);
        disabled.keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use chrono::Utc;
    use serde_json::Map;
    use tokio::{
        sync::mpsc,
        time::{timeout, Duration},
    };

    use super::*;
    use crate::{
        aggregator::PunishmentDecision,
        batcher::BatcherConfig,
        layers::ModerationLayer,
        models::{
            Action, ChatContext, MessageEnvelope, ModerationResult, ModerationVerdict,
            ViolationPriority,
        },
        sink::SinkError,
        storage::memory::MemoryStorage,
    };

    struct AlwaysViolatingLayer;

    #[async_trait]
    impl ModerationLayer for AlwaysViolatingLayer {
        fn kind(&self) -> LayerKind {
            LayerKind::Regex
        }

        fn priority(&self) -> u32 {
            10
        }

        async fn evaluate(&self, _message: &MessageEnvelope) -> Option<ModerationVerdict> {
            Some(ModerationVerdict {
                layer: LayerKind::Regex,
                rule_code: "always".to_owned(),
                priority: ViolationPriority::Spam,
                action: Action::Warn,
                reason: "auto".to_owned(),
                violated: true,
                details: Map::new(),
            })
        }
    }

    struct ChannelSink {
        tx: mpsc::UnboundedSender<(PunishmentDecision, ModerationResult)>,
        fail: bool,
    }

    #[async_trait]
    impl DecisionSink for ChannelSink {
        async fn on_decision(
            &self,
            decision: &PunishmentDecision,
            result: &ModerationResult,
        ) -> Result<(), SinkError> {
            let _ = self.tx.send((decision.clone(), result.clone()));
            if self.fail {
                Err(SinkError("actuator offline".to_owned()))
            } else {
                Ok(())
            }
        }
    }

    fn envelope(message_id: i64) -> MessageEnvelope {
        MessageEnvelope {
            context: ChatContext {
                chat_id: 100,
                user_id: 10,
                message_id,
                timestamp: Utc::now(),
                username: None,
                language_code: None,
            },
            text: Some("violation".to_owned()),
            caption: None,
            media_type: None,
            images: Vec::new(),
            metadata: Map::new(),
        }
    }

    fn fixture(
        fail_sink: bool,
    ) -> (
        MessageBatcher,
        ModerationScheduler,
        Arc<MemoryStorage>,
        mpsc::UnboundedReceiver<(PunishmentDecision, ModerationResult)>,
    ) {
        let batcher = MessageBatcher::new(BatcherConfig {
            max_batch_size: 1,
            max_delay: Duration::from_millis(10),
        })
        .expect("valid batcher config");
        let pipeline = Arc::new(ModerationPipeline::new(vec![Arc::new(
            AlwaysViolatingLayer,
        )]));
        let storage = Arc::new(MemoryStorage::new());
        let (tx, rx) = mpsc::unbounded_channel();
        let sink = Arc::new(ChannelSink { tx, fail: fail_sink });
        let scheduler = ModerationScheduler::new(
            batcher.clone(),
            pipeline,
            storage.clone(),
            Some(sink),
            Arc::new(EngineMetrics::new()),
            SchedulerConfig {
                max_concurrent_batches: 1,
            },
        )
        .expect("valid scheduler config");
        (batcher, scheduler, storage, rx)
    }

    #[tokio::test]
    async fn processes_batches_and_invokes_decision_sink() {
        let (batcher, scheduler, storage, mut decisions) = fixture(false);
        scheduler.start().await;

        batcher.submit(envelope(1)).await.expect("submit");
        let (decision, result) = timeout(Duration::from_secs(1), decisions.recv())
            .await
            .expect("decision within 1s")
            .expect("channel open");

        assert_eq!(decision.verdict.rule_code, "always");
        assert_eq!(decision.action(), Action::Warn);
        assert_eq!(result.message.context.message_id, 1);

        let incidents = storage.incidents();
        assert_eq!(incidents.len(), 1);
        assert_eq!(incidents[0].rule_id, "always");
        assert_eq!(incidents[0].action, Action::Warn);
        assert_eq!(incidents[0].priority, ViolationPriority::Spam);
        assert_eq!(incidents[0].chat_id, 100);
        assert_eq!(incidents[0].user_id, 10);
        assert_eq!(incidents[0].message_id, 1);

        scheduler.stop().await;
        batcher.stop().await;
    }

    #[tokio::test]
    async fn sink_failure_does_not_stop_the_scheduler() {
        let (batcher, scheduler, storage, mut decisions) = fixture(true);
        scheduler.start().await;

        batcher.submit(envelope(1)).await.expect("first submit");
        timeout(Duration::from_secs(1), decisions.recv())
            .await
            .expect("first decision")
            .expect("channel open");

        batcher.submit(envelope(2)).await.expect("second submit");
        timeout(Duration::from_secs(1), decisions.recv())
            .await
            .expect("second decision")
            .expect("channel open");

        assert_eq!(storage.incidents().len(), 2);
        scheduler.stop().await;
        batcher.stop().await;
    }

    #[tokio::test]
    async fn paused_layer_is_skipped_until_resumed() {
        let (batcher, scheduler, storage, mut decisions) = fixture(false);
        scheduler.start().await;
        scheduler.pause_layer(LayerKind::Regex, Duration::from_secs(60));

        batcher.submit(envelope(1)).await.expect("submit");
        assert!(
            timeout(Duration::from_millis(300), decisions.recv())
                .await
                .is_err(),
            "no decision while the only layer is paused"
        );
        assert!(storage.incidents().is_empty());

        scheduler.resume_layer(LayerKind::Regex);
        batcher.submit(envelope(2)).await.expect("submit after resume");
        let (decision, _) = timeout(Duration::from_secs(1), decisions.recv())
            .await
            .expect("decision after resume")
            .expect("channel open");
        assert_eq!(decision.verdict.rule_code, "always");

        scheduler.stop().await;
        batcher.stop().await;
    }

    #[tokio::test]
    async fn pause_deadline_expires_on_its_own() {
        let (batcher, scheduler, _, mut decisions) = fixture(false);
        scheduler.start().await;
        scheduler.pause_layer(LayerKind::Regex, Duration::from_millis(50));

        tokio::time::sleep(Duration::from_millis(120)).await;
        batcher.submit(envelope(1)).await.expect("submit");
        assert!(timeout(Duration::from_secs(1), decisions.recv())
            .await
            .expect("decision after expiry")
            .is_some());

        scheduler.stop().await;
        batcher.stop().await;
    }

    #[tokio::test]
    async fn start_is_idempotent() {
        let (batcher, scheduler, _, _rx) = fixture(false);
        scheduler.start().await;
        scheduler.start().await;
        scheduler.stop().await;
        batcher.stop().await;
    }
}
