use prometheus::{
    opts, Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Registry,
    TextEncoder,
};

use crate::models::ModerationVerdict;

/// Engine-wide counters and gauges. Registration failures are programming
/// errors, hence the expects.
#[derive(Clone)]
pub struct EngineMetrics {
    registry: Registry,
    messages_ingested_total: IntCounter,
    batches_total: IntCounterVec,
    batch_duration_seconds: Histogram,
    inflight_batches: IntGauge,
    verdicts_total: IntCounterVec,
    sink_errors_total: IntCounter,
    store_errors_total: IntCounter,
}

pub struct InflightBatchGuard<'a> {
    metrics: &'a EngineMetrics,
}

impl EngineMetrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let messages_ingested_total = IntCounter::new(
            "moderation_messages_ingested_total",
            "Messages accepted by the batching ingress",
        )
        .expect("valid messages_ingested_total metric");

        let batches_total = IntCounterVec::new(
            opts!(
                "moderation_batches_total",
                "Batches processed by the scheduler, by flush reason"
            ),
            &["reason"],
        )
        .expect("valid batches_total metric");

        let batch_duration_seconds = Histogram::with_opts(HistogramOpts::new(
            "moderation_batch_duration_seconds",
            "Wall-clock seconds spent processing one batch",
        ))
        .expect("valid batch_duration_seconds metric");

        let inflight_batches = IntGauge::new(
            "moderation_inflight_batches",
            "Batch tasks currently running",
        )
        .expect("valid inflight_batches metric");

        let verdicts_total = IntCounterVec::new(
            opts!(
                "moderation_verdicts_total",
                "Violating verdicts, by layer and action"
            ),
            &["layer", "action"],
        )
        .expect("valid verdicts_total metric");

        let sink_errors_total = IntCounter::new(
            "moderation_sink_errors_total",
            "Decision sink invocations that failed",
        )
        .expect("valid sink_errors_total metric");

        let store_errors_total = IntCounter::new(
            "moderation_store_errors_total",
            "Storage writes that failed and were absorbed",
        )
        .expect("valid store_errors_total metric");

        registry
            .register(Box::new(messages_ingested_total.clone()))
            .expect("register messages_ingested_total");
        registry
            .register(Box::new(batches_total.clone()))
            .expect("register batches_total");
        registry
            .register(Box::new(batch_duration_seconds.clone()))
            .expect("register batch_duration_seconds");
        registry
            .register(Box::new(inflight_batches.clone()))
            .expect("register inflight_batches");
        registry
            .register(Box::new(verdicts_total.clone()))
            .expect("register verdicts_total");
        registry
            .register(Box::new(sink_errors_total.clone()))
            .expect("register sink_errors_total");
        registry
            .register(Box::new(store_errors_total.clone()))
            .expect("register store_errors_total");

        Self {
            registry,
            messages_ingested_total,
            batches_total,
            batch_duration_seconds,
            inflight_batches,
            verdicts_total,
            sink_errors_total,
            store_errors_total,
        }
    }

    pub fn observe_ingested(&self) {
        self.messages_ingested_total.inc();
    }

    pub fn observe_batch(&self, reason: &str, duration_seconds: f64) {
        self.batches_total.with_label_values(&[reason]).inc();
        self.batch_duration_seconds.observe(duration_seconds);
    }

    pub fn inflight_guard(&self) -> InflightBatchGuard<'_> {
        self.inflight_batches.inc();
        InflightBatchGuard { metrics: self }
    }

    pub fn observe_verdict(&self, verdict: &ModerationVerdict) {
        self.verdicts_total
            .with_label_values(&[verdict.layer.name(), verdict.action.name()])
            .inc();
    }

    pub fn observe_sink_error(&self) {
        self.sink_errors_total.inc();
    }

    pub fn observe_store_error(&self) {
        self.store_errors_total.inc();
    }

    pub fn render(&self) -> Result<String, String> {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        let families = self.registry.gather();
        encoder
            .encode(&families, &mut buffer)
            .map_err(|error| error.to_string())?;
        String::from_utf8(buffer).map_err(|error| error.to_string())
    }
}

impl Default for EngineMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for InflightBatchGuard<'_> {
    fn drop(&mut self) {
        self.metrics.inflight_batches.dec();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_includes_registered_families_after_observation() {
        let metrics = EngineMetrics::new();
        metrics.observe_ingested();
        metrics.observe_batch("size", 0.05);
        let rendered = metrics.render().expect("render succeeds");
        assert!(rendered.contains("moderation_messages_ingested_total"));
        assert!(rendered.contains("moderation_batches_total"));
    }

    #[test]
    fn inflight_guard_decrements_on_drop() {
        let metrics = EngineMetrics::new();
        {
            let _guard = metrics.inflight_guard();
            assert_eq!(metrics.inflight_batches.get(), 1);
        }
        assert_eq!(metrics.inflight_batches.get(), 0);
    }
}
