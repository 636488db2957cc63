use std::{env, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::{
    sync::{mpsc, Mutex},
    task::JoinHandle,
    time::sleep,
};
use tracing::{debug, info};

use crate::{errors::EngineError, models::MessageEnvelope};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushReason {
    Size,
    Timer,
    Stop,
}

impl FlushReason {
    pub fn name(&self) -> &'static str {
        match self {
            FlushReason::Size => "size",
            FlushReason::Timer => "timer",
            FlushReason::Stop => "stop",
        }
    }
}

#[derive(Debug)]
pub struct MessageBatch {
    pub items: Vec<MessageEnvelope>,
    pub created_at: DateTime<Utc>,
    pub flush_reason: FlushReason,
}

#[derive(Debug, Error)]
pub enum BatcherError {
    #[error("batcher has been stopped and drained")]
    Closed,
}

#[derive(Debug, Clone, Copy)]
pub struct BatcherConfig {
    pub max_batch_size: usize,
    pub max_delay: Duration,
}

impl Default for BatcherConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 50,
            max_delay: Duration::from_millis(500),
        }
    }
}

impl BatcherConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let max_batch_size = env::var("MODERATION_BATCH_MAX_SIZE")
            .ok()
            .and_then(|value| value.parse::<usize>().ok())
            .unwrap_or(defaults.max_batch_size);
        let max_delay = env::var("MODERATION_BATCH_MAX_DELAY_MS")
            .ok()
            .and_then(|value| value.parse::<u64>().ok())
            .map(Duration::from_millis)
            .unwrap_or(defaults.max_delay);

        Self {
            max_batch_size,
            max_delay,
        }
    }
}

/// Accumulates envelopes and emits a batch once `max_batch_size` items are
/// pending or `max_delay` has elapsed since the first item of the current
/// accumulation cycle.
#[derive(Clone)]
pub struct MessageBatcher {
    inner: Arc<BatcherInner>,
}

struct BatcherInner {
    max_batch_size: usize,
    max_delay: Duration,
    state: Mutex<BatcherState>,
    receiver: Mutex<mpsc::UnboundedReceiver<MessageBatch>>,
}

struct BatcherState {
    pending: Vec<MessageEnvelope>,
    timer: Option<JoinHandle<()>>,
    sender: Option<mpsc::UnboundedSender<MessageBatch>>,
}

impl MessageBatcher {
    pub fn new(config: BatcherConfig) -> Result<Self, EngineError> {
        if config.max_batch_size == 0 {
            return Err(EngineError::Config(
                "max_batch_size must be at least 1".to_owned(),
            ));
        }
        if config.max_delay.is_zero() {
            return Err(EngineError::Config("max_delay must be positive".to_owned()));
        }

        let (sender, receiver) = mpsc::unbounded_channel();
        info!(
            max_batch_size = config.max_batch_size,
            max_delay_ms = config.max_delay.as_millis() as u64,
            "batcher started"
        );

        Ok(Self {
            inner: Arc::new(BatcherInner {
                max_batch_size: config.max_batch_size,
                max_delay: config.max_delay,
                state: Mutex::new(BatcherState {
                    pending: Vec::new(),
                    timer: None,
                    sender: Some(sender),
                }),
                receiver: Mutex::new(receiver),
            }),
        })
    }

    /// Appends to the pending buffer. The first item of a cycle arms the
    /// delay timer; reaching `max_batch_size` flushes immediately.
    pub async fn submit(&self, message: MessageEnvelope) -> Result<(), BatcherError> {
        let mut state = self.inner.state.lock().await;
        if state.sender.is_none() {
            return Err(BatcherError::Closed);
        }

        state.pending.push(message);
        debug!(queue_size = state.pending.len(), "message enqueued");
        if state.pending.len() == 1 {
            self.arm_timer(&mut state);
        }
        if state.pending.len() >= self.inner.max_batch_size {
            self.inner.flush(&mut state, FlushReason::Size);
        }
        Ok(())
    }

    /// Suspends until a batch is available. Fails with `Closed` once the
    /// batcher has been stopped and the queue is drained.
    pub async fn get(&self) -> Result<MessageBatch, BatcherError> {
        let mut receiver = self.inner.receiver.lock().await;
        let batch = receiver.recv().await.ok_or(BatcherError::Closed)?;
        debug!(
            size = batch.items.len(),
            reason = batch.flush_reason.name(),
            "batch dequeued"
        );
        Ok(batch)
    }

    /// Flushes any remaining items with reason `stop` and closes the queue.
    pub async fn stop(&self) {
        let mut state = self.inner.state.lock().await;
        self.inner.flush(&mut state, FlushReason::Stop);
        state.sender = None;
        info!("batcher stopped");
    }

    fn arm_timer(&self, state: &mut BatcherState) {
        if let Some(timer) = &state.timer {
            if !timer.is_finished() {
                return;
            }
        }
        let inner = self.inner.clone();
        state.timer = Some(tokio::spawn(async move {
            sleep(inner.max_delay).await;
            let mut state = inner.state.lock().await;
            inner.flush(&mut state, FlushReason::Timer);
        }));
    }
}

impl BatcherInner {
    fn flush(&self, state: &mut BatcherState, reason: FlushReason) {
        if state.pending.is_empty() {
            return;
        }
        let batch = MessageBatch {
            items: std::mem::take(&mut state.pending),
            created_at: Utc::now(),
            flush_reason: reason,
        };
        if let Some(timer) = state.timer.take() {
            timer.abort();
        }
        let size = batch.items.len();
        if let Some(sender) = &state.sender {
            if sender.send(batch).is_ok() {
                info!(reason = reason.name(), batch_size = size, "batch flushed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use serde_json::Map;
    use tokio::time::{timeout, Duration, Instant};

    use super::*;
    use crate::models::ChatContext;

    fn envelope(text: &str) -> MessageEnvelope {
        MessageEnvelope {
            context: ChatContext {
                chat_id: 100,
                user_id: 10,
                message_id: 1,
                timestamp: Utc::now(),
                username: Some("tester".to_owned()),
                language_code: None,
            },
            text: Some(text.to_owned()),
            caption: None,
            media_type: None,
            images: Vec::new(),
            metadata: Map::new(),
        }
    }

    fn batcher(max_batch_size: usize, max_delay: Duration) -> MessageBatcher {
        MessageBatcher::new(BatcherConfig {
            max_batch_size,
            max_delay,
        })
        .expect("valid batcher config")
    }

    #[test]
    fn construction_rejects_invalid_tuning() {
        assert!(MessageBatcher::new(BatcherConfig {
            max_batch_size: 0,
            max_delay: Duration::from_millis(10),
        })
        .is_err());
        assert!(MessageBatcher::new(BatcherConfig {
            max_batch_size: 1,
            max_delay: Duration::ZERO,
        })
        .is_err());
    }

    #[tokio::test]
    async fn flushes_on_size() {
        let batcher = batcher(2, Duration::from_secs(10));
        batcher.submit(envelope("first")).await.unwrap();
        batcher.submit(envelope("second")).await.unwrap();

        let batch = timeout(Duration::from_secs(1), batcher.get())
            .await
            .expect("batch within timeout")
            .unwrap();
        assert_eq!(batch.items.len(), 2);
        assert_eq!(batch.flush_reason, FlushReason::Size);
        assert_eq!(batch.items[0].content_text(), "first");
        assert_eq!(batch.items[1].content_text(), "second");
        batcher.stop().await;
    }

    #[tokio::test]
    async fn flushes_on_timer() {
        let batcher = batcher(10, Duration::from_millis(50));
        let started = Instant::now();
        batcher.submit(envelope("delayed")).await.unwrap();

        let batch = timeout(Duration::from_secs(1), batcher.get())
            .await
            .expect("batch within timeout")
            .unwrap();
        assert_eq!(batch.items.len(), 1);
        assert_eq!(batch.flush_reason, FlushReason::Timer);
        assert!(started.elapsed() >= Duration::from_millis(50));
        batcher.stop().await;
    }

    #[tokio::test]
    async fn emits_full_batches_in_submission_order() {
        let batcher = batcher(3, Duration::from_secs(10));
        for index in 0..9 {
            batcher.submit(envelope(&format!("m{index}"))).await.unwrap();
        }

        let mut seen = Vec::new();
        for _ in 0..3 {
            let batch = batcher.get().await.unwrap();
            assert_eq!(batch.items.len(), 3);
            assert_eq!(batch.flush_reason, FlushReason::Size);
            seen.extend(batch.items.iter().map(|item| item.content_text().to_owned()));
        }
        let expected: Vec<String> = (0..9).map(|index| format!("m{index}")).collect();
        assert_eq!(seen, expected);
        batcher.stop().await;
    }

    #[tokio::test]
    async fn stop_flushes_remainder_and_closes() {
        let batcher = batcher(10, Duration::from_secs(10));
        batcher.submit(envelope("pending")).await.unwrap();
        batcher.stop().await;

        let batch = batcher.get().await.unwrap();
        assert_eq!(batch.flush_reason, FlushReason::Stop);
        assert_eq!(batch.items.len(), 1);

        assert!(matches!(batcher.get().await, Err(BatcherError::Closed)));
        assert!(matches!(
            batcher.submit(envelope("late")).await,
            Err(BatcherError::Closed)
        ));
    }
}
