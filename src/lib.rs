pub mod aggregator;
pub mod backend;
pub mod batcher;
pub mod engine;
pub mod errors;
pub mod layers;
pub mod metrics;
pub mod models;
pub mod pipeline;
pub mod registry;
pub mod rules;
pub mod scheduler;
pub mod sink;
pub mod storage;

use std::{env, sync::Arc};

use backend::{mock::MockBackend, openai::OpenAiBackend, ModerationBackend};
use engine::{EngineConfig, ModerationEngine};
use errors::EngineError;
use sink::TracingSink;
use storage::{sqlite::SqliteStorage, StorageGateway};
use tracing::info;

/// Builds an engine from environment configuration. Without an API key the
/// mock backend is wired in so the binary stays runnable offline.
pub fn build_engine() -> Result<ModerationEngine, EngineError> {
    let backend: Arc<dyn ModerationBackend> =
        match OpenAiBackend::from_env().map_err(EngineError::Config)? {
            Some(openai) => Arc::new(openai),
            None => {
                info!("no API key configured, using mock backend");
                Arc::new(MockBackend::new())
            }
        };

    let sqlite_path =
        env::var("MODERATION_SQLITE_PATH").unwrap_or_else(|_| "moderation.db".to_owned());
    let storage: Arc<dyn StorageGateway> = Arc::new(SqliteStorage::new(sqlite_path));

    ModerationEngine::new(
        EngineConfig::from_env(),
        backend,
        storage,
        Some(Arc::new(TracingSink)),
    )
}
