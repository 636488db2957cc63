use chat_moderation_engine::{build_engine, models::MessageEnvelope};
use tokio::io::{stdin, AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,chat_moderation_engine=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let engine = build_engine()?;
    engine.start().await?;
    info!("reading envelopes from stdin as JSON lines");

    let mut lines = BufReader::new(stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<MessageEnvelope>(&line) {
            Ok(envelope) => {
                if engine.ingest(envelope).await.is_err() {
                    break;
                }
            }
            Err(parse_error) => {
                warn!(error = %parse_error, "skipping malformed envelope");
            }
        }
    }

    engine.shutdown().await;
    Ok(())
}
