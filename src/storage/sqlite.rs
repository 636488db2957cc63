use std::{
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use rusqlite::{params, Connection};
use tracing::info;

use crate::{
    models::{
        Action, LayerKind, ModerationResult, ModerationRule, RuleSource, RuleType,
        ViolationPriority,
    },
    storage::{IncidentRecord, StorageGateway, StoreError},
};

use async_trait::async_trait;

const CREATE_RULES: &str = "\
CREATE TABLE IF NOT EXISTS moderation_rules (
    rule_id TEXT PRIMARY KEY,
    description TEXT NOT NULL,
    action TEXT NOT NULL,
    source TEXT NOT NULL,
    layer TEXT NOT NULL,
    rule_type TEXT NOT NULL,
    chat_id INTEGER,
    pattern TEXT,
    category TEXT,
    priority INTEGER NOT NULL,
    action_duration_seconds INTEGER,
    metadata_json TEXT NOT NULL
)";

const CREATE_INCIDENTS: &str = "\
CREATE TABLE IF NOT EXISTS moderation_incidents (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    rule_id TEXT,
    layer TEXT NOT NULL,
    action TEXT NOT NULL,
    priority INTEGER NOT NULL,
    chat_id INTEGER NOT NULL,
    user_id INTEGER NOT NULL,
    message_id INTEGER NOT NULL,
    occurred_at TEXT NOT NULL,
    reason TEXT,
    payload_json TEXT NOT NULL
)";

/// SQLite storage gateway. One connection, used sequentially; every call
/// runs on the blocking pool.
pub struct SqliteStorage {
    path: PathBuf,
    conn: Arc<Mutex<Option<Connection>>>,
}

impl SqliteStorage {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_owned(),
            conn: Arc::new(Mutex::new(None)),
        }
    }

    async fn with_conn<T, F>(&self, operation: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let guard = conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            let connection = guard.as_ref().ok_or(StoreError::NotConnected)?;
            operation(connection)
        })
        .await
        .map_err(|join_error| StoreError::Query(join_error.to_string()))?
    }
}

fn query_error(error: rusqlite::Error) -> StoreError {
    StoreError::Query(error.to_string())
}

fn ensure_schema(connection: &Connection) -> Result<(), rusqlite::Error> {
    // journal_mode returns a row, so it cannot go through execute().
    connection.query_row("PRAGMA journal_mode=WAL", [], |_| Ok(()))?;
    connection.execute(CREATE_RULES, [])?;
    connection.execute(CREATE_INCIDENTS, [])?;

    let mut statement = connection.prepare("PRAGMA table_info(moderation_rules)")?;
    let columns = statement
        .query_map([], |row| row.get::<_, String>(1))?
        .collect::<Result<Vec<_>, _>>()?;
    if !columns.iter().any(|name| name == "action_duration_seconds") {
        connection.execute(
            "ALTER TABLE moderation_rules ADD COLUMN action_duration_seconds INTEGER",
            [],
        )?;
    }
    Ok(())
}

fn rule_from_row(row: &rusqlite::Row<'_>) -> Result<ModerationRule, StoreError> {
    let corrupt = |field: &str, value: &str| {
        StoreError::Corrupt(format!("unexpected {field} value: {value}"))
    };

    let action_text: String = row.get(2).map_err(query_error)?;
    let source_text: String = row.get(3).map_err(query_error)?;
    let layer_text: String = row.get(4).map_err(query_error)?;
    let type_text: String = row.get(5).map_err(query_error)?;
    let priority_rank: i64 = row.get(9).map_err(query_error)?;
    let metadata_json: String = row.get(11).map_err(query_error)?;

    Ok(ModerationRule {
        rule_id: row.get(0).map_err(query_error)?,
        description: row.get(1).map_err(query_error)?,
        action: Action::from_name(&action_text).ok_or_else(|| corrupt("action", &action_text))?,
        source: RuleSource::from_name(&source_text)
            .ok_or_else(|| corrupt("source", &source_text))?,
        layer: LayerKind::from_name(&layer_text).ok_or_else(|| corrupt("layer", &layer_text))?,
        rule_type: RuleType::from_name(&type_text)
            .ok_or_else(|| corrupt("rule_type", &type_text))?,
        chat_id: row.get(6).map_err(query_error)?,
        pattern: row.get(7).map_err(query_error)?,
        category: row.get(8).map_err(query_error)?,
        priority: ViolationPriority::from_rank(priority_rank)
            .ok_or_else(|| corrupt("priority", &priority_rank.to_string()))?,
        action_duration_seconds: row.get(10).map_err(query_error)?,
        metadata: serde_json::from_str(&metadata_json)
            .map_err(|parse_error| StoreError::Corrupt(parse_error.to_string()))?,
    })
}

#[async_trait]
impl StorageGateway for SqliteStorage {
    async fn connect(&self) -> Result<(), StoreError> {
        let path = self.path.clone();
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let connection = Connection::open(&path)
                .map_err(|open_error| StoreError::Connect(open_error.to_string()))?;
            ensure_schema(&connection)
                .map_err(|schema_error| StoreError::Connect(schema_error.to_string()))?;
            *conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(connection);
            Ok::<_, StoreError>(())
        })
        .await
        .map_err(|join_error| StoreError::Connect(join_error.to_string()))??;
        info!(path = %self.path.display(), "sqlite connected");
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), StoreError> {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            conn.lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .take();
        })
        .await
        .map_err(|join_error| StoreError::Query(join_error.to_string()))?;
        Ok(())
    }

    async fn list_rules(&self) -> Result<Vec<ModerationRule>, StoreError> {
        self.with_conn(|connection| {
            let mut statement = connection
                .prepare(
                    "SELECT rule_id, description, action, source, layer, rule_type, chat_id,
                            pattern, category, priority, action_duration_seconds, metadata_json
                     FROM moderation_rules",
                )
                .map_err(query_error)?;
            let mut rows = statement.query([]).map_err(query_error)?;
            let mut rules = Vec::new();
            while let Some(row) = rows.next().map_err(query_error)? {
                rules.push(rule_from_row(row)?);
            }
            Ok(rules)
        })
        .await
    }

    async fn upsert_rule(&self, rule: &ModerationRule) -> Result<(), StoreError> {
        let rule = rule.clone();
        let outcome = self
            .with_conn(move |connection| {
                let metadata_json = serde_json::to_string(&rule.metadata)
                    .unwrap_or_else(|_| "{}".to_owned());
                connection
                    .execute(
                        "INSERT INTO moderation_rules (
                            rule_id, description, action, source, layer, rule_type,
                            chat_id, pattern, category, priority, action_duration_seconds,
                            metadata_json
                        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
                        ON CONFLICT(rule_id) DO UPDATE SET
                            description=excluded.description,
                            action=excluded.action,
                            source=excluded.source,
                            layer=excluded.layer,
                            rule_type=excluded.rule_type,
                            chat_id=excluded.chat_id,
                            pattern=excluded.pattern,
                            category=excluded.category,
                            priority=excluded.priority,
                            action_duration_seconds=excluded.action_duration_seconds,
                            metadata_json=excluded.metadata_json",
                        params![
                            rule.rule_id,
                            rule.description,
                            rule.action.name(),
                            rule.source.name(),
                            rule.layer.name(),
                            rule.rule_type.name(),
                            rule.chat_id,
                            rule.pattern,
                            rule.category,
                            rule.priority.rank(),
                            rule.action_duration_seconds,
                            metadata_json,
                        ],
                    )
                    .map_err(query_error)?;
                Ok(rule.rule_id.clone())
            })
            .await?;
        info!(rule_id = %outcome, "rule upserted");
        Ok(())
    }

    async fn delete_rule(&self, rule_id: &str) -> Result<(), StoreError> {
        let rule_id = rule_id.to_owned();
        self.with_conn(move |connection| {
            connection
                .execute(
                    "DELETE FROM moderation_rules WHERE rule_id = ?1",
                    params![rule_id],
                )
                .map_err(query_error)?;
            Ok(())
        })
        .await
    }

    async fn record_batch_results(&self, results: &[ModerationResult]) -> Result<(), StoreError> {
        let entries: Vec<IncidentRecord> = results
            .iter()
            .filter_map(IncidentRecord::from_result)
            .collect();
        if entries.is_empty() {
            return Ok(());
        }
        let count = entries.len();
        self.with_conn(move |connection| {
            let mut statement = connection
                .prepare(
                    "INSERT INTO moderation_incidents (
                        rule_id, layer, action, priority, chat_id, user_id,
                        message_id, occurred_at, reason, payload_json
                    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                )
                .map_err(query_error)?;
            for entry in &entries {
                statement
                    .execute(params![
                        entry.rule_id,
                        entry.layer.name(),
                        entry.action.name(),
                        entry.priority.rank(),
                        entry.chat_id,
                        entry.user_id,
                        entry.message_id,
                        entry.occurred_at.to_rfc3339(),
                        entry.reason,
                        entry.payload.to_string(),
                    ])
                    .map_err(query_error)?;
            }
            Ok(())
        })
        .await?;
        info!(count, "incidents recorded");
        Ok(())
    }
}
