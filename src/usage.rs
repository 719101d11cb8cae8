//! Per-attempt usage accounting.
//!
//! Every provider attempt, successful or not, is appended to `ai_usage_log`.
//! Writes are best-effort: a failed insert is reported through `log` and then
//! dropped so that accounting can never change the outcome of a completion.
//! The read helpers at the bottom back the usage statistics screens.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use r2d2_sqlite::rusqlite::types::Type;
use r2d2_sqlite::rusqlite::{params, Connection, Row};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tokio::task::spawn_blocking;
use uuid::Uuid;

use crate::agents::providers::ProviderId;
use crate::agents::TaskType;
use crate::db::DbPool;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageLogEntry {
    pub provider: ProviderId,
    pub model: String,
    pub task_type: TaskType,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub estimated_cost: f64,
    pub latency_ms: Option<u64>,
    pub success: bool,
    pub error_message: Option<String>,
    pub ticket_id: Option<String>,
    pub user_id: Option<String>,
    pub created_at: i64,
}

/// Sink for attempt records. Implementations must not fail the caller.
#[async_trait]
pub trait UsageLogger: Send + Sync {
    async fn record(&self, entry: UsageLogEntry);
}

#[derive(Clone)]
pub struct SqliteUsageLogger {
    pool: DbPool,
}

impl SqliteUsageLogger {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl UsageLogger for SqliteUsageLogger {
    async fn record(&self, entry: UsageLogEntry) {
        let pool = self.pool.clone();
        let provider = entry.provider;
        let outcome = spawn_blocking(move || {
            let conn = pool.get()?;
            insert_usage(&conn, &entry)
        })
        .await
        .map_err(|err| anyhow!(err.to_string()))
        .and_then(|inner| inner);
        if let Err(err) = outcome {
            log::warn!("dropping AI usage record for {provider}: {err:#}");
        }
    }
}

pub fn insert_usage(conn: &Connection, entry: &UsageLogEntry) -> Result<String> {
    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO ai_usage_log (id, provider, model, task_type, input_tokens, output_tokens, estimated_cost, latency_ms, success, error_message, ticket_id, user_id, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
        params![
            id,
            entry.provider.as_str(),
            entry.model,
            entry.task_type.as_str(),
            entry.input_tokens,
            entry.output_tokens,
            entry.estimated_cost,
            entry.latency_ms.map(|v| v as i64),
            entry.success as i32,
            entry.error_message,
            entry.ticket_id,
            entry.user_id,
            entry.created_at,
        ],
    )?;
    Ok(id)
}

pub(crate) fn now_unix() -> i64 {
    OffsetDateTime::now_utc().unix_timestamp()
}

/// Aggregate over a group of usage rows.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UsageAggregate {
    /// Group key (provider id or task type); `None` for overall totals.
    pub key: Option<String>,
    pub calls: i64,
    pub failures: i64,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub estimated_cost: f64,
    pub avg_latency_ms: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UsageGrouping {
    Provider,
    TaskType,
}

const AGGREGATE_COLUMNS: &str = "COUNT(1), COALESCE(SUM(1 - success), 0), COALESCE(SUM(input_tokens), 0), COALESCE(SUM(output_tokens), 0), COALESCE(SUM(estimated_cost), 0.0), AVG(latency_ms)";

fn map_aggregate(
    row: &Row,
    key: Option<String>,
    offset: usize,
) -> rusqlite::Result<UsageAggregate> {
    Ok(UsageAggregate {
        key,
        calls: row.get(offset)?,
        failures: row.get(offset + 1)?,
        input_tokens: row.get(offset + 2)?,
        output_tokens: row.get(offset + 3)?,
        estimated_cost: row.get(offset + 4)?,
        avg_latency_ms: row.get(offset + 5)?,
    })
}

/// Totals over every attempt recorded at or after `since` (unix seconds).
pub fn usage_totals(conn: &Connection, since: i64) -> Result<UsageAggregate> {
    let sql = format!("SELECT {AGGREGATE_COLUMNS} FROM ai_usage_log WHERE created_at >= ?1");
    Ok(conn.query_row(&sql, params![since], |row| map_aggregate(row, None, 0))?)
}

pub fn usage_grouped(
    conn: &Connection,
    since: i64,
    grouping: UsageGrouping,
) -> Result<Vec<UsageAggregate>> {
    let column = match grouping {
        UsageGrouping::Provider => "provider",
        UsageGrouping::TaskType => "task_type",
    };
    let sql = format!(
        "SELECT {column}, {AGGREGATE_COLUMNS} FROM ai_usage_log WHERE created_at >= ?1 GROUP BY {column} ORDER BY {column}"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params![since], |row| {
        let key: String = row.get(0)?;
        map_aggregate(row, Some(key), 1)
    })?;
    let mut groups = Vec::new();
    for row in rows {
        groups.push(row?);
    }
    Ok(groups)
}

pub fn usage_by_provider(conn: &Connection, since: i64) -> Result<Vec<UsageAggregate>> {
    usage_grouped(conn, since, UsageGrouping::Provider)
}

pub fn usage_by_task_type(conn: &Connection, since: i64) -> Result<Vec<UsageAggregate>> {
    usage_grouped(conn, since, UsageGrouping::TaskType)
}

/// Most recent attempts first; rows from the same second keep insertion order.
pub fn recent_usage(conn: &Connection, limit: usize) -> Result<Vec<UsageLogEntry>> {
    let mut stmt = conn.prepare(
        "SELECT provider, model, task_type, input_tokens, output_tokens, estimated_cost, latency_ms, success, error_message, ticket_id, user_id, created_at
         FROM ai_usage_log ORDER BY created_at DESC, rowid DESC LIMIT ?1",
    )?;
    let rows = stmt.query_map(params![limit as i64], |row| {
        let provider = row
            .get::<_, String>(0)?
            .parse::<ProviderId>()
            .map_err(|err| {
                rusqlite::Error::FromSqlConversionFailure(0, Type::Text, err.into())
            })?;
        let task_type: String = row.get(2)?;
        let latency: Option<i64> = row.get(6)?;
        Ok(UsageLogEntry {
            provider,
            model: row.get(1)?,
            task_type: TaskType::new(task_type),
            input_tokens: row.get(3)?,
            output_tokens: row.get(4)?,
            estimated_cost: row.get(5)?,
            latency_ms: latency.map(|v| v as u64),
            success: row.get::<_, i64>(7)? != 0,
            error_message: row.get(8)?,
            ticket_id: row.get(9)?,
            user_id: row.get(10)?,
            created_at: row.get(11)?,
        })
    })?;
    let mut entries = Vec::new();
    for row in rows {
        entries.push(row?);
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        crate::db::apply_migrations(&conn).unwrap();
        conn
    }

    fn entry(provider: ProviderId, task: &str, success: bool, created_at: i64) -> UsageLogEntry {
        UsageLogEntry {
            provider,
            model: provider.default_model().to_string(),
            task_type: TaskType::new(task),
            input_tokens: if success { 100 } else { 0 },
            output_tokens: if success { 50 } else { 0 },
            estimated_cost: if success { 0.5 } else { 0.0 },
            latency_ms: Some(if success { 200 } else { 100 }),
            success,
            error_message: (!success).then(|| "boom".to_string()),
            ticket_id: Some("T-1".into()),
            user_id: None,
            created_at,
        }
    }

    #[test]
    fn totals_respect_time_window() {
        let conn = conn();
        insert_usage(&conn, &entry(ProviderId::Anthropic, "reply", true, 10)).unwrap();
        insert_usage(&conn, &entry(ProviderId::OpenAi, "reply", false, 20)).unwrap();
        insert_usage(&conn, &entry(ProviderId::OpenAi, "summary", true, 30)).unwrap();

        let all = usage_totals(&conn, 0).unwrap();
        assert_eq!(all.calls, 3);
        assert_eq!(all.failures, 1);
        assert_eq!(all.input_tokens, 200);
        assert_eq!(all.output_tokens, 100);
        assert!((all.estimated_cost - 1.0).abs() < 1e-9);
        assert!((all.avg_latency_ms.unwrap() - 500.0 / 3.0).abs() < 1e-9);

        let recent = usage_totals(&conn, 15).unwrap();
        assert_eq!(recent.calls, 2);
    }

    #[test]
    fn empty_window_has_zero_totals() {
        let conn = conn();
        let totals = usage_totals(&conn, 0).unwrap();
        assert_eq!(totals.calls, 0);
        assert_eq!(totals.estimated_cost, 0.0);
        assert_eq!(totals.avg_latency_ms, None);
    }

    #[test]
    fn grouping_by_provider_and_task_type() {
        let conn = conn();
        insert_usage(&conn, &entry(ProviderId::Anthropic, "reply", true, 10)).unwrap();
        insert_usage(&conn, &entry(ProviderId::OpenAi, "reply", false, 20)).unwrap();
        insert_usage(&conn, &entry(ProviderId::OpenAi, "summary", true, 30)).unwrap();

        let by_provider = usage_by_provider(&conn, 0).unwrap();
        let keys: Vec<_> = by_provider.iter().map(|g| g.key.clone().unwrap()).collect();
        assert_eq!(keys, vec!["anthropic", "openai"]);
        assert_eq!(by_provider[1].calls, 2);
        assert_eq!(by_provider[1].failures, 1);

        let by_task = usage_by_task_type(&conn, 0).unwrap();
        assert_eq!(by_task.len(), 2);
        assert_eq!(by_task[0].key.as_deref(), Some("reply"));
        assert_eq!(by_task[0].calls, 2);
    }

    #[test]
    fn recent_usage_is_newest_first_and_bounded() {
        let conn = conn();
        insert_usage(&conn, &entry(ProviderId::Anthropic, "reply", false, 10)).unwrap();
        insert_usage(&conn, &entry(ProviderId::OpenAi, "reply", true, 10)).unwrap();
        insert_usage(&conn, &entry(ProviderId::OpenRouter, "other", true, 5)).unwrap();

        let recent = recent_usage(&conn, 2).unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].provider, ProviderId::OpenAi);
        assert_eq!(recent[1].provider, ProviderId::Anthropic);
        assert_eq!(recent[1].error_message.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn logger_swallows_storage_failures() {
        let dir = tempfile::tempdir().unwrap();
        let pool = crate::db::init_db(dir.path().to_path_buf()).unwrap();
        pool.get()
            .unwrap()
            .execute_batch("DROP TABLE ai_usage_log;")
            .unwrap();
        let logger = SqliteUsageLogger::new(pool);
        logger
            .record(entry(ProviderId::Anthropic, "reply", true, now_unix()))
            .await;
    }
}
