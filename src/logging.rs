//! Structured audit trail stored in the `event_log` table.

use r2d2_sqlite::rusqlite::{params, Connection};
use serde_json::Value;
use time::OffsetDateTime;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventLevel {
    Info,
    Warn,
    Error,
}

impl EventLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

/// One audit row. `code` and `explain` follow the catalogue in `errors`.
#[derive(Debug, Clone)]
pub struct AuditEvent<'a> {
    pub level: EventLevel,
    pub code: Option<&'static str>,
    pub module: &'a str,
    pub message: &'a str,
    pub explain: Option<&'a str>,
    pub data: Option<Value>,
}

impl<'a> AuditEvent<'a> {
    pub fn info(module: &'a str, message: &'a str) -> Self {
        Self {
            level: EventLevel::Info,
            code: None,
            module,
            message,
            explain: None,
            data: None,
        }
    }

    pub fn with_code(mut self, code: &'static str, explain: &'a str) -> Self {
        self.code = Some(code);
        self.explain = Some(explain);
        self
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    /// Append the event, returning the generated row id.
    pub fn record(&self, conn: &Connection) -> rusqlite::Result<String> {
        let id = Uuid::new_v4().to_string();
        let ts = OffsetDateTime::now_utc().unix_timestamp();
        conn.execute(
            "INSERT INTO event_log (id, ts, level, code, module, message, explain, data) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                id,
                ts,
                self.level.as_str(),
                self.code,
                self.module,
                self.message,
                self.explain,
                self.data.as_ref().map(Value::to_string),
            ],
        )?;
        Ok(id)
    }
}
