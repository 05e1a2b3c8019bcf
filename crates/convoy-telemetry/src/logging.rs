//! SQLite sink for warn+ events, keyed by the chat correlation fields
//! (`user_id`, `conversation_id`) so failures can be traced per user.

use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use tracing::field::{Field, Visit};
use tracing::span;
use tracing_subscriber::layer::Context;
use tracing_subscriber::Layer;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LogRecord {
    pub id: i64,
    pub timestamp: String,
    pub level: String,
    pub target: String,
    pub message: String,
    pub fields: Option<String>,
    pub user_id: Option<String>,
    pub conversation_id: Option<String>,
}

#[derive(Clone, Debug, Default)]
pub struct LogQuery {
    pub level: Option<String>,
    pub user_id: Option<String>,
    pub conversation_id: Option<String>,
    pub limit: Option<u32>,
}

pub struct SqliteLogSink {
    conn: Mutex<Connection>,
}

impl SqliteLogSink {
    pub fn new(db_path: &Path) -> Result<Self, rusqlite::Error> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let conn = Connection::open(db_path)?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             CREATE TABLE IF NOT EXISTS logs (
                 id INTEGER PRIMARY KEY AUTOINCREMENT,
                 timestamp TEXT NOT NULL,
                 level TEXT NOT NULL,
                 target TEXT NOT NULL,
                 message TEXT NOT NULL,
                 fields TEXT,
                 user_id TEXT,
                 conversation_id TEXT
             );
             CREATE INDEX IF NOT EXISTS idx_logs_user ON logs(user_id);
             CREATE INDEX IF NOT EXISTS idx_logs_conversation ON logs(conversation_id);",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn insert(&self, entry: &LogEntry) {
        let conn = self.conn.lock();
        // A failing log write must never take the caller down
        let _ = conn.execute(
            "INSERT INTO logs (timestamp, level, target, message, fields, user_id, conversation_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            rusqlite::params![
                entry.timestamp,
                entry.level,
                entry.target,
                entry.message,
                entry.fields,
                entry.keys.user_id,
                entry.keys.conversation_id,
            ],
        );
    }

    /// Most recent records first.
    pub fn query(&self, q: &LogQuery) -> Result<Vec<LogRecord>, rusqlite::Error> {
        let conn = self.conn.lock();
        let mut sql = String::from(
            "SELECT id, timestamp, level, target, message, fields, user_id, conversation_id FROM logs WHERE 1=1",
        );
        let mut params: Vec<String> = Vec::new();
        for (column, value) in [
            ("level", &q.level),
            ("user_id", &q.user_id),
            ("conversation_id", &q.conversation_id),
        ] {
            if let Some(v) = value {
                params.push(v.clone());
                sql.push_str(&format!(" AND {column} = ?{}", params.len()));
            }
        }
        sql.push_str(&format!(" ORDER BY id DESC LIMIT {}", q.limit.unwrap_or(100)));

        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(params.iter()), |row| {
            Ok(LogRecord {
                id: row.get(0)?,
                timestamp: row.get(1)?,
                level: row.get(2)?,
                target: row.get(3)?,
                message: row.get(4)?,
                fields: row.get(5)?,
                user_id: row.get(6)?,
                conversation_id: row.get(7)?,
            })
        })?;
        rows.collect()
    }

    pub fn count(&self) -> Result<i64, rusqlite::Error> {
        let conn = self.conn.lock();
        conn.query_row("SELECT COUNT(*) FROM logs", [], |row| row.get(0))
    }
}

struct LogEntry {
    timestamp: String,
    level: String,
    target: String,
    message: String,
    fields: Option<String>,
    keys: CorrelationKeys,
}

/// Correlation fields lifted out of events and spans into indexed columns.
#[derive(Clone, Debug, Default)]
struct CorrelationKeys {
    user_id: Option<String>,
    conversation_id: Option<String>,
}

impl CorrelationKeys {
    fn is_empty(&self) -> bool {
        self.user_id.is_none() && self.conversation_id.is_none()
    }

    fn fill_from(&mut self, other: &CorrelationKeys) {
        if self.user_id.is_none() {
            self.user_id.clone_from(&other.user_id);
        }
        if self.conversation_id.is_none() {
            self.conversation_id.clone_from(&other.conversation_id);
        }
    }
}

#[derive(Default)]
struct FieldVisitor {
    message: Option<String>,
    fields: serde_json::Map<String, serde_json::Value>,
    keys: CorrelationKeys,
}

impl FieldVisitor {
    fn put(&mut self, name: &str, value: serde_json::Value) {
        let slot = match name {
            "message" => &mut self.message,
            "user_id" => &mut self.keys.user_id,
            "conversation_id" => &mut self.keys.conversation_id,
            _ => {
                self.fields.insert(name.to_string(), value);
                return;
            }
        };
        *slot = Some(match value {
            serde_json::Value::String(s) => s,
            other => other.to_string(),
        });
    }
}

impl Visit for FieldVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        let rendered = format!("{value:?}");
        self.put(field.name(), serde_json::Value::String(rendered.trim_matches('"').to_string()));
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        self.put(field.name(), serde_json::Value::String(value.to_string()));
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.put(field.name(), value.into());
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.put(field.name(), value.into());
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.put(field.name(), value.into());
    }
}

/// tracing Layer that writes warn+ events to a [`SqliteLogSink`].
pub struct SqliteLogLayer {
    sink: Arc<SqliteLogSink>,
}

impl SqliteLogLayer {
    pub fn new(sink: Arc<SqliteLogSink>) -> Self {
        Self { sink }
    }
}

impl<S> Layer<S> for SqliteLogLayer
where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
{
    fn on_new_span(&self, attrs: &span::Attributes<'_>, id: &span::Id, ctx: Context<'_, S>) {
        let mut visitor = FieldVisitor::default();
        attrs.record(&mut visitor);
        if visitor.keys.is_empty() {
            return;
        }
        if let Some(span) = ctx.span(id) {
            span.extensions_mut().insert(visitor.keys);
        }
    }

    fn on_event(&self, event: &tracing::Event<'_>, ctx: Context<'_, S>) {
        let level = *event.metadata().level();
        if level > tracing::Level::WARN {
            return;
        }

        let mut visitor = FieldVisitor::default();
        event.record(&mut visitor);

        if let Some(scope) = ctx.event_scope(event) {
            for span in scope {
                if let Some(keys) = span.extensions().get::<CorrelationKeys>() {
                    visitor.keys.fill_from(keys);
                }
            }
        }

        let fields = if visitor.fields.is_empty() {
            None
        } else {
            serde_json::to_string(&visitor.fields).ok()
        };

        self.sink.insert(&LogEntry {
            timestamp: Utc::now().to_rfc3339(),
            level: level.to_string(),
            target: event.metadata().target().to_string(),
            message: visitor.message.unwrap_or_default(),
            fields,
            keys: visitor.keys,
        });
    }
}
