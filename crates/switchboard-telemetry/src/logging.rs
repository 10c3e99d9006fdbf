//! Persistent WARN+ log store.
//!
//! Every stored row is tagged with the relay context it was emitted in
//! (instance, owner, contact), taken from the event itself or from the
//! nearest enclosing span, so that operators and tenants can pull the
//! failures of one instance without grepping JSON output.

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use rusqlite::types::ToSql;
use rusqlite::Connection;
use serde::Serialize;
use tracing::field::{Field, Visit};
use tracing::{span, Level};
use tracing_subscriber::layer::Context;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::Layer;

/// Field names whose values never reach the log database.
const REDACTED_FIELDS: &[&str] = &["content", "credentials", "blob", "text"];

const DEFAULT_QUERY_LIMIT: u32 = 100;

/// A persisted log row.
#[derive(Clone, Debug, Serialize)]
pub struct LogRecord {
    pub id: i64,
    pub timestamp: String,
    pub level: String,
    pub target: String,
    pub message: String,
    pub fields: Option<String>,
    pub instance_id: Option<String>,
    pub owner_id: Option<String>,
    pub contact_id: Option<String>,
}

/// A row to append.
#[derive(Clone, Debug)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: Level,
    pub target: String,
    pub message: String,
    pub fields: Option<String>,
    pub context: LogContext,
}

/// Relay identifiers attached to a log row.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LogContext {
    pub instance_id: Option<String>,
    pub owner_id: Option<String>,
    pub contact_id: Option<String>,
}

impl LogContext {
    /// Store `value` if `name` is a context field. Returns false otherwise.
    fn absorb(&mut self, name: &str, value: &str) -> bool {
        let slot = match name {
            "instance_id" => &mut self.instance_id,
            "owner_id" => &mut self.owner_id,
            "contact_id" => &mut self.contact_id,
            _ => return false,
        };
        *slot = Some(value.to_string());
        true
    }

    /// Fill the fields still missing from `outer`.
    fn inherit(&mut self, outer: &LogContext) {
        if self.instance_id.is_none() {
            self.instance_id.clone_from(&outer.instance_id);
        }
        if self.owner_id.is_none() {
            self.owner_id.clone_from(&outer.owner_id);
        }
        if self.contact_id.is_none() {
            self.contact_id.clone_from(&outer.contact_id);
        }
    }

    fn is_complete(&self) -> bool {
        self.instance_id.is_some() && self.owner_id.is_some() && self.contact_id.is_some()
    }

    fn is_empty(&self) -> bool {
        self.instance_id.is_none() && self.owner_id.is_none() && self.contact_id.is_none()
    }
}

/// Which rows a query may see.
#[derive(Clone, Debug, Default)]
pub enum LogScope {
    /// Operator access: every row.
    #[default]
    Everything,
    /// Rows emitted on behalf of the owner or about one of its instances.
    Owner {
        owner_id: String,
        instance_ids: Vec<String>,
    },
}

#[derive(Clone, Debug, Default)]
pub struct LogQuery {
    pub scope: LogScope,
    /// Keep rows at least this severe.
    pub min_level: Option<Level>,
    /// Substring of the emitting module path.
    pub target: Option<String>,
    pub instance_id: Option<String>,
    pub contact_id: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub limit: Option<u32>,
}

/// Collects the `WHERE` clauses of a query with positional parameters.
#[derive(Default)]
struct Filter {
    clauses: Vec<String>,
    params: Vec<Box<dyn ToSql>>,
}

impl Filter {
    fn placeholder(&mut self, value: impl ToSql + 'static) -> String {
        self.params.push(Box::new(value));
        format!("?{}", self.params.len())
    }

    fn eq(&mut self, column: &str, value: impl ToSql + 'static) {
        let p = self.placeholder(value);
        self.clauses.push(format!("{column} = {p}"));
    }

    fn build(q: &LogQuery) -> Self {
        let mut f = Filter::default();

        if let LogScope::Owner { owner_id, instance_ids } = &q.scope {
            let mut allowed = vec![format!("owner_id = {}", f.placeholder(owner_id.clone()))];
            if !instance_ids.is_empty() {
                let list: Vec<String> = instance_ids
                    .iter()
                    .map(|id| f.placeholder(id.clone()))
                    .collect();
                allowed.push(format!("instance_id IN ({})", list.join(", ")));
            }
            f.clauses.push(format!("({})", allowed.join(" OR ")));
        }
        if let Some(min) = q.min_level {
            let levels: Vec<String> = [Level::ERROR, Level::WARN, Level::INFO, Level::DEBUG, Level::TRACE]
                .into_iter()
                .filter(|level| *level <= min)
                .map(|level| f.placeholder(level.as_str()))
                .collect();
            f.clauses.push(format!("level IN ({})", levels.join(", ")));
        }
        if let Some(target) = &q.target {
            let p = f.placeholder(format!("%{target}%"));
            f.clauses.push(format!("target LIKE {p}"));
        }
        if let Some(instance_id) = &q.instance_id {
            f.eq("instance_id", instance_id.clone());
        }
        if let Some(contact_id) = &q.contact_id {
            f.eq("contact_id", contact_id.clone());
        }
        if let Some(since) = q.since {
            let p = f.placeholder(stamp(since));
            f.clauses.push(format!("timestamp >= {p}"));
        }
        f
    }

    fn where_sql(&self) -> String {
        if self.clauses.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", self.clauses.join(" AND "))
        }
    }
}

/// Fixed-width UTC timestamps so that text comparison orders by time.
fn stamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// SQLite-backed log store.
pub struct SqliteLogSink {
    conn: Mutex<Connection>,
}

impl SqliteLogSink {
    pub fn new(db_path: &Path) -> Result<Self, rusqlite::Error> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        Self::init(Connection::open(db_path)?)
    }

    pub fn in_memory() -> Result<Self, rusqlite::Error> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, rusqlite::Error> {
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
                 instance_id TEXT,
                 owner_id TEXT,
                 contact_id TEXT
             );
             CREATE INDEX IF NOT EXISTS idx_logs_instance ON logs(instance_id, timestamp);
             CREATE INDEX IF NOT EXISTS idx_logs_owner ON logs(owner_id, timestamp);
             CREATE INDEX IF NOT EXISTS idx_logs_timestamp ON logs(timestamp);",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn append(&self, entry: &LogEntry) -> Result<(), rusqlite::Error> {
        self.conn.lock().execute(
            "INSERT INTO logs (timestamp, level, target, message, fields, instance_id, owner_id, contact_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            rusqlite::params![
                stamp(entry.timestamp),
                entry.level.as_str(),
                entry.target,
                entry.message,
                entry.fields,
                entry.context.instance_id,
                entry.context.owner_id,
                entry.context.contact_id,
            ],
        )?;
        Ok(())
    }

    /// Matching rows, newest first.
    pub fn query(&self, q: &LogQuery) -> Result<Vec<LogRecord>, rusqlite::Error> {
        let filter = Filter::build(q);
        let sql = format!(
            "SELECT id, timestamp, level, target, message, fields, instance_id, owner_id, contact_id
             FROM logs{} ORDER BY id DESC LIMIT {}",
            filter.where_sql(),
            q.limit.unwrap_or(DEFAULT_QUERY_LIMIT)
        );

        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&sql)?;
        let params: Vec<&dyn ToSql> = filter.params.iter().map(|p| p.as_ref()).collect();
        let rows = stmt.query_map(params.as_slice(), |row| {
            Ok(LogRecord {
                id: row.get(0)?,
                timestamp: row.get(1)?,
                level: row.get(2)?,
                target: row.get(3)?,
                message: row.get(4)?,
                fields: row.get(5)?,
                instance_id: row.get(6)?,
                owner_id: row.get(7)?,
                contact_id: row.get(8)?,
            })
        })?;
        rows.collect()
    }

    /// Delete rows older than `cutoff`; returns how many went.
    pub fn prune_before(&self, cutoff: DateTime<Utc>) -> Result<usize, rusqlite::Error> {
        self.conn
            .lock()
            .execute("DELETE FROM logs WHERE timestamp < ?1", [stamp(cutoff)])
    }

    pub fn count(&self) -> Result<i64, rusqlite::Error> {
        self.conn
            .lock()
            .query_row("SELECT COUNT(*) FROM logs", [], |row| row.get(0))
    }
}

/// tracing layer feeding WARN and ERROR events into a [`SqliteLogSink`].
pub struct SqliteLogLayer {
    sink: Arc<SqliteLogSink>,
}

impl SqliteLogLayer {
    pub fn new(sink: Arc<SqliteLogSink>) -> Self {
        Self { sink }
    }
}

#[derive(Default)]
struct EventFields {
    message: Option<String>,
    context: LogContext,
    extra: serde_json::Map<String, serde_json::Value>,
}

impl EventFields {
    fn put(&mut self, field: &Field, value: serde_json::Value) {
        let name = field.name();
        let value = if REDACTED_FIELDS.contains(&name) {
            serde_json::Value::from("[redacted]")
        } else {
            value
        };
        self.extra.insert(name.to_string(), value);
    }

    fn put_text(&mut self, field: &Field, value: String) {
        match field.name() {
            "message" => self.message = Some(value),
            name if self.context.absorb(name, &value) => {}
            _ => self.put(field, value.into()),
        }
    }
}

impl Visit for EventFields {
    fn record_str(&mut self, field: &Field, value: &str) {
        self.put_text(field, value.to_string());
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        // `%id` arrives here as Display output; `?s` strings keep their quotes
        let text = format!("{value:?}");
        self.put_text(field, text.trim_matches('"').to_string());
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.put(field, value.into());
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.put(field, value.into());
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.put(field, value.into());
    }
}

/// Context recorded on a span, kept in its extensions.
struct SpanContext(LogContext);

/// Merge the context fields of a span's attributes or later records into
/// its extensions.
fn remember_span_context<S>(values: impl FnOnce(&mut EventFields), id: &span::Id, ctx: &Context<'_, S>)
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a>,
{
    let mut fields = EventFields::default();
    values(&mut fields);
    if fields.context.is_empty() {
        return;
    }
    let Some(span) = ctx.span(id) else { return };
    let mut extensions = span.extensions_mut();
    if let Some(SpanContext(existing)) = extensions.get_mut::<SpanContext>() {
        let mut merged = fields.context;
        merged.inherit(existing);
        *existing = merged;
        return;
    }
    extensions.insert(SpanContext(fields.context));
}

impl<S> Layer<S> for SqliteLogLayer
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_new_span(&self, attrs: &span::Attributes<'_>, id: &span::Id, ctx: Context<'_, S>) {
        remember_span_context(|f| attrs.record(f), id, &ctx);
    }

    fn on_record(&self, id: &span::Id, values: &span::Record<'_>, ctx: Context<'_, S>) {
        remember_span_context(|f| values.record(f), id, &ctx);
    }

    fn on_event(&self, event: &tracing::Event<'_>, ctx: Context<'_, S>) {
        let level = *event.metadata().level();
        if level > Level::WARN {
            return;
        }

        let mut fields = EventFields::default();
        event.record(&mut fields);

        if let Some(scope) = ctx.event_scope(event) {
            for span in scope {
                if fields.context.is_complete() {
                    break;
                }
                if let Some(SpanContext(outer)) = span.extensions().get::<SpanContext>() {
                    fields.context.inherit(outer);
                }
            }
        }

        let entry = LogEntry {
            timestamp: Utc::now(),
            level,
            target: event.metadata().target().to_string(),
            message: fields.message.unwrap_or_default(),
            fields: (!fields.extra.is_empty())
                .then(|| serde_json::to_string(&fields.extra).unwrap_or_default()),
            context: fields.context,
        };
        if let Err(e) = self.sink.append(&entry) {
            // Logging here would re-enter this layer
            eprintln!("switchboard-telemetry: dropped log row: {e}");
        }
    }
}
