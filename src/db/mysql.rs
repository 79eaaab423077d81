//! MySQL pool adapter.
//!
//! Implements [`Pool`] and [`Connection`] over `sqlx::MySqlPool` so the
//! decorator can drive a real server:
//!
//! - the session's thread id comes from `SELECT CONNECTION_ID()` at acquire time
//! - `KILL <id>` and other parameterless statements use the text protocol
//! - destroying a session aborts its in-flight statement and drops the socket
//!   right there; a session destroyed while idle drops it on its next
//!   `execute`, `release` or drop, and never returns it to the pool

use crate::config::TimeoutConfig;
use crate::db::pool::{Connection, Destroyable, Pool, Releasable};
use crate::db::timeout::TimeoutPool;
use crate::error::{DriverError, DriverResult, PoolError, PoolResult};
use crate::models::{Query, QueryOutput, QueryParam};
use async_trait::async_trait;
use serde_json::Value as JsonValue;
use sqlx::mysql::{MySqlArguments, MySqlConnectOptions, MySqlConnection, MySqlPoolOptions, MySqlRow};
use sqlx::pool::PoolConnection;
use sqlx::{Column, MySql, MySqlPool, Row, TypeInfo};
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Notify;
use tracing::{debug, info};
use url::Url;

/// Native MySQL pool.
#[derive(Debug, Clone)]
pub struct MySqlBackend {
    pool: MySqlPool,
}

impl MySqlBackend {
    pub fn new(pool: MySqlPool) -> Self {
        Self { pool }
    }

    /// Connect to `url` and decorate the pool.
    ///
    /// Timeout options (`timeout`, `reclaim`, ...) are read from the URL query
    /// and stripped before the URL reaches the driver.
    pub async fn connect(url: &str) -> PoolResult<TimeoutPool<Self>> {
        let mut url = Url::parse(url).map_err(|e| PoolError::config(format!("Invalid URL: {e}")))?;
        let config = TimeoutConfig::from_url(&mut url)?;

        let options = MySqlConnectOptions::from_str(url.as_str())
            .map_err(|e| PoolError::config(format!("Invalid MySQL connection string: {}", e)))?
            .charset("utf8mb4");

        let pool = MySqlPoolOptions::new()
            .connect_with(options)
            .await
            .map_err(DriverError::from)?;

        info!(
            host = url.host_str().unwrap_or_default(),
            reclaim = %config.reclaim,
            "Connected to MySQL"
        );

        TimeoutPool::new(Self::new(pool), config)
    }

    /// Get a reference to the underlying sqlx pool.
    pub fn pool(&self) -> &MySqlPool {
        &self.pool
    }
}

#[async_trait]
impl Pool for MySqlBackend {
    type Connection = MySqlSession;

    async fn acquire(&self) -> PoolResult<MySqlSession> {
        let mut conn = self.pool.acquire().await.map_err(DriverError::from)?;
        let thread_id: u64 = sqlx::query_scalar("SELECT CONNECTION_ID()")
            .fetch_one(&mut *conn)
            .await
            .map_err(DriverError::from)?;

        debug!(thread_id, "Acquired MySQL session");
        Ok(MySqlSession::new(conn, thread_id))
    }

    async fn execute(&self, query: &Query) -> PoolResult<QueryOutput> {
        let mut conn = self.pool.acquire().await.map_err(DriverError::from)?;
        Ok(run(&mut conn, query).await?)
    }
}

/// Shared kill switch for one session's transport.
#[derive(Debug)]
struct Transport {
    thread_id: u64,
    destroyed: AtomicBool,
    notify: Notify,
}

impl Transport {
    fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    /// Resolves once `destroy` has been called.
    async fn destroyed(&self) {
        loop {
            let notified = self.notify.notified();
            if self.is_destroyed() {
                return;
            }
            notified.await;
        }
    }
}

impl Destroyable for Transport {
    fn destroy(&self) {
        self.destroyed.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    fn thread_id(&self) -> Option<u64> {
        Some(self.thread_id)
    }
}

/// A pooled MySQL connection with a known thread id.
pub struct MySqlSession {
    conn: Option<PoolConnection<MySql>>,
    transport: Arc<Transport>,
    /// Set while a statement runs; still set if the statement was abandoned mid-flight.
    busy: bool,
}

impl MySqlSession {
    fn new(conn: PoolConnection<MySql>, thread_id: u64) -> Self {
        Self {
            conn: Some(conn),
            transport: Arc::new(Transport {
                thread_id,
                destroyed: AtomicBool::new(false),
                notify: Notify::new(),
            }),
            busy: false,
        }
    }

    /// Whether the wire protocol state can no longer be trusted.
    fn is_poisoned(&self) -> bool {
        self.busy || self.transport.is_destroyed()
    }

    /// Whether the underlying connection has been closed or handed back.
    pub fn is_closed(&self) -> bool {
        self.conn.is_none()
    }

    /// Drop the socket of a destroyed transport without returning it to the pool.
    fn close_destroyed(&mut self) {
        if let Some(conn) = self.conn.take() {
            debug!(thread_id = self.transport.thread_id, "Dropping destroyed MySQL transport");
            drop(conn.detach());
        }
    }
}

impl std::fmt::Debug for MySqlSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MySqlSession")
            .field("thread_id", &self.transport.thread_id)
            .field("destroyed", &self.transport.is_destroyed())
            .field("busy", &self.busy)
            .field("released", &self.conn.is_none())
            .finish()
    }
}

#[async_trait]
impl Connection for MySqlSession {
    async fn execute(&mut self, query: &Query) -> PoolResult<QueryOutput> {
        let transport = Arc::clone(&self.transport);
        if transport.is_destroyed() {
            self.close_destroyed();
            return Err(DriverError::connection_lost("connection was destroyed").into());
        }
        let conn = self
            .conn
            .as_mut()
            .ok_or_else(|| DriverError::connection_lost("connection was already released"))?;

        self.busy = true;
        let result = tokio::select! {
            biased;
            result = run(&mut **conn, query) => result.map_err(PoolError::from),
            _ = transport.destroyed() => Err(DriverError::connection_lost(format!(
                "transport of thread {} destroyed with a query in flight",
                transport.thread_id
            ))
            .into()),
        };
        self.busy = false;
        if transport.is_destroyed() {
            self.close_destroyed();
        }
        result
    }

    fn thread_id(&self) -> Option<u64> {
        Some(self.transport.thread_id)
    }

    fn as_releasable(&mut self) -> Option<&mut dyn Releasable> {
        Some(self)
    }

    fn destroyer(&self) -> Option<Arc<dyn Destroyable>> {
        Some(self.transport.clone())
    }
}

#[async_trait]
impl Releasable for MySqlSession {
    async fn release(&mut self) -> PoolResult<()> {
        if self.transport.is_destroyed() {
            self.close_destroyed();
            return Ok(());
        }
        let Some(conn) = self.conn.take() else {
            return Ok(());
        };

        if self.is_poisoned() {
            // Protocol state is unknown after an aborted statement.
            debug!(thread_id = self.transport.thread_id, "Closing interrupted MySQL session");
            conn.close().await.map_err(DriverError::from)?;
        }
        Ok(())
    }
}

impl Drop for MySqlSession {
    fn drop(&mut self) {
        let poisoned = self.is_poisoned();
        if let Some(conn) = self.conn.take() {
            if poisoned {
                // Detached connections close on drop instead of returning to the pool.
                drop(conn.detach());
            }
        }
    }
}

// =============================================================================
// Statement Execution
// =============================================================================

async fn run(conn: &mut MySqlConnection, query: &Query) -> DriverResult<QueryOutput> {
    use sqlx::Executor;

    // When params is empty, use raw SQL to avoid prepared statement issues
    // (KILL and some administrative statements cannot be prepared)
    if query.returns_rows() {
        let rows: Vec<MySqlRow> = if query.params.is_empty() {
            (&mut *conn).fetch_all(query.sql.as_str()).await?
        } else {
            let mut q = sqlx::query(&query.sql);
            for param in &query.params {
                q = bind_param(q, param);
            }
            q.fetch_all(&mut *conn).await?
        };
        Ok(rows_to_output(&rows))
    } else {
        let result = if query.params.is_empty() {
            (&mut *conn).execute(query.sql.as_str()).await?
        } else {
            let mut q = sqlx::query(&query.sql);
            for param in &query.params {
                q = bind_param(q, param);
            }
            q.execute(&mut *conn).await?
        };
        Ok(QueryOutput::write_result(result.rows_affected()))
    }
}

fn bind_param<'q>(
    query: sqlx::query::Query<'q, MySql, MySqlArguments>,
    param: &'q QueryParam,
) -> sqlx::query::Query<'q, MySql, MySqlArguments> {
    match param {
        QueryParam::Null => query.bind(None::<String>),
        QueryParam::Bool(v) => query.bind(*v),
        QueryParam::Int(v) => query.bind(*v),
        QueryParam::Float(v) => query.bind(*v),
        QueryParam::String(v) => query.bind(v.as_str()),
        QueryParam::Bytes(v) => query.bind(v.as_slice()),
    }
}

// =============================================================================
// Row Decoding
// =============================================================================

/// Logical category for MySQL column types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TypeCategory {
    Integer,
    Float,
    Boolean,
    Binary,
    Json,
    Text,
}

fn categorize_type(type_name: &str) -> TypeCategory {
    let lower = type_name.to_lowercase();

    // DECIMAL is decoded as text to preserve precision
    if lower.contains("decimal") || lower.contains("numeric") {
        return TypeCategory::Text;
    }
    if lower == "boolean" || lower == "bool" {
        return TypeCategory::Boolean;
    }
    if lower.contains("int") {
        return TypeCategory::Integer;
    }
    if lower.contains("float") || lower.contains("double") || lower == "real" {
        return TypeCategory::Float;
    }
    if lower == "json" {
        return TypeCategory::Json;
    }
    if lower.contains("blob") || lower.contains("binary") {
        return TypeCategory::Binary;
    }
    TypeCategory::Text
}

fn rows_to_output(rows: &[MySqlRow]) -> QueryOutput {
    let columns = rows
        .first()
        .map(|row| row.columns().iter().map(|c| c.name().to_string()).collect())
        .unwrap_or_default();

    let rows = rows
        .iter()
        .map(|row| {
            row.columns()
                .iter()
                .enumerate()
                .map(|(idx, col)| {
                    let category = categorize_type(col.type_info().name());
                    (col.name().to_string(), decode_column(row, idx, category))
                })
                .collect()
        })
        .collect();

    QueryOutput::rows(columns, rows)
}

fn decode_column(row: &MySqlRow, idx: usize, category: TypeCategory) -> JsonValue {
    match category {
        TypeCategory::Integer => decode_integer(row, idx),
        TypeCategory::Boolean => row
            .try_get::<Option<bool>, _>(idx)
            .ok()
            .flatten()
            .map(JsonValue::Bool)
            .unwrap_or(JsonValue::Null),
        TypeCategory::Float => row
            .try_get::<Option<f64>, _>(idx)
            .ok()
            .flatten()
            .and_then(serde_json::Number::from_f64)
            .map(JsonValue::Number)
            .unwrap_or(JsonValue::Null),
        TypeCategory::Binary => row
            .try_get::<Option<Vec<u8>>, _>(idx)
            .ok()
            .flatten()
            .map(|v| {
                use base64::{Engine as _, engine::general_purpose::STANDARD};
                JsonValue::String(STANDARD.encode(v))
            })
            .unwrap_or(JsonValue::Null),
        TypeCategory::Json => row
            .try_get::<Option<JsonValue>, _>(idx)
            .ok()
            .flatten()
            .unwrap_or(JsonValue::Null),
        TypeCategory::Text => row
            .try_get::<Option<String>, _>(idx)
            .ok()
            .flatten()
            .map(JsonValue::String)
            .unwrap_or(JsonValue::Null),
    }
}

fn decode_integer(row: &MySqlRow, idx: usize) -> JsonValue {
    if let Ok(Some(v)) = row.try_get::<Option<i64>, _>(idx) {
        return JsonValue::Number(v.into());
    }
    if let Ok(Some(v)) = row.try_get::<Option<u64>, _>(idx) {
        return JsonValue::Number(v.into());
    }
    if let Ok(Some(v)) = row.try_get::<Option<i32>, _>(idx) {
        return JsonValue::Number(v.into());
    }
    if let Ok(Some(v)) = row.try_get::<Option<u32>, _>(idx) {
        return JsonValue::Number(v.into());
    }
    if let Ok(Some(v)) = row.try_get::<Option<i16>, _>(idx) {
        return JsonValue::Number(v.into());
    }
    if let Ok(Some(v)) = row.try_get::<Option<u16>, _>(idx) {
        return JsonValue::Number(v.into());
    }
    if let Ok(Some(v)) = row.try_get::<Option<i8>, _>(idx) {
        return JsonValue::Number(v.into());
    }
    if let Ok(Some(v)) = row.try_get::<Option<u8>, _>(idx) {
        return JsonValue::Number(v.into());
    }
    JsonValue::Null
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_categorize_type() {
        assert_eq!(categorize_type("BIGINT UNSIGNED"), TypeCategory::Integer);
        assert_eq!(categorize_type("TINYINT"), TypeCategory::Integer);
        assert_eq!(categorize_type("BOOLEAN"), TypeCategory::Boolean);
        assert_eq!(categorize_type("DOUBLE"), TypeCategory::Float);
        assert_eq!(categorize_type("DECIMAL"), TypeCategory::Text);
        assert_eq!(categorize_type("JSON"), TypeCategory::Json);
        assert_eq!(categorize_type("VARBINARY"), TypeCategory::Binary);
        assert_eq!(categorize_type("VARCHAR"), TypeCategory::Text);
    }

    #[tokio::test]
    async fn test_transport_destroy_wakes_waiter() {
        let transport = Arc::new(Transport {
            thread_id: 42,
            destroyed: AtomicBool::new(false),
            notify: Notify::new(),
        });

        let waiter = {
            let transport = transport.clone();
            tokio::spawn(async move { transport.destroyed().await })
        };
        tokio::task::yield_now().await;

        transport.destroy();
        waiter.await.unwrap();
        assert!(transport.is_destroyed());
        assert_eq!(Destroyable::thread_id(&*transport), Some(42));
    }

    #[tokio::test]
    async fn test_connect_rejects_bad_timeout_option() {
        let result = MySqlBackend::connect("mysql://root@localhost:3306/db?timeout=0").await;
        assert!(matches!(result, Err(PoolError::Config { .. })));
    }
}
