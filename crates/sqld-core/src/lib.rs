//! sqld core: request decomposition, dialect-aware statement building and
//! execution against MySQL, PostgreSQL or SQLite.
//!
//! The HTTP surface lives in `sqld-daemon`; everything here is transport
//! agnostic. A [`Database`] wraps one concrete sqlx pool, [`QueryService`]
//! turns decomposed requests into statements and runs them, and the
//! [`response`] module shapes results as JSON or delimited text.

use std::{borrow::Cow, str::FromStr, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::{stream::BoxStream, TryStreamExt};
use parking_lot::RwLock;
use sqlx::{
    database::HasArguments,
    mysql::{MySqlPool, MySqlPoolOptions},
    postgres::{PgPool, PgPoolOptions},
    query::Query,
    sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions},
    Either, Encode, Executor, Type, TypeInfo,
};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub mod builder;
pub mod dialect;
pub mod error;
pub mod materialize;
pub mod pgwire;
pub mod raw;
pub mod request;
pub mod response;
pub mod service;
pub mod snapshot;
pub mod value;

pub use builder::{QueryBuilder, Statement};
pub use dialect::{DbKind, Dialect};
pub use error::{ConfigurationError, ErrorKind, SqldError, SqldResult};
pub use request::{decompose, ControlParams, FilterSet, TableRequest};
pub use response::{Payload, ResponseFormat};
pub use service::QueryService;
pub use value::{ExecResult, Row, SqlArg, SqlValue};

use materialize::ColumnSet;

/// Busy timeout applied to file backed SQLite databases under write contention.
const SQLITE_BUSY_TIMEOUT_MS: u64 = 5_000;
/// How long a request waits for a pooled connection before failing with 503.
const ACQUIRE_TIMEOUT_SECS: u64 = 10;

/// One connection pool per supported engine.
#[derive(Clone, Debug)]
pub enum DbPool {
    MySql(MySqlPool),
    Postgres(PgPool),
    Sqlite(SqlitePool),
}

/// Result of a write statement as reported by the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteOutcome {
    pub rows_affected: u64,
    /// Driver reported identity of the last inserted row. Always `None` on
    /// PostgreSQL, which has no such concept without `RETURNING`.
    pub last_insert_id: Option<u64>,
}

/// Shared handle to the configured database.
#[derive(Clone, Debug)]
pub struct Database {
    pool: DbPool,
}

impl Database {
    /// Opens a pool for `kind` at `url`.
    ///
    /// An in-memory SQLite database only exists as long as its connection, so
    /// it gets a single connection that is never recycled.
    pub async fn connect(kind: DbKind, url: &str, max_connections: u32) -> Result<Self> {
        let max_connections = max_connections.max(1);
        let acquire_timeout = Duration::from_secs(ACQUIRE_TIMEOUT_SECS);

        let pool = match kind {
            DbKind::MySql => DbPool::MySql(
                MySqlPoolOptions::new()
                    .max_connections(max_connections)
                    .acquire_timeout(acquire_timeout)
                    .connect(url)
                    .await
                    .context("failed to connect to mysql")?,
            ),
            DbKind::Postgres => DbPool::Postgres(
                PgPoolOptions::new()
                    .max_connections(max_connections)
                    .acquire_timeout(acquire_timeout)
                    .connect(url)
                    .await
                    .context("failed to connect to postgres")?,
            ),
            DbKind::Sqlite => {
                let options = SqliteConnectOptions::from_str(url)
                    .with_context(|| format!("invalid sqlite url {url}"))?
                    .create_if_missing(true)
                    .busy_timeout(Duration::from_millis(SQLITE_BUSY_TIMEOUT_MS));

                let pool_options = if is_sqlite_memory(url) {
                    debug!("in-memory sqlite: pinning a single connection");
                    SqlitePoolOptions::new()
                        .min_connections(1)
                        .max_connections(1)
                        .idle_timeout(None)
                        .max_lifetime(None)
                } else {
                    SqlitePoolOptions::new().max_connections(max_connections)
                };

                DbPool::Sqlite(
                    pool_options
                        .acquire_timeout(acquire_timeout)
                        .connect_with(options)
                        .await
                        .context("failed to open sqlite database")?,
                )
            }
        };

        info!(db = kind.as_str(), "database pool ready");
        Ok(Self { pool })
    }

    pub fn kind(&self) -> DbKind {
        match self.pool {
            DbPool::MySql(_) => DbKind::MySql,
            DbPool::Postgres(_) => DbKind::Postgres,
            DbPool::Sqlite(_) => DbKind::Sqlite,
        }
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    /// The SQLite pool, when that is the configured engine.
    pub fn sqlite_pool(&self) -> Option<&SqlitePool> {
        match &self.pool {
            DbPool::Sqlite(pool) => Some(pool),
            _ => None,
        }
    }

    /// Round trip to the server.
    pub async fn ping(&self) -> SqldResult<()> {
        const PING: &str = "SELECT 1";
        let outcome = match &self.pool {
            DbPool::MySql(pool) => sqlx::query(PING).execute(pool).await.map(drop),
            DbPool::Postgres(pool) => sqlx::query(PING).execute(pool).await.map(drop),
            DbPool::Sqlite(pool) => sqlx::query(PING).execute(pool).await.map(drop),
        };
        outcome.map_err(SqldError::from)
    }

    /// Runs a row-producing statement, materializing every row in result order.
    pub async fn fetch_rows(&self, statement: &Statement) -> SqldResult<Vec<Row>> {
        debug!(sql = %statement.sql, args = statement.args.len(), "fetch");
        match &self.pool {
            DbPool::MySql(pool) => {
                let rows = bind_args(sqlx::query(&statement.sql), &statement.args).fetch(pool);
                collect_rows(rows, materialize::mysql_row).await
            }
            DbPool::Postgres(pool) => {
                let sql = postgres_sql(pool, statement).await?;
                let rows = bind_args(sqlx::query(&sql), &statement.args).fetch(pool);
                collect_rows(rows, materialize::postgres_row).await
            }
            DbPool::Sqlite(pool) => {
                let rows = bind_args(sqlx::query(&statement.sql), &statement.args).fetch(pool);
                collect_rows(rows, materialize::sqlite_row).await
            }
        }
    }

    /// Runs a write statement.
    pub async fn execute(&self, statement: &Statement) -> SqldResult<WriteOutcome> {
        debug!(sql = %statement.sql, args = statement.args.len(), "execute");
        let outcome = match &self.pool {
            DbPool::MySql(pool) => {
                let done = bind_args(sqlx::query(&statement.sql), &statement.args)
                    .execute(pool)
                    .await?;
                WriteOutcome {
                    rows_affected: done.rows_affected(),
                    last_insert_id: Some(done.last_insert_id()),
                }
            }
            DbPool::Postgres(pool) => {
                let sql = postgres_sql(pool, statement).await?;
                let done = bind_args(sqlx::query(&sql), &statement.args)
                    .execute(pool)
                    .await?;
                WriteOutcome {
                    rows_affected: done.rows_affected(),
                    last_insert_id: None,
                }
            }
            DbPool::Sqlite(pool) => {
                let done = bind_args(sqlx::query(&statement.sql), &statement.args)
                    .execute(pool)
                    .await?;
                WriteOutcome {
                    rows_affected: done.rows_affected(),
                    last_insert_id: u64::try_from(done.last_insert_rowid()).ok(),
                }
            }
        };
        Ok(outcome)
    }

    /// Closes the pool, waiting for checked out connections to be returned.
    pub async fn close(&self) {
        match &self.pool {
            DbPool::MySql(pool) => pool.close().await,
            DbPool::Postgres(pool) => pool.close().await,
            DbPool::Sqlite(pool) => pool.close().await,
        }
    }
}

/// `sqlite::memory:` and `file:...?mode=memory` style URLs.
pub fn is_sqlite_memory(url: &str) -> bool {
    url.contains(":memory:") || url.contains("mode=memory")
}

/// The statement's SQL with every text argument cast to the type PostgreSQL
/// infers for its placeholder.
async fn postgres_sql<'s>(pool: &PgPool, statement: &'s Statement) -> SqldResult<Cow<'s, str>> {
    let has_text = statement
        .args
        .iter()
        .any(|arg| matches!(arg, SqlArg::Text(_)));
    if !has_text || statement.placeholders().len() != statement.args.len() {
        return Ok(Cow::Borrowed(&statement.sql));
    }

    let described = pool.describe(&statement.sql).await?;
    let Some(Either::Left(types)) = described.parameters() else {
        return Ok(Cow::Borrowed(&statement.sql));
    };

    let dialect = Dialect::new(DbKind::Postgres, None);
    let casts: Vec<Option<String>> = statement
        .args
        .iter()
        .zip(types)
        .map(|(arg, type_info)| match arg {
            SqlArg::Text(_) => dialect.parameter_cast(type_info.name()),
            _ => None,
        })
        .collect();
    if casts.iter().all(Option::is_none) {
        return Ok(Cow::Borrowed(&statement.sql));
    }

    let sql = statement.sql_with_casts(&casts);
    debug!(%sql, "text arguments cast to inferred types");
    Ok(Cow::Owned(sql))
}

fn bind_args<'q, DB>(
    mut query: Query<'q, DB, <DB as HasArguments<'q>>::Arguments>,
    args: &[SqlArg],
) -> Query<'q, DB, <DB as HasArguments<'q>>::Arguments>
where
    DB: sqlx::Database,
    bool: Encode<'q, DB> + Type<DB>,
    i64: Encode<'q, DB> + Type<DB>,
    f64: Encode<'q, DB> + Type<DB>,
    String: Encode<'q, DB> + Type<DB>,
{
    for arg in args {
        query = match arg {
            SqlArg::Bool(v) => query.bind(*v),
            SqlArg::Int(v) => query.bind(*v),
            SqlArg::Float(v) => query.bind(*v),
            SqlArg::Text(v) => query.bind(v.clone()),
        };
    }
    query
}

async fn collect_rows<R: sqlx::Row>(
    mut rows: BoxStream<'_, Result<R, sqlx::Error>>,
    convert: fn(&R, &ColumnSet) -> Result<Row, sqlx::Error>,
) -> SqldResult<Vec<Row>> {
    let mut columns: Option<ColumnSet> = None;
    let mut out = Vec::new();
    while let Some(row) = rows.try_next().await? {
        let columns = columns.get_or_insert_with(|| ColumnSet::of(&row));
        out.push(convert(&row, columns)?);
    }
    Ok(out)
}

/// Long running job owned by the daemon, e.g. health checks or snapshots.
#[async_trait]
pub trait BackgroundWorker: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    async fn run(self: Arc<Self>) -> Result<()>;
}

/// Owns the join handle of a running worker.
pub struct WorkerGuard {
    name: &'static str,
    handle: JoinHandle<Result<()>>,
}

impl WorkerGuard {
    pub fn new(name: &'static str, handle: JoinHandle<Result<()>>) -> Self {
        Self { name, handle }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub async fn join(self) -> Result<()> {
        self.handle
            .await
            .with_context(|| format!("worker {} panicked", self.name))??;
        Ok(())
    }
}

/// Background workers spawned by the daemon, joined on shutdown.
#[derive(Default)]
pub struct WorkerRegistry {
    workers: RwLock<Vec<WorkerGuard>>,
}

impl WorkerRegistry {
    pub fn spawn<W: BackgroundWorker>(&self, worker: Arc<W>) {
        let name = worker.name();
        debug!(worker = name, "spawning background worker");
        let handle = tokio::spawn(worker.run());
        self.workers.write().push(WorkerGuard::new(name, handle));
    }

    pub fn len(&self) -> usize {
        self.workers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.read().is_empty()
    }

    /// Joins every worker. Failures are logged; the first one is returned.
    pub async fn wait_all(self) -> Result<()> {
        let mut first_error = None;
        for guard in self.workers.into_inner() {
            let name = guard.name();
            if let Err(err) = guard.join().await {
                warn!(worker = name, error = %err, "background worker failed");
                first_error.get_or_insert(err);
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const TEST_DB_URL: &str = "sqlite::memory:";

    async fn setup_db() -> Database {
        Database::connect(DbKind::Sqlite, TEST_DB_URL, 4).await.unwrap()
    }

    #[tokio::test]
    async fn memory_database_survives_across_statements() {
        let db = setup_db().await;
        db.execute(&Statement::raw("CREATE TABLE t (id INTEGER PRIMARY KEY, name TEXT)"))
            .await
            .unwrap();
        let outcome = db
            .execute(
                &QueryBuilder::new(&Dialect::new(DbKind::Sqlite, None))
                    .insert("t", &serde_json::json!({"name": "a"}).as_object().cloned().unwrap())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(outcome.rows_affected, 1);
        assert_eq!(outcome.last_insert_id, Some(1));

        let rows = db.fetch_rows(&Statement::raw("SELECT * FROM t")).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get("name"), Some(&SqlValue::Text("a".into())));
    }

    #[tokio::test]
    async fn fetch_materializes_storage_classes() {
        let db = setup_db().await;
        let rows = db
            .fetch_rows(&Statement::raw(
                "SELECT 1 AS i, 2.5 AS f, 'x' AS s, NULL AS n, X'6869' AS b",
            ))
            .await
            .unwrap();
        let row = &rows[0];
        assert_eq!(row.get("i"), Some(&SqlValue::Int(1)));
        assert_eq!(row.get("f"), Some(&SqlValue::Float(2.5)));
        assert_eq!(row.get("s"), Some(&SqlValue::Text("x".into())));
        assert_eq!(row.get("n"), Some(&SqlValue::Null));
        assert_eq!(row.get("b"), Some(&SqlValue::Text("hi".into())));
        let columns: Vec<&str> = row.columns().collect();
        assert_eq!(columns, vec!["i", "f", "s", "n", "b"]);
    }

    #[tokio::test]
    async fn invalid_utf8_text_is_read_lossily() {
        let db = setup_db().await;
        db.execute(&Statement::raw("CREATE TABLE t (id INTEGER, s TEXT)"))
            .await
            .unwrap();
        db.execute(&Statement::raw(
            "INSERT INTO t VALUES (1, CAST(X'6869FF' AS TEXT))",
        ))
        .await
        .unwrap();

        let rows = db.fetch_rows(&Statement::raw("SELECT * FROM t")).await.unwrap();
        assert_eq!(rows[0].get("s"), Some(&SqlValue::Text("hi\u{fffd}".into())));
    }

    #[tokio::test]
    async fn database_errors_are_bad_requests() {
        let db = setup_db().await;
        let err = db
            .fetch_rows(&Statement::raw("SELECT * FROM missing_table"))
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), 400);
        assert!(err.message().contains("missing_table"));
    }

    #[tokio::test]
    async fn ping_and_close() {
        let db = setup_db().await;
        db.ping().await.unwrap();
        db.close().await;
        let err = db.ping().await.unwrap_err();
        assert_eq!(err.status_code(), 503);
    }

    #[test]
    fn memory_url_detection() {
        assert!(is_sqlite_memory("sqlite::memory:"));
        assert!(is_sqlite_memory("sqlite://file:db?mode=memory&cache=shared"));
        assert!(!is_sqlite_memory("sqlite:///var/lib/sqld/data.db"));
    }

    struct Counter {
        hits: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl BackgroundWorker for Counter {
        fn name(&self) -> &'static str {
            "counter"
        }

        async fn run(self: Arc<Self>) -> Result<()> {
            self.hits.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                anyhow::bail!("counter failed");
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn registry_joins_workers_and_reports_failures() {
        let ok = Arc::new(Counter {
            hits: AtomicUsize::new(0),
            fail: false,
        });
        let registry = WorkerRegistry::default();
        registry.spawn(ok.clone());
        assert_eq!(registry.len(), 1);
        registry.wait_all().await.unwrap();
        assert_eq!(ok.hits.load(Ordering::SeqCst), 1);

        let registry = WorkerRegistry::default();
        registry.spawn(Arc::new(Counter {
            hits: AtomicUsize::new(0),
            fail: true,
        }));
        let err = registry.wait_all().await.unwrap_err();
        assert!(err.to_string().contains("counter failed"));
    }
}
