//! Glue between decomposed requests, the statement builder and the database.

use std::sync::atomic::{AtomicU64, Ordering};

use serde_json::{Map, Value};
use tracing::debug;

use crate::{
    builder::{QueryBuilder, Statement},
    dialect::{Dialect, IdentityStrategy},
    error::{SqldError, SqldResult},
    raw::{self, QueryKind},
    request::{TableRequest, ROW_ID_COLUMN},
    response::Payload,
    value::{ExecResult, Row, SqlValue},
    Database, WriteOutcome,
};

/// Executes table and raw requests against one database.
#[derive(Debug)]
pub struct QueryService {
    db: Database,
    dialect: Dialect,
    writes: AtomicU64,
}

impl QueryService {
    pub fn new(db: Database, dialect: Dialect) -> Self {
        Self {
            db,
            dialect,
            writes: AtomicU64::new(0),
        }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn dialect(&self) -> &Dialect {
        &self.dialect
    }

    pub async fn read(&self, request: &TableRequest) -> SqldResult<Payload> {
        let statement = self.builder().select(request)?;
        let rows = self.db.fetch_rows(&statement).await?;
        Ok(Payload::Rows(rows))
    }

    /// Inserts one row. Engines reporting a last insert id echo the payload back
    /// with `id` filled in; otherwise only the affected count is returned.
    pub async fn create(&self, table: &str, payload: &Map<String, Value>) -> SqldResult<Payload> {
        let statement = self.builder().insert(table, payload)?;
        let outcome = self.write(&statement).await?;

        let generated = match self.dialect.identity() {
            IdentityStrategy::LastInsertId => outcome.last_insert_id.filter(|id| *id != 0),
            IdentityStrategy::Unavailable => None,
        };
        match generated {
            Some(id) => {
                let mut row = Row::from(payload);
                if row.get(ROW_ID_COLUMN).is_none() {
                    let value = i64::try_from(id)
                        .map(SqlValue::Int)
                        .unwrap_or(SqlValue::UInt(id));
                    row.insert(ROW_ID_COLUMN, value);
                }
                Ok(Payload::Created(row))
            }
            None => Ok(Payload::Exec(exec_result(outcome))),
        }
    }

    pub async fn update(
        &self,
        request: &TableRequest,
        payload: &Map<String, Value>,
    ) -> SqldResult<Payload> {
        let statement = self.builder().update(request, payload)?;
        let outcome = self.write(&statement).await?;
        Ok(Payload::Exec(exec_result(outcome)))
    }

    pub async fn delete(&self, request: &TableRequest) -> SqldResult<Payload> {
        let statement = self.builder().delete(request)?;
        let outcome = self.write(&statement).await?;
        Ok(Payload::Exec(exec_result(outcome)))
    }

    /// Runs caller supplied SQL verbatim after classifying it.
    pub async fn raw(&self, sql: &str) -> SqldResult<Payload> {
        let (sql, kind) = raw::prepare(sql)?;
        let statement = Statement::raw(sql);
        match kind {
            QueryKind::Read => Ok(Payload::Rows(self.db.fetch_rows(&statement).await?)),
            QueryKind::Write => {
                let outcome = self.write(&statement).await?;
                Ok(Payload::Exec(exec_result(outcome)))
            }
        }
    }

    /// Successful writes since the last call, resetting the counter.
    pub fn take_writes(&self) -> u64 {
        self.writes.swap(0, Ordering::AcqRel)
    }

    pub fn pending_writes(&self) -> u64 {
        self.writes.load(Ordering::Acquire)
    }

    /// Puts back writes taken by a snapshot that then failed.
    pub fn restore_writes(&self, count: u64) {
        self.writes.fetch_add(count, Ordering::AcqRel);
    }

    fn builder(&self) -> QueryBuilder<'_> {
        QueryBuilder::new(&self.dialect)
    }

    async fn write(&self, statement: &Statement) -> SqldResult<WriteOutcome> {
        let outcome = self.db.execute(statement).await?;
        self.writes.fetch_add(1, Ordering::AcqRel);
        debug!(rows_affected = outcome.rows_affected, "write applied");
        Ok(outcome)
    }
}

fn exec_result(outcome: WriteOutcome) -> ExecResult {
    ExecResult {
        rows_affected: outcome.rows_affected,
    }
}

/// Parses a create/update body, which must be a JSON object.
pub fn parse_object(body: &[u8]) -> SqldResult<Map<String, Value>> {
    match serde_json::from_slice::<Value>(body)? {
        Value::Object(object) => Ok(object),
        _ => Err(SqldError::bad_request("request body must be a JSON object")),
    }
}
