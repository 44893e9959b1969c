//! SQLite snapshots.
//!
//! Saving and loading both copy schema and rows between a pooled connection
//! and a separate connection on the snapshot file. The live database may be
//! in-memory, so nothing here relies on it being able to open other files.

use std::{
    ffi::OsString,
    io::ErrorKind,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use futures::TryStreamExt;
use sqlx::{
    sqlite::{SqliteConnectOptions, SqliteJournalMode},
    ConnectOptions, Connection, Row as _, SqliteConnection, SqlitePool, TypeInfo, ValueRef,
};
use tracing::{debug, info, warn};

use crate::dialect::{DbKind, Dialect};

/// What a snapshot or restore copied.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RestoreReport {
    pub tables: usize,
    pub rows: u64,
}

/// Writes a consistent copy of the live database to `path`.
///
/// The copy is written next to the target and renamed over it, so a reader of
/// `path` never sees a partial file.
pub async fn snapshot_to(pool: &SqlitePool, path: &Path) -> Result<RestoreReport> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }

    let staging = staging_path(path);
    remove_if_exists(&staging).await?;

    let written = write_snapshot(pool, &staging).await;
    let report = match written {
        Ok(report) => report,
        Err(err) => {
            if let Err(cleanup) = remove_if_exists(&staging).await {
                warn!(error = %cleanup, "failed to remove partial snapshot");
            }
            return Err(err.context(format!("failed to snapshot into {}", staging.display())));
        }
    };

    tokio::fs::rename(&staging, path)
        .await
        .with_context(|| format!("failed to move snapshot into {}", path.display()))?;

    info!(
        path = %path.display(),
        tables = report.tables,
        rows = report.rows,
        "sqlite snapshot written"
    );
    Ok(report)
}

async fn write_snapshot(pool: &SqlitePool, staging: &Path) -> Result<RestoreReport> {
    let mut source = pool.acquire().await.context("no connection for snapshot")?;
    let mut target = SqliteConnectOptions::new()
        .filename(staging)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Delete)
        .connect()
        .await
        .with_context(|| format!("failed to create {}", staging.display()))?;

    // One read transaction on the source keeps every table at the same point.
    let mut reading = source.begin().await?;
    let mut writing = target.begin().await?;
    let report = copy_database(&mut reading, &mut writing).await?;
    writing.commit().await?;
    reading.rollback().await?;

    target.close().await?;
    Ok(report)
}

/// Loads every table, row, index, view and trigger of the snapshot at `path`
/// into the live database. Objects of the same name are replaced. A missing
/// file restores nothing.
pub async fn restore_from(pool: &SqlitePool, path: &Path) -> Result<RestoreReport> {
    match tokio::fs::metadata(path).await {
        Ok(_) => {}
        Err(err) if err.kind() == ErrorKind::NotFound => {
            debug!(path = %path.display(), "no snapshot to restore");
            return Ok(RestoreReport::default());
        }
        Err(err) => {
            return Err(err).with_context(|| format!("failed to stat {}", path.display()));
        }
    }

    let mut source = SqliteConnectOptions::new()
        .filename(path)
        .read_only(true)
        .connect()
        .await
        .with_context(|| format!("failed to open {}", path.display()))?;
    let mut conn = pool.acquire().await.context("no connection for restore")?;

    // Foreign keys can only be toggled outside a transaction.
    sqlx::query("PRAGMA foreign_keys = OFF")
        .execute(&mut *conn)
        .await?;
    let restored = async {
        let mut writing = conn.begin().await?;
        let report = copy_database(&mut source, &mut writing).await?;
        writing.commit().await?;
        Ok::<_, anyhow::Error>(report)
    }
    .await;
    sqlx::query("PRAGMA foreign_keys = ON")
        .execute(&mut *conn)
        .await?;

    if let Err(err) = source.close().await {
        warn!(error = %err, "failed to close snapshot file");
    }
    let report = restored.with_context(|| format!("failed to restore {}", path.display()))?;

    info!(
        path = %path.display(),
        tables = report.tables,
        rows = report.rows,
        "sqlite snapshot restored"
    );
    Ok(report)
}

#[derive(Debug, sqlx::FromRow)]
struct SchemaObject {
    #[sqlx(rename = "type")]
    kind: String,
    name: String,
    sql: String,
}

/// One stored value, by SQLite storage class.
enum Cell {
    Null,
    Integer(i64),
    Real(f64),
    Text(Vec<u8>),
    Blob(Vec<u8>),
}

async fn copy_database(
    source: &mut SqliteConnection,
    target: &mut SqliteConnection,
) -> Result<RestoreReport> {
    let objects: Vec<SchemaObject> = sqlx::query_as(
        "SELECT type, name, sql FROM sqlite_master \
         WHERE sql IS NOT NULL AND name NOT LIKE 'sqlite_%' \
         ORDER BY CASE type WHEN 'table' THEN 0 WHEN 'index' THEN 1 ELSE 2 END, rowid",
    )
    .fetch_all(&mut *source)
    .await?;

    let dialect = Dialect::new(DbKind::Sqlite, None);
    let mut report = RestoreReport::default();

    // Tables and their rows first, so triggers do not fire on copied rows.
    for object in objects.iter().filter(|o| o.kind == "table") {
        let name = dialect.quote_identifier(&object.name);
        sqlx::query(&format!("DROP TABLE IF EXISTS main.{name}"))
            .execute(&mut *target)
            .await?;
        sqlx::query(&object.sql).execute(&mut *target).await?;
        let rows = copy_rows(source, target, &name).await?;

        debug!(table = %object.name, rows, "table copied");
        report.tables += 1;
        report.rows += rows;
    }

    for object in objects.iter().filter(|o| o.kind != "table") {
        let keyword = match object.kind.as_str() {
            "index" => "INDEX",
            "view" => "VIEW",
            "trigger" => "TRIGGER",
            other => {
                warn!(kind = other, name = %object.name, "skipping unknown schema object");
                continue;
            }
        };
        let name = dialect.quote_identifier(&object.name);
        sqlx::query(&format!("DROP {keyword} IF EXISTS main.{name}"))
            .execute(&mut *target)
            .await?;
        sqlx::query(&object.sql).execute(&mut *target).await?;
    }

    copy_sequences(source, target).await?;
    Ok(report)
}

async fn copy_rows(
    source: &mut SqliteConnection,
    target: &mut SqliteConnection,
    table: &str,
) -> Result<u64> {
    let select = format!("SELECT * FROM main.{table}");
    let mut rows = sqlx::query(&select).fetch(&mut *source);
    let mut copied = 0;

    while let Some(row) = rows.try_next().await? {
        let mut cells = Vec::with_capacity(row.len());
        for idx in 0..row.len() {
            let raw = row.try_get_raw(idx)?;
            if raw.is_null() {
                cells.push(Cell::Null);
                continue;
            }
            let storage = raw.type_info().name().to_ascii_uppercase();
            cells.push(match storage.as_str() {
                "INTEGER" => Cell::Integer(row.try_get_unchecked(idx)?),
                "REAL" => Cell::Real(row.try_get_unchecked(idx)?),
                "TEXT" => Cell::Text(row.try_get_unchecked(idx)?),
                _ => Cell::Blob(row.try_get_unchecked(idx)?),
            });
        }

        let mut insert = format!("INSERT INTO main.{table} VALUES (");
        for (idx, cell) in cells.iter().enumerate() {
            if idx > 0 {
                insert.push_str(", ");
            }
            // Text goes in as bytes so cells that are not valid UTF-8 survive.
            insert.push_str(match cell {
                Cell::Null => "NULL",
                Cell::Text(_) => "CAST(? AS TEXT)",
                _ => "?",
            });
        }
        insert.push(')');

        let mut query = sqlx::query(&insert);
        for cell in cells {
            query = match cell {
                Cell::Null => query,
                Cell::Integer(v) => query.bind(v),
                Cell::Real(v) => query.bind(v),
                Cell::Text(v) | Cell::Blob(v) => query.bind(v),
            };
        }
        query.execute(&mut *target).await?;
        copied += 1;
    }
    Ok(copied)
}

/// Carries AUTOINCREMENT counters over, so deleted ids are not reused.
async fn copy_sequences(source: &mut SqliteConnection, target: &mut SqliteConnection) -> Result<()> {
    let has_sequences: Option<String> = sqlx::query_scalar(
        "SELECT name FROM sqlite_master WHERE type = 'table' AND name = 'sqlite_sequence'",
    )
    .fetch_optional(&mut *source)
    .await?;
    if has_sequences.is_none() {
        return Ok(());
    }

    let sequences: Vec<(String, i64)> = sqlx::query_as("SELECT name, seq FROM sqlite_sequence")
        .fetch_all(&mut *source)
        .await?;
    for (name, seq) in sequences {
        sqlx::query("DELETE FROM sqlite_sequence WHERE name = ?")
            .bind(&name)
            .execute(&mut *target)
            .await?;
        sqlx::query("INSERT INTO sqlite_sequence (name, seq) VALUES (?, ?)")
            .bind(&name)
            .bind(seq)
            .execute(&mut *target)
            .await?;
    }
    Ok(())
}

fn staging_path(path: &Path) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(".tmp");
    PathBuf::from(name)
}

async fn remove_if_exists(path: &Path) -> Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err).with_context(|| format!("failed to remove {}", path.display())),
    }
}
