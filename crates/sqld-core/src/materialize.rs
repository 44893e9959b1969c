//! Driver rows to [`Row`] conversion.
//!
//! Values are decoded by the type the driver reports for the cell. Anything that is
//! neither numeric, boolean nor temporal is read as raw bytes and decoded as UTF-8,
//! which covers text, decimal and binary columns alike. PostgreSQL types with a
//! binary layout of their own go through [`crate::pgwire`] first.

use std::fmt::Write as _;

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use sqlx::{
    mysql::MySqlRow, postgres::PgRow, sqlite::SqliteRow, Column, Row as _, TypeInfo, ValueRef,
};
use uuid::Uuid;

use crate::{
    pgwire::{self, PgScalar},
    value::{Row, SqlValue},
};

/// Column names of a result set, read once from its first row.
#[derive(Debug, Clone)]
pub struct ColumnSet {
    names: Vec<String>,
}

impl ColumnSet {
    pub fn of<R: sqlx::Row>(row: &R) -> Self {
        Self {
            names: row
                .columns()
                .iter()
                .map(|column| column.name().to_string())
                .collect(),
        }
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }
}

pub fn sqlite_row(row: &SqliteRow, columns: &ColumnSet) -> Result<Row, sqlx::Error> {
    let mut out = Row::with_capacity(columns.names.len());
    for (idx, name) in columns.names.iter().enumerate() {
        let raw = row.try_get_raw(idx)?;
        if raw.is_null() {
            out.insert(name.as_str(), SqlValue::Null);
            continue;
        }
        // Storage class of the value itself, not the declared column type.
        let storage = raw.type_info().name().to_ascii_uppercase();
        let value = match storage.as_str() {
            "INTEGER" => SqlValue::Int(row.try_get_unchecked::<i64, _>(idx)?),
            "REAL" => SqlValue::Float(row.try_get_unchecked::<f64, _>(idx)?),
            // TEXT cells are not guaranteed to be valid UTF-8.
            _ => SqlValue::from_bytes(&row.try_get_unchecked::<Vec<u8>, _>(idx)?),
        };
        out.insert(name.as_str(), value);
    }
    Ok(out)
}

pub fn postgres_row(row: &PgRow, columns: &ColumnSet) -> Result<Row, sqlx::Error> {
    let mut out = Row::with_capacity(columns.names.len());
    for (idx, name) in columns.names.iter().enumerate() {
        let raw = row.try_get_raw(idx)?;
        if raw.is_null() {
            out.insert(name.as_str(), SqlValue::Null);
            continue;
        }
        let type_name = raw.type_info().name().to_string();
        let value = match type_name.as_str() {
            "BOOL" => SqlValue::Bool(row.try_get_unchecked::<bool, _>(idx)?),
            "INT2" => SqlValue::Int(row.try_get_unchecked::<i16, _>(idx)?.into()),
            "INT4" => SqlValue::Int(row.try_get_unchecked::<i32, _>(idx)?.into()),
            "INT8" => SqlValue::Int(row.try_get_unchecked::<i64, _>(idx)?),
            "FLOAT4" => SqlValue::Float(row.try_get_unchecked::<f32, _>(idx)?.into()),
            "FLOAT8" => SqlValue::Float(row.try_get_unchecked::<f64, _>(idx)?),
            "NUMERIC" => {
                let bytes = row.try_get_unchecked::<Vec<u8>, _>(idx)?;
                match decode_pg_numeric(&bytes) {
                    Some(text) => SqlValue::Text(text),
                    None => SqlValue::from_bytes(&bytes),
                }
            }
            "TEXT" | "VARCHAR" | "CHAR" | "BPCHAR" | "NAME" | "CITEXT" | "UNKNOWN" => {
                SqlValue::Text(row.try_get_unchecked::<String, _>(idx)?)
            }
            "UUID" => SqlValue::Text(row.try_get_unchecked::<Uuid, _>(idx)?.to_string()),
            "JSON" | "JSONB" => SqlValue::Text(
                row.try_get_unchecked::<serde_json::Value, _>(idx)?
                    .to_string(),
            ),
            "TIMESTAMPTZ" => SqlValue::Text(
                row.try_get_unchecked::<DateTime<Utc>, _>(idx)?
                    .to_rfc3339(),
            ),
            "TIMESTAMP" => SqlValue::Text(format_naive(
                row.try_get_unchecked::<NaiveDateTime, _>(idx)?,
            )),
            "DATE" => SqlValue::Text(row.try_get_unchecked::<NaiveDate, _>(idx)?.to_string()),
            "TIME" => SqlValue::Text(row.try_get_unchecked::<NaiveTime, _>(idx)?.to_string()),
            other => {
                let bytes = row.try_get_unchecked::<Vec<u8>, _>(idx)?;
                let rendered = if pgwire::is_array_name(other) {
                    pgwire::render_array(&bytes)
                } else {
                    PgScalar::from_name(other).and_then(|kind| pgwire::render_scalar(kind, &bytes))
                };
                rendered
                    .map(SqlValue::Text)
                    .unwrap_or_else(|| SqlValue::from_bytes(&bytes))
            }
        };
        out.insert(name.as_str(), value);
    }
    Ok(out)
}

pub fn mysql_row(row: &MySqlRow, columns: &ColumnSet) -> Result<Row, sqlx::Error> {
    let mut out = Row::with_capacity(columns.names.len());
    for (idx, name) in columns.names.iter().enumerate() {
        let raw = row.try_get_raw(idx)?;
        if raw.is_null() {
            out.insert(name.as_str(), SqlValue::Null);
            continue;
        }
        let type_name = raw.type_info().name().to_string();
        let value = match type_name.as_str() {
            "BOOLEAN" => SqlValue::Bool(row.try_get_unchecked::<bool, _>(idx)?),
            "TINYINT UNSIGNED" | "SMALLINT UNSIGNED" | "MEDIUMINT UNSIGNED" | "INT UNSIGNED"
            | "BIGINT UNSIGNED" => SqlValue::UInt(row.try_get_unchecked::<u64, _>(idx)?),
            "TINYINT" | "SMALLINT" | "MEDIUMINT" | "INT" | "BIGINT" | "YEAR" => {
                SqlValue::Int(row.try_get_unchecked::<i64, _>(idx)?)
            }
            "FLOAT" => SqlValue::Float(row.try_get_unchecked::<f32, _>(idx)?.into()),
            "DOUBLE" => SqlValue::Float(row.try_get_unchecked::<f64, _>(idx)?),
            "BIT" => SqlValue::UInt(bits_to_u64(&row.try_get_unchecked::<Vec<u8>, _>(idx)?)),
            "DATETIME" => SqlValue::Text(format_naive(
                row.try_get_unchecked::<NaiveDateTime, _>(idx)?,
            )),
            "TIMESTAMP" => SqlValue::Text(
                row.try_get_unchecked::<DateTime<Utc>, _>(idx)?
                    .to_rfc3339(),
            ),
            "DATE" => SqlValue::Text(row.try_get_unchecked::<NaiveDate, _>(idx)?.to_string()),
            "TIME" => SqlValue::Text(row.try_get_unchecked::<NaiveTime, _>(idx)?.to_string()),
            // DECIMAL, JSON, ENUM, SET and the string/blob family arrive as bytes.
            _ => SqlValue::from_bytes(&row.try_get_unchecked::<Vec<u8>, _>(idx)?),
        };
        out.insert(name.as_str(), value);
    }
    Ok(out)
}

fn format_naive(value: NaiveDateTime) -> String {
    value.format("%Y-%m-%dT%H:%M:%S%.f").to_string()
}

/// MySQL BIT(n) values are big-endian byte strings.
fn bits_to_u64(bytes: &[u8]) -> u64 {
    bytes
        .iter()
        .fold(0u64, |acc, byte| (acc << 8) | u64::from(*byte))
}

const NUMERIC_POS: u16 = 0x0000;
const NUMERIC_NEG: u16 = 0x4000;
const NUMERIC_NAN: u16 = 0xC000;
const NUMERIC_PINF: u16 = 0xD000;
const NUMERIC_NINF: u16 = 0xF000;

/// Renders a PostgreSQL NUMERIC in binary wire format as exact decimal text.
///
/// Layout: `ndigits`, `weight`, `sign`, `dscale` (all 16-bit big-endian) followed by
/// `ndigits` base-10000 digits; `weight` is the power of 10000 of the first digit.
pub fn decode_pg_numeric(bytes: &[u8]) -> Option<String> {
    let word = |at: usize| -> Option<[u8; 2]> { Some([*bytes.get(at)?, *bytes.get(at + 1)?]) };

    let ndigits = usize::try_from(i16::from_be_bytes(word(0)?)).ok()?;
    let weight = i32::from(i16::from_be_bytes(word(2)?));
    let sign = u16::from_be_bytes(word(4)?);
    let dscale = usize::from(u16::from_be_bytes(word(6)?));
    if bytes.len() != 8 + 2 * ndigits {
        return None;
    }

    match sign {
        NUMERIC_NAN => return Some("NaN".to_string()),
        NUMERIC_PINF => return Some("Infinity".to_string()),
        NUMERIC_NINF => return Some("-Infinity".to_string()),
        NUMERIC_POS | NUMERIC_NEG => {}
        _ => return None,
    }

    let digit_at = |pos: i32| -> i16 {
        usize::try_from(pos)
            .ok()
            .filter(|p| *p < ndigits)
            .and_then(|p| word(8 + 2 * p))
            .map(i16::from_be_bytes)
            .unwrap_or(0)
    };

    let mut out = String::new();
    if sign == NUMERIC_NEG {
        out.push('-');
    }
    if weight < 0 {
        out.push('0');
    } else {
        for pos in 0..=weight {
            let group = digit_at(pos);
            if pos == 0 {
                let _ = write!(out, "{group}");
            } else {
                let _ = write!(out, "{group:04}");
            }
        }
    }

    if dscale > 0 {
        let mut fraction = String::with_capacity(dscale + 4);
        let mut pos = weight + 1;
        while fraction.len() < dscale {
            let _ = write!(fraction, "{:04}", digit_at(pos));
            pos += 1;
        }
        fraction.truncate(dscale);
        out.push('.');
        out.push_str(&fraction);
    }

    Some(out)
}
