//! Raw SQL entry point: body extraction and lexical read/write classification.
//!
//! Classification looks at the leading keyword only. The statement is not parsed;
//! anything malformed is left for the database to reject.

use serde::Deserialize;

use crate::error::{SqldError, SqldResult};

const READ_KEYWORDS: &[&str] = &["SELECT", "SHOW", "DESCRIBE", "EXPLAIN", "DESC", "PRAGMA"];
const WRITE_KEYWORDS: &[&str] = &["INSERT", "UPDATE", "DELETE", "CREATE", "DROP", "ALTER"];

/// Form field / file name carrying the statement in multipart bodies.
pub const SQL_FIELD: &str = "sql";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryKind {
    /// Produces rows.
    Read,
    /// Produces an affected-row count.
    Write,
}

/// JSON body shape: `{"sql": "..."}`.
#[derive(Debug, Clone, Deserialize)]
pub struct RawQuery {
    #[serde(default)]
    pub sql: String,
}

/// Classifies by the uppercased leading keyword. `None` for anything unrecognized.
pub fn detect_kind(sql: &str) -> Option<QueryKind> {
    let first = sql.split_whitespace().next()?;
    let keyword: String = first
        .chars()
        .take_while(|c| c.is_ascii_alphabetic())
        .collect::<String>()
        .to_ascii_uppercase();

    if READ_KEYWORDS.contains(&keyword.as_str()) {
        Some(QueryKind::Read)
    } else if WRITE_KEYWORDS.contains(&keyword.as_str()) {
        Some(QueryKind::Write)
    } else {
        None
    }
}

/// Trims and classifies a statement, rejecting empty and unknown queries.
pub fn prepare(sql: &str) -> SqldResult<(&str, QueryKind)> {
    let trimmed = sql.trim();
    if trimmed.is_empty() {
        return Err(SqldError::bad_request("empty query"));
    }
    match detect_kind(trimmed) {
        Some(kind) => Ok((trimmed, kind)),
        None => Err(SqldError::bad_request("unknown query type")),
    }
}

/// Extracts the statement from a non-multipart body. `text/plain` is taken
/// verbatim; every other content type is read as `{"sql": "..."}`.
pub fn sql_from_body(content_type: Option<&str>, body: &[u8]) -> SqldResult<String> {
    if is_media_type(content_type, "text/plain") {
        return String::from_utf8(body.to_vec())
            .map_err(|_| SqldError::bad_request("query body is not valid UTF-8"));
    }
    if body.iter().all(u8::is_ascii_whitespace) {
        return Err(SqldError::bad_request("empty query"));
    }
    let query: RawQuery = serde_json::from_slice(body)?;
    Ok(query.sql)
}

/// Compares the media type of a `Content-Type` value, ignoring parameters and case.
pub fn is_media_type(content_type: Option<&str>, expected: &str) -> bool {
    content_type
        .and_then(|value| value.split(';').next())
        .map(|media| media.trim().eq_ignore_ascii_case(expected))
        .unwrap_or(false)
}
