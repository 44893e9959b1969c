//! Response shaping: JSON or delimited text, chosen by the `Accept` header.
//!
//! JSON successes are wrapped as `{"data": ...}` and failures as
//! `{"error": ...}`. Delimited bodies carry no envelope.

use serde::Serialize;

use crate::{
    error::SqldError,
    value::{ExecResult, Row, SqlValue},
};

pub const JSON_CONTENT_TYPE: &str = "application/json";
pub const CSV_CONTENT_TYPE: &str = "text/csv";
pub const TSV_CONTENT_TYPE: &str = "text/tab-separated-values";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseFormat {
    Json,
    /// Field delimiter byte, `,` or `\t`.
    Delimited(u8),
}

impl ResponseFormat {
    /// `text/csv` selects commas, `text/tsv` (or the registered TSV type) tabs;
    /// everything else, including a missing header, is JSON.
    pub fn from_accept(accept: Option<&str>) -> Self {
        let Some(accept) = accept else {
            return ResponseFormat::Json;
        };
        for range in accept.split(',') {
            let media = range.split(';').next().unwrap_or_default().trim();
            if media.eq_ignore_ascii_case("text/csv") {
                return ResponseFormat::Delimited(b',');
            }
            if media.eq_ignore_ascii_case("text/tsv")
                || media.eq_ignore_ascii_case(TSV_CONTENT_TYPE)
            {
                return ResponseFormat::Delimited(b'\t');
            }
        }
        ResponseFormat::Json
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            ResponseFormat::Json => JSON_CONTENT_TYPE,
            ResponseFormat::Delimited(b'\t') => TSV_CONTENT_TYPE,
            ResponseFormat::Delimited(_) => CSV_CONTENT_TYPE,
        }
    }
}

/// Successful result of any request.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Payload {
    /// Read result; serialized as a JSON array, empty when there are no rows.
    Rows(Vec<Row>),
    Exec(ExecResult),
    /// Inserted payload echoed back with its generated id.
    Created(Row),
}

#[derive(Debug, Serialize)]
struct DataBody<'a> {
    data: &'a Payload,
}

#[derive(Debug, Serialize)]
struct ErrorBody<'a> {
    error: &'a str,
}

/// A fully rendered HTTP response body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rendered {
    pub status: u16,
    pub content_type: &'static str,
    pub body: Vec<u8>,
}

/// Renders a success with `status`, or the error with its own status.
pub fn render(format: ResponseFormat, status: u16, outcome: &Result<Payload, SqldError>) -> Rendered {
    match outcome {
        Ok(payload) => render_payload(format, status, payload),
        Err(err) => render_error(format, err),
    }
}

pub fn render_payload(format: ResponseFormat, status: u16, payload: &Payload) -> Rendered {
    let body = match format {
        ResponseFormat::Json => {
            serde_json::to_vec(&DataBody { data: payload }).map_err(SqldError::from)
        }
        ResponseFormat::Delimited(delimiter) => delimited(payload, delimiter),
    };
    match body {
        Ok(body) => Rendered {
            status,
            content_type: format.content_type(),
            body,
        },
        Err(err) => render_error(format, &SqldError::internal(err.message())),
    }
}

pub fn render_error(format: ResponseFormat, err: &SqldError) -> Rendered {
    let body = match format {
        ResponseFormat::Json => serde_json::to_vec(&ErrorBody {
            error: err.message(),
        })
        .unwrap_or_else(|_| br#"{"error":"internal error"}"#.to_vec()),
        ResponseFormat::Delimited(delimiter) => {
            write_records(delimiter, [["error"], [err.message()]])
                .unwrap_or_else(|_| b"error\ninternal error\n".to_vec())
        }
    };
    Rendered {
        status: err.status_code(),
        content_type: format.content_type(),
        body,
    }
}

/// Header line from the first row's columns, then one line per row. An empty row
/// set renders as an empty body.
pub fn delimited(payload: &Payload, delimiter: u8) -> Result<Vec<u8>, SqldError> {
    match payload {
        Payload::Rows(rows) => delimited_rows(rows, delimiter),
        Payload::Created(row) => delimited_rows(std::slice::from_ref(row), delimiter),
        Payload::Exec(result) => write_records(
            delimiter,
            [["rows_affected".to_string()], [result.rows_affected.to_string()]],
        ),
    }
}

fn delimited_rows(rows: &[Row], delimiter: u8) -> Result<Vec<u8>, SqldError> {
    let Some(first) = rows.first() else {
        return Ok(Vec::new());
    };
    let headers: Vec<&str> = first.columns().collect();

    let mut writer = delimited_writer(delimiter);
    writer.write_record(&headers)?;
    for row in rows {
        writer.write_record(
            headers
                .iter()
                .map(|name| row.get(name).unwrap_or(&SqlValue::Null).to_string()),
        )?;
    }
    finish(writer)
}

fn write_records<R, F>(delimiter: u8, records: impl IntoIterator<Item = R>) -> Result<Vec<u8>, SqldError>
where
    R: IntoIterator<Item = F>,
    F: AsRef<[u8]>,
{
    let mut writer = delimited_writer(delimiter);
    for record in records {
        writer.write_record(record)?;
    }
    finish(writer)
}

/// Fields are quoted only when they hold the delimiter, a quote or a line break.
fn delimited_writer(delimiter: u8) -> csv::Writer<Vec<u8>> {
    csv::WriterBuilder::new()
        .delimiter(delimiter)
        .quote_style(csv::QuoteStyle::Necessary)
        .terminator(csv::Terminator::Any(b'\n'))
        .from_writer(Vec::new())
}

fn finish(writer: csv::Writer<Vec<u8>>) -> Result<Vec<u8>, SqldError> {
    writer
        .into_inner()
        .map_err(|err| SqldError::internal(err.into_error().to_string()))
}
