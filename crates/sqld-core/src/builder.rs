//! Parameterized statement construction.
//!
//! Identifiers go through the [`Dialect`]; every user supplied value is bound.
//! The only user text written verbatim is the `__order_by__` term list.

use std::{fmt::Write as _, ops::Range};

use serde_json::{Map, Value};

use crate::{
    dialect::Dialect,
    error::{SqldError, SqldResult},
    request::{TableRequest, ROW_ID_COLUMN},
    value::SqlArg,
};

/// SQL text plus its positional arguments.
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub sql: String,
    pub args: Vec<SqlArg>,
    /// Byte range of each argument's placeholder in `sql`, in argument order.
    placeholders: Vec<Range<usize>>,
}

impl Statement {
    /// A statement without arguments, e.g. a raw query.
    pub fn raw(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            args: Vec::new(),
            placeholders: Vec::new(),
        }
    }

    pub fn placeholders(&self) -> &[Range<usize>] {
        &self.placeholders
    }

    /// The SQL with each placeholder that has a cast target wrapped in
    /// `CAST(<placeholder> AS <type>)`. `casts` is indexed like `args`.
    pub fn sql_with_casts(&self, casts: &[Option<String>]) -> String {
        let mut out = String::with_capacity(self.sql.len() + 16 * casts.len());
        let mut copied = 0;
        for (span, cast) in self.placeholders.iter().zip(casts) {
            let Some(target) = cast else {
                continue;
            };
            out.push_str(&self.sql[copied..span.start]);
            let _ = write!(out, "CAST({} AS {target})", &self.sql[span.clone()]);
            copied = span.end;
        }
        out.push_str(&self.sql[copied..]);
        out
    }
}

#[derive(Debug, Clone, Copy)]
pub struct QueryBuilder<'a> {
    dialect: &'a Dialect,
}

impl<'a> QueryBuilder<'a> {
    pub fn new(dialect: &'a Dialect) -> Self {
        Self { dialect }
    }

    pub fn select(&self, request: &TableRequest) -> SqldResult<Statement> {
        let mut writer = SqlWriter::new(self.dialect);
        writer.push("SELECT * FROM ");
        writer.push_table(&request.table)?;
        writer.push_where(request)?;

        let terms: Vec<&str> = request
            .controls
            .order_by
            .iter()
            .map(|term| term.trim())
            .filter(|term| !term.is_empty())
            .collect();
        if !terms.is_empty() {
            writer.push(" ORDER BY ");
            writer.push(&terms.join(", "));
        }

        match (request.controls.limit, request.controls.offset) {
            (Some(limit), _) => writer.push(&format!(" LIMIT {limit}")),
            (None, Some(_)) => {
                if let Some(unbounded) = self.dialect.unbounded_limit() {
                    writer.push(&format!(" LIMIT {unbounded}"));
                }
            }
            (None, None) => {}
        }
        if let Some(offset) = request.controls.offset {
            writer.push(&format!(" OFFSET {offset}"));
        }

        Ok(writer.finish())
    }

    pub fn insert(&self, table: &str, payload: &Map<String, Value>) -> SqldResult<Statement> {
        if payload.is_empty() {
            return Err(SqldError::bad_request("insert payload has no columns"));
        }

        let mut writer = SqlWriter::new(self.dialect);
        writer.push("INSERT INTO ");
        writer.push_table(table)?;
        writer.push(" (");
        for (idx, column) in payload.keys().enumerate() {
            if idx > 0 {
                writer.push(", ");
            }
            writer.push_column(column)?;
        }
        writer.push(") VALUES (");
        for (idx, value) in payload.values().enumerate() {
            if idx > 0 {
                writer.push(", ");
            }
            writer.push_value(value);
        }
        writer.push(")");
        Ok(writer.finish())
    }

    pub fn update(
        &self,
        request: &TableRequest,
        payload: &Map<String, Value>,
    ) -> SqldResult<Statement> {
        if payload.is_empty() {
            return Err(SqldError::bad_request("update payload has no columns"));
        }

        let mut writer = SqlWriter::new(self.dialect);
        writer.push("UPDATE ");
        writer.push_table(&request.table)?;
        writer.push(" SET ");
        for (idx, (column, value)) in payload.iter().enumerate() {
            if idx > 0 {
                writer.push(", ");
            }
            writer.push_column(column)?;
            writer.push(" = ");
            writer.push_value(value);
        }
        writer.push_where(request)?;
        self.push_write_limit(&mut writer, request);
        Ok(writer.finish())
    }

    pub fn delete(&self, request: &TableRequest) -> SqldResult<Statement> {
        let mut writer = SqlWriter::new(self.dialect);
        writer.push("DELETE FROM ");
        writer.push_table(&request.table)?;
        writer.push_where(request)?;
        self.push_write_limit(&mut writer, request);
        Ok(writer.finish())
    }

    fn push_write_limit(&self, writer: &mut SqlWriter<'_>, request: &TableRequest) {
        let Some(limit) = request.controls.limit else {
            return;
        };
        if self.dialect.supports_write_limit() {
            writer.push(&format!(" LIMIT {limit}"));
        } else {
            tracing::debug!(
                dialect = %self.dialect.kind(),
                limit,
                "ignoring __limit__ on write statement"
            );
        }
    }
}

struct SqlWriter<'a> {
    dialect: &'a Dialect,
    sql: String,
    args: Vec<SqlArg>,
    placeholders: Vec<Range<usize>>,
}

impl<'a> SqlWriter<'a> {
    fn new(dialect: &'a Dialect) -> Self {
        Self {
            dialect,
            sql: String::with_capacity(64),
            args: Vec::new(),
            placeholders: Vec::new(),
        }
    }

    fn push(&mut self, text: &str) {
        self.sql.push_str(text);
    }

    fn push_table(&mut self, table: &str) -> SqldResult<()> {
        check_identifier(table)?;
        let name = self.dialect.table_name(table);
        self.push(&name);
        Ok(())
    }

    fn push_column(&mut self, column: &str) -> SqldResult<()> {
        check_identifier(column)?;
        let name = self.dialect.quote_identifier(column);
        self.push(&name);
        Ok(())
    }

    fn bind(&mut self, arg: SqlArg) {
        self.args.push(arg);
        let placeholder = self.dialect.placeholder(self.args.len());
        let start = self.sql.len();
        self.push(&placeholder);
        self.placeholders.push(start..self.sql.len());
    }

    fn push_value(&mut self, value: &Value) {
        match SqlArg::from_json(value) {
            Some(arg) => self.bind(arg),
            None => self.push("NULL"),
        }
    }

    fn push_predicate(&mut self, column: &str, values: &[String]) -> SqldResult<()> {
        check_identifier(column)?;
        let lhs = self.dialect.quote_identifier(column);
        self.push(&lhs);
        match values {
            [single] => {
                self.push(" = ");
                self.bind(SqlArg::Text(single.clone()));
            }
            many => {
                self.push(" IN (");
                for (idx, value) in many.iter().enumerate() {
                    if idx > 0 {
                        self.push(", ");
                    }
                    self.bind(SqlArg::Text(value.clone()));
                }
                self.push(")");
            }
        }
        Ok(())
    }

    /// Row id first, then filters in request order, all ANDed.
    fn push_where(&mut self, request: &TableRequest) -> SqldResult<()> {
        let mut first = true;
        let mut next_clause = |writer: &mut Self| {
            writer.push(if first { " WHERE " } else { " AND " });
            first = false;
        };

        if let Some(id) = &request.row_id {
            next_clause(self);
            self.push_predicate(ROW_ID_COLUMN, std::slice::from_ref(id))?;
        }
        for (column, values) in request.filters.iter() {
            if values.is_empty() {
                continue;
            }
            next_clause(self);
            self.push_predicate(column, values)?;
        }
        Ok(())
    }

    fn finish(self) -> Statement {
        Statement {
            sql: self.sql,
            args: self.args,
            placeholders: self.placeholders,
        }
    }
}

fn check_identifier(name: &str) -> SqldResult<()> {
    if name.is_empty() {
        return Err(SqldError::bad_request("empty identifier"));
    }
    if name.contains('\0') {
        return Err(SqldError::bad_request(format!(
            "invalid identifier {:?}",
            name.replace('\0', "\\0")
        )));
    }
    Ok(())
}
