//! Per-backend SQL dialect policy.
//!
//! Everything that differs between MySQL, PostgreSQL and SQLite at the SQL text
//! level lives here: placeholder style, identifier quoting, schema qualification,
//! and the few statement shapes that are not portable. A [`Dialect`] is resolved
//! once from configuration and shared read-only by every request.

use std::{borrow::Cow, fmt, str::FromStr};

use crate::error::ConfigurationError;

/// Schema PostgreSQL resolves unqualified names against.
pub const DEFAULT_PG_SCHEMA: &str = "public";

const RESERVED_WORDS: &[&str] = &[
    "ALL", "AND", "AS", "ASC", "BETWEEN", "BY", "CASE", "CHECK", "COLUMN", "CONSTRAINT",
    "CREATE", "CROSS", "DEFAULT", "DELETE", "DESC", "DISTINCT", "DROP", "ELSE", "END", "EXISTS",
    "FALSE", "FOR", "FOREIGN", "FROM", "FULL", "GROUP", "HAVING", "IN", "INDEX", "INNER",
    "INSERT", "INTO", "IS", "JOIN", "KEY", "LEFT", "LIKE", "LIMIT", "NOT", "NULL", "OFFSET",
    "ON", "OR", "ORDER", "OUTER", "PRIMARY", "REFERENCES", "RIGHT", "SELECT", "SET", "TABLE",
    "THEN", "TO", "TRUE", "UNION", "UNIQUE", "UPDATE", "USER", "USING", "VALUES", "WHEN",
    "WHERE", "WITH",
];

/// Supported database backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DbKind {
    MySql,
    Postgres,
    Sqlite,
}

impl DbKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DbKind::MySql => "mysql",
            DbKind::Postgres => "postgres",
            DbKind::Sqlite => "sqlite3",
        }
    }
}

impl fmt::Display for DbKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DbKind {
    type Err = ConfigurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mysql" => Ok(DbKind::MySql),
            "postgres" | "postgresql" => Ok(DbKind::Postgres),
            "sqlite3" | "sqlite" => Ok(DbKind::Sqlite),
            _ => Err(ConfigurationError::UnsupportedDatabase(s.to_string())),
        }
    }
}

/// How bound parameters are spelled in SQL text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaceholderStyle {
    /// `?`
    Question,
    /// `$1`, `$2`, ...
    Dollar,
}

/// Whether the driver reports the identity generated by an INSERT.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentityStrategy {
    LastInsertId,
    Unavailable,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dialect {
    kind: DbKind,
    schema: Option<String>,
}

impl Dialect {
    /// Builds the policy for `kind`. The schema only matters for PostgreSQL and is
    /// dropped when empty or equal to the default schema.
    pub fn new(kind: DbKind, schema: Option<&str>) -> Self {
        let schema = match kind {
            DbKind::Postgres => schema
                .map(str::trim)
                .filter(|s| !s.is_empty() && *s != DEFAULT_PG_SCHEMA)
                .map(str::to_string),
            DbKind::MySql | DbKind::Sqlite => None,
        };
        Self { kind, schema }
    }

    pub fn from_config(db_type: &str, schema: Option<&str>) -> Result<Self, ConfigurationError> {
        Ok(Self::new(db_type.parse()?, schema))
    }

    pub fn kind(&self) -> DbKind {
        self.kind
    }

    pub fn schema(&self) -> Option<&str> {
        self.schema.as_deref()
    }

    pub fn placeholder_style(&self) -> PlaceholderStyle {
        match self.kind {
            DbKind::Postgres => PlaceholderStyle::Dollar,
            DbKind::MySql | DbKind::Sqlite => PlaceholderStyle::Question,
        }
    }

    /// Placeholder for the 1-based parameter `position`.
    pub fn placeholder(&self, position: usize) -> String {
        match self.placeholder_style() {
            PlaceholderStyle::Question => "?".to_string(),
            PlaceholderStyle::Dollar => format!("${position}"),
        }
    }

    pub fn quote_char(&self) -> char {
        match self.kind {
            DbKind::MySql => '`',
            DbKind::Postgres | DbKind::Sqlite => '"',
        }
    }

    /// Unconditionally quotes `name`, doubling any embedded quote character.
    pub fn quote_identifier(&self, name: &str) -> String {
        let quote = self.quote_char();
        let mut out = String::with_capacity(name.len() + 2);
        out.push(quote);
        for ch in name.chars() {
            if ch == quote {
                out.push(quote);
            }
            out.push(ch);
        }
        out.push(quote);
        out
    }

    /// Quotes `name` only when it would not survive as a bare identifier.
    pub fn quote_if_needed<'a>(&self, name: &'a str) -> Cow<'a, str> {
        if self.is_plain_identifier(name) {
            Cow::Borrowed(name)
        } else {
            Cow::Owned(self.quote_identifier(name))
        }
    }

    fn is_plain_identifier(&self, name: &str) -> bool {
        let mut chars = name.chars();
        let Some(first) = chars.next() else {
            return false;
        };
        let case_ok = |c: char| match self.kind {
            // PostgreSQL folds bare identifiers to lowercase.
            DbKind::Postgres => !c.is_ascii_uppercase(),
            DbKind::MySql | DbKind::Sqlite => true,
        };
        let starts_ok = (first.is_ascii_alphabetic() || first == '_') && case_ok(first);
        starts_ok
            && chars.all(|c| (c.is_ascii_alphanumeric() || c == '_') && case_ok(c))
            && !RESERVED_WORDS.contains(&name.to_ascii_uppercase().as_str())
    }

    /// Table reference as it appears after `FROM`/`INTO`/`UPDATE`.
    pub fn table_name(&self, table: &str) -> String {
        match &self.schema {
            Some(schema) => format!(
                "{}.{}",
                self.quote_if_needed(schema),
                self.quote_if_needed(table)
            ),
            None => self.quote_if_needed(table).into_owned(),
        }
    }

    /// Cast target for a text argument whose placeholder the server inferred
    /// as `type_name`.
    ///
    /// Query-string values are always sent as text, and PostgreSQL will not
    /// compare a text parameter with a column of another type. Casting the
    /// parameter (not the column) keeps numeric, temporal and uuid comparisons
    /// typed and leaves indexes usable. `None` means no cast is needed.
    pub fn parameter_cast(&self, type_name: &str) -> Option<String> {
        if self.kind != DbKind::Postgres {
            return None;
        }
        if let Some(element) = type_name.strip_suffix("[]") {
            return Some(format!("{}[]", self.pg_type_spelling(element)));
        }
        match type_name.to_ascii_uppercase().as_str() {
            "TEXT" | "VARCHAR" | "UNKNOWN" | "VOID" => None,
            _ => Some(self.pg_type_spelling(type_name)),
        }
    }

    fn pg_type_spelling(&self, type_name: &str) -> String {
        match type_name {
            "CHAR" => "BPCHAR".to_string(),
            "\"CHAR\"" => "\"char\"".to_string(),
            builtin
                if !builtin.is_empty()
                    && builtin
                        .chars()
                        .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_') =>
            {
                builtin.to_string()
            }
            custom => self.quote_identifier(custom),
        }
    }

    /// `UPDATE ... LIMIT n` / `DELETE ... LIMIT n`.
    pub fn supports_write_limit(&self) -> bool {
        matches!(self.kind, DbKind::MySql)
    }

    pub fn identity(&self) -> IdentityStrategy {
        match self.kind {
            DbKind::MySql | DbKind::Sqlite => IdentityStrategy::LastInsertId,
            DbKind::Postgres => IdentityStrategy::Unavailable,
        }
    }

    /// LIMIT value standing for "no limit" where OFFSET cannot appear alone.
    pub fn unbounded_limit(&self) -> Option<&'static str> {
        match self.kind {
            DbKind::Postgres => None,
            DbKind::Sqlite => Some("-1"),
            DbKind::MySql => Some("18446744073709551615"),
        }
    }
}
