//! Request decomposition: URL path and query string into a table request.
//!
//! No escaping happens here. Table names, row ids and filter columns are kept
//! verbatim and only turned into SQL text by the query builder.

use percent_encoding::percent_decode_str;
use url::form_urlencoded;

use crate::error::{SqldError, SqldResult};

pub const LIMIT_KEY: &str = "__limit__";
pub const OFFSET_KEY: &str = "__offset__";
pub const ORDER_BY_KEY: &str = "__order_by__";

/// Column the row-id path segment filters on.
pub const ROW_ID_COLUMN: &str = "id";

pub fn is_control_key(key: &str) -> bool {
    matches!(key, LIMIT_KEY | OFFSET_KEY | ORDER_BY_KEY)
}

/// Column equality filters, keyed by column in first-seen order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilterSet {
    entries: Vec<(String, Vec<String>)>,
}

impl FilterSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `value` to the set of accepted values for `column`.
    pub fn push(&mut self, column: impl Into<String>, value: impl Into<String>) {
        let column = column.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(name, _)| *name == column) {
            Some((_, values)) => values.push(value),
            None => self.entries.push((column, vec![value])),
        }
    }

    pub fn get(&self, column: &str) -> Option<&[String]> {
        self.entries
            .iter()
            .find(|(name, _)| name == column)
            .map(|(_, values)| values.as_slice())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.entries
            .iter()
            .map(|(name, values)| (name.as_str(), values.as_slice()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Reserved query parameters shaping the statement instead of filtering it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ControlParams {
    pub limit: Option<u64>,
    pub offset: Option<u64>,
    /// Raw `column [ASC|DESC]` terms in request order.
    pub order_by: Vec<String>,
}

/// A decomposed `/{table}[/{id}]?...` request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableRequest {
    pub table: String,
    pub row_id: Option<String>,
    pub filters: FilterSet,
    pub controls: ControlParams,
}

impl TableRequest {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            row_id: None,
            filters: FilterSet::new(),
            controls: ControlParams::default(),
        }
    }

    pub fn with_row_id(mut self, id: impl Into<String>) -> Self {
        self.row_id = Some(id.into());
        self
    }

    pub fn with_filter(mut self, column: impl Into<String>, value: impl Into<String>) -> Self {
        self.filters.push(column, value);
        self
    }

    pub fn with_limit(mut self, limit: u64) -> Self {
        self.controls.limit = Some(limit);
        self
    }
}

/// Normalizes a configured prefix to start and end with `/`.
pub fn normalize_prefix(raw: &str) -> String {
    let trimmed = raw.trim().trim_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else {
        format!("/{trimmed}/")
    }
}

/// True when `path` addresses the prefix itself (the raw query entry point).
pub fn is_prefix_root(prefix: &str, path: &str) -> bool {
    path == prefix || path == prefix.trim_end_matches('/')
}

/// Splits `path` (prefix included) and `query` into a [`TableRequest`].
pub fn decompose(prefix: &str, path: &str, query: Option<&str>) -> SqldResult<TableRequest> {
    let rest = path
        .strip_prefix(prefix)
        .ok_or_else(|| SqldError::not_found(format!("no route for {path}")))?;

    let mut segments = rest.split('/');
    let table = decode_segment(segments.next().unwrap_or_default())?;
    if table.is_empty() {
        return Err(SqldError::bad_request("missing table name"));
    }
    let row_id = segments
        .next()
        .map(decode_segment)
        .transpose()?
        .filter(|id| !id.is_empty());

    let mut request = TableRequest {
        table,
        row_id,
        filters: FilterSet::new(),
        controls: ControlParams::default(),
    };
    if let Some(query) = query {
        apply_query(&mut request, query);
    }
    Ok(request)
}

fn decode_segment(segment: &str) -> SqldResult<String> {
    percent_decode_str(segment)
        .decode_utf8()
        .map(|s| s.into_owned())
        .map_err(|_| SqldError::bad_request("path is not valid UTF-8"))
}

fn apply_query(request: &mut TableRequest, query: &str) {
    let mut limit_seen = false;
    let mut offset_seen = false;

    for (key, value) in form_urlencoded::parse(query.as_bytes()) {
        match key.as_ref() {
            "" => {}
            LIMIT_KEY => {
                if !limit_seen {
                    limit_seen = true;
                    request.controls.limit = parse_count(&value);
                }
            }
            OFFSET_KEY => {
                if !offset_seen {
                    offset_seen = true;
                    request.controls.offset = parse_count(&value);
                }
            }
            ORDER_BY_KEY => request.controls.order_by.push(value.into_owned()),
            _ => request.filters.push(key.into_owned(), value.into_owned()),
        }
    }
}

/// A non-negative count that fits a signed 64-bit SQL integer; anything else
/// is treated as absent.
fn parse_count(value: &str) -> Option<u64> {
    value
        .trim()
        .parse::<i64>()
        .ok()
        .and_then(|count| u64::try_from(count).ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_normalization() {
        assert_eq!(normalize_prefix("/"), "/");
        assert_eq!(normalize_prefix(""), "/");
        assert_eq!(normalize_prefix("api"), "/api/");
        assert_eq!(normalize_prefix("/api/v1"), "/api/v1/");
    }

    #[test]
    fn table_and_row_id() {
        let req = decompose("/", "/products/42", None).unwrap();
        assert_eq!(req.table, "products");
        assert_eq!(req.row_id.as_deref(), Some("42"));
        assert!(req.filters.is_empty());

        let req = decompose("/api/", "/api/products/", None).unwrap();
        assert_eq!(req.table, "products");
        assert_eq!(req.row_id, None);
    }

    #[test]
    fn empty_table_is_bad_request() {
        let err = decompose("/api/", "/api/", None).unwrap_err();
        assert_eq!(err.status_code(), 400);
    }

    #[test]
    fn paths_outside_prefix_are_not_found() {
        let err = decompose("/api/", "/other/products", None).unwrap_err();
        assert_eq!(err.status_code(), 404);
    }

    #[test]
    fn segments_are_percent_decoded() {
        let req = decompose("/", "/order%20items/a%2Fb", None).unwrap();
        assert_eq!(req.table, "order items");
        assert_eq!(req.row_id.as_deref(), Some("a/b"));
    }

    #[test]
    fn control_keys_never_become_filters() {
        let req = decompose(
            "/",
            "/products",
            Some("category=Test&__limit__=5&__offset__=10&__order_by__=id%20DESC&__order_by__=name&category=Misc"),
        )
        .unwrap();

        assert_eq!(req.controls.limit, Some(5));
        assert_eq!(req.controls.offset, Some(10));
        assert_eq!(req.controls.order_by, vec!["id DESC", "name"]);
        assert_eq!(req.filters.len(), 1);
        assert_eq!(
            req.filters.get("category").unwrap(),
            &["Test".to_string(), "Misc".to_string()]
        );
        for key in [LIMIT_KEY, OFFSET_KEY, ORDER_BY_KEY] {
            assert!(req.filters.get(key).is_none());
        }
    }

    #[test]
    fn unparsable_limits_are_ignored() {
        let req = decompose("/", "/t", Some("__limit__=abc&__offset__=-3")).unwrap();
        assert_eq!(req.controls.limit, None);
        assert_eq!(req.controls.offset, None);
        assert!(req.filters.is_empty());
    }

    #[test]
    fn counts_past_i64_are_ignored() {
        let req = decompose(
            "/",
            "/t",
            Some("__limit__=9223372036854775808&__offset__=18446744073709551615"),
        )
        .unwrap();
        assert_eq!(req.controls.limit, None);
        assert_eq!(req.controls.offset, None);

        let req = decompose("/", "/t", Some("__limit__=9223372036854775807&__offset__=0")).unwrap();
        assert_eq!(req.controls.limit, Some(i64::MAX as u64));
        assert_eq!(req.controls.offset, Some(0));
    }

    #[test]
    fn first_limit_value_wins() {
        let req = decompose("/", "/t", Some("__limit__=x&__limit__=3")).unwrap();
        assert_eq!(req.controls.limit, None);
        let req = decompose("/", "/t", Some("__limit__=2&__limit__=3")).unwrap();
        assert_eq!(req.controls.limit, Some(2));
    }

    #[test]
    fn prefix_root_detection() {
        assert!(is_prefix_root("/", "/"));
        assert!(is_prefix_root("/api/", "/api"));
        assert!(is_prefix_root("/api/", "/api/"));
        assert!(!is_prefix_root("/api/", "/api/t"));
    }
}
