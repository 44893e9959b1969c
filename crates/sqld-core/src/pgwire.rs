//! Text rendering of PostgreSQL binary wire values.
//!
//! sqlx always requests binary results. The materializer decodes the common
//! types through sqlx itself; this module covers the rest (OIDs, intervals,
//! network addresses, money, `"char"`, `timetz` and arrays of any of these) and
//! renders them the way PostgreSQL's own text output does.

use std::{
    fmt::Write as _,
    net::{Ipv4Addr, Ipv6Addr},
};

use chrono::{DateTime, Duration, NaiveDate, NaiveTime, Timelike};
use uuid::Uuid;

use crate::materialize::decode_pg_numeric;

/// Wire level shape of a scalar type, keyed by OID or type name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PgScalar {
    Bool,
    Bytea,
    Char,
    Int2,
    Int4,
    Int8,
    Oid,
    Float4,
    Float8,
    Numeric,
    Money,
    Text,
    Json,
    Jsonb,
    Uuid,
    Date,
    Time,
    TimeTz,
    Timestamp,
    TimestampTz,
    Interval,
    Inet,
    Cidr,
}

impl PgScalar {
    pub fn from_oid(oid: u32) -> Option<Self> {
        Some(match oid {
            16 => PgScalar::Bool,
            17 => PgScalar::Bytea,
            18 => PgScalar::Char,
            19 | 25 | 1042 | 1043 => PgScalar::Text,
            20 => PgScalar::Int8,
            21 => PgScalar::Int2,
            23 => PgScalar::Int4,
            24 | 26 | 28 | 29 | 2202 | 2205 | 2206 => PgScalar::Oid,
            114 => PgScalar::Json,
            650 => PgScalar::Cidr,
            700 => PgScalar::Float4,
            701 => PgScalar::Float8,
            790 => PgScalar::Money,
            869 => PgScalar::Inet,
            1082 => PgScalar::Date,
            1083 => PgScalar::Time,
            1114 => PgScalar::Timestamp,
            1184 => PgScalar::TimestampTz,
            1186 => PgScalar::Interval,
            1266 => PgScalar::TimeTz,
            1700 => PgScalar::Numeric,
            2950 => PgScalar::Uuid,
            3802 => PgScalar::Jsonb,
            _ => return None,
        })
    }

    /// Resolves the type names sqlx reports for types it has no decoder for here.
    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name.to_ascii_uppercase().as_str() {
            "\"CHAR\"" => PgScalar::Char,
            "OID" | "XID" | "CID" | "REGPROC" | "REGCLASS" | "REGTYPE" | "REGNAMESPACE" => {
                PgScalar::Oid
            }
            "MONEY" => PgScalar::Money,
            "INTERVAL" => PgScalar::Interval,
            "TIMETZ" => PgScalar::TimeTz,
            "INET" => PgScalar::Inet,
            "CIDR" => PgScalar::Cidr,
            _ => return None,
        })
    }
}

/// Array type names as sqlx reports them, e.g. `INT4[]` or `_int4`.
pub fn is_array_name(name: &str) -> bool {
    name.ends_with("[]") || name.starts_with('_')
}

/// Renders one scalar. `None` when the bytes do not have the expected shape.
pub fn render_scalar(kind: PgScalar, bytes: &[u8]) -> Option<String> {
    let text = match kind {
        PgScalar::Bool => match bytes {
            [0] => "f".to_string(),
            [_] => "t".to_string(),
            _ => return None,
        },
        PgScalar::Bytea => {
            let mut out = String::with_capacity(2 + bytes.len() * 2);
            out.push_str("\\x");
            for byte in bytes {
                let _ = write!(out, "{byte:02x}");
            }
            out
        }
        PgScalar::Char => match bytes {
            [] => String::new(),
            [byte] => String::from_utf8_lossy(&[*byte]).into_owned(),
            _ => return None,
        },
        PgScalar::Int2 => i16::from_be_bytes(fixed(bytes)?).to_string(),
        PgScalar::Int4 => i32::from_be_bytes(fixed(bytes)?).to_string(),
        PgScalar::Int8 => i64::from_be_bytes(fixed(bytes)?).to_string(),
        PgScalar::Oid => u32::from_be_bytes(fixed(bytes)?).to_string(),
        PgScalar::Float4 => float_text(f64::from(f32::from_be_bytes(fixed(bytes)?))),
        PgScalar::Float8 => float_text(f64::from_be_bytes(fixed(bytes)?)),
        PgScalar::Numeric => decode_pg_numeric(bytes)?,
        PgScalar::Money => money_text(i64::from_be_bytes(fixed(bytes)?)),
        PgScalar::Text | PgScalar::Json => String::from_utf8_lossy(bytes).into_owned(),
        PgScalar::Jsonb => match bytes.split_first() {
            Some((&1, document)) => String::from_utf8_lossy(document).into_owned(),
            _ => return None,
        },
        PgScalar::Uuid => Uuid::from_slice(bytes).ok()?.to_string(),
        PgScalar::Date => date_text(i32::from_be_bytes(fixed(bytes)?))?,
        PgScalar::Time => time_text(i64::from_be_bytes(fixed(bytes)?))?,
        PgScalar::TimeTz => {
            let (micros, zone) = split(bytes, 8)?;
            let mut out = time_text(i64::from_be_bytes(fixed(micros)?))?;
            // Stored as seconds west of UTC.
            out.push_str(&utc_offset_text(-i32::from_be_bytes(fixed(zone)?)));
            out
        }
        PgScalar::Timestamp => {
            let micros = i64::from_be_bytes(fixed(bytes)?);
            match infinity_text(micros) {
                Some(text) => text.to_string(),
                None => timestamp(micros)?
                    .naive_utc()
                    .format("%Y-%m-%dT%H:%M:%S%.f")
                    .to_string(),
            }
        }
        PgScalar::TimestampTz => {
            let micros = i64::from_be_bytes(fixed(bytes)?);
            match infinity_text(micros) {
                Some(text) => text.to_string(),
                None => timestamp(micros)?.to_rfc3339(),
            }
        }
        PgScalar::Interval => {
            let (micros, rest) = split(bytes, 8)?;
            let (days, months) = split(rest, 4)?;
            interval_text(
                i32::from_be_bytes(fixed(months)?),
                i32::from_be_bytes(fixed(days)?),
                i64::from_be_bytes(fixed(micros)?),
            )
        }
        PgScalar::Inet => inet_text(bytes, false)?,
        PgScalar::Cidr => inet_text(bytes, true)?,
    };
    Some(text)
}

/// PostgreSQL's `MAXDIM`.
const MAX_ARRAY_DIMS: usize = 6;

/// Renders a binary array value in PostgreSQL's `{a,b,NULL}` text form.
/// Elements of types without a renderer come out as lossy UTF-8.
pub fn render_array(bytes: &[u8]) -> Option<String> {
    let mut reader = Reader { bytes, at: 0 };
    let ndim = usize::try_from(reader.i32()?)
        .ok()
        .filter(|ndim| *ndim <= MAX_ARRAY_DIMS)?;
    let _has_nulls = reader.i32()?;
    let element = PgScalar::from_oid(reader.u32()?);

    let mut dims = Vec::with_capacity(ndim);
    for _ in 0..ndim {
        let len = usize::try_from(reader.i32()?).ok()?;
        let lower = reader.i32()?;
        dims.push((len, lower));
    }

    let mut out = String::new();
    if dims.iter().any(|(_, lower)| *lower != 1) {
        for (len, lower) in &dims {
            let upper = i64::from(*lower) + i64::try_from(*len).ok()? - 1;
            let _ = write!(out, "[{lower}:{upper}]");
        }
        out.push('=');
    }
    if dims.is_empty() {
        out.push_str("{}");
    } else {
        write_dimension(&mut out, &mut reader, &dims, element)?;
    }
    (reader.at == bytes.len()).then_some(out)
}

fn write_dimension(
    out: &mut String,
    reader: &mut Reader<'_>,
    dims: &[(usize, i32)],
    element: Option<PgScalar>,
) -> Option<()> {
    let ((len, _), inner) = dims.split_first()?;
    out.push('{');
    for idx in 0..*len {
        if idx > 0 {
            out.push(',');
        }
        if inner.is_empty() {
            match reader.element()? {
                None => out.push_str("NULL"),
                Some(raw) => {
                    let text = match element {
                        Some(kind) => render_scalar(kind, raw)?,
                        None => String::from_utf8_lossy(raw).into_owned(),
                    };
                    push_array_item(out, &text);
                }
            }
        } else {
            write_dimension(out, reader, inner, element)?;
        }
    }
    out.push('}');
    Some(())
}

fn push_array_item(out: &mut String, text: &str) {
    let needs_quotes = text.is_empty()
        || text.eq_ignore_ascii_case("NULL")
        || text
            .chars()
            .any(|c| matches!(c, '{' | '}' | ',' | '"' | '\\') || c.is_whitespace());
    if !needs_quotes {
        out.push_str(text);
        return;
    }
    out.push('"');
    for c in text.chars() {
        if c == '"' || c == '\\' {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('"');
}

struct Reader<'a> {
    bytes: &'a [u8],
    at: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, len: usize) -> Option<&'a [u8]> {
        let end = self.at.checked_add(len)?;
        let slice = self.bytes.get(self.at..end)?;
        self.at = end;
        Some(slice)
    }

    fn i32(&mut self) -> Option<i32> {
        Some(i32::from_be_bytes(fixed(self.take(4)?)?))
    }

    fn u32(&mut self) -> Option<u32> {
        Some(u32::from_be_bytes(fixed(self.take(4)?)?))
    }

    /// Length-prefixed element; `Some(None)` is SQL NULL.
    fn element(&mut self) -> Option<Option<&'a [u8]>> {
        let len = self.i32()?;
        if len < 0 {
            return Some(None);
        }
        self.take(usize::try_from(len).ok()?).map(Some)
    }
}

fn fixed<const N: usize>(bytes: &[u8]) -> Option<[u8; N]> {
    bytes.try_into().ok()
}

fn split(bytes: &[u8], at: usize) -> Option<(&[u8], &[u8])> {
    (at <= bytes.len()).then(|| bytes.split_at(at))
}

fn float_text(value: f64) -> String {
    if value.is_nan() {
        "NaN".to_string()
    } else if value.is_infinite() {
        let text = if value > 0.0 { "Infinity" } else { "-Infinity" };
        text.to_string()
    } else {
        value.to_string()
    }
}

fn money_text(cents: i64) -> String {
    let sign = if cents < 0 { "-" } else { "" };
    let abs = cents.unsigned_abs();
    format!("{sign}{}.{:02}", abs / 100, abs % 100)
}

fn pg_epoch() -> Option<NaiveDate> {
    NaiveDate::from_ymd_opt(2000, 1, 1)
}

fn date_text(days: i32) -> Option<String> {
    match days {
        i32::MAX => Some("infinity".to_string()),
        i32::MIN => Some("-infinity".to_string()),
        _ => Some(
            pg_epoch()?
                .checked_add_signed(Duration::days(i64::from(days)))?
                .to_string(),
        ),
    }
}

fn time_text(micros: i64) -> Option<String> {
    let secs = u32::try_from(micros.div_euclid(1_000_000)).ok()?;
    let nanos = u32::try_from(micros.rem_euclid(1_000_000) * 1_000).ok()?;
    // 24:00:00 is a valid PostgreSQL time but not a chrono one.
    if secs == 86_400 && nanos == 0 {
        return Some("24:00:00".to_string());
    }
    let time = NaiveTime::from_num_seconds_from_midnight_opt(secs, nanos)?;
    let mut out = time.format("%H:%M:%S").to_string();
    if time.nanosecond() > 0 {
        let _ = write!(out, ".{:06}", time.nanosecond() / 1_000);
        trim_fraction(&mut out);
    }
    Some(out)
}

fn infinity_text(micros: i64) -> Option<&'static str> {
    match micros {
        i64::MAX => Some("infinity"),
        i64::MIN => Some("-infinity"),
        _ => None,
    }
}

fn timestamp(micros: i64) -> Option<DateTime<chrono::Utc>> {
    let epoch = pg_epoch()?.and_hms_opt(0, 0, 0)?.and_utc();
    epoch.checked_add_signed(Duration::microseconds(micros))
}

fn utc_offset_text(east_seconds: i32) -> String {
    let sign = if east_seconds < 0 { '-' } else { '+' };
    let abs = east_seconds.unsigned_abs();
    let (hours, minutes, seconds) = (abs / 3600, (abs % 3600) / 60, abs % 60);
    let mut out = format!("{sign}{hours:02}");
    if minutes > 0 || seconds > 0 {
        let _ = write!(out, ":{minutes:02}");
    }
    if seconds > 0 {
        let _ = write!(out, ":{seconds:02}");
    }
    out
}

/// `postgres` interval style, e.g. `1 year 2 mons 3 days 04:05:06.5`.
fn interval_text(months: i32, days: i32, micros: i64) -> String {
    let mut parts: Vec<String> = Vec::new();
    let mut unit = |value: i64, singular: &str, plural: &str| {
        if value != 0 {
            let name = if value == 1 { singular } else { plural };
            parts.push(format!("{value} {name}"));
        }
    };
    unit(i64::from(months / 12), "year", "years");
    unit(i64::from(months % 12), "mon", "mons");
    unit(i64::from(days), "day", "days");

    if micros != 0 || parts.is_empty() {
        let sign = if micros < 0 { "-" } else { "" };
        let abs = micros.unsigned_abs();
        let total_secs = abs / 1_000_000;
        let fraction = abs % 1_000_000;
        let mut clock = format!(
            "{sign}{:02}:{:02}:{:02}",
            total_secs / 3600,
            (total_secs % 3600) / 60,
            total_secs % 60
        );
        if fraction > 0 {
            let _ = write!(clock, ".{fraction:06}");
            trim_fraction(&mut clock);
        }
        parts.push(clock);
    }
    parts.join(" ")
}

fn trim_fraction(text: &mut String) {
    while text.ends_with('0') {
        text.pop();
    }
    if text.ends_with('.') {
        text.pop();
    }
}

const PGSQL_AF_INET: u8 = 2;
const PGSQL_AF_INET6: u8 = 3;

/// `family, bits, is_cidr, length, address...`
fn inet_text(bytes: &[u8], cidr: bool) -> Option<String> {
    let (header, address) = split(bytes, 4)?;
    let [family, bits, _is_cidr, len] = fixed::<4>(header)?;
    if usize::from(len) != address.len() {
        return None;
    }
    let (text, full) = match family {
        PGSQL_AF_INET => (Ipv4Addr::from(fixed::<4>(address)?).to_string(), 32),
        PGSQL_AF_INET6 => (Ipv6Addr::from(fixed::<16>(address)?).to_string(), 128),
        _ => return None,
    };
    if cidr || bits != full {
        Some(format!("{text}/{bits}"))
    } else {
        Some(text)
    }
}
