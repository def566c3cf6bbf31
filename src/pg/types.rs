//! PostgreSQL type handling.
//!
//! Parameters are always bound in text format: every [`Param`] knows how to
//! render itself as the text PostgreSQL accepts for its type. Result columns
//! arrive in text format as well and are turned into [`serde_json::Value`]s by
//! a per-column [`ColumnDecoder`].
//!
//! Reference: https://www.postgresql.org/docs/current/protocol-overview.html#PROTOCOL-FORMAT-CODES

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, Utc};
use serde_json::Value;

// ============================================================================
// Type OIDs
// ============================================================================

/// PostgreSQL type object identifiers (OIDs).
///
/// These are the built-in type OIDs from PostgreSQL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Oid(pub i32);

impl Oid {
    // Boolean types
    pub const BOOL: Oid = Oid(16);

    // Binary data
    pub const BYTEA: Oid = Oid(17);

    // Character types
    pub const CHAR: Oid = Oid(18);
    pub const NAME: Oid = Oid(19);

    // Integer types
    pub const INT8: Oid = Oid(20);
    pub const INT2: Oid = Oid(21);
    pub const INT4: Oid = Oid(23);

    // Text types
    pub const TEXT: Oid = Oid(25);

    // OID type
    pub const OID_TYPE: Oid = Oid(26);

    // Floating point types
    pub const FLOAT4: Oid = Oid(700);
    pub const FLOAT8: Oid = Oid(701);

    // String types
    pub const VARCHAR: Oid = Oid(1043);
    pub const BPCHAR: Oid = Oid(1042);

    // Date/time types
    pub const DATE: Oid = Oid(1082);
    pub const TIMESTAMP: Oid = Oid(1114);
    pub const TIMESTAMPTZ: Oid = Oid(1184);

    // UUID
    pub const UUID: Oid = Oid(2950);

    // JSON types
    pub const JSON: Oid = Oid(114);
    pub const JSONB: Oid = Oid(3802);

    // Numeric
    pub const NUMERIC: Oid = Oid(1700);

    /// Unspecified: let the server infer the parameter type.
    pub const UNSPECIFIED: Oid = Oid(0);

    /// Create from raw i32 value
    #[inline]
    pub fn from_i32(oid: i32) -> Self {
        Oid(oid)
    }

    /// Get the raw i32 value
    #[inline]
    pub fn as_i32(self) -> i32 {
        self.0
    }

    /// Check if this is a text-like type
    pub fn is_text_like(self) -> bool {
        matches!(
            self,
            Oid::TEXT | Oid::VARCHAR | Oid::BPCHAR | Oid::CHAR | Oid::NAME
        )
    }

    /// Check if this is an integer type
    pub fn is_integer(self) -> bool {
        matches!(self, Oid::INT2 | Oid::INT4 | Oid::INT8 | Oid::OID_TYPE)
    }

    /// Check if this is a floating point type
    pub fn is_float(self) -> bool {
        matches!(self, Oid::FLOAT4 | Oid::FLOAT8)
    }
}

// ============================================================================
// Parameters
// ============================================================================

/// A query parameter.
#[derive(Debug, Clone, PartialEq)]
pub enum Param {
    Null,
    Bool(bool),
    Int(i64),
    BigInt(i128),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
    Json(Value),
    Uuid(uuid::Uuid),
    Date(NaiveDate),
    Timestamp(NaiveDateTime),
    TimestampTz(DateTime<Utc>),
}

impl Param {
    /// Check if this value is NULL
    #[inline]
    pub fn is_null(&self) -> bool {
        matches!(self, Param::Null)
    }

    /// Text representation sent in a Bind message; `None` is SQL NULL.
    pub fn to_text(&self) -> Option<String> {
        Some(match self {
            Param::Null => return None,
            Param::Bool(v) => (if *v { "t" } else { "f" }).to_string(),
            Param::Int(v) => v.to_string(),
            Param::BigInt(v) => v.to_string(),
            Param::Float(v) => format_float(*v),
            Param::Text(v) => v.clone(),
            Param::Bytes(v) => format!("\\x{}", hex::encode(v)),
            Param::Json(v) => v.to_string(),
            Param::Uuid(v) => v.hyphenated().to_string(),
            Param::Date(v) => v.format("%Y-%m-%d").to_string(),
            Param::Timestamp(v) => v.format("%Y-%m-%dT%H:%M:%S%.f").to_string(),
            Param::TimestampTz(v) => v.to_rfc3339_opts(SecondsFormat::AutoSi, true),
        })
    }
}

/// PostgreSQL spells the non-finite floats differently from Rust.
fn format_float(v: f64) -> String {
    if v.is_nan() {
        "NaN".to_string()
    } else if v.is_infinite() {
        (if v > 0.0 { "Infinity" } else { "-Infinity" }).to_string()
    } else {
        v.to_string()
    }
}

macro_rules! param_from {
    ($($t:ty => $variant:ident $(as $cast:ty)?),* $(,)?) => {
        $(
            impl From<$t> for Param {
                fn from(v: $t) -> Self {
                    Param::$variant(v $(as $cast)?)
                }
            }
        )*
    };
}

param_from! {
    bool => Bool,
    i16 => Int as i64,
    i32 => Int as i64,
    i64 => Int,
    u32 => Int as i64,
    i128 => BigInt,
    u64 => BigInt as i128,
    f32 => Float as f64,
    f64 => Float,
    String => Text,
    Vec<u8> => Bytes,
    Value => Json,
    uuid::Uuid => Uuid,
    NaiveDate => Date,
    NaiveDateTime => Timestamp,
    DateTime<Utc> => TimestampTz,
}

impl From<&str> for Param {
    fn from(v: &str) -> Self {
        Param::Text(v.to_string())
    }
}

impl From<&[u8]> for Param {
    fn from(v: &[u8]) -> Self {
        Param::Bytes(v.to_vec())
    }
}

impl<T: Into<Param>> From<Option<T>> for Param {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Param::Null)
    }
}

// ============================================================================
// Column decoders
// ============================================================================

/// A user supplied decoder for one column's text value.
pub type DecodeFn = Arc<dyn Fn(&[u8]) -> Value + Send + Sync>;

/// How the values of one result column are decoded.
#[derive(Clone)]
pub enum ColumnDecoder {
    /// Override supplied with the query for this column name.
    Custom(DecodeFn),
    /// Default decoder for the column's type OID.
    Builtin(fn(&[u8]) -> Value),
    /// Plain UTF-8 text.
    Text,
}

impl ColumnDecoder {
    /// Default decoder for a type OID.
    pub fn for_oid(oid: Oid) -> Self {
        match oid {
            Oid::BOOL => ColumnDecoder::Builtin(decode_bool),
            Oid::INT2 | Oid::INT4 | Oid::INT8 | Oid::OID_TYPE => {
                ColumnDecoder::Builtin(decode_int)
            }
            Oid::FLOAT4 | Oid::FLOAT8 => ColumnDecoder::Builtin(decode_float),
            Oid::JSON | Oid::JSONB => ColumnDecoder::Builtin(decode_json),
            _ => ColumnDecoder::Text,
        }
    }

    /// Decode one non-null, non-empty value.
    pub fn decode(&self, data: &[u8]) -> Value {
        match self {
            ColumnDecoder::Custom(f) => f(data),
            ColumnDecoder::Builtin(f) => f(data),
            ColumnDecoder::Text => decode_text(data),
        }
    }
}

impl fmt::Debug for ColumnDecoder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ColumnDecoder::Custom(_) => f.write_str("Custom"),
            ColumnDecoder::Builtin(_) => f.write_str("Builtin"),
            ColumnDecoder::Text => f.write_str("Text"),
        }
    }
}

fn decode_text(data: &[u8]) -> Value {
    Value::String(String::from_utf8_lossy(data).into_owned())
}

fn decode_bool(data: &[u8]) -> Value {
    Value::Bool(matches!(data, b"t" | b"true" | b"1"))
}

fn decode_int(data: &[u8]) -> Value {
    std::str::from_utf8(data)
        .ok()
        .and_then(|s| s.parse::<i64>().ok())
        .map(Value::from)
        .unwrap_or_else(|| decode_text(data))
}

/// Non-finite floats have no JSON number form and stay text.
fn decode_float(data: &[u8]) -> Value {
    std::str::from_utf8(data)
        .ok()
        .and_then(|s| s.parse::<f64>().ok())
        .and_then(serde_json::Number::from_f64)
        .map(Value::Number)
        .unwrap_or_else(|| decode_text(data))
}

fn decode_json(data: &[u8]) -> Value {
    serde_json::from_slice(data).unwrap_or_else(|_| decode_text(data))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_oid_classification() {
        assert!(Oid::TEXT.is_text_like());
        assert!(Oid::VARCHAR.is_text_like());
        assert!(!Oid::INT4.is_text_like());

        assert!(Oid::INT4.is_integer());
        assert!(Oid::INT8.is_integer());
        assert!(!Oid::FLOAT8.is_integer());

        assert!(Oid::FLOAT4.is_float());
        assert!(!Oid::INT4.is_float());
    }

    #[test]
    fn test_param_text_coercion() {
        assert_eq!(Param::Null.to_text(), None);
        assert_eq!(Param::from(true).to_text().as_deref(), Some("t"));
        assert_eq!(Param::from(42i32).to_text().as_deref(), Some("42"));
        assert_eq!(
            Param::from(170141183460469231731687303715884105727i128)
                .to_text()
                .as_deref(),
            Some("170141183460469231731687303715884105727")
        );
        assert_eq!(Param::from(f64::NAN).to_text().as_deref(), Some("NaN"));
        assert_eq!(
            Param::from(vec![0xde, 0xad]).to_text().as_deref(),
            Some("\\xdead")
        );
        assert_eq!(
            Param::from(json!({"a": [1, 2]})).to_text().as_deref(),
            Some(r#"{"a":[1,2]}"#)
        );
        assert_eq!(Param::from(None::<i32>), Param::Null);
    }

    #[test]
    fn test_date_coercion_is_iso() {
        let date = NaiveDate::from_ymd_opt(2024, 2, 29).unwrap();
        assert_eq!(Param::from(date).to_text().as_deref(), Some("2024-02-29"));

        let ts = date.and_hms_opt(12, 30, 5).unwrap().and_utc();
        assert_eq!(
            Param::from(ts).to_text().as_deref(),
            Some("2024-02-29T12:30:05Z")
        );
    }

    #[test]
    fn test_builtin_decoders() {
        assert_eq!(ColumnDecoder::for_oid(Oid::BOOL).decode(b"t"), json!(true));
        assert_eq!(ColumnDecoder::for_oid(Oid::INT8).decode(b"-17"), json!(-17));
        assert_eq!(ColumnDecoder::for_oid(Oid::FLOAT8).decode(b"1.5"), json!(1.5));
        assert_eq!(
            ColumnDecoder::for_oid(Oid::FLOAT8).decode(b"Infinity"),
            json!("Infinity")
        );
        assert_eq!(
            ColumnDecoder::for_oid(Oid::JSONB).decode(br#"{"k":1}"#),
            json!({"k": 1})
        );
        assert_eq!(
            ColumnDecoder::for_oid(Oid::NUMERIC).decode(b"1.10"),
            json!("1.10")
        );
    }
}
