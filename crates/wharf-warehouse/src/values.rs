//! Parsing and coercion of raw column values into logical types.
//!
//! Staging files carry every value as text (or raw JSON); the pipeline
//! converts each to its logical type exactly once per consumer. Conversion
//! failures are [`ErrorKind::DataQuality`] errors and the offending value
//! is routed to the discards table rather than failing the upload.
//!
//! String handling is destination-specific and captured by
//! [`StringPolicy`]: some warehouses cap column width (MSSQL `nvarchar` at
//! 512 characters) and require a wide wire encoding (UTF-16LE) for
//! non-ASCII text.

use chrono::{DateTime, Utc};

use wharf_core::schema::DataType;
use wharf_core::warehouse::DestinationType;

use crate::driver::{DriverError, ErrorKind, Result};

/// Destination-specific string handling.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StringPolicy {
    /// Maximum string length in characters; longer values are truncated.
    pub max_chars: Option<usize>,
    /// Whether non-ASCII strings are re-encoded as UTF-16LE bytes for the
    /// destination's wire format.
    pub wide_encoding: bool,
}

impl StringPolicy {
    /// No truncation, no re-encoding. Suitable for Postgres-style
    /// destinations with unbounded text columns.
    #[must_use]
    pub const fn unbounded() -> Self {
        Self {
            max_chars: None,
            wide_encoding: false,
        }
    }

    /// MSSQL-style policy: `nvarchar(512)` width cap, UTF-16LE wire form
    /// for non-ASCII text.
    #[must_use]
    pub const fn wide(max_chars: usize) -> Self {
        Self {
            max_chars: Some(max_chars),
            wide_encoding: true,
        }
    }

    /// Returns the policy a destination type requires.
    #[must_use]
    pub const fn for_destination(destination_type: DestinationType) -> Self {
        match destination_type {
            DestinationType::Mssql => Self::wide(512),
            _ => Self::unbounded(),
        }
    }
}

/// A parsed column value, ready for the destination's bind layer.
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnValue {
    /// SQL NULL (empty field in a load file).
    Null,
    /// 64-bit signed integer.
    Int(i64),
    /// IEEE-754 double.
    Float(f64),
    /// Boolean.
    Boolean(bool),
    /// UTC timestamp.
    Datetime(DateTime<Utc>),
    /// Plain string (possibly truncated per policy).
    String(String),
    /// UTF-16LE bytes for destinations requiring a wide wire form.
    Wide(Vec<u8>),
    /// Raw JSON text, already validated.
    Json(String),
}

impl ColumnValue {
    /// Renders the value back to its canonical load-file text form.
    #[must_use]
    pub fn to_field(&self) -> String {
        match self {
            Self::Null => String::new(),
            Self::Int(v) => v.to_string(),
            Self::Float(v) => v.to_string(),
            Self::Boolean(v) => v.to_string(),
            Self::Datetime(v) => v.to_rfc3339(),
            Self::String(v) => v.clone(),
            Self::Wide(bytes) => wide_to_string(bytes),
            Self::Json(v) => v.clone(),
        }
    }
}

/// Decodes UTF-16LE bytes back into a string (lossy on malformed input).
#[must_use]
pub fn wide_to_string(bytes: &[u8]) -> String {
    let units: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .collect();
    String::from_utf16_lossy(&units)
}

fn reject(raw: &str, data_type: DataType) -> DriverError {
    DriverError::new(
        ErrorKind::DataQuality,
        format!("cannot convert {raw:?} to {data_type}"),
    )
}

/// Converts one raw text value into its logical type.
///
/// Rules:
/// - `int`: base-10 signed 64-bit; anything containing a decimal point is
///   rejected
/// - `float`: IEEE-754 double
/// - `boolean`: `true`/`false`, case-insensitive
/// - `datetime`: RFC 3339
/// - `string`: passed through, truncated to the policy's width; non-ASCII
///   strings become UTF-16LE bytes under a wide policy
/// - `json`: must parse as JSON; stored as validated text
///
/// An empty raw value is `Null` for every type.
///
/// # Errors
///
/// Returns an [`ErrorKind::DataQuality`] error for values that do not
/// conform; callers route these to the discards table.
pub fn process_column_value(
    raw: &str,
    data_type: DataType,
    policy: &StringPolicy,
) -> Result<ColumnValue> {
    if raw.is_empty() {
        return Ok(ColumnValue::Null);
    }

    match data_type {
        DataType::Int => {
            if raw.contains('.') {
                return Err(reject(raw, data_type));
            }
            raw.parse::<i64>()
                .map(ColumnValue::Int)
                .map_err(|_| reject(raw, data_type))
        }
        DataType::Float => raw
            .parse::<f64>()
            .map(ColumnValue::Float)
            .map_err(|_| reject(raw, data_type)),
        DataType::Boolean => {
            if raw.eq_ignore_ascii_case("true") {
                Ok(ColumnValue::Boolean(true))
            } else if raw.eq_ignore_ascii_case("false") {
                Ok(ColumnValue::Boolean(false))
            } else {
                Err(reject(raw, data_type))
            }
        }
        DataType::Datetime => DateTime::parse_from_rfc3339(raw)
            .map(|dt| ColumnValue::Datetime(dt.with_timezone(&Utc)))
            .map_err(|_| reject(raw, data_type)),
        DataType::String => {
            let truncated = match policy.max_chars {
                Some(max) if raw.chars().count() > max => raw.chars().take(max).collect(),
                _ => raw.to_string(),
            };
            if policy.wide_encoding && !truncated.is_ascii() {
                let bytes = truncated
                    .encode_utf16()
                    .flat_map(u16::to_le_bytes)
                    .collect();
                Ok(ColumnValue::Wide(bytes))
            } else {
                Ok(ColumnValue::String(truncated))
            }
        }
        DataType::Json => {
            serde_json::from_str::<serde_json::Value>(raw).map_err(|_| reject(raw, data_type))?;
            Ok(ColumnValue::Json(raw.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const UNBOUNDED: StringPolicy = StringPolicy::unbounded();
    const MSSQL: StringPolicy = StringPolicy::wide(512);

    #[test]
    fn rejects_decimal_as_int() {
        let err = process_column_value("1.01", DataType::Int, &UNBOUNDED).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DataQuality);
    }

    #[test]
    fn accepts_integer() {
        assert_eq!(
            process_column_value("1", DataType::Int, &UNBOUNDED).unwrap(),
            ColumnValue::Int(1)
        );
    }

    #[test]
    fn rejects_non_numeric_float() {
        assert!(process_column_value("test", DataType::Float, &UNBOUNDED).is_err());
    }

    #[test]
    fn accepts_float() {
        assert_eq!(
            process_column_value("1.01", DataType::Float, &UNBOUNDED).unwrap(),
            ColumnValue::Float(1.01)
        );
    }

    #[test]
    fn boolean_is_case_insensitive() {
        assert_eq!(
            process_column_value("true", DataType::Boolean, &UNBOUNDED).unwrap(),
            ColumnValue::Boolean(true)
        );
        assert_eq!(
            process_column_value("FALSE", DataType::Boolean, &UNBOUNDED).unwrap(),
            ColumnValue::Boolean(false)
        );
        assert!(process_column_value("test", DataType::Boolean, &UNBOUNDED).is_err());
    }

    #[test]
    fn rejects_non_rfc3339_datetime() {
        assert!(process_column_value("1", DataType::Datetime, &UNBOUNDED).is_err());
    }

    #[test]
    fn accepts_rfc3339_datetime() {
        let expected = Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap();
        assert_eq!(
            process_column_value("2020-01-01T00:00:00Z", DataType::Datetime, &UNBOUNDED).unwrap(),
            ColumnValue::Datetime(expected)
        );
    }

    #[test]
    fn string_passes_through() {
        assert_eq!(
            process_column_value("test", DataType::String, &MSSQL).unwrap(),
            ColumnValue::String("test".into())
        );
    }

    #[test]
    fn string_exceeding_max_length_is_truncated() {
        let long = "test".repeat(200);
        let got = process_column_value(&long, DataType::String, &MSSQL).unwrap();
        assert_eq!(got, ColumnValue::String("test".repeat(128)));
    }

    #[test]
    fn string_with_diacritics_is_wide_encoded() {
        let got = process_column_value("tést", DataType::String, &MSSQL).unwrap();
        assert_eq!(
            got,
            ColumnValue::Wide(vec![0x74, 0x0, 0xe9, 0x0, 0x73, 0x0, 0x74, 0x0])
        );
    }

    #[test]
    fn wide_bytes_decode_back() {
        let ColumnValue::Wide(bytes) =
            process_column_value("tést", DataType::String, &MSSQL).unwrap()
        else {
            panic!("expected wide encoding");
        };
        assert_eq!(wide_to_string(&bytes), "tést");
    }

    #[test]
    fn unbounded_policy_never_wide_encodes() {
        assert_eq!(
            process_column_value("tést", DataType::String, &UNBOUNDED).unwrap(),
            ColumnValue::String("tést".into())
        );
    }

    #[test]
    fn json_must_parse() {
        assert!(process_column_value(r#"{"a": 1}"#, DataType::Json, &UNBOUNDED).is_ok());
        assert!(process_column_value("{not json", DataType::Json, &UNBOUNDED).is_err());
    }

    #[test]
    fn empty_value_is_null_for_every_type() {
        for ty in [
            DataType::Int,
            DataType::Float,
            DataType::Boolean,
            DataType::String,
            DataType::Datetime,
            DataType::Json,
        ] {
            assert_eq!(
                process_column_value("", ty, &UNBOUNDED).unwrap(),
                ColumnValue::Null
            );
        }
    }

    #[test]
    fn to_field_roundtrips_canonical_forms() {
        assert_eq!(ColumnValue::Int(42).to_field(), "42");
        assert_eq!(ColumnValue::Boolean(true).to_field(), "true");
        assert_eq!(ColumnValue::Null.to_field(), "");
    }
}
