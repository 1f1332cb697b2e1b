//! The per-destination discards sink.
//!
//! Rows that fail column-value validation, and values of columns the
//! warehouse schema does not carry, land in a `rudder_discards` table in
//! the destination namespace instead of failing the upload. The table is
//! append-only and shares the regular load path.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use wharf_core::schema::{DataType, TableSchema};

use crate::values::ColumnValue;

/// Name of the discards table in every destination namespace.
pub const DISCARDS_TABLE: &str = "rudder_discards";

/// Schema of the discards table.
///
/// Column order (sorted, as everywhere): `column_name`, `column_value`,
/// `received_at`, `row_id`, `table_name`, `uuid_ts`.
#[must_use]
pub fn discards_schema() -> TableSchema {
    TableSchema::new()
        .with_column("column_name", DataType::String)
        .with_column("column_value", DataType::String)
        .with_column("received_at", DataType::Datetime)
        .with_column("row_id", DataType::String)
        .with_column("table_name", DataType::String)
        .with_column("uuid_ts", DataType::Datetime)
}

/// One discarded column value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscardRow {
    /// Table the value was destined for.
    pub table_name: String,
    /// The row's `id`, when the event carried one.
    pub row_id: String,
    /// The offending column.
    pub column_name: String,
    /// The raw value, as received.
    pub column_value: String,
    /// The event's `received_at`, when parseable.
    pub received_at: DateTime<Utc>,
    /// Ingestion timestamp of the discard row itself.
    pub uuid_ts: DateTime<Utc>,
}

impl DiscardRow {
    /// Creates a discard row stamped at `now`.
    #[must_use]
    pub fn new(
        table_name: impl Into<String>,
        row_id: impl Into<String>,
        column_name: impl Into<String>,
        column_value: impl Into<String>,
        received_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Self {
        let row_id = {
            let id: String = row_id.into();
            if id.is_empty() {
                Uuid::new_v4().to_string()
            } else {
                id
            }
        };
        Self {
            table_name: table_name.into(),
            row_id,
            column_name: column_name.into(),
            column_value: column_value.into(),
            received_at: received_at.unwrap_or(now),
            uuid_ts: now,
        }
    }

    /// Returns the row's values aligned with [`discards_schema`] column
    /// order.
    #[must_use]
    pub fn values(&self) -> Vec<ColumnValue> {
        vec![
            ColumnValue::String(self.column_name.clone()),
            ColumnValue::String(self.column_value.clone()),
            ColumnValue::Datetime(self.received_at),
            ColumnValue::String(self.row_id.clone()),
            ColumnValue::String(self.table_name.clone()),
            ColumnValue::Datetime(self.uuid_ts),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_columns_are_the_contract_set() {
        assert_eq!(
            discards_schema().columns(),
            vec![
                "column_name",
                "column_value",
                "received_at",
                "row_id",
                "table_name",
                "uuid_ts"
            ]
        );
    }

    #[test]
    fn values_align_with_schema_order() {
        let now = Utc::now();
        let row = DiscardRow::new("tracks", "row-1", "test_int", "1.01", None, now);
        let values = row.values();
        assert_eq!(values.len(), discards_schema().len());
        assert_eq!(values[0], ColumnValue::String("test_int".into()));
        assert_eq!(values[4], ColumnValue::String("tracks".into()));
    }

    #[test]
    fn missing_row_id_gets_generated() {
        let now = Utc::now();
        let row = DiscardRow::new("tracks", "", "c", "v", None, now);
        assert!(!row.row_id.is_empty());
    }

    #[test]
    fn missing_received_at_falls_back_to_now() {
        let now = Utc::now();
        let row = DiscardRow::new("tracks", "r", "c", "v", None, now);
        assert_eq!(row.received_at, now);
    }
}
