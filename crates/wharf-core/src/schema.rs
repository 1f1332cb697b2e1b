//! The logical schema model and its reconciliation rules.
//!
//! Warehouse schemas are maps of `table -> (column -> DataType)` over a
//! closed set of logical types. Reconciliation between an upload's schema
//! and the remote warehouse schema is an **additive merge**: new tables and
//! new columns are introduced, while an existing column must keep its
//! logical type or the merge fails for that column with a schema conflict.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// The logical data types Wharf understands.
///
/// Every destination maps these onto its own physical types; the core never
/// sees physical types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    /// 64-bit signed integer.
    Int,
    /// IEEE-754 double.
    Float,
    /// Boolean.
    Boolean,
    /// Unicode string.
    String,
    /// RFC 3339 timestamp, stored in UTC.
    Datetime,
    /// Arbitrary JSON document.
    Json,
}

impl DataType {
    /// Returns the stable lowercase tag used in persisted schemas and logs.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Int => "int",
            Self::Float => "float",
            Self::Boolean => "boolean",
            Self::String => "string",
            Self::Datetime => "datetime",
            Self::Json => "json",
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DataType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "int" => Ok(Self::Int),
            "float" => Ok(Self::Float),
            "boolean" => Ok(Self::Boolean),
            "string" => Ok(Self::String),
            "datetime" => Ok(Self::Datetime),
            "json" => Ok(Self::Json),
            other => Err(Error::InvalidInput(format!("unknown data type: {other}"))),
        }
    }
}

/// Column layout of a single table.
///
/// Columns are kept in a `BTreeMap` so iteration order (and therefore load
/// file column order) is deterministic.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TableSchema(BTreeMap<String, DataType>);

impl TableSchema {
    /// Creates an empty table schema.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a column, replacing any previous type.
    pub fn insert(&mut self, column: impl Into<String>, data_type: DataType) {
        self.0.insert(column.into(), data_type);
    }

    /// Builder-style column insertion.
    #[must_use]
    pub fn with_column(mut self, column: impl Into<String>, data_type: DataType) -> Self {
        self.insert(column, data_type);
        self
    }

    /// Returns the type of a column, if present.
    #[must_use]
    pub fn get(&self, column: &str) -> Option<DataType> {
        self.0.get(column).copied()
    }

    /// Returns true if the table has no columns.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns the number of columns.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Iterates columns in deterministic (sorted) order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, DataType)> {
        self.0.iter().map(|(name, ty)| (name.as_str(), *ty))
    }

    /// Returns the column names in deterministic (sorted) order.
    #[must_use]
    pub fn columns(&self) -> Vec<&str> {
        self.0.keys().map(String::as_str).collect()
    }

    /// Merges columns from `other` into this table.
    ///
    /// Returns the names of columns that were newly added.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SchemaConflict`] if an existing column has a
    /// different logical type in `other`. `table` is used only for the error
    /// message.
    pub fn merge_from(&mut self, table: &str, other: &Self) -> Result<Vec<String>> {
        let mut added = Vec::new();
        for (column, incoming) in &other.0 {
            match self.0.get(column) {
                None => {
                    self.0.insert(column.clone(), *incoming);
                    added.push(column.clone());
                }
                Some(existing) if existing != incoming => {
                    return Err(Error::SchemaConflict {
                        table: table.to_string(),
                        column: column.clone(),
                        existing: *existing,
                        incoming: *incoming,
                    });
                }
                Some(_) => {}
            }
        }
        Ok(added)
    }
}

impl FromIterator<(String, DataType)> for TableSchema {
    fn from_iter<T: IntoIterator<Item = (String, DataType)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// A column whose logical type differs between two schemas.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnConflict {
    /// Table containing the conflict.
    pub table: String,
    /// The conflicting column.
    pub column: String,
    /// Type on the remote (warehouse) side.
    pub existing: DataType,
    /// Type on the upload side.
    pub incoming: DataType,
}

/// The additive difference between an upload schema and a remote schema.
///
/// Produced by [`Schema::diff`]; consumed by the schema-reconciliation
/// phase, which creates `new_tables`, alters tables listed in
/// `new_columns`, and fails the tables listed in `conflicts`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchemaDiff {
    /// Tables present in the upload but absent from the warehouse.
    pub new_tables: Vec<(String, TableSchema)>,
    /// Columns to add to existing tables, keyed by table.
    pub new_columns: Vec<(String, TableSchema)>,
    /// Columns whose types disagree; the affected table aborts, the rest
    /// proceed.
    pub conflicts: Vec<ColumnConflict>,
}

impl SchemaDiff {
    /// Returns true if the warehouse already covers the upload schema.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.new_tables.is_empty() && self.new_columns.is_empty() && self.conflicts.is_empty()
    }

    /// Returns the set of tables that have at least one conflict.
    #[must_use]
    pub fn conflicting_tables(&self) -> Vec<&str> {
        let mut tables: Vec<&str> = self.conflicts.iter().map(|c| c.table.as_str()).collect();
        tables.dedup();
        tables
    }
}

/// A full warehouse schema: `table -> TableSchema`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Schema(BTreeMap<String, TableSchema>);

impl Schema {
    /// Creates an empty schema.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces a table.
    pub fn insert(&mut self, table: impl Into<String>, schema: TableSchema) {
        self.0.insert(table.into(), schema);
    }

    /// Builder-style table insertion.
    #[must_use]
    pub fn with_table(mut self, table: impl Into<String>, schema: TableSchema) -> Self {
        self.insert(table, schema);
        self
    }

    /// Returns the schema of a table, if present.
    #[must_use]
    pub fn table(&self, name: &str) -> Option<&TableSchema> {
        self.0.get(name)
    }

    /// Returns true if the schema has no tables.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns the number of tables.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Iterates tables in deterministic (sorted) order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &TableSchema)> {
        self.0.iter().map(|(name, schema)| (name.as_str(), schema))
    }

    /// Returns the table names in deterministic (sorted) order.
    #[must_use]
    pub fn tables(&self) -> Vec<&str> {
        self.0.keys().map(String::as_str).collect()
    }

    /// Merges `other` into this schema additively.
    ///
    /// Used by the scheduler to union the schema snapshots of the staging
    /// files claimed into one upload.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SchemaConflict`] on the first column whose type
    /// disagrees.
    pub fn merge_from(&mut self, other: &Self) -> Result<()> {
        for (table, incoming) in &other.0 {
            match self.0.get_mut(table) {
                Some(existing) => {
                    existing.merge_from(table, incoming)?;
                }
                None => {
                    self.0.insert(table.clone(), incoming.clone());
                }
            }
        }
        Ok(())
    }

    /// Computes the additive difference of `self` (the upload schema)
    /// against `remote` (the warehouse schema).
    ///
    /// Conflicts are collected, not raised: the reconciliation phase fails
    /// individual tables while the rest of the upload proceeds.
    #[must_use]
    pub fn diff(&self, remote: &Self) -> SchemaDiff {
        let mut diff = SchemaDiff::default();

        for (table, upload_schema) in &self.0 {
            let Some(remote_schema) = remote.0.get(table) else {
                diff.new_tables.push((table.clone(), upload_schema.clone()));
                continue;
            };

            let mut added = TableSchema::new();
            for (column, incoming) in upload_schema.iter() {
                match remote_schema.get(column) {
                    None => added.insert(column, incoming),
                    Some(existing) if existing != incoming => {
                        diff.conflicts.push(ColumnConflict {
                            table: table.clone(),
                            column: column.to_string(),
                            existing,
                            incoming,
                        });
                    }
                    Some(_) => {}
                }
            }
            if !added.is_empty() {
                diff.new_columns.push((table.clone(), added));
            }
        }

        diff
    }
}

impl FromIterator<(String, TableSchema)> for Schema {
    fn from_iter<T: IntoIterator<Item = (String, TableSchema)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracks_schema() -> TableSchema {
        TableSchema::new()
            .with_column("id", DataType::String)
            .with_column("received_at", DataType::Datetime)
            .with_column("revenue", DataType::Float)
    }

    #[test]
    fn data_type_roundtrips_through_tag() {
        for ty in [
            DataType::Int,
            DataType::Float,
            DataType::Boolean,
            DataType::String,
            DataType::Datetime,
            DataType::Json,
        ] {
            let parsed: DataType = ty.as_str().parse().unwrap();
            assert_eq!(parsed, ty);
        }
        assert!("decimal".parse::<DataType>().is_err());
    }

    #[test]
    fn table_schema_iterates_in_sorted_order() {
        let schema = tracks_schema();
        assert_eq!(schema.columns(), vec!["id", "received_at", "revenue"]);
    }

    #[test]
    fn merge_adds_new_columns() {
        let mut schema = tracks_schema();
        let incoming = TableSchema::new().with_column("context_ip", DataType::String);

        let added = schema.merge_from("tracks", &incoming).unwrap();
        assert_eq!(added, vec!["context_ip".to_string()]);
        assert_eq!(schema.get("context_ip"), Some(DataType::String));
    }

    #[test]
    fn merge_rejects_type_change() {
        let mut schema = tracks_schema();
        let incoming = TableSchema::new().with_column("revenue", DataType::String);

        let err = schema.merge_from("tracks", &incoming).unwrap_err();
        assert!(matches!(err, Error::SchemaConflict { .. }));
        // The original type survives a failed merge.
        assert_eq!(schema.get("revenue"), Some(DataType::Float));
    }

    #[test]
    fn schema_merge_unions_tables() {
        let mut schema = Schema::new().with_table("tracks", tracks_schema());
        let other = Schema::new()
            .with_table("pages", TableSchema::new().with_column("id", DataType::String));

        schema.merge_from(&other).unwrap();
        assert_eq!(schema.tables(), vec!["pages", "tracks"]);
    }

    #[test]
    fn diff_reports_new_tables_and_columns() {
        let upload = Schema::new()
            .with_table("tracks", tracks_schema())
            .with_table("pages", TableSchema::new().with_column("id", DataType::String));
        let remote = Schema::new().with_table(
            "tracks",
            TableSchema::new()
                .with_column("id", DataType::String)
                .with_column("received_at", DataType::Datetime),
        );

        let diff = upload.diff(&remote);
        assert_eq!(diff.new_tables.len(), 1);
        assert_eq!(diff.new_tables[0].0, "pages");
        assert_eq!(diff.new_columns.len(), 1);
        assert_eq!(diff.new_columns[0].0, "tracks");
        assert_eq!(diff.new_columns[0].1.columns(), vec!["revenue"]);
        assert!(diff.conflicts.is_empty());
    }

    #[test]
    fn diff_collects_conflicts_without_failing() {
        let upload = Schema::new().with_table(
            "tracks",
            TableSchema::new().with_column("revenue", DataType::String),
        );
        let remote = Schema::new().with_table(
            "tracks",
            TableSchema::new().with_column("revenue", DataType::Float),
        );

        let diff = upload.diff(&remote);
        assert_eq!(diff.conflicts.len(), 1);
        assert_eq!(diff.conflicts[0].column, "revenue");
        assert_eq!(diff.conflicting_tables(), vec!["tracks"]);
        assert!(diff.new_tables.is_empty());
    }

    #[test]
    fn diff_of_identical_schemas_is_empty() {
        let schema = Schema::new().with_table("tracks", tracks_schema());
        assert!(schema.diff(&schema).is_empty());
    }
}
