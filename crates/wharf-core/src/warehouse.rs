//! Warehouse identity and destination configuration.
//!
//! A [`Warehouse`] is the immutable identity of one (source, destination)
//! pair; its configuration is versioned through the destination's
//! `revision_id`. Destination configuration arrives as a loosely-typed map
//! from the control plane; [`DestinationConfig`] provides the typed
//! accessors the core relies on.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::id::{DestinationId, SourceId, WorkspaceId};

/// The warehouse destination types Wharf can load into.
///
/// Registration of driver implementations is keyed by the stable string tag
/// returned by [`DestinationType::as_str`]; there is no dynamic loading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DestinationType {
    /// PostgreSQL.
    Postgres,
    /// Microsoft SQL Server.
    Mssql,
    /// Snowflake.
    Snowflake,
    /// Google BigQuery.
    #[serde(rename = "BQ")]
    BigQuery,
    /// Amazon Redshift.
    #[serde(rename = "RS")]
    Redshift,
    /// Databricks Delta Lake.
    #[serde(rename = "DELTALAKE")]
    Databricks,
    /// S3-style datalake (S3, MinIO, GCS, Azure Blob).
    #[serde(rename = "S3_DATALAKE")]
    S3Datalake,
}

impl DestinationType {
    /// Returns the stable tag used for driver registration and persistence.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Postgres => "POSTGRES",
            Self::Mssql => "MSSQL",
            Self::Snowflake => "SNOWFLAKE",
            Self::BigQuery => "BQ",
            Self::Redshift => "RS",
            Self::Databricks => "DELTALAKE",
            Self::S3Datalake => "S3_DATALAKE",
        }
    }

    /// Returns true for destinations that are object stores rather than
    /// SQL warehouses.
    ///
    /// Datalake destinations have no merge step; loads are append-only.
    #[must_use]
    pub const fn is_datalake(&self) -> bool {
        matches!(self, Self::S3Datalake)
    }
}

impl fmt::Display for DestinationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DestinationType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "POSTGRES" => Ok(Self::Postgres),
            "MSSQL" => Ok(Self::Mssql),
            "SNOWFLAKE" => Ok(Self::Snowflake),
            "BQ" => Ok(Self::BigQuery),
            "RS" => Ok(Self::Redshift),
            "DELTALAKE" => Ok(Self::Databricks),
            "S3_DATALAKE" => Ok(Self::S3Datalake),
            other => Err(Error::InvalidInput(format!(
                "unknown destination type: {other}"
            ))),
        }
    }
}

/// An event source, as configured in the control plane.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Source {
    /// Source identifier.
    pub id: SourceId,
    /// Human-readable name.
    pub name: String,
    /// Whether the source is enabled.
    pub enabled: bool,
}

/// A warehouse destination, as configured in the control plane.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Destination {
    /// Destination identifier.
    pub id: DestinationId,
    /// Human-readable name.
    pub name: String,
    /// Destination type tag.
    pub destination_type: DestinationType,
    /// Whether the destination is enabled. Disabling a destination stops its
    /// routers and aborts in-flight uploads at the next phase boundary.
    pub enabled: bool,
    /// Config revision; bumped on every control-plane update.
    pub revision_id: String,
    /// Loosely-typed configuration map.
    pub config: DestinationConfig,
}

/// Destination configuration map with typed accessors.
///
/// All recognized keys are strings unless noted; unknown keys are carried
/// but ignored.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DestinationConfig(BTreeMap<String, Value>);

impl DestinationConfig {
    /// Creates an empty config.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insertion of a string value.
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(key.into(), Value::String(value.into()));
        self
    }

    /// Builder-style insertion of an arbitrary JSON value.
    #[must_use]
    pub fn with_value(mut self, key: impl Into<String>, value: Value) -> Self {
        self.0.insert(key.into(), value);
        self
    }

    /// Returns a string value; empty or missing values yield `None`.
    #[must_use]
    pub fn get_str(&self, key: &str) -> Option<&str> {
        match self.0.get(key) {
            Some(Value::String(s)) if !s.is_empty() => Some(s),
            _ => None,
        }
    }

    /// Returns a boolean value; missing or non-boolean values yield `false`.
    #[must_use]
    pub fn get_bool(&self, key: &str) -> bool {
        matches!(self.0.get(key), Some(Value::Bool(true)))
    }

    /// Returns a nested object value.
    #[must_use]
    pub fn get_map(&self, key: &str) -> Option<&serde_json::Map<String, Value>> {
        match self.0.get(key) {
            Some(Value::Object(map)) => Some(map),
            _ => None,
        }
    }

    /// Warehouse host.
    #[must_use]
    pub fn host(&self) -> Option<&str> {
        self.get_str("host")
    }

    /// Warehouse port.
    #[must_use]
    pub fn port(&self) -> Option<&str> {
        match self.0.get("port") {
            Some(Value::String(s)) if !s.is_empty() => Some(s),
            _ => None,
        }
    }

    /// Warehouse database name.
    #[must_use]
    pub fn database(&self) -> Option<&str> {
        self.get_str("database")
    }

    /// Warehouse user.
    #[must_use]
    pub fn user(&self) -> Option<&str> {
        self.get_str("user")
    }

    /// Warehouse password.
    #[must_use]
    pub fn password(&self) -> Option<&str> {
        self.get_str("password")
    }

    /// SSL mode for SQL connections.
    #[must_use]
    pub fn ssl_mode(&self) -> Option<&str> {
        self.get_str("sslMode")
    }

    /// Target schema name override.
    #[must_use]
    pub fn namespace(&self) -> Option<&str> {
        self.get_str("namespace")
    }

    /// Minutes between scheduled syncs, as configured.
    ///
    /// An empty string is treated as missing, matching the control plane's
    /// behaviour of clearing rather than deleting keys.
    #[must_use]
    pub fn sync_frequency(&self) -> Option<&str> {
        self.get_str("syncFrequency")
    }

    /// First daily sync time, `HH:MM` UTC.
    #[must_use]
    pub fn sync_start_at(&self) -> Option<&str> {
        self.get_str("syncStartAt")
    }

    /// Exclude window bounds `(startTime, endTime)`, `HH:MM` UTC.
    ///
    /// Either bound may be absent; scheduling treats a half-open window as
    /// no window at all.
    #[must_use]
    pub fn exclude_window(&self) -> (Option<String>, Option<String>) {
        let Some(window) = self.get_map("excludeWindow") else {
            return (None, None);
        };
        let bound = |key: &str| match window.get(key) {
            Some(Value::String(s)) if !s.is_empty() => Some(s.clone()),
            _ => None,
        };
        (bound("startTime"), bound("endTime"))
    }

    /// Object-storage provider tag (`S3`, `MINIO`, `GCS`, `AZURE_BLOB`).
    #[must_use]
    pub fn bucket_provider(&self) -> Option<&str> {
        self.get_str("bucketProvider")
    }

    /// Object-storage bucket name.
    #[must_use]
    pub fn bucket_name(&self) -> Option<&str> {
        self.get_str("bucketName")
    }

    /// Object-storage access key id.
    #[must_use]
    pub fn access_key_id(&self) -> Option<&str> {
        self.get_str("accessKeyID")
    }

    /// Object-storage secret access key.
    #[must_use]
    pub fn secret_access_key(&self) -> Option<&str> {
        self.get_str("secretAccessKey")
    }

    /// Object-storage endpoint.
    #[must_use]
    pub fn end_point(&self) -> Option<&str> {
        self.get_str("endPoint")
    }

    /// Object-storage region.
    #[must_use]
    pub fn region(&self) -> Option<&str> {
        self.get_str("region")
    }

    /// Whether to use SSL for object storage.
    #[must_use]
    pub fn use_ssl(&self) -> bool {
        self.get_bool("useSSL")
    }

    /// Whether to force path-style S3 addressing.
    #[must_use]
    pub fn s3_force_path_style(&self) -> bool {
        self.get_bool("s3ForcePathStyle")
    }

    /// Key prefix inside the bucket.
    #[must_use]
    pub fn prefix(&self) -> Option<&str> {
        self.get_str("prefix")
    }

    /// Whether server-side encryption is enabled (datalake variants).
    #[must_use]
    pub fn enable_sse(&self) -> bool {
        self.get_bool("enableSSE")
    }

    /// Whether SSL is disabled (datalake variants).
    #[must_use]
    pub fn disable_ssl(&self) -> bool {
        self.get_bool("disableSSL")
    }

    /// Whether the platform-managed bucket is used instead of the
    /// customer's.
    #[must_use]
    pub fn use_rudder_storage(&self) -> bool {
        self.get_bool("useRudderStorage")
    }
}

/// The immutable identity of one (source, destination) pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Warehouse {
    /// The event source.
    pub source: Source,
    /// The warehouse destination.
    pub destination: Destination,
    /// Workspace owning the pair.
    pub workspace_id: WorkspaceId,
    /// Target schema name (namespace) in the destination.
    pub namespace: String,
}

impl Warehouse {
    /// Returns the canonical identifier
    /// `destinationType:sourceId:destinationId`.
    #[must_use]
    pub fn identifier(&self) -> String {
        format!(
            "{}:{}:{}",
            self.destination.destination_type, self.source.id, self.destination.id
        )
    }

    /// Returns true if both ends of the pair are enabled.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.source.enabled && self.destination.enabled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn test_warehouse() -> Warehouse {
        Warehouse {
            source: Source {
                id: SourceId::new("src-1"),
                name: "app".into(),
                enabled: true,
            },
            destination: Destination {
                id: DestinationId::new("dst-1"),
                name: "analytics-pg".into(),
                destination_type: DestinationType::Postgres,
                enabled: true,
                revision_id: "rev-1".into(),
                config: DestinationConfig::new()
                    .with("host", "localhost")
                    .with("syncFrequency", "30")
                    .with_value(
                        "excludeWindow",
                        json!({"startTime": "22:09", "endTime": "09:07"}),
                    ),
            },
            workspace_id: WorkspaceId::new("ws-1"),
            namespace: "analytics".into(),
        }
    }

    #[test]
    fn identifier_is_type_source_destination() {
        assert_eq!(test_warehouse().identifier(), "POSTGRES:src-1:dst-1");
    }

    #[test]
    fn destination_type_tag_roundtrips() {
        for ty in [
            DestinationType::Postgres,
            DestinationType::Mssql,
            DestinationType::Snowflake,
            DestinationType::BigQuery,
            DestinationType::Redshift,
            DestinationType::Databricks,
            DestinationType::S3Datalake,
        ] {
            let parsed: DestinationType = ty.as_str().parse().unwrap();
            assert_eq!(parsed, ty);
        }
    }

    #[test]
    fn empty_config_strings_read_as_missing() {
        let config = DestinationConfig::new().with("syncFrequency", "");
        assert_eq!(config.sync_frequency(), None);
    }

    #[test]
    fn exclude_window_reads_nested_bounds() {
        let warehouse = test_warehouse();
        let (start, end) = warehouse.destination.config.exclude_window();
        assert_eq!(start.as_deref(), Some("22:09"));
        assert_eq!(end.as_deref(), Some("09:07"));
    }

    #[test]
    fn exclude_window_missing_yields_none() {
        let config = DestinationConfig::new();
        assert_eq!(config.exclude_window(), (None, None));
    }

    #[test]
    fn disabled_destination_disables_warehouse() {
        let mut warehouse = test_warehouse();
        warehouse.destination.enabled = false;
        assert!(!warehouse.is_enabled());
    }
}
