//! Object-storage abstraction for staging files, load files and
//! coordination objects.
//!
//! Wharf reads staged event batches from object storage, writes per-table
//! load files back into it, and uses conditional writes for the advisory
//! lock. The contract is intentionally small:
//!
//! - Conditional writes with preconditions (the CAS primitive the lock
//!   builds on)
//! - Object metadata including `last_modified` and an opaque version token
//! - Presigned URL generation for drivers that load directly from URLs
//!
//! ## Multi-Cloud Compatibility
//!
//! The version token is an opaque `String` so backends keep their native
//! semantics: S3/MinIO use `ETag` or version ids, GCS its numeric
//! generation, Azure its `ETag`. Nothing above this trait may interpret the
//! token.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};

use crate::error::{Error, Result};

/// Precondition for conditional writes (CAS operations).
#[derive(Debug, Clone)]
pub enum WritePrecondition {
    /// Write only if the object does not exist.
    DoesNotExist,
    /// Write only if the object's version matches the given token.
    MatchesVersion(String),
    /// Write unconditionally.
    None,
}

/// Result of a conditional write.
#[derive(Debug, Clone)]
pub enum WriteResult {
    /// Write succeeded, returns the new version token.
    Success {
        /// The version token after the write.
        version: String,
    },
    /// Precondition failed, returns the current version token.
    ///
    /// A failed precondition is a normal result, never an error.
    PreconditionFailed {
        /// The version that caused the precondition to fail.
        current_version: String,
    },
}

impl WriteResult {
    /// Returns true if the write was applied.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }
}

/// Metadata about a stored object.
#[derive(Debug, Clone)]
pub struct ObjectMeta {
    /// Object key.
    pub key: String,
    /// Object size in bytes.
    pub size: u64,
    /// Opaque version token for CAS operations.
    pub version: String,
    /// Last modification timestamp.
    pub last_modified: Option<DateTime<Utc>>,
}

/// Object-storage contract implemented by every backend (S3, MinIO, GCS,
/// Azure Blob, memory).
#[async_trait]
pub trait ObjectStore: Send + Sync + 'static {
    /// Reads an entire object.
    ///
    /// Returns [`Error::NotFound`] if the object doesn't exist.
    async fn get(&self, key: &str) -> Result<Bytes>;

    /// Writes with an optional precondition.
    ///
    /// Returns [`WriteResult::PreconditionFailed`] when the precondition is
    /// not met; that is a normal result, not an error.
    async fn put(
        &self,
        key: &str,
        data: Bytes,
        precondition: WritePrecondition,
    ) -> Result<WriteResult>;

    /// Deletes an object. Idempotent: succeeds if the object is absent.
    async fn delete(&self, key: &str) -> Result<()>;

    /// Lists objects under the given prefix.
    ///
    /// **Ordering**: arbitrary and backend-dependent. Callers needing
    /// determinism must sort (the load pipeline sorts by key).
    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>>;

    /// Gets object metadata without reading content.
    ///
    /// Returns `None` if the object doesn't exist.
    async fn head(&self, key: &str) -> Result<Option<ObjectMeta>>;

    /// Generates a presigned URL for direct access.
    async fn signed_url(&self, key: &str, expiry: Duration) -> Result<String>;
}

/// In-memory object store for testing.
///
/// Thread-safe via `RwLock`; not suitable for production. Uses numeric
/// versions internally (exposed as strings) to simulate generation-style
/// CAS.
#[derive(Debug, Default)]
pub struct MemoryObjectStore {
    objects: Arc<RwLock<HashMap<String, StoredObject>>>,
}

#[derive(Debug, Clone)]
struct StoredObject {
    data: Bytes,
    version: i64,
    last_modified: DateTime<Utc>,
}

impl MemoryObjectStore {
    /// Creates a new empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of stored objects.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn object_count(&self) -> Result<usize> {
        let objects = self
            .objects
            .read()
            .map_err(|_| Error::internal("lock poisoned"))?;
        Ok(objects.len())
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn get(&self, key: &str) -> Result<Bytes> {
        let objects = self
            .objects
            .read()
            .map_err(|_| Error::internal("lock poisoned"))?;

        objects
            .get(key)
            .map(|o| o.data.clone())
            .ok_or_else(|| Error::NotFound(format!("object not found: {key}")))
    }

    async fn put(
        &self,
        key: &str,
        data: Bytes,
        precondition: WritePrecondition,
    ) -> Result<WriteResult> {
        let mut objects = self
            .objects
            .write()
            .map_err(|_| Error::internal("lock poisoned"))?;

        let current = objects.get(key);

        match precondition {
            WritePrecondition::DoesNotExist => {
                if let Some(obj) = current {
                    return Ok(WriteResult::PreconditionFailed {
                        current_version: obj.version.to_string(),
                    });
                }
            }
            WritePrecondition::MatchesVersion(expected) => {
                let expected_num: i64 = expected.parse().unwrap_or(-1);
                match current {
                    Some(obj) if obj.version != expected_num => {
                        return Ok(WriteResult::PreconditionFailed {
                            current_version: obj.version.to_string(),
                        });
                    }
                    None => {
                        return Ok(WriteResult::PreconditionFailed {
                            current_version: "0".to_string(),
                        });
                    }
                    _ => {}
                }
            }
            WritePrecondition::None => {}
        }

        let new_version = current.map_or(1, |o| o.version + 1);
        objects.insert(
            key.to_string(),
            StoredObject {
                data,
                version: new_version,
                last_modified: Utc::now(),
            },
        );
        drop(objects);

        Ok(WriteResult::Success {
            version: new_version.to_string(),
        })
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.objects
            .write()
            .map_err(|_| Error::internal("lock poisoned"))?
            .remove(key);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>> {
        let objects = self
            .objects
            .read()
            .map_err(|_| Error::internal("lock poisoned"))?;

        Ok(objects
            .iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .map(|(key, obj)| ObjectMeta {
                key: key.clone(),
                size: obj.data.len() as u64,
                version: obj.version.to_string(),
                last_modified: Some(obj.last_modified),
            })
            .collect())
    }

    async fn head(&self, key: &str) -> Result<Option<ObjectMeta>> {
        let objects = self
            .objects
            .read()
            .map_err(|_| Error::internal("lock poisoned"))?;

        Ok(objects.get(key).map(|obj| ObjectMeta {
            key: key.to_string(),
            size: obj.data.len() as u64,
            version: obj.version.to_string(),
            last_modified: Some(obj.last_modified),
        }))
    }

    async fn signed_url(&self, key: &str, expiry: Duration) -> Result<String> {
        // Memory backend has no real signing; the shape mirrors a presigned
        // URL closely enough for tests.
        Ok(format!(
            "memory://{key}?expires={}",
            expiry.as_secs()
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_get_roundtrip() {
        let store = MemoryObjectStore::new();
        store
            .put("a/b", Bytes::from_static(b"hello"), WritePrecondition::None)
            .await
            .unwrap();

        let data = store.get("a/b").await.unwrap();
        assert_eq!(&data[..], b"hello");
    }

    #[tokio::test]
    async fn get_missing_is_not_found() {
        let store = MemoryObjectStore::new();
        let err = store.get("missing").await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn does_not_exist_precondition_blocks_overwrite() {
        let store = MemoryObjectStore::new();
        let first = store
            .put("lock", Bytes::from_static(b"a"), WritePrecondition::DoesNotExist)
            .await
            .unwrap();
        assert!(first.is_success());

        let second = store
            .put("lock", Bytes::from_static(b"b"), WritePrecondition::DoesNotExist)
            .await
            .unwrap();
        assert!(!second.is_success());
    }

    #[tokio::test]
    async fn matches_version_detects_concurrent_write() {
        let store = MemoryObjectStore::new();
        let WriteResult::Success { version } = store
            .put("obj", Bytes::from_static(b"v1"), WritePrecondition::None)
            .await
            .unwrap()
        else {
            panic!("unconditional write failed");
        };

        // A concurrent writer bumps the version.
        store
            .put("obj", Bytes::from_static(b"v2"), WritePrecondition::None)
            .await
            .unwrap();

        let stale = store
            .put(
                "obj",
                Bytes::from_static(b"v3"),
                WritePrecondition::MatchesVersion(version),
            )
            .await
            .unwrap();
        assert!(!stale.is_success());
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let store = MemoryObjectStore::new();
        store.delete("absent").await.unwrap();

        store
            .put("obj", Bytes::from_static(b"x"), WritePrecondition::None)
            .await
            .unwrap();
        store.delete("obj").await.unwrap();
        assert!(store.head("obj").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn list_filters_by_prefix() {
        let store = MemoryObjectStore::new();
        for key in ["staging/src-1/a", "staging/src-1/b", "staging/src-2/c"] {
            store
                .put(key, Bytes::from_static(b"x"), WritePrecondition::None)
                .await
                .unwrap();
        }

        let listed = store.list("staging/src-1/").await.unwrap();
        assert_eq!(listed.len(), 2);
    }
}
