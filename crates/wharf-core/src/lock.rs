//! Advisory lock for multi-process scheduler exclusion.
//!
//! Upload creation for a (source, destination) pair must be serialized
//! across every process running a scheduler for that pair. The lock uses
//! object storage as the coordination point:
//!
//! - **CAS**: acquisition writes a lock object with a `DoesNotExist`
//!   precondition, so only one writer succeeds
//! - **TTL**: an expired lock may be taken over, preventing deadlocks when
//!   a holder dies
//! - **Fencing**: each acquisition increments a sequence number so a stale
//!   holder can be detected by downstream writers
//!
//! # Example
//!
//! ```rust,ignore
//! let lock = AdvisoryLock::new(storage.clone(), paths::lock_key(&source, &destination));
//!
//! let Some(guard) = lock.acquire(Duration::from_secs(30), 5).await? else {
//!     return Ok(None); // another scheduler holds the window
//! };
//!
//! // ... claim staging files, create the upload row ...
//!
//! guard.release().await?;
//! ```

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::error::{Error, Result};
use crate::storage::{ObjectStore, WritePrecondition, WriteResult};

/// Default lock TTL.
pub const DEFAULT_LOCK_TTL: Duration = Duration::from_secs(30);

/// Base backoff between acquisition retries.
const BACKOFF_BASE: Duration = Duration::from_millis(100);

/// Maximum backoff between acquisition retries.
const BACKOFF_MAX: Duration = Duration::from_secs(5);

/// Lock object contents.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockInfo {
    /// Unique holder id.
    pub holder_id: String,
    /// When the lock expires.
    pub expires_at: DateTime<Utc>,
    /// When the lock was acquired.
    pub acquired_at: DateTime<Utc>,
    /// Monotonically increasing fencing sequence, bumped on every
    /// acquisition including takeovers.
    #[serde(default)]
    pub sequence_number: u64,
}

impl LockInfo {
    /// Creates lock info for the given holder, TTL and sequence.
    #[must_use]
    pub fn new(holder_id: impl Into<String>, ttl: Duration, sequence_number: u64) -> Self {
        let now = Utc::now();
        Self {
            holder_id: holder_id.into(),
            expires_at: now
                + chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::seconds(30)),
            acquired_at: now,
            sequence_number,
        }
    }

    /// Returns whether this lock has expired.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    /// Returns whether this lock has expired at the given instant.
    #[must_use]
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// An advisory lock backed by object-storage CAS.
pub struct AdvisoryLock<S: ObjectStore + ?Sized> {
    storage: Arc<S>,
    lock_key: String,
    holder_id: String,
}

// Manual Clone so S itself doesn't need to be Clone.
impl<S: ObjectStore + ?Sized> Clone for AdvisoryLock<S> {
    fn clone(&self) -> Self {
        Self {
            storage: Arc::clone(&self.storage),
            lock_key: self.lock_key.clone(),
            holder_id: self.holder_id.clone(),
        }
    }
}

impl<S: ObjectStore + ?Sized> AdvisoryLock<S> {
    /// Creates a new lock over the given key. Each instance gets a unique
    /// holder id.
    #[must_use]
    pub fn new(storage: Arc<S>, lock_key: impl Into<String>) -> Self {
        Self {
            storage,
            lock_key: lock_key.into(),
            holder_id: Ulid::new().to_string(),
        }
    }

    /// Returns the holder id of this lock instance.
    #[must_use]
    pub fn holder_id(&self) -> &str {
        &self.holder_id
    }

    /// Attempts one acquisition without retrying.
    ///
    /// Returns `Ok(None)` when another live holder owns the lock.
    ///
    /// # Errors
    ///
    /// Returns an error on storage failures or malformed lock objects.
    pub async fn try_acquire(&self, ttl: Duration) -> Result<Option<LockGuard<S>>> {
        // Fast path: the lock object doesn't exist yet.
        let info = LockInfo::new(&self.holder_id, ttl, 1);
        let body = encode(&info)?;
        match self
            .storage
            .put(&self.lock_key, body, WritePrecondition::DoesNotExist)
            .await?
        {
            WriteResult::Success { version } => {
                return Ok(Some(self.guard(info, version)));
            }
            WriteResult::PreconditionFailed { .. } => {}
        }

        // Slow path: inspect the current holder and take over if expired.
        let current_bytes = match self.storage.get(&self.lock_key).await {
            Ok(bytes) => bytes,
            // Deleted between our put and get; next attempt wins it.
            Err(Error::NotFound(_)) => return Ok(None),
            Err(e) => return Err(e),
        };
        let current: LockInfo = decode(&current_bytes)?;

        if !current.is_expired() {
            return Ok(None);
        }

        let Some(meta) = self.storage.head(&self.lock_key).await? else {
            return Ok(None);
        };
        let takeover = LockInfo::new(&self.holder_id, ttl, current.sequence_number + 1);
        let body = encode(&takeover)?;
        match self
            .storage
            .put(
                &self.lock_key,
                body,
                WritePrecondition::MatchesVersion(meta.version),
            )
            .await?
        {
            WriteResult::Success { version } => Ok(Some(self.guard(takeover, version))),
            WriteResult::PreconditionFailed { .. } => Ok(None),
        }
    }

    /// Acquires the lock, retrying with capped exponential backoff.
    ///
    /// Returns `Ok(None)` when every attempt found a live holder.
    ///
    /// # Errors
    ///
    /// Returns an error on storage failures.
    pub async fn acquire(&self, ttl: Duration, max_retries: u32) -> Result<Option<LockGuard<S>>> {
        let mut backoff = BACKOFF_BASE;
        for attempt in 0..=max_retries {
            if let Some(guard) = self.try_acquire(ttl).await? {
                return Ok(Some(guard));
            }
            if attempt < max_retries {
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(BACKOFF_MAX);
            }
        }
        Ok(None)
    }

    fn guard(&self, info: LockInfo, version: String) -> LockGuard<S> {
        LockGuard {
            storage: Arc::clone(&self.storage),
            lock_key: self.lock_key.clone(),
            info,
            version,
        }
    }
}

/// Held lock. Release explicitly; an unreleased guard is reclaimed by TTL
/// takeover.
pub struct LockGuard<S: ObjectStore + ?Sized> {
    storage: Arc<S>,
    lock_key: String,
    info: LockInfo,
    version: String,
}

impl<S: ObjectStore + ?Sized> LockGuard<S> {
    /// Returns the fencing sequence of this acquisition.
    #[must_use]
    pub const fn sequence_number(&self) -> u64 {
        self.info.sequence_number
    }

    /// Returns the lock info written at acquisition.
    #[must_use]
    pub const fn info(&self) -> &LockInfo {
        &self.info
    }

    /// Releases the lock.
    ///
    /// Only deletes the lock object if this guard's acquisition is still
    /// the current one, so a late release cannot clobber a takeover.
    ///
    /// # Errors
    ///
    /// Returns an error on storage failures.
    pub async fn release(self) -> Result<()> {
        let Some(meta) = self.storage.head(&self.lock_key).await? else {
            return Ok(());
        };
        if meta.version == self.version {
            self.storage.delete(&self.lock_key).await?;
        }
        Ok(())
    }
}

fn encode(info: &LockInfo) -> Result<Bytes> {
    serde_json::to_vec(info)
        .map(Bytes::from)
        .map_err(|e| Error::Serialization {
            message: format!("encoding lock info: {e}"),
        })
}

fn decode(bytes: &Bytes) -> Result<LockInfo> {
    serde_json::from_slice(bytes).map_err(|e| Error::Serialization {
        message: format!("decoding lock info: {e}"),
    })
}
