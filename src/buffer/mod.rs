//! Durable per-stream reading buffer on the edge device.
//!
//! Captured readings are committed before `append` returns and stay in the store
//! until a sender has delivered them and retention has expired. All statements for
//! one file run on that file's database thread, which is what serializes
//! `fetch_unsent` against a concurrent `mark_sent`.

use std::{
    collections::HashSet,
    path::PathBuf,
    sync::{Mutex, MutexGuard, OnceLock},
    time::Duration,
};

use anyhow::{bail, Result};

use crate::db::{helpers::now_ms, Database, BUFFER_SCHEMA};
use crate::models::{BufferedRecord, Reading, StreamKind};

/// Handle to the buffered readings of one stream. Clones share the same store.
#[derive(Clone)]
pub struct ReadingBuffer {
    db: Database,
    stream: StreamKind,
}

type ClaimKey = (PathBuf, StreamKind);

/// Delivery claims of this process, keyed by store file and stream. Every handle
/// and every `open` of the same file resolves to the same key.
fn sender_claims() -> MutexGuard<'static, HashSet<ClaimKey>> {
    static CLAIMS: OnceLock<Mutex<HashSet<ClaimKey>>> = OnceLock::new();
    CLAIMS
        .get_or_init(|| Mutex::new(HashSet::new()))
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Proof that a sender owns this buffer's delivery side. Released on drop.
pub struct SenderClaim {
    key: ClaimKey,
}

impl Drop for SenderClaim {
    fn drop(&mut self) {
        sender_claims().remove(&self.key);
    }
}

impl ReadingBuffer {
    /// Open (and migrate) the store at `path`. A store failing its integrity check is an error.
    pub fn open(path: impl Into<PathBuf>, stream: StreamKind) -> Result<Self> {
        let db = Database::open(path, &BUFFER_SCHEMA)?;
        Ok(Self::with_database(db, stream))
    }

    /// Bind a stream to an already opened buffer database (both stream tables live in it).
    pub fn with_database(db: Database, stream: StreamKind) -> Self {
        Self { db, stream }
    }

    pub fn stream(&self) -> StreamKind {
        self.stream
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    /// Reserve the delivery side of this stream in this store. Fails while any other
    /// handle to the same file holds it.
    pub fn claim_sender(&self) -> Result<SenderClaim> {
        let path = self
            .db
            .path()
            .canonicalize()
            .unwrap_or_else(|_| self.db.path().to_path_buf());
        let key = (path, self.stream);
        if !sender_claims().insert(key.clone()) {
            bail!("a sender is already attached to the {} buffer", self.stream.as_str());
        }
        Ok(SenderClaim { key })
    }

    pub async fn append(&self, reading: &Reading) -> Result<i64> {
        if reading.kind() != self.stream {
            bail!(
                "cannot append a {} reading to the {} buffer",
                reading.kind().as_str(),
                self.stream.as_str()
            );
        }
        self.db.insert_reading(reading).await
    }

    /// Up to `limit` pending records in ascending id order.
    pub async fn fetch_unsent(&self, limit: usize) -> Result<Vec<BufferedRecord>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        self.db.fetch_unsent_readings(self.stream, limit).await
    }

    /// Mark ids delivered atomically; returns how many changed state.
    pub async fn mark_sent(&self, ids: &[i64]) -> Result<usize> {
        self.db.mark_readings_sent(self.stream, ids).await
    }

    /// Drop delivered rows buffered at least `age` ago.
    pub async fn delete_sent_older_than(&self, age: Duration) -> Result<usize> {
        let age_ms = i64::try_from(age.as_millis()).unwrap_or(i64::MAX);
        let cutoff = now_ms().saturating_sub(age_ms);
        self.db.delete_sent_readings_before(self.stream, cutoff).await
    }

    pub async fn count_unsent(&self) -> Result<u64> {
        self.db.count_readings(self.stream, Some(false)).await
    }

    pub async fn count_total(&self) -> Result<u64> {
        self.db.count_readings(self.stream, None).await
    }

    pub async fn count_quarantined(&self) -> Result<u64> {
        self.db.count_quarantined_readings(self.stream).await
    }
}
