//! In-memory span store for testing and development.
//!
//! Not suitable for production: no persistence, single-process only.

use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{SpanQuery, SpanStore};
use crate::error::{Error, Result};
use crate::span::SpanRecord;

fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::storage("span store lock poisoned")
}

/// Thread-safe in-memory span store.
#[derive(Debug, Default)]
pub struct InMemorySpanStore {
    rows: RwLock<Vec<SpanRecord>>,
}

impl InMemorySpanStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the total number of stored rows.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn len(&self) -> Result<usize> {
        Ok(self.rows.read().map_err(poison_err)?.len())
    }

    /// Returns true if the store holds no rows.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.rows.read().map_err(poison_err)?.is_empty())
    }
}

#[async_trait]
impl SpanStore for InMemorySpanStore {
    async fn insert_batch(&self, rows: Vec<SpanRecord>) -> Result<()> {
        let mut stored = self.rows.write().map_err(poison_err)?;
        stored.extend(rows);
        Ok(())
    }

    async fn query(&self, query: &SpanQuery) -> Result<Vec<SpanRecord>> {
        let stored = self.rows.read().map_err(poison_err)?;
        let mut matched: Vec<SpanRecord> = stored
            .iter()
            .filter(|row| query.matches(row))
            .cloned()
            .collect();
        matched.sort_by_key(|row| row.start_time);
        Ok(matched)
    }

    async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut stored = self.rows.write().map_err(poison_err)?;
        let before = stored.len();
        stored.retain(|row| row.created_at >= cutoff);
        Ok((before - stored.len()) as u64)
    }
}
