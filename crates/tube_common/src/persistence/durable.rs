//! Common contract for local durable tiers.

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::types::{StorageTier, SyncRecord};

/// A local tier holding one snapshot per user.
///
/// Calls are synchronous: local writes must complete before a remote sync is
/// even scheduled.
pub trait DurableStore: Send + Sync {
    fn name(&self) -> &'static str;

    fn tier(&self) -> StorageTier;

    fn get(&self, user_id: &str) -> Result<Option<SyncRecord>>;

    fn put(&self, record: &SyncRecord) -> Result<()>;
}

/// A snapshot waiting to be pushed to the remote store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedSnapshot {
    /// `{user_id}_{timestamp}`
    pub id: String,
    pub record: SyncRecord,
    pub queued_at: i64,
}

/// Snapshots whose remote write failed, kept for background replay
pub trait ReplayQueue: Send + Sync {
    fn enqueue(&self, record: &SyncRecord) -> Result<String>;

    /// Queued snapshots for a user, oldest first
    fn pending(&self, user_id: &str) -> Result<Vec<QueuedSnapshot>>;

    fn remove(&self, id: &str) -> Result<()>;

    /// Drop every queued snapshot for `user_id` at or before `timestamp`
    fn remove_through(&self, user_id: &str, timestamp: i64) -> Result<usize>;

    fn count(&self, user_id: &str) -> Result<usize>;
}

/// Replay entry id for a record
pub fn replay_id(record: &SyncRecord) -> String {
    format!("{}_{}", record.user_id, record.timestamp)
}
