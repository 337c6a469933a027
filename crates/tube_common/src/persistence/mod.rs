//! Persistence - local durable tiers, the remote store, and the sync manager
//! that writes to all of them.

pub mod durable;
pub mod kv;
pub mod manager;
pub mod phase;
pub mod remote;
pub mod sqlite;

pub use durable::{replay_id, DurableStore, QueuedSnapshot, ReplayQueue};
pub use kv::{state_key, JsonKvStore, DEVICE_ID_KEY, STATE_KEY_PREFIX};
pub use manager::{LocalTiers, SyncManager, SyncStatus};
pub use phase::{SyncPhase, SyncSignal};
pub use remote::{FakeRemoteStore, HttpRemoteStore, NullRemoteStore, PushCall, RemoteStateStore};
pub use sqlite::SqliteStore;
