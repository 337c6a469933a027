//! Sync manager - owns every write to the storage tiers.
//!
//! Each state change is written to the local tiers synchronously, then a
//! remote push is scheduled after the debounce window. Rapid changes
//! supersede each other's timers so a burst becomes one push carrying the
//! newest snapshot. Pushes are serialized through [`SyncPhase`].
//!
//! A failed push is never surfaced to the learner: the local write already
//! happened, and with a structured tier the snapshot is queued for replay.

use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::durable::{DurableStore, ReplayQueue};
use super::kv::JsonKvStore;
use super::phase::{SyncPhase, SyncSignal};
use super::remote::RemoteStateStore;
use super::sqlite::SqliteStore;
use crate::config::{ProgressionConfig, StorageConfig, SyncConfig};
use crate::error::{Result, TubeError};
use crate::identity::{AnonymousPolicy, IdentityResolver, IdentitySource, ResolvedIdentity};
use crate::progression;
use crate::store::{LearningStateStore, Subscription};
use crate::types::{now_millis, LearningState, StorageTier, SyncRecord};

const UNLOAD_POLL: Duration = Duration::from_millis(25);

/// The local durable tiers of one deployment
#[derive(Clone)]
pub struct LocalTiers {
    pub kv: Arc<JsonKvStore>,
    pub structured: Option<Arc<SqliteStore>>,
}

impl LocalTiers {
    pub fn new(kv: Arc<JsonKvStore>, structured: Option<Arc<SqliteStore>>) -> Self {
        Self { kv, structured }
    }

    /// Open the tiers under `config.data_dir`. The structured tier is optional:
    /// if it cannot be opened the deployment runs on the key-value tier alone.
    pub fn open(config: &StorageConfig) -> Result<Self> {
        let kv = Arc::new(JsonKvStore::open(config.kv_path())?);

        let structured = if config.sqlite_enabled {
            match SqliteStore::open(config.sqlite_path()) {
                Ok(db) => Some(Arc::new(db)),
                Err(e) => {
                    warn!(error = %e, "Structured tier unavailable, continuing without replay queue");
                    None
                }
            }
        } else {
            None
        };

        Ok(Self { kv, structured })
    }

    /// Tiers in recovery order, most authoritative first
    fn durable(&self) -> Vec<&dyn DurableStore> {
        let mut tiers: Vec<&dyn DurableStore> = Vec::with_capacity(2);
        if let Some(db) = &self.structured {
            tiers.push(db.as_ref());
        }
        tiers.push(self.kv.as_ref());
        tiers
    }
}

/// Sync health as reported to the UI and `tubectl status`
#[derive(Debug, Clone, Serialize)]
pub struct SyncStatus {
    pub user_id: Option<String>,
    pub phase: SyncPhase,
    pub remote_enabled: bool,
    pub last_success: Option<i64>,
    pub last_failure: Option<String>,
    pub last_failure_at: Option<i64>,
    pub consecutive_failures: u32,
    pub queued_replays: usize,
    pub remote_calls: u64,
    pub last_pushed_timestamp: Option<i64>,
}

#[derive(Default)]
struct SyncRuntime {
    phase: SyncPhase,
    identity: Option<ResolvedIdentity>,
    latest: Option<Arc<LearningState>>,
    debounce_generation: u64,
    last_success: Option<i64>,
    last_failure: Option<String>,
    last_failure_at: Option<i64>,
    consecutive_failures: u32,
    remote_calls: u64,
    last_pushed_timestamp: Option<i64>,
}

struct ManagerInner {
    sync: SyncConfig,
    rules: ProgressionConfig,
    tiers: LocalTiers,
    remote: Arc<dyn RemoteStateStore>,
    resolver: IdentityResolver,
    runtime: Mutex<SyncRuntime>,
}

#[derive(Clone)]
pub struct SyncManager {
    inner: Arc<ManagerInner>,
}

impl SyncManager {
    pub fn new(
        sync: SyncConfig,
        rules: ProgressionConfig,
        tiers: LocalTiers,
        remote: Arc<dyn RemoteStateStore>,
        resolver: IdentityResolver,
    ) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                sync,
                rules,
                tiers,
                remote,
                resolver,
                runtime: Mutex::new(SyncRuntime::default()),
            }),
        }
    }

    /// Resolve the identity and load the freshest available state.
    ///
    /// Local and remote reads run concurrently. A remote snapshot wins only
    /// when its `last_updated` is strictly later than the local one.
    pub async fn initialize(&self, requested: Option<&str>, policy: AnonymousPolicy) -> Result<LearningState> {
        let identity = self.inner.resolver.resolve(requested, policy)?;
        self.remember_device(&identity);
        let user_id = identity.user_id.clone();

        {
            let mut rt = self.runtime();
            rt.identity = Some(identity);
        }

        let (local, remote) = tokio::join!(
            async { self.read_local(&user_id) },
            self.fetch_remote(&user_id)
        );

        let local_ts = local.as_ref().map(|r| r.timestamp);
        let remote_ts = remote.as_ref().map(|s| s.last_updated);

        let (mut chosen, origin, local_won) = match (local, remote) {
            (Some(l), Some(r)) if r.last_updated > l.timestamp => (r, StorageTier::Remote, false),
            (Some(l), _) => (l.state, l.origin_tier, true),
            (None, Some(r)) => (r, StorageTier::Remote, false),
            (None, None) => (self.fresh_state(&user_id), StorageTier::Memory, false),
        };
        chosen.user_id = user_id.clone();

        let (state, repairs) = progression::normalize_with_report(&chosen, &self.inner.rules);
        if !repairs.is_empty() {
            warn!(user_id = %user_id, ?repairs, "Repaired loaded state");
        }
        info!(
            user_id = %user_id,
            origin = %origin,
            local_ts = ?local_ts,
            remote_ts = ?remote_ts,
            "Learning state initialized"
        );

        let state = Arc::new(state);
        self.runtime().latest = Some(Arc::clone(&state));

        if !local_won || !repairs.is_empty() {
            if let Err(e) = self.save_locally(&state) {
                warn!(error = %e, "Initial local write failed");
            }
        }
        if local_won && remote_ts.map_or(true, |r| r < state.last_updated) {
            self.schedule_remote();
        }
        if self.inner.sync.replay_on_startup {
            self.spawn_replay();
        }

        Ok((*state).clone())
    }

    /// Write `state` to every local tier. Returns how many tiers persisted it;
    /// fails only when none did.
    pub fn save_locally(&self, state: &LearningState) -> Result<usize> {
        let mut written = 0;
        let mut last_error = None;
        // fast tier first so a slow database never delays it
        let tiers = self.inner.tiers.durable();
        for tier in tiers.iter().rev() {
            let record = SyncRecord::new(state, tier.tier());
            match tier.put(&record) {
                Ok(()) => written += 1,
                Err(e) => {
                    warn!(tier = tier.name(), error = %e, "Local write failed");
                    last_error = Some(e);
                }
            }
        }

        if written == 0 {
            return Err(last_error
                .unwrap_or_else(|| TubeError::LocalStorage("no local tier configured".into())));
        }
        debug!(user_id = %state.user_id, tiers = written, "Saved locally");
        Ok(written)
    }

    /// Store subscriber entry point: local write now, remote push later
    pub fn record_change(&self, state: Arc<LearningState>) {
        if let Err(e) = self.save_locally(&state) {
            warn!(error = %e, "State change not persisted locally");
        }
        {
            let mut rt = self.runtime();
            rt.latest = Some(state);
            rt.phase = rt.phase.on(SyncSignal::Write);
        }
        self.schedule_remote();
    }

    /// Subscribe this manager to `store`
    pub fn attach(&self, store: &LearningStateStore) -> Subscription {
        self.runtime().latest = Some(store.get_state());
        let manager = self.clone();
        store.subscribe(move |snapshot| manager.record_change(Arc::clone(snapshot)))
    }

    /// Persist locally and push now, bypassing the debounce window.
    ///
    /// True whenever at least the local write succeeded.
    pub async fn force_sync(&self) -> bool {
        let Some(state) = self.latest() else {
            warn!("force_sync before initialize");
            return false;
        };

        let local_ok = self.save_locally(&state).is_ok();
        if !self.inner.remote.is_enabled() {
            return local_ok;
        }

        self.cancel_debounce();
        let remote_ok = matches!(self.push_serialized(state).await, Some(Ok(())));
        local_ok || remote_ok
    }

    /// Best-effort flush when the session is torn down: synchronous local
    /// write plus a detached push. The push goes through the same serialized
    /// path as every other sync, waiting out one already in flight.
    pub fn flush_on_unload(&self) -> Option<JoinHandle<()>> {
        let state = self.latest()?;
        self.identity()?;

        if let Err(e) = self.save_locally(&state) {
            warn!(error = %e, "Unload flush: local write failed");
        }
        if !self.inner.remote.is_enabled() {
            return None;
        }

        let handle = Handle::try_current().ok()?;
        self.cancel_debounce();
        let manager = self.clone();
        Some(handle.spawn(async move { manager.push_when_idle(state).await }))
    }

    /// Push the newest queued snapshot. Older queue entries are superseded
    /// by it and cleared on success. Returns the number of entries cleared.
    pub async fn replay_pending(&self) -> Result<usize> {
        let Some(db) = self.inner.tiers.structured.clone() else {
            return Ok(0);
        };
        let Some(identity) = self.identity() else {
            return Ok(0);
        };
        if !self.inner.remote.is_enabled() {
            return Ok(0);
        }

        let queued = db.pending(&identity.user_id)?;
        let Some(newest) = queued.last() else {
            return Ok(0);
        };
        let newest_ts = newest.record.timestamp;

        // the live state supersedes anything older in the queue
        let state = match self.latest() {
            Some(latest) if latest.last_updated > newest_ts => latest,
            _ => Arc::new(newest.record.state.clone()),
        };

        info!(user_id = %identity.user_id, queued = queued.len(), "Replaying queued snapshot");
        match self.push_serialized(state).await {
            Some(Ok(())) => Ok(queued.len()),
            Some(Err(e)) => Err(e),
            None => Ok(0),
        }
    }

    pub fn sync_status(&self) -> SyncStatus {
        let rt = self.runtime();
        let user_id = rt.identity.as_ref().map(|i| i.user_id.clone());
        let queued_replays = match (&self.inner.tiers.structured, &user_id) {
            (Some(db), Some(user)) => db.count(user).unwrap_or_else(|e| {
                warn!(error = %e, "Failed to count replay queue");
                0
            }),
            _ => 0,
        };

        SyncStatus {
            user_id,
            phase: rt.phase,
            remote_enabled: self.inner.remote.is_enabled(),
            last_success: rt.last_success,
            last_failure: rt.last_failure.clone(),
            last_failure_at: rt.last_failure_at,
            consecutive_failures: rt.consecutive_failures,
            queued_replays,
            remote_calls: rt.remote_calls,
            last_pushed_timestamp: rt.last_pushed_timestamp,
        }
    }

    pub fn identity(&self) -> Option<ResolvedIdentity> {
        self.runtime().identity.clone()
    }

    pub fn latest(&self) -> Option<Arc<LearningState>> {
        self.runtime().latest.clone()
    }

    pub fn tiers(&self) -> &LocalTiers {
        &self.inner.tiers
    }

    // ------------------------------------------------------------------------

    fn runtime(&self) -> MutexGuard<'_, SyncRuntime> {
        self.inner.runtime.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Minted ids and ids the caller named explicitly become the device id,
    /// so the next start on this device recovers them without a credential.
    fn remember_device(&self, identity: &ResolvedIdentity) {
        let explicit = identity.source == IdentitySource::Caller && !identity.anonymous;
        if !identity.is_minted() && !explicit {
            return;
        }
        let kv = &self.inner.tiers.kv;
        if kv.device_id().as_deref() == Some(identity.user_id.as_str()) {
            return;
        }
        match kv.set_device_id(&identity.user_id) {
            Ok(()) => debug!(user_id = %identity.user_id, "Device identity recorded"),
            Err(e) => warn!(error = %e, "Failed to store device identity"),
        }
    }

    fn fresh_state(&self, user_id: &str) -> LearningState {
        let rules = &self.inner.rules;
        LearningState::with_threads(user_id, &rules.default_threads, rules.units_per_thread, rules.first_skip())
    }

    /// Newest snapshot across the local tiers
    fn read_local(&self, user_id: &str) -> Option<SyncRecord> {
        self.inner
            .tiers
            .durable()
            .into_iter()
            .filter_map(|tier| match tier.get(user_id) {
                Ok(record) => record,
                Err(e) => {
                    warn!(tier = tier.name(), error = %e, "Local read failed");
                    None
                }
            })
            .max_by_key(|record| record.timestamp)
    }

    async fn fetch_remote(&self, user_id: &str) -> Option<LearningState> {
        if !self.inner.remote.is_enabled() {
            return None;
        }
        self.runtime().remote_calls += 1;
        match self.inner.remote.fetch(user_id).await {
            Ok(state) => state,
            Err(e) => {
                warn!(error = %e, "Remote fetch failed, using local state");
                self.note_failure(&e);
                None
            }
        }
    }

    fn cancel_debounce(&self) {
        self.runtime().debounce_generation += 1;
    }

    /// Start a debounce timer. A newer timer supersedes this one.
    fn schedule_remote(&self) {
        if !self.inner.remote.is_enabled() {
            return;
        }
        let generation = {
            let mut rt = self.runtime();
            rt.debounce_generation += 1;
            rt.debounce_generation
        };

        match Handle::try_current() {
            Ok(handle) => {
                let manager = self.clone();
                let delay = self.inner.sync.debounce();
                handle.spawn(async move {
                    tokio::time::sleep(delay).await;
                    manager.run_debounced(generation).await;
                });
            }
            Err(_) => debug!("No async runtime, remote sync deferred to next force_sync"),
        }
    }

    async fn run_debounced(&self, generation: u64) {
        let state = {
            let rt = self.runtime();
            if rt.debounce_generation != generation || !rt.phase.can_start() {
                return;
            }
            match rt.latest.clone() {
                Some(state) => state,
                None => return,
            }
        };

        if let Some(Err(e)) = self.push_serialized(state).await {
            debug!(error = %e, "Debounced sync failed, snapshot kept locally");
        }
    }

    /// Push once no other sync is in flight, giving up after the request
    /// timeout. A snapshot that never got out is queued for replay.
    async fn push_when_idle(&self, state: Arc<LearningState>) {
        let deadline = Instant::now() + self.inner.sync.request_timeout();
        loop {
            let newest = self.latest().unwrap_or_else(|| Arc::clone(&state));
            match self.push_serialized(newest).await {
                Some(Ok(())) => {
                    // nothing left for the follow-up timer a pending flag started
                    self.cancel_debounce();
                    debug!("Unload flush delivered");
                    return;
                }
                Some(Err(e)) => {
                    warn!(error = %e, "Unload flush failed");
                    return;
                }
                None if Instant::now() < deadline => tokio::time::sleep(UNLOAD_POLL).await,
                None => {
                    warn!("Unload flush timed out behind an in-flight sync");
                    self.queue_for_replay(&state);
                    return;
                }
            }
        }
    }

    fn queue_for_replay(&self, state: &LearningState) {
        match &self.inner.tiers.structured {
            Some(db) => {
                if let Err(e) = db.enqueue(&SyncRecord::new(state, StorageTier::Structured)) {
                    warn!(error = %e, "Failed to queue snapshot for replay");
                }
            }
            None => debug!("No structured tier, failure absorbed by local write"),
        }
    }

    fn spawn_replay(&self) {
        if self.inner.tiers.structured.is_none() || !self.inner.remote.is_enabled() {
            return;
        }
        if let Ok(handle) = Handle::try_current() {
            let manager = self.clone();
            handle.spawn(async move {
                match manager.replay_pending().await {
                    Ok(0) => {}
                    Ok(n) => info!(cleared = n, "Replay queue drained"),
                    Err(e) => debug!(error = %e, "Replay deferred"),
                }
            });
        }
    }

    /// One push of `state`, serialized with every other push.
    ///
    /// `None` when a push is already in flight; the pending flag is raised so
    /// that push is followed by another with the newest snapshot.
    async fn push_serialized(&self, state: Arc<LearningState>) -> Option<Result<()>> {
        let identity = {
            let mut rt = self.runtime();
            if !rt.phase.can_start() {
                rt.phase = rt.phase.on(SyncSignal::Write);
                return None;
            }
            let Some(identity) = rt.identity.clone() else {
                return Some(Err(TubeError::IdentityUnavailable));
            };
            rt.phase = rt.phase.on(SyncSignal::Start);
            rt.remote_calls += 1;
            identity
        };

        let anonymous_id = identity.anonymous.then_some(identity.user_id.as_str());
        let result = self.inner.remote.push(&state, anonymous_id).await;
        self.settle(&identity, &state, &result);
        Some(result)
    }

    fn settle(&self, identity: &ResolvedIdentity, state: &LearningState, result: &Result<()>) {
        match result {
            Ok(()) => {
                if let Some(db) = &self.inner.tiers.structured {
                    match db.remove_through(&identity.user_id, state.last_updated) {
                        Ok(0) => {}
                        Ok(n) => debug!(cleared = n, "Superseded replay entries dropped"),
                        Err(e) => warn!(error = %e, "Failed to trim replay queue"),
                    }
                }
                let mut rt = self.runtime();
                rt.last_success = Some(now_millis());
                rt.consecutive_failures = 0;
                rt.last_pushed_timestamp = Some(state.last_updated);
                debug!(user_id = %identity.user_id, ts = state.last_updated, "Remote sync complete");
            }
            Err(e) => {
                warn!(error = %e, transient = e.is_transient(), "Remote sync failed");
                self.queue_for_replay(state);
                self.note_failure(e);
            }
        }

        let rerun = {
            let mut rt = self.runtime();
            let pending = rt.phase == SyncPhase::SyncingWithPending;
            rt.phase = rt.phase.on(SyncSignal::Finished);
            pending
        };
        if rerun {
            self.schedule_remote();
        }
    }

    fn note_failure(&self, error: &TubeError) {
        let mut rt = self.runtime();
        rt.consecutive_failures += 1;
        rt.last_failure = Some(error.to_string());
        rt.last_failure_at = Some(now_millis());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::ProcessFallbackIdentity;
    use crate::persistence::remote::{FakeRemoteStore, NullRemoteStore};
    use tempfile::tempdir;

    fn tiers(dir: &std::path::Path) -> LocalTiers {
        LocalTiers::open(&StorageConfig::in_dir(dir)).unwrap()
    }

    fn manager(tiers: LocalTiers, remote: Arc<dyn RemoteStateStore>) -> SyncManager {
        let resolver = IdentityResolver::new(ProcessFallbackIdentity::new());
        let sync = SyncConfig {
            debounce_ms: 20,
            replay_on_startup: false,
            ..SyncConfig::default()
        };
        SyncManager::new(sync, ProgressionConfig::default(), tiers, remote, resolver)
    }

    #[tokio::test]
    async fn test_fresh_state_when_nothing_stored() {
        let dir = tempdir().unwrap();
        let m = manager(tiers(dir.path()), Arc::new(NullRemoteStore));
        let state = m.initialize(Some("u1"), AnonymousPolicy::Forbid).await.unwrap();
        assert_eq!(state.user_id, "u1");
        assert_eq!(state.rotation_slots.len(), 3);
        assert_eq!(m.sync_status().remote_calls, 0);
    }

    #[tokio::test]
    async fn test_timestamp_tie_keeps_local() {
        let dir = tempdir().unwrap();
        let rules = ProgressionConfig::default();
        let mut local = LearningState::with_threads("u1", &rules.default_threads, 3, 3);
        local.last_updated = 100;
        let mut remote = local.clone();
        remote.points.lifetime = 999;

        let t = tiers(dir.path());
        t.kv.put(&SyncRecord::new(&local, StorageTier::KeyValue)).unwrap();
        let m = manager(t, Arc::new(FakeRemoteStore::new().with_state(remote)));
        let state = m.initialize(Some("u1"), AnonymousPolicy::Forbid).await.unwrap();
        assert_eq!(state.points.lifetime, 0);
    }

    #[tokio::test]
    async fn test_save_locally_fails_only_when_every_tier_fails() {
        let dir = tempdir().unwrap();
        let m = manager(tiers(dir.path()), Arc::new(NullRemoteStore));
        let state = m.initialize(Some("u1"), AnonymousPolicy::Forbid).await.unwrap();
        assert_eq!(m.save_locally(&state).unwrap(), 2);
    }

    #[tokio::test]
    async fn test_force_sync_without_initialize_is_false() {
        let dir = tempdir().unwrap();
        let m = manager(tiers(dir.path()), Arc::new(NullRemoteStore));
        assert!(!m.force_sync().await);
    }
}
