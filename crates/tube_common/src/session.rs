//! Practice session - the composition root.
//!
//! Owns one learner's store and wires the sync manager and content cache to
//! it. There is no global store: whoever starts a session holds it.

use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::info;

use crate::config::TubeConfig;
use crate::content::{ContentCache, ContentFetcher, HttpContentFetcher, NullContentFetcher};
use crate::error::{Result, TubeError};
use crate::identity::{AnonymousPolicy, IdentityResolver, ProcessFallbackIdentity, ResolvedIdentity};
use crate::persistence::{
    HttpRemoteStore, LocalTiers, NullRemoteStore, RemoteStateStore, SyncManager, SyncStatus,
};
use crate::rotation::RotationView;
use crate::store::{LearningStateStore, StoreAction, Subscription};
use crate::types::{now_millis, CompletionEvent, LearningState, SlotNumber, StitchContent};

/// Collaborators a session talks to. `from_config` builds the production set.
pub struct SessionDeps {
    pub remote: Arc<dyn RemoteStateStore>,
    pub fetcher: Arc<dyn ContentFetcher>,
    pub fallback: ProcessFallbackIdentity,
}

impl SessionDeps {
    /// HTTP clients when an endpoint is configured, offline stand-ins otherwise
    pub fn from_config(config: &TubeConfig) -> Result<Self> {
        let (remote, fetcher): (Arc<dyn RemoteStateStore>, Arc<dyn ContentFetcher>) =
            match &config.sync.endpoint {
                Some(url) => (
                    Arc::new(HttpRemoteStore::new(url, config.sync.request_timeout())?),
                    Arc::new(HttpContentFetcher::new(url, config.sync.request_timeout())?),
                ),
                None => (Arc::new(NullRemoteStore), Arc::new(NullContentFetcher)),
            };

        Ok(Self {
            remote,
            fetcher,
            fallback: ProcessFallbackIdentity::shared(),
        })
    }
}

pub struct PracticeSession {
    config: TubeConfig,
    store: LearningStateStore,
    manager: SyncManager,
    cache: ContentCache,
    subscriptions: Vec<Subscription>,
}

impl PracticeSession {
    /// Start a session with collaborators built from `config`
    pub async fn start(config: TubeConfig, requested_user: Option<&str>, policy: AnonymousPolicy) -> Result<Self> {
        let deps = SessionDeps::from_config(&config)?;
        Self::start_with(config, deps, requested_user, policy).await
    }

    /// Resolve identity, load state, then wire store, sync and prefetch.
    ///
    /// Nothing is written anywhere if identity resolution fails.
    pub async fn start_with(
        config: TubeConfig,
        deps: SessionDeps,
        requested_user: Option<&str>,
        policy: AnonymousPolicy,
    ) -> Result<Self> {
        let tiers = LocalTiers::open(&config.storage)?;
        let resolver = IdentityResolver::standard(
            Arc::clone(&tiers.kv),
            config.storage.data_dir.join(&config.identity.credential_file),
            deps.fallback,
        );

        let manager = SyncManager::new(
            config.sync.clone(),
            config.progression.clone(),
            tiers,
            deps.remote,
            resolver,
        );
        let initial = manager.initialize(requested_user, policy).await?;

        let store = LearningStateStore::new(initial, config.progression.clone());
        let cache = ContentCache::new(config.cache.clone(), deps.fetcher);

        let mut subscriptions = vec![manager.attach(&store)];
        let prefetcher = cache.clone();
        let rules = config.progression.clone();
        subscriptions.push(store.subscribe(move |snapshot| {
            prefetcher.prefetch_for_state(snapshot, &rules);
        }));
        cache.prefetch_for_state(&store.get_state(), &config.progression);

        info!(user_id = %store.get_state().user_id, "Practice session started");
        Ok(Self {
            config,
            store,
            manager,
            cache,
            subscriptions,
        })
    }

    pub fn state(&self) -> Arc<LearningState> {
        self.store.get_state()
    }

    pub fn store(&self) -> &LearningStateStore {
        &self.store
    }

    pub fn complete(&self, event: CompletionEvent) -> Result<Arc<LearningState>> {
        self.store.dispatch(StoreAction::Complete(event))
    }

    /// Completion event for the ready unit of `slot`
    pub fn completion_for(&self, slot: u8, correct_count: u32, total_count: u32) -> Result<CompletionEvent> {
        let state = self.state();
        let number = SlotNumber::new(slot, self.config.progression.slot_count)?;
        let slot_state = state
            .slot(number)
            .ok_or(TubeError::InvalidSlot {
                slot,
                max: self.config.progression.slot_count,
            })?;

        Ok(CompletionEvent {
            slot,
            thread_id: slot_state.thread_id.clone(),
            unit_id: slot_state.current_unit_id.clone(),
            correct_count,
            total_count,
            timestamp: now_millis(),
        })
    }

    /// Move the rotation from the active slot to `slot`
    pub fn cycle_to(&self, slot: u8) -> Result<Arc<LearningState>> {
        let from = self.state().active_slot.get();
        self.store.dispatch(StoreAction::CycleSlot { from, to: slot })
    }

    /// Move to the next slot in rotation order
    pub fn advance(&self) -> Result<Arc<LearningState>> {
        self.store.dispatch(StoreAction::Advance)
    }

    pub fn view(&self) -> RotationView {
        RotationView::from_state(&self.state())
    }

    pub async fn content(&self, unit_id: &str) -> Result<StitchContent> {
        self.cache.get(unit_id).await
    }

    pub async fn force_sync(&self) -> bool {
        self.manager.force_sync().await
    }

    pub fn sync_status(&self) -> SyncStatus {
        self.manager.sync_status()
    }

    pub fn identity(&self) -> Option<ResolvedIdentity> {
        self.manager.identity()
    }

    pub fn cache(&self) -> &ContentCache {
        &self.cache
    }

    pub fn manager(&self) -> &SyncManager {
        &self.manager
    }

    pub fn config(&self) -> &TubeConfig {
        &self.config
    }

    /// Detach everything and issue the unload flush. The returned handle is
    /// the detached remote push, if one was started.
    pub fn shutdown(self) -> Option<JoinHandle<()>> {
        for subscription in self.subscriptions {
            subscription.unsubscribe();
        }
        info!("Practice session shutting down");
        self.manager.flush_on_unload()
    }
}
