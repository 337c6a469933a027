//! Remote state store abstraction.
//!
//! Production code uses `HttpRemoteStore` against the `/user-state` endpoint.
//! Deployments without a backend use `NullRemoteStore`; tests use
//! `FakeRemoteStore`, which records every push.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tracing::debug;

use crate::error::{Result, TubeError};
use crate::types::LearningState;
use crate::wire::{SaveUserStateRequest, SaveUserStateResponse, UserStateResponse};

#[async_trait]
pub trait RemoteStateStore: Send + Sync {
    /// Latest remote snapshot, `None` when the backend has nothing for this user
    async fn fetch(&self, user_id: &str) -> Result<Option<LearningState>>;

    /// Write a snapshot. `anonymous_id` is set for anonymous identities.
    async fn push(&self, state: &LearningState, anonymous_id: Option<&str>) -> Result<()>;

    /// False for stores that never reach a backend
    fn is_enabled(&self) -> bool {
        true
    }
}

// ============================================================================
// HTTP
// ============================================================================

pub struct HttpRemoteStore {
    base_url: String,
    http: reqwest::Client,
    timeout_secs: u64,
}

impl HttpRemoteStore {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("tube-player/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| TubeError::Config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http,
            timeout_secs: timeout.as_secs(),
        })
    }

    fn map_err(&self, e: reqwest::Error) -> TubeError {
        if e.is_timeout() {
            TubeError::Timeout(self.timeout_secs)
        } else {
            TubeError::Network(e.to_string())
        }
    }
}

#[async_trait]
impl RemoteStateStore for HttpRemoteStore {
    async fn fetch(&self, user_id: &str) -> Result<Option<LearningState>> {
        let url = format!("{}/user-state", self.base_url);
        let response = self
            .http
            .get(&url)
            .query(&[("userId", user_id)])
            .send()
            .await
            .map_err(|e| self.map_err(e))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            debug!(user_id, "No remote state");
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(TubeError::Network(format!(
                "GET /user-state returned {}",
                response.status()
            )));
        }

        let body = response.text().await.map_err(|e| self.map_err(e))?;
        if body.trim().is_empty() {
            return Ok(None);
        }
        let parsed: UserStateResponse = serde_json::from_str(&body)?;
        if !parsed.success {
            return Err(TubeError::RemoteRejected(
                parsed.error.unwrap_or_else(|| "fetch unsuccessful".to_string()),
            ));
        }
        Ok(parsed.state)
    }

    async fn push(&self, state: &LearningState, anonymous_id: Option<&str>) -> Result<()> {
        let url = format!("{}/user-state", self.base_url);
        let body = SaveUserStateRequest {
            state: state.clone(),
            id: anonymous_id.map(str::to_string),
        };

        let response = self
            .http
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| self.map_err(e))?;

        if !response.status().is_success() {
            return Err(TubeError::Network(format!(
                "POST /user-state returned {}",
                response.status()
            )));
        }

        let parsed: SaveUserStateResponse = response.json().await.map_err(|e| self.map_err(e))?;
        if !parsed.success {
            return Err(TubeError::RemoteRejected(
                parsed.error.unwrap_or_else(|| "save unsuccessful".to_string()),
            ));
        }
        Ok(())
    }
}

// ============================================================================
// Null (local-only deployments)
// ============================================================================

pub struct NullRemoteStore;

#[async_trait]
impl RemoteStateStore for NullRemoteStore {
    async fn fetch(&self, _user_id: &str) -> Result<Option<LearningState>> {
        Ok(None)
    }

    async fn push(&self, _state: &LearningState, _anonymous_id: Option<&str>) -> Result<()> {
        Ok(())
    }

    fn is_enabled(&self) -> bool {
        false
    }
}

// ============================================================================
// Fake (tests)
// ============================================================================

/// One recorded push
#[derive(Debug, Clone)]
pub struct PushCall {
    pub state: LearningState,
    pub anonymous_id: Option<String>,
}

/// In-memory remote store with failure switches and a call log
#[derive(Default)]
pub struct FakeRemoteStore {
    stored: Mutex<HashMap<String, LearningState>>,
    pushes: Mutex<Vec<PushCall>>,
    fetches: Mutex<Vec<String>>,
    fail_pushes: AtomicBool,
    fail_fetches: AtomicBool,
    push_delay: Mutex<Option<Duration>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl FakeRemoteStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a remote snapshot
    pub fn with_state(self, state: LearningState) -> Self {
        self.stored
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(state.user_id.clone(), state);
        self
    }

    pub fn set_fail_pushes(&self, fail: bool) {
        self.fail_pushes.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_fetches(&self, fail: bool) {
        self.fail_fetches.store(fail, Ordering::SeqCst);
    }

    /// Hold every push for `delay` before completing it
    pub fn set_push_delay(&self, delay: Option<Duration>) {
        *self.push_delay.lock().unwrap_or_else(PoisonError::into_inner) = delay;
    }

    pub fn pushes(&self) -> Vec<PushCall> {
        self.pushes.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn push_count(&self) -> usize {
        self.pushes.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Most pushes ever running at the same time
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn stored(&self, user_id: &str) -> Option<LearningState> {
        self.stored
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(user_id)
            .cloned()
    }
}

#[async_trait]
impl RemoteStateStore for FakeRemoteStore {
    async fn fetch(&self, user_id: &str) -> Result<Option<LearningState>> {
        self.fetches
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(user_id.to_string());
        if self.fail_fetches.load(Ordering::SeqCst) {
            return Err(TubeError::Network("fake fetch failure".into()));
        }
        Ok(self.stored(user_id))
    }

    async fn push(&self, state: &LearningState, anonymous_id: Option<&str>) -> Result<()> {
        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(running, Ordering::SeqCst);

        let delay = *self.push_delay.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let result = self.record_push(state, anonymous_id);
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

impl FakeRemoteStore {
    fn record_push(&self, state: &LearningState, anonymous_id: Option<&str>) -> Result<()> {
        self.pushes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(PushCall {
                state: state.clone(),
                anonymous_id: anonymous_id.map(str::to_string),
            });

        if self.fail_pushes.load(Ordering::SeqCst) {
            return Err(TubeError::Network("fake push failure".into()));
        }
        self.stored
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(state.user_id.clone(), state.clone());
        Ok(())
    }
}
