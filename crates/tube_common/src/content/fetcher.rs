//! Content fetchers - where stitch content comes from on a cache miss.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tracing::debug;

use crate::error::{Result, TubeError};
use crate::types::StitchContent;
use crate::wire::{BatchRequest, BatchResponse, StitchResponse};

#[async_trait]
pub trait ContentFetcher: Send + Sync {
    async fn fetch_one(&self, id: &str) -> Result<StitchContent>;

    /// Fetch several stitches at once. Unknown ids are left out of the result.
    async fn fetch_batch(&self, ids: &[String]) -> Result<Vec<StitchContent>>;
}

/// Fetcher for the `/content` endpoints
pub struct HttpContentFetcher {
    base_url: String,
    http: reqwest::Client,
    timeout_secs: u64,
}

impl HttpContentFetcher {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TubeError::Config(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http,
            timeout_secs: timeout.as_secs(),
        })
    }

    /// `{base}/content/stitch/{id}` with `id` encoded as a single path segment
    fn stitch_url(&self, id: &str) -> Result<reqwest::Url> {
        let mut url = reqwest::Url::parse(&self.base_url)
            .map_err(|e| TubeError::Config(format!("Invalid content endpoint {}: {}", self.base_url, e)))?;
        url.path_segments_mut()
            .map_err(|_| TubeError::Config(format!("Content endpoint {} cannot take a path", self.base_url)))?
            .pop_if_empty()
            .extend(["content", "stitch", id]);
        Ok(url)
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
impl ContentFetcher for HttpContentFetcher {
    async fn fetch_one(&self, id: &str) -> Result<StitchContent> {
        let url = self.stitch_url(id)?;
        let response = self.http.get(url.clone()).send().await.map_err(|e| self.map_err(e))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(TubeError::ContentNotFound(id.to_string()));
        }
        if !response.status().is_success() {
            return Err(TubeError::Network(format!(
                "GET {} returned {}",
                url,
                response.status()
            )));
        }

        let body: StitchResponse = response.json().await.map_err(|e| self.map_err(e))?;
        match body.stitch {
            Some(stitch) if body.success => Ok(stitch),
            _ => Err(TubeError::ContentNotFound(id.to_string())),
        }
    }

    async fn fetch_batch(&self, ids: &[String]) -> Result<Vec<StitchContent>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let url = format!("{}/content/batch", self.base_url);
        let request = BatchRequest {
            stitch_ids: ids.to_vec(),
        };
        let response = self
            .http
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| self.map_err(e))?;

        if !response.status().is_success() {
            return Err(TubeError::Network(format!(
                "POST {} returned {}",
                url,
                response.status()
            )));
        }

        let body: BatchResponse = response.json().await.map_err(|e| self.map_err(e))?;
        if !body.success {
            return Err(TubeError::RemoteRejected("batch fetch unsuccessful".into()));
        }
        debug!(requested = ids.len(), received = body.stitches.len(), "Batch fetched");
        Ok(body.stitches)
    }
}

/// Fetcher for deployments without a content backend
pub struct NullContentFetcher;

#[async_trait]
impl ContentFetcher for NullContentFetcher {
    async fn fetch_one(&self, id: &str) -> Result<StitchContent> {
        Err(TubeError::ContentNotFound(id.to_string()))
    }

    async fn fetch_batch(&self, _ids: &[String]) -> Result<Vec<StitchContent>> {
        Ok(Vec::new())
    }
}

/// In-memory fetcher for tests. Counts calls; can be slowed down or failed.
#[derive(Default)]
pub struct FakeContentFetcher {
    catalog: Mutex<HashMap<String, StitchContent>>,
    serve_any: AtomicBool,
    fail: AtomicBool,
    delay: Mutex<Option<Duration>>,
    one_calls: AtomicUsize,
    batch_calls: AtomicUsize,
    batch_ids: Mutex<Vec<Vec<String>>>,
}

impl FakeContentFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// A fetcher that makes up content for any id
    pub fn serving_any() -> Self {
        let fetcher = Self::default();
        fetcher.serve_any.store(true, Ordering::SeqCst);
        fetcher
    }

    pub fn with_stitch(self, stitch: StitchContent) -> Self {
        self.catalog
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(stitch.id.clone(), stitch);
        self
    }

    pub fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn set_delay(&self, delay: Option<Duration>) {
        *self.delay.lock().unwrap_or_else(PoisonError::into_inner) = delay;
    }

    pub fn one_calls(&self) -> usize {
        self.one_calls.load(Ordering::SeqCst)
    }

    pub fn batch_calls(&self) -> usize {
        self.batch_calls.load(Ordering::SeqCst)
    }

    /// Ids requested by each batch call, in call order
    pub fn batch_ids(&self) -> Vec<Vec<String>> {
        self.batch_ids
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    async fn pause(&self) -> Result<()> {
        let delay = *self.delay.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(TubeError::Network("fake content failure".into()));
        }
        Ok(())
    }

    fn lookup(&self, id: &str) -> Option<StitchContent> {
        let known = self
            .catalog
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned();
        known.or_else(|| {
            self.serve_any.load(Ordering::SeqCst).then(|| StitchContent {
                id: id.to_string(),
                thread_id: None,
                title: Some(format!("Stitch {}", id)),
                questions: Vec::new(),
            })
        })
    }
}

#[async_trait]
impl ContentFetcher for FakeContentFetcher {
    async fn fetch_one(&self, id: &str) -> Result<StitchContent> {
        self.one_calls.fetch_add(1, Ordering::SeqCst);
        self.pause().await?;
        self.lookup(id)
            .ok_or_else(|| TubeError::ContentNotFound(id.to_string()))
    }

    async fn fetch_batch(&self, ids: &[String]) -> Result<Vec<StitchContent>> {
        self.batch_calls.fetch_add(1, Ordering::SeqCst);
        self.batch_ids
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(ids.to_vec());
        self.pause().await?;
        Ok(ids.iter().filter_map(|id| self.lookup(id)).collect())
    }
}
