//! Background content worker.
//!
//! Fetch I/O runs on a separate task that talks to its clients only through
//! messages: `{action, data, id}` in, `{id, success, result | error}` out.
//! Replies are matched to callers by id. A request that gets no reply within
//! the timeout fails and its correlation entry is removed, so a late reply is
//! dropped instead of leaking.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use super::fetcher::ContentFetcher;
use crate::error::{Result, TubeError};
use crate::types::StitchContent;

const CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum WorkerAction {
    FetchStitch,
    FetchBatch,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerRequest {
    pub action: WorkerAction,
    pub data: Value,
    pub id: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerResponse {
    pub id: u64,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl WorkerResponse {
    fn from_outcome(id: u64, outcome: Result<Value>) -> Self {
        match outcome {
            Ok(result) => Self {
                id,
                success: true,
                result: Some(result),
                error: None,
            },
            Err(e) => Self {
                id,
                success: false,
                result: None,
                error: Some(e.to_string()),
            },
        }
    }
}

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<WorkerResponse>>>>;

pub struct ContentWorker;

impl ContentWorker {
    /// Spawn the worker and its reply router on the current runtime
    pub fn spawn(fetcher: Arc<dyn ContentFetcher>, timeout: Duration) -> WorkerClient {
        let (request_tx, mut request_rx) = mpsc::channel::<WorkerRequest>(CHANNEL_CAPACITY);
        let (response_tx, mut response_rx) = mpsc::channel::<WorkerResponse>(CHANNEL_CAPACITY);

        tokio::spawn(async move {
            while let Some(request) = request_rx.recv().await {
                let fetcher = Arc::clone(&fetcher);
                let response_tx = response_tx.clone();
                tokio::spawn(async move {
                    let outcome = run_action(fetcher.as_ref(), request.action, &request.data).await;
                    let response = WorkerResponse::from_outcome(request.id, outcome);
                    let _ = response_tx.send(response).await;
                });
            }
            debug!("Content worker stopped");
        });

        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let router_pending = Arc::clone(&pending);
        tokio::spawn(async move {
            while let Some(response) = response_rx.recv().await {
                let waiter = lock(&router_pending).remove(&response.id);
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(response);
                    }
                    None => debug!(request_id = response.id, "Late worker reply dropped"),
                }
            }
        });

        WorkerClient {
            requests: request_tx,
            pending,
            next_id: AtomicU64::new(1),
            timeout,
        }
    }
}

async fn run_action(fetcher: &dyn ContentFetcher, action: WorkerAction, data: &Value) -> Result<Value> {
    match action {
        WorkerAction::FetchStitch => {
            let id = data
                .get("id")
                .and_then(Value::as_str)
                .ok_or_else(|| TubeError::Worker("fetchStitch requires data.id".into()))?;
            Ok(serde_json::to_value(fetcher.fetch_one(id).await?)?)
        }
        WorkerAction::FetchBatch => {
            let ids: Vec<String> = data
                .get("stitchIds")
                .cloned()
                .map(serde_json::from_value)
                .transpose()?
                .ok_or_else(|| TubeError::Worker("fetchBatch requires data.stitchIds".into()))?;
            Ok(serde_json::to_value(fetcher.fetch_batch(&ids).await?)?)
        }
    }
}

/// Caller side of the worker protocol
pub struct WorkerClient {
    requests: mpsc::Sender<WorkerRequest>,
    pending: PendingMap,
    next_id: AtomicU64,
    timeout: Duration,
}

impl WorkerClient {
    /// Send one request and wait for its reply or the timeout
    pub async fn request(&self, action: WorkerAction, data: Value) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        lock(&self.pending).insert(id, tx);

        if self.requests.send(WorkerRequest { action, data, id }).await.is_err() {
            lock(&self.pending).remove(&id);
            return Err(TubeError::Worker("content worker is not running".into()));
        }

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(response)) if response.success => response
                .result
                .ok_or_else(|| TubeError::Worker(format!("reply {} carried no result", id))),
            Ok(Ok(response)) => Err(TubeError::Worker(
                response.error.unwrap_or_else(|| "unknown worker error".into()),
            )),
            Ok(Err(_)) => Err(TubeError::Worker(format!("reply {} was dropped", id))),
            Err(_) => {
                lock(&self.pending).remove(&id);
                warn!(request_id = id, "Content worker request timed out");
                Err(TubeError::WorkerTimeout {
                    request_id: id,
                    secs: self.timeout.as_secs(),
                })
            }
        }
    }

    pub async fn fetch_stitch(&self, id: &str) -> Result<StitchContent> {
        let value = self.request(WorkerAction::FetchStitch, json!({ "id": id })).await?;
        Ok(serde_json::from_value(value)?)
    }

    pub async fn fetch_batch(&self, ids: &[String]) -> Result<Vec<StitchContent>> {
        let value = self
            .request(WorkerAction::FetchBatch, json!({ "stitchIds": ids }))
            .await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Requests still waiting for a reply
    pub fn pending_count(&self) -> usize {
        lock(&self.pending).len()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::fetcher::FakeContentFetcher;

    #[tokio::test]
    async fn test_reply_is_correlated_by_id() {
        let fetcher = Arc::new(FakeContentFetcher::serving_any());
        let client = ContentWorker::spawn(fetcher, Duration::from_secs(5));
        let (a, b) = tokio::join!(client.fetch_stitch("s-1"), client.fetch_stitch("s-2"));
        assert_eq!(a.unwrap().id, "s-1");
        assert_eq!(b.unwrap().id, "s-2");
        assert_eq!(client.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_unanswered_request_times_out_and_is_forgotten() {
        let fetcher = Arc::new(FakeContentFetcher::serving_any());
        fetcher.set_delay(Some(Duration::from_millis(300)));
        let client = ContentWorker::spawn(fetcher, Duration::from_millis(30));

        let err = client.fetch_stitch("slow").await.unwrap_err();
        assert!(matches!(err, TubeError::WorkerTimeout { .. }));
        assert_eq!(client.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_fetch_error_becomes_failed_reply() {
        let client = ContentWorker::spawn(Arc::new(FakeContentFetcher::new()), Duration::from_secs(5));
        let err = client.fetch_stitch("missing").await.unwrap_err();
        assert!(matches!(err, TubeError::Worker(_)));
    }

    #[test]
    fn test_request_wire_shape() {
        let req = WorkerRequest {
            action: WorkerAction::FetchBatch,
            data: json!({"stitchIds": ["a"]}),
            id: 7,
        };
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["action"], "fetchBatch");
        assert_eq!(json["id"], 7);
    }
}
