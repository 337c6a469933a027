//! Tests for the content cache and its worker

use std::sync::Arc;
use std::time::Duration;

use tube_common::config::{CacheConfig, ProgressionConfig};
use tube_common::content::{ContentCache, FakeContentFetcher};
use tube_common::{LearningState, StitchContent, TubeError};

fn config(worker_enabled: bool) -> CacheConfig {
    CacheConfig {
        worker_enabled,
        worker_timeout_secs: 1,
        ..CacheConfig::default()
    }
}

fn stitch(id: &str) -> StitchContent {
    StitchContent {
        id: id.to_string(),
        thread_id: Some("t1".into()),
        title: None,
        questions: vec![serde_json::json!({"q": "2 + 2", "a": "4"})],
    }
}

#[tokio::test]
async fn test_miss_fetches_then_hit_serves_from_memory() {
    let fetcher = Arc::new(FakeContentFetcher::new().with_stitch(stitch("s1")));
    let cache = ContentCache::new(config(false), fetcher.clone());

    let first = cache.get("s1").await.unwrap();
    let second = cache.get("s1").await.unwrap();
    assert_eq!(first, second);
    assert_eq!(fetcher.one_calls(), 1);
}

#[tokio::test]
async fn test_unknown_stitch_is_not_found() {
    let cache = ContentCache::new(config(false), Arc::new(FakeContentFetcher::new()));
    assert!(matches!(
        cache.get("nope").await,
        Err(TubeError::ContentNotFound(_))
    ));
    assert!(cache.is_empty());
}

#[tokio::test]
async fn test_prefetch_skips_cached_and_duplicate_ids() {
    let fetcher = Arc::new(FakeContentFetcher::serving_any());
    let cache = ContentCache::new(config(false), fetcher.clone());
    cache.insert(stitch("a"));

    let ids: Vec<String> = ["a", "b", "c", "b"].iter().map(|s| s.to_string()).collect();
    cache.prefetch(&ids).unwrap().await.unwrap();

    assert_eq!(fetcher.batch_ids(), vec![vec!["b".to_string(), "c".to_string()]]);
    assert!(cache.contains("b"));
    assert!(cache.contains("c"));
}

#[tokio::test]
async fn test_prefetch_of_cached_ids_does_nothing() {
    let fetcher = Arc::new(FakeContentFetcher::serving_any());
    let cache = ContentCache::new(config(false), fetcher.clone());
    cache.insert(stitch("a"));

    assert!(cache.prefetch(&["a".to_string()]).is_none());
    assert_eq!(fetcher.batch_calls(), 0);
}

#[tokio::test]
async fn test_prefetch_for_state_covers_every_slot() {
    let rules = ProgressionConfig::default();
    let state = LearningState::with_threads("u1", &rules.default_threads, 10, 3);
    let fetcher = Arc::new(FakeContentFetcher::serving_any());
    let cache = ContentCache::new(config(false), fetcher.clone());

    cache.prefetch_for_state(&state, &rules).unwrap().await.unwrap();
    // ready unit plus 3 lookahead positions, three slots
    assert_eq!(cache.len(), 12);
    assert!(cache.contains("t3-0004"));
    assert!(!cache.contains("t1-0005"));
}

#[tokio::test]
async fn test_eviction_keeps_cache_bounded() {
    let cache = ContentCache::new(
        CacheConfig {
            max_entries: 500,
            ..config(false)
        },
        Arc::new(FakeContentFetcher::new()),
    );
    for i in 0..501 {
        cache.insert(stitch(&format!("s{:03}", i)));
    }
    // 501 > 500 drops ceil(501 * 0.2) = 101 of the oldest
    assert_eq!(cache.len(), 400);
    assert!(!cache.contains("s000"));
    assert!(!cache.contains("s100"));
    assert!(cache.contains("s101"));
    assert_eq!(cache.evict_old(), 0);
}

#[tokio::test]
async fn test_worker_path_serves_content() {
    let fetcher = Arc::new(FakeContentFetcher::serving_any());
    let cache = ContentCache::new(config(true), fetcher.clone());

    let content = cache.get("w1").await.unwrap();
    assert_eq!(content.id, "w1");
    let status = cache.cache_status();
    assert!(status.worker_enabled);
    assert_eq!(status.worker_fallbacks, 0);
}

#[tokio::test]
async fn test_worker_timeout_falls_back_to_direct_fetch() {
    let fetcher = Arc::new(FakeContentFetcher::serving_any());
    fetcher.set_delay(Some(Duration::from_millis(1_500)));
    let cache = ContentCache::new(config(true), fetcher.clone());

    // worker gives up after 1s, then the direct fetch completes
    let content = cache.get("slow").await.unwrap();
    assert_eq!(content.id, "slow");
    assert_eq!(cache.cache_status().worker_fallbacks, 1);
    assert_eq!(fetcher.one_calls(), 2);
}

#[tokio::test]
async fn test_worker_failure_falls_back_and_reports_direct_error() {
    let fetcher = Arc::new(FakeContentFetcher::new());
    fetcher.set_fail(true);
    let cache = ContentCache::new(config(true), fetcher.clone());

    assert!(matches!(cache.get("x").await, Err(TubeError::Network(_))));
    assert_eq!(cache.cache_status().worker_fallbacks, 1);
}
