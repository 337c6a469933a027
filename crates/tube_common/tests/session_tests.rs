//! Tests for the practice session composition root

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tempfile::tempdir;
use tube_common::config::{StorageConfig, TubeConfig};
use tube_common::content::FakeContentFetcher;
use tube_common::identity::ProcessFallbackIdentity;
use tube_common::persistence::FakeRemoteStore;
use tube_common::{AnonymousPolicy, PracticeSession, SessionDeps, SlotNumber};

fn config(dir: &Path) -> TubeConfig {
    let mut config = TubeConfig::default();
    config.storage = StorageConfig::in_dir(dir);
    config.sync.endpoint = Some("http://unused".into());
    config.sync.debounce_ms = 20;
    config.cache.worker_enabled = false;
    config
}

fn deps(remote: &Arc<FakeRemoteStore>, fetcher: &Arc<FakeContentFetcher>) -> SessionDeps {
    SessionDeps {
        remote: remote.clone(),
        fetcher: fetcher.clone(),
        fallback: ProcessFallbackIdentity::new(),
    }
}

#[tokio::test]
async fn test_session_completes_and_syncs() {
    let dir = tempdir().unwrap();
    let remote = Arc::new(FakeRemoteStore::new());
    let fetcher = Arc::new(FakeContentFetcher::serving_any());
    let session = PracticeSession::start_with(
        config(dir.path()),
        deps(&remote, &fetcher),
        Some("learner"),
        AnonymousPolicy::Forbid,
    )
    .await
    .unwrap();

    let event = session.completion_for(1, 10, 10).unwrap();
    let ready = event.unit_id.clone();
    let state = session.complete(event).unwrap();
    assert_eq!(state.points.session, 30);
    assert_eq!(
        state.slot(SlotNumber::FIRST).unwrap().unit(&ready).unwrap().position,
        3
    );

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(remote.stored("learner").unwrap(), *session.state());
    assert!(fetcher.batch_calls() >= 1);
}

#[tokio::test]
async fn test_session_rotation_and_view() {
    let dir = tempdir().unwrap();
    let remote = Arc::new(FakeRemoteStore::new());
    let fetcher = Arc::new(FakeContentFetcher::serving_any());
    let session = PracticeSession::start_with(
        config(dir.path()),
        deps(&remote, &fetcher),
        Some("learner"),
        AnonymousPolicy::Forbid,
    )
    .await
    .unwrap();

    session.advance().unwrap();
    session.advance().unwrap();
    let state = session.cycle_to(1).unwrap();
    assert_eq!(state.cycle_count, 1);
    assert!(session.cycle_to(4).is_err());

    let view = session.view();
    assert_eq!(view.active_tube, 1);
    assert_eq!(view.cycle_count, 1);
}

#[tokio::test]
async fn test_session_refuses_to_start_without_identity() {
    let dir = tempdir().unwrap();
    let remote = Arc::new(FakeRemoteStore::new());
    let fetcher = Arc::new(FakeContentFetcher::serving_any());
    let result = PracticeSession::start_with(
        config(dir.path()),
        deps(&remote, &fetcher),
        None,
        AnonymousPolicy::Forbid,
    )
    .await;
    assert!(result.is_err());
    assert_eq!(remote.push_count(), 0);
}

#[tokio::test]
async fn test_shutdown_flushes_and_state_survives_restart() {
    let dir = tempdir().unwrap();
    let remote = Arc::new(FakeRemoteStore::new());
    let fetcher = Arc::new(FakeContentFetcher::serving_any());

    let before = {
        let session = PracticeSession::start_with(
            config(dir.path()),
            deps(&remote, &fetcher),
            Some("learner"),
            AnonymousPolicy::Forbid,
        )
        .await
        .unwrap();
        session.advance().unwrap();
        let state = session.state();
        if let Some(flush) = session.shutdown() {
            flush.await.unwrap();
        }
        state
    };
    assert_eq!(remote.stored("learner").unwrap(), *before);

    let session = PracticeSession::start_with(
        config(dir.path()),
        deps(&remote, &fetcher),
        Some("learner"),
        AnonymousPolicy::Forbid,
    )
    .await
    .unwrap();
    assert_eq!(*session.state(), *before);
}
