//! Tests for identity recovery

use std::fs;
use std::sync::Arc;

use tempfile::tempdir;
use tube_common::identity::{
    AnonymousPolicy, CredentialIdentity, IdentityProvider, IdentityResolver, IdentitySource,
    ProcessFallbackIdentity,
};
use tube_common::persistence::JsonKvStore;
use tube_common::TubeError;

struct Fixed(&'static str);

impl IdentityProvider for Fixed {
    fn name(&self) -> &'static str {
        "fixed"
    }

    fn resolve(&self) -> Option<String> {
        Some(self.0.to_string())
    }
}

struct Empty;

impl IdentityProvider for Empty {
    fn name(&self) -> &'static str {
        "empty"
    }

    fn resolve(&self) -> Option<String> {
        None
    }
}

#[test]
fn test_device_id_beats_credential() {
    let dir = tempdir().unwrap();
    let kv = Arc::new(JsonKvStore::open(dir.path().join("state.json")).unwrap());
    kv.set_device_id("device-user").unwrap();
    let cred = dir.path().join("credentials.json");
    fs::write(&cred, r#"{"user_id": "cred-user"}"#).unwrap();

    let resolver = IdentityResolver::standard(kv, &cred, ProcessFallbackIdentity::new());
    let id = resolver.resolve(None, AnonymousPolicy::Forbid).unwrap();
    assert_eq!(id.user_id, "device-user");
    assert_eq!(id.source, IdentitySource::Provider("device"));
}

#[test]
fn test_expired_credential_still_identifies() {
    let dir = tempdir().unwrap();
    let kv = Arc::new(JsonKvStore::open(dir.path().join("state.json")).unwrap());
    let cred = dir.path().join("credentials.json");
    fs::write(
        &cred,
        r#"{"access_token": "x", "expires_at": 1, "claims": {"sub": "learner-9"}}"#,
    )
    .unwrap();

    let resolver = IdentityResolver::standard(kv, &cred, ProcessFallbackIdentity::new());
    let id = resolver.resolve(None, AnonymousPolicy::Forbid).unwrap();
    assert_eq!(id.user_id, "learner-9");
    assert_eq!(id.source, IdentitySource::Provider("credential"));
    assert!(!id.anonymous);
}

#[test]
fn test_unreadable_credential_is_skipped() {
    let dir = tempdir().unwrap();
    let cred = dir.path().join("credentials.json");
    fs::write(&cred, "not json").unwrap();
    assert!(CredentialIdentity::new(&cred).resolve().is_none());
}

#[test]
fn test_process_fallback_remembers_earlier_resolution() {
    let fallback = ProcessFallbackIdentity::new();
    let first = IdentityResolver::new(fallback.clone());
    first.resolve(Some("learner-3"), AnonymousPolicy::Forbid).unwrap();

    let second = IdentityResolver::new(fallback).with_provider(Empty);
    let id = second.resolve(None, AnonymousPolicy::Forbid).unwrap();
    assert_eq!(id.user_id, "learner-3");
    assert_eq!(id.source, IdentitySource::Provider("process"));
}

#[test]
fn test_providers_are_tried_in_order() {
    let resolver = IdentityResolver::new(ProcessFallbackIdentity::new())
        .with_provider(Empty)
        .with_provider(Fixed("second"))
        .with_provider(Fixed("third"));
    let id = resolver.resolve(None, AnonymousPolicy::Forbid).unwrap();
    assert_eq!(id.user_id, "second");
}

#[test]
fn test_nothing_found_and_minting_forbidden() {
    let resolver = IdentityResolver::new(ProcessFallbackIdentity::new()).with_provider(Empty);
    assert!(matches!(
        resolver.resolve(Some("   "), AnonymousPolicy::Forbid),
        Err(TubeError::IdentityUnavailable)
    ));
}

#[test]
fn test_resolver_never_writes_device_id() {
    let dir = tempdir().unwrap();
    let kv = Arc::new(JsonKvStore::open(dir.path().join("state.json")).unwrap());
    let resolver = IdentityResolver::standard(
        Arc::clone(&kv),
        dir.path().join("missing.json"),
        ProcessFallbackIdentity::new(),
    );

    let id = resolver.resolve(None, AnonymousPolicy::Allow).unwrap();
    assert_eq!(id.source, IdentitySource::Minted);
    assert!(kv.device_id().is_none());
}
