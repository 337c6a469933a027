//! Identity resolution.
//!
//! When the caller supplies no user id, an ordered list of providers is tried:
//! stored device id, cached credential, then the process-wide fallback. Only
//! if all of them come up empty, and the caller explicitly allowed it, is a new
//! anonymous id minted. Providers read; they never write. Persisting a minted
//! id is the sync manager's job.

use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock, PoisonError, RwLock};
use tracing::{debug, info};

use crate::error::{Result, TubeError};
use crate::persistence::JsonKvStore;

/// Prefix of minted anonymous ids
pub const ANON_PREFIX: &str = "anon-";

/// One identity recovery strategy
pub trait IdentityProvider: Send + Sync {
    fn name(&self) -> &'static str;

    fn resolve(&self) -> Option<String>;
}

/// Whether resolution may mint a new anonymous identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AnonymousPolicy {
    #[default]
    Forbid,
    Allow,
}

impl AnonymousPolicy {
    pub fn from_allow(allow: bool) -> Self {
        if allow {
            AnonymousPolicy::Allow
        } else {
            AnonymousPolicy::Forbid
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentitySource {
    Caller,
    Provider(&'static str),
    Minted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedIdentity {
    pub user_id: String,
    pub source: IdentitySource,
    pub anonymous: bool,
}

impl ResolvedIdentity {
    fn new(user_id: String, source: IdentitySource) -> Self {
        let anonymous = source == IdentitySource::Minted || user_id.starts_with(ANON_PREFIX);
        Self {
            user_id,
            source,
            anonymous,
        }
    }

    /// Newly minted ids have not been written anywhere yet
    pub fn is_minted(&self) -> bool {
        self.source == IdentitySource::Minted
    }
}

// ============================================================================
// Providers
// ============================================================================

/// Device id stored in the key-value tier
pub struct StoredDeviceIdentity {
    kv: Arc<JsonKvStore>,
}

impl StoredDeviceIdentity {
    pub fn new(kv: Arc<JsonKvStore>) -> Self {
        Self { kv }
    }
}

impl IdentityProvider for StoredDeviceIdentity {
    fn name(&self) -> &'static str {
        "device"
    }

    fn resolve(&self) -> Option<String> {
        self.kv.device_id()
    }
}

/// User id embedded in a cached auth credential.
///
/// Expiry is not checked: an expired credential still says who the learner is.
pub struct CredentialIdentity {
    path: PathBuf,
}

impl CredentialIdentity {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl IdentityProvider for CredentialIdentity {
    fn name(&self) -> &'static str {
        "credential"
    }

    fn resolve(&self) -> Option<String> {
        let content = fs::read_to_string(&self.path).ok()?;
        let json: Value = match serde_json::from_str(&content) {
            Ok(v) => v,
            Err(e) => {
                debug!(path = %self.path.display(), error = %e, "Credential unreadable");
                return None;
            }
        };
        credential_user_id(&json)
    }
}

fn credential_user_id(json: &Value) -> Option<String> {
    [
        json.get("user_id"),
        json.get("user").and_then(|u| u.get("id")),
        json.get("claims").and_then(|c| c.get("sub")),
    ]
    .into_iter()
    .flatten()
    .filter_map(Value::as_str)
    .map(str::trim)
    .find(|id| !id.is_empty())
    .map(str::to_string)
}

/// Id remembered from an earlier resolution in this process.
///
/// Clones share the same slot.
#[derive(Debug, Clone, Default)]
pub struct ProcessFallbackIdentity {
    slot: Arc<RwLock<Option<String>>>,
}

static PROCESS_FALLBACK: OnceLock<ProcessFallbackIdentity> = OnceLock::new();

impl ProcessFallbackIdentity {
    pub fn new() -> Self {
        Self::default()
    }

    /// The slot shared by every session in this process
    pub fn shared() -> Self {
        PROCESS_FALLBACK.get_or_init(Self::default).clone()
    }

    pub fn set(&self, user_id: &str) {
        *self.slot.write().unwrap_or_else(PoisonError::into_inner) = Some(user_id.to_string());
    }

    pub fn get(&self) -> Option<String> {
        self.slot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl IdentityProvider for ProcessFallbackIdentity {
    fn name(&self) -> &'static str {
        "process"
    }

    fn resolve(&self) -> Option<String> {
        self.get()
    }
}

// ============================================================================
// Resolver
// ============================================================================

pub struct IdentityResolver {
    providers: Vec<Box<dyn IdentityProvider>>,
    fallback: ProcessFallbackIdentity,
}

impl IdentityResolver {
    /// Resolver with no providers besides the process fallback
    pub fn new(fallback: ProcessFallbackIdentity) -> Self {
        Self {
            providers: Vec::new(),
            fallback,
        }
    }

    /// Device id, then credential, then process fallback
    pub fn standard(kv: Arc<JsonKvStore>, credential_path: impl Into<PathBuf>, fallback: ProcessFallbackIdentity) -> Self {
        Self::new(fallback)
            .with_provider(StoredDeviceIdentity::new(kv))
            .with_provider(CredentialIdentity::new(credential_path))
    }

    /// Append a provider, tried before the process fallback
    pub fn with_provider<P: IdentityProvider + 'static>(mut self, provider: P) -> Self {
        self.providers.push(Box::new(provider));
        self
    }

    pub fn fallback(&self) -> &ProcessFallbackIdentity {
        &self.fallback
    }

    /// Establish the identity for a session.
    ///
    /// Fails with `IdentityUnavailable` when nothing is found and `policy`
    /// forbids minting.
    pub fn resolve(&self, requested: Option<&str>, policy: AnonymousPolicy) -> Result<ResolvedIdentity> {
        let resolved = self.lookup(requested).or_else(|| match policy {
            AnonymousPolicy::Allow => {
                let id = format!("{}{}", ANON_PREFIX, uuid::Uuid::new_v4());
                info!(user_id = %id, "Minted anonymous identity");
                Some(ResolvedIdentity::new(id, IdentitySource::Minted))
            }
            AnonymousPolicy::Forbid => None,
        });

        match resolved {
            Some(identity) => {
                self.fallback.set(&identity.user_id);
                debug!(user_id = %identity.user_id, source = ?identity.source, "Identity resolved");
                Ok(identity)
            }
            None => Err(TubeError::IdentityUnavailable),
        }
    }

    fn lookup(&self, requested: Option<&str>) -> Option<ResolvedIdentity> {
        if let Some(id) = requested.map(str::trim).filter(|id| !id.is_empty()) {
            return Some(ResolvedIdentity::new(id.to_string(), IdentitySource::Caller));
        }

        let fallback: &(dyn IdentityProvider + 'static) = &self.fallback;
        self.providers
            .iter()
            .map(|p| p.as_ref())
            .chain(std::iter::once(fallback))
            .find_map(|provider| {
                provider
                    .resolve()
                    .map(|id| ResolvedIdentity::new(id, IdentitySource::Provider(provider.name())))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_credential_field_order() {
        assert_eq!(
            credential_user_id(&json!({"user_id": "a", "user": {"id": "b"}})).as_deref(),
            Some("a")
        );
        assert_eq!(
            credential_user_id(&json!({"user": {"id": "b"}, "claims": {"sub": "c"}})).as_deref(),
            Some("b")
        );
        assert_eq!(
            credential_user_id(&json!({"claims": {"sub": "c"}, "expires_at": 0})).as_deref(),
            Some("c")
        );
        assert!(credential_user_id(&json!({"user_id": "  "})).is_none());
    }

    #[test]
    fn test_caller_id_wins() {
        let resolver = IdentityResolver::new(ProcessFallbackIdentity::new());
        let id = resolver.resolve(Some("learner-1"), AnonymousPolicy::Forbid).unwrap();
        assert_eq!(id.source, IdentitySource::Caller);
        assert!(!id.anonymous);
        assert_eq!(resolver.fallback().get().as_deref(), Some("learner-1"));
    }

    #[test]
    fn test_forbid_policy_refuses_to_mint() {
        let resolver = IdentityResolver::new(ProcessFallbackIdentity::new());
        let err = resolver.resolve(None, AnonymousPolicy::Forbid).unwrap_err();
        assert!(matches!(err, TubeError::IdentityUnavailable));
        assert!(resolver.fallback().get().is_none());
    }

    #[test]
    fn test_minted_id_shape() {
        let resolver = IdentityResolver::new(ProcessFallbackIdentity::new());
        let id = resolver.resolve(Some(""), AnonymousPolicy::Allow).unwrap();
        assert!(id.user_id.starts_with(ANON_PREFIX));
        assert!(id.anonymous);
        assert!(id.is_minted());
    }
}
