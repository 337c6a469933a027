//! Tube Common - progression and persistence core of the tube practice player.
//!
//! A learner rotates through three tubes, each holding a thread of stitches.
//! Perfect scores push a stitch further back (spaced review); everything else
//! leaves it in front. State lives in one store per session and is mirrored
//! to local tiers and a remote backend by the sync manager.

pub mod config;
pub mod content;
pub mod error;
pub mod identity;
pub mod persistence;
pub mod progression;
pub mod rotation;
pub mod session;
pub mod store;
pub mod types;
pub mod wire;

pub use config::TubeConfig;
pub use error::{ErrorCategory, Result, TubeError};
pub use identity::{AnonymousPolicy, IdentityResolver, ResolvedIdentity};
pub use rotation::RotationView;
pub use session::{PracticeSession, SessionDeps};
pub use store::{LearningStateStore, StoreAction, Subscription};
pub use types::*;
