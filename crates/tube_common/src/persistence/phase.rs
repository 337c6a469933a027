//! Remote sync state machine.
//!
//! ```text
//!            Start                 Write
//!   Idle ──────────▶ Syncing ──────────▶ SyncingWithPending
//!    ▲                  │                        │
//!    └──── Finished ────┘                        │ Finished
//!                       ▲────────────────────────┘ (rescheduled)
//! ```
//!
//! At most one remote push is in flight per manager. A write landing while a
//! push runs only raises the pending flag; the push that follows carries the
//! newest snapshot.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPhase {
    #[default]
    Idle,
    Syncing,
    SyncingWithPending,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncSignal {
    /// A debounced push is about to run
    Start,
    /// A local write landed
    Write,
    /// The in-flight push completed, successfully or not
    Finished,
}

impl SyncPhase {
    /// Next phase. Signals that make no sense in the current phase leave it unchanged.
    pub fn on(self, signal: SyncSignal) -> SyncPhase {
        match (self, signal) {
            (SyncPhase::Idle, SyncSignal::Start) => SyncPhase::Syncing,
            (SyncPhase::Idle, _) => SyncPhase::Idle,
            (SyncPhase::Syncing, SyncSignal::Write) => SyncPhase::SyncingWithPending,
            (SyncPhase::Syncing, SyncSignal::Finished) => SyncPhase::Idle,
            (SyncPhase::Syncing, SyncSignal::Start) => SyncPhase::Syncing,
            (SyncPhase::SyncingWithPending, SyncSignal::Finished) => SyncPhase::Idle,
            (SyncPhase::SyncingWithPending, _) => SyncPhase::SyncingWithPending,
        }
    }

    pub fn can_start(self) -> bool {
        self == SyncPhase::Idle
    }

    pub fn is_syncing(self) -> bool {
        self != SyncPhase::Idle
    }
}

impl fmt::Display for SyncPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SyncPhase::Idle => "idle",
            SyncPhase::Syncing => "syncing",
            SyncPhase::SyncingWithPending => "syncing (pending)",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_during_sync_raises_pending() {
        let phase = SyncPhase::Idle.on(SyncSignal::Start).on(SyncSignal::Write);
        assert_eq!(phase, SyncPhase::SyncingWithPending);
        assert_eq!(phase.on(SyncSignal::Write), SyncPhase::SyncingWithPending);
        assert_eq!(phase.on(SyncSignal::Finished), SyncPhase::Idle);
    }

    #[test]
    fn test_second_start_is_refused_while_syncing() {
        let phase = SyncPhase::Idle.on(SyncSignal::Start);
        assert!(!phase.can_start());
        assert_eq!(phase.on(SyncSignal::Start), SyncPhase::Syncing);
    }

    #[test]
    fn test_idle_ignores_stray_signals() {
        assert_eq!(SyncPhase::Idle.on(SyncSignal::Write), SyncPhase::Idle);
        assert_eq!(SyncPhase::Idle.on(SyncSignal::Finished), SyncPhase::Idle);
    }
}
