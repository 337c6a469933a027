//! Core learning-state types shared by every component.
//!
//! A learner's [`LearningState`] owns exactly one [`SlotState`] per rotation
//! slot ("tube"). Each slot holds the units ("stitches") of one thread, keyed
//! by position; the unit at position 0 is the one served next.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::error::{Result, TubeError};

/// Current wall-clock time in epoch milliseconds
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Rotation slot number, 1-based
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SlotNumber(u8);

impl SlotNumber {
    pub const FIRST: SlotNumber = SlotNumber(1);

    /// Validate `n` against the configured slot count
    pub fn new(n: u8, slot_count: u8) -> Result<Self> {
        if n == 0 || n > slot_count {
            return Err(TubeError::InvalidSlot {
                slot: n,
                max: slot_count,
            });
        }
        Ok(SlotNumber(n))
    }

    pub fn get(self) -> u8 {
        self.0
    }

    /// The slot after this one, wrapping from the last back to the first
    pub fn successor(self, slot_count: u8) -> SlotNumber {
        if self.0 >= slot_count {
            SlotNumber::FIRST
        } else {
            SlotNumber(self.0 + 1)
        }
    }
}

impl fmt::Display for SlotNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Difficulty tier of the wrong-answer options shown for a unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum DistractorLevel {
    L1,
    L2,
    L3,
}

impl DistractorLevel {
    /// Next tier up, never past `ceiling`
    pub fn escalate(self, ceiling: DistractorLevel) -> DistractorLevel {
        let next = match self {
            DistractorLevel::L1 => DistractorLevel::L2,
            DistractorLevel::L2 | DistractorLevel::L3 => DistractorLevel::L3,
        };
        next.min(ceiling).max(self)
    }
}

impl Default for DistractorLevel {
    fn default() -> Self {
        DistractorLevel::L1
    }
}

impl fmt::Display for DistractorLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DistractorLevel::L1 => "L1",
            DistractorLevel::L2 => "L2",
            DistractorLevel::L3 => "L3",
        };
        f.write_str(s)
    }
}

/// Question content for a unit, as served by the content endpoints.
///
/// Questions are opaque to the core; only the renderer interprets them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StitchContent {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default)]
    pub questions: Vec<serde_json::Value>,
}

/// One schedulable block of exercises ("stitch")
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Unit {
    pub id: String,
    pub thread_id: String,
    pub position: u32,
    pub skip_number: u32,
    #[serde(default)]
    pub distractor_level: DistractorLevel,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<StitchContent>,
}

impl Unit {
    /// A fresh unit at the bottom of the skip ladder
    pub fn fresh(id: impl Into<String>, thread_id: impl Into<String>, position: u32, first_skip: u32) -> Self {
        Self {
            id: id.into(),
            thread_id: thread_id.into(),
            position,
            skip_number: first_skip,
            distractor_level: DistractorLevel::L1,
            content: None,
        }
    }
}

/// Progression state of one rotation slot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SlotState {
    pub thread_id: String,
    pub current_unit_id: String,
    /// Completed sets in this slot
    #[serde(default)]
    pub position: u32,
    /// Units ordered by position. Loaded data may violate uniqueness until
    /// normalized; everything produced by the engine keeps one unit per position.
    #[serde(default)]
    pub units: Vec<Unit>,
    /// Sequence feeding deterministic ids for minted units
    #[serde(default = "default_next_sequence")]
    pub next_sequence: u32,
}

fn default_next_sequence() -> u32 {
    1
}

impl SlotState {
    /// Materialize a thread with `unit_count` units at positions 0..unit_count
    pub fn materialize(thread_id: &str, unit_count: u32, first_skip: u32) -> Self {
        let count = unit_count.max(1);
        let units: Vec<Unit> = (0..count)
            .map(|pos| Unit::fresh(format!("{}-{:04}", thread_id, pos + 1), thread_id, pos, first_skip))
            .collect();
        Self {
            thread_id: thread_id.to_string(),
            current_unit_id: units[0].id.clone(),
            position: 0,
            units,
            next_sequence: count + 1,
        }
    }

    pub fn unit_at(&self, position: u32) -> Option<&Unit> {
        self.units.iter().find(|u| u.position == position)
    }

    pub fn unit(&self, id: &str) -> Option<&Unit> {
        self.units.iter().find(|u| u.id == id)
    }

    /// The unit served next (position 0)
    pub fn ready_unit(&self) -> Option<&Unit> {
        self.unit_at(0)
    }

    /// Units in position order
    pub fn ordered_units(&self) -> Vec<&Unit> {
        let mut units: Vec<&Unit> = self.units.iter().collect();
        units.sort_by_key(|u| u.position);
        units
    }

    /// True when every position is held by at most one unit and position 0
    /// holds `current_unit_id`
    pub fn is_consistent(&self) -> bool {
        let mut seen = std::collections::BTreeSet::new();
        for unit in &self.units {
            if !seen.insert(unit.position) {
                return false;
            }
        }
        self.ready_unit()
            .map(|u| u.id == self.current_unit_id)
            .unwrap_or(false)
    }
}

/// Points earned, in this session and over the learner's lifetime
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Points {
    #[serde(default)]
    pub session: u64,
    #[serde(default)]
    pub lifetime: u64,
}

impl Points {
    pub fn add(&mut self, amount: u64) {
        self.session += amount;
        self.lifetime += amount;
    }
}

/// Per-user progression state. The in-memory store holds the only writable
/// copy; every storage tier holds a snapshot of it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LearningState {
    pub user_id: String,
    pub rotation_slots: BTreeMap<SlotNumber, SlotState>,
    pub active_slot: SlotNumber,
    #[serde(default)]
    pub cycle_count: u32,
    #[serde(default)]
    pub points: Points,
    /// Epoch milliseconds of the last applied change
    #[serde(default)]
    pub last_updated: i64,
}

impl LearningState {
    /// Fresh state with one thread per slot
    pub fn with_threads(user_id: &str, threads: &[String], units_per_thread: u32, first_skip: u32) -> Self {
        let rotation_slots = threads
            .iter()
            .enumerate()
            .map(|(i, thread)| {
                (
                    SlotNumber((i + 1) as u8),
                    SlotState::materialize(thread, units_per_thread, first_skip),
                )
            })
            .collect();
        Self {
            user_id: user_id.to_string(),
            rotation_slots,
            active_slot: SlotNumber::FIRST,
            cycle_count: 0,
            points: Points::default(),
            last_updated: 0,
        }
    }

    pub fn slot(&self, slot: SlotNumber) -> Option<&SlotState> {
        self.rotation_slots.get(&slot)
    }

    pub fn active(&self) -> Option<&SlotState> {
        self.slot(self.active_slot)
    }
}

/// A learner finished one exercise set
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionEvent {
    pub slot: u8,
    pub thread_id: String,
    pub unit_id: String,
    pub correct_count: u32,
    pub total_count: u32,
    #[serde(default)]
    pub timestamp: i64,
}

impl CompletionEvent {
    /// Every question answered correctly. An empty set is never perfect.
    pub fn is_perfect(&self) -> bool {
        self.total_count > 0 && self.correct_count == self.total_count
    }
}

/// Storage tiers, most authoritative first
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageTier {
    Remote,
    Structured,
    KeyValue,
    Memory,
}

impl fmt::Display for StorageTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StorageTier::Remote => "remote",
            StorageTier::Structured => "structured",
            StorageTier::KeyValue => "key_value",
            StorageTier::Memory => "memory",
        };
        f.write_str(s)
    }
}

/// A state snapshot as held by one storage tier
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncRecord {
    pub user_id: String,
    pub state: LearningState,
    pub timestamp: i64,
    pub origin_tier: StorageTier,
}

impl SyncRecord {
    pub fn new(state: &LearningState, origin_tier: StorageTier) -> Self {
        Self {
            user_id: state.user_id.clone(),
            state: state.clone(),
            timestamp: state.last_updated,
            origin_tier,
        }
    }
}
