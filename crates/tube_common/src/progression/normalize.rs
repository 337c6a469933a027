//! Structural repair for loaded learning states.
//!
//! Snapshots arriving from storage or a merge can carry two units on one
//! position, a ready unit that disagrees with `current_unit_id`, or missing
//! slots. [`normalize`] maps any such state to one that satisfies the slot
//! invariants, deterministically and without side effects. It is idempotent.

use std::collections::BTreeSet;

use crate::config::ProgressionConfig;
use crate::types::{LearningState, SlotNumber, SlotState, Unit};

/// One repair performed by [`normalize_with_report`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Repair {
    /// A unit lost a duplicate position and moved to the next free one
    ShiftedDuplicate {
        slot: u8,
        unit_id: String,
        from: u32,
        to: u32,
    },
    /// The unit named by `current_unit_id` was moved to position 0
    PromotedCurrent { slot: u8, unit_id: String },
    /// `current_unit_id` named no unit; the lowest-positioned unit became ready
    ReassignedCurrent { slot: u8, unit_id: String },
    /// The slot had no units; a fresh one was minted
    MintedReady { slot: u8, unit_id: String },
    /// A configured slot was missing and was materialized
    MaterializedSlot { slot: u8, thread_id: String },
    /// A slot beyond the configured count was dropped
    DroppedSlot { slot: u8 },
    /// `active_slot` pointed outside the configured slots
    ResetActiveSlot { from: u8 },
}

/// Normalize, discarding the repair report
pub fn normalize(state: &LearningState, rules: &ProgressionConfig) -> LearningState {
    normalize_with_report(state, rules).0
}

/// Normalize and report what was repaired. An empty report means the input
/// already satisfied every invariant and is returned unchanged.
pub fn normalize_with_report(
    state: &LearningState,
    rules: &ProgressionConfig,
) -> (LearningState, Vec<Repair>) {
    let mut next = state.clone();
    let mut repairs = Vec::new();

    let extra: Vec<SlotNumber> = next
        .rotation_slots
        .keys()
        .copied()
        .filter(|s| s.get() == 0 || s.get() > rules.slot_count)
        .collect();
    for slot in extra {
        next.rotation_slots.remove(&slot);
        repairs.push(Repair::DroppedSlot { slot: slot.get() });
    }

    for n in 1..=rules.slot_count {
        let Ok(slot) = SlotNumber::new(n, rules.slot_count) else {
            continue;
        };
        if !next.rotation_slots.contains_key(&slot) {
            let thread_id = rules
                .default_threads
                .get(n as usize - 1)
                .cloned()
                .unwrap_or_else(|| format!("t{}", n));
            next.rotation_slots.insert(
                slot,
                SlotState::materialize(&thread_id, rules.units_per_thread, rules.first_skip()),
            );
            repairs.push(Repair::MaterializedSlot { slot: n, thread_id });
        }
    }

    if SlotNumber::new(next.active_slot.get(), rules.slot_count).is_err() {
        repairs.push(Repair::ResetActiveSlot {
            from: next.active_slot.get(),
        });
        next.active_slot = SlotNumber::FIRST;
    }

    for (slot, slot_state) in next.rotation_slots.iter_mut() {
        repair_slot(slot.get(), slot_state, rules, &mut repairs);
    }

    (next, repairs)
}

fn repair_slot(slot: u8, state: &mut SlotState, rules: &ProgressionConfig, repairs: &mut Vec<Repair>) {
    dedupe_positions(slot, &mut state.units, repairs);

    if state.units.is_empty() {
        let id = mint_unit_id(state);
        state.units.push(Unit::fresh(id.clone(), state.thread_id.clone(), 0, rules.first_skip()));
        state.current_unit_id = id.clone();
        repairs.push(Repair::MintedReady { slot, unit_id: id });
    }

    let current_idx = state.units.iter().position(|u| u.id == state.current_unit_id);
    match current_idx {
        Some(idx) if state.units[idx].position != 0 => {
            // swap with whatever sits at 0 so positions stay unique
            let old_pos = state.units[idx].position;
            if let Some(ready) = state.units.iter_mut().find(|u| u.position == 0) {
                ready.position = old_pos;
            }
            state.units[idx].position = 0;
            repairs.push(Repair::PromotedCurrent {
                slot,
                unit_id: state.current_unit_id.clone(),
            });
        }
        Some(_) => {}
        None => {
            let lowest = state
                .units
                .iter()
                .enumerate()
                .min_by_key(|(_, u)| u.position)
                .map(|(i, _)| i);
            if let Some(i) = lowest {
                state.units[i].position = 0;
                state.current_unit_id = state.units[i].id.clone();
                repairs.push(Repair::ReassignedCurrent {
                    slot,
                    unit_id: state.current_unit_id.clone(),
                });
            }
        }
    }

    state.units.sort_by_key(|u| u.position);
}

/// First unit seen on a position keeps it; later ones move to the next free
/// position above their original one, in insertion order. A unit with no
/// free position above it takes the lowest free one instead.
fn dedupe_positions(slot: u8, units: &mut [Unit], repairs: &mut Vec<Repair>) {
    let mut occupied = BTreeSet::new();
    let mut displaced = Vec::new();
    for (i, unit) in units.iter().enumerate() {
        if !occupied.insert(unit.position) {
            displaced.push(i);
        }
    }

    for i in displaced {
        let from = units[i].position;
        let to = free_position_above(&occupied, from).unwrap_or_else(|| lowest_free_position(&occupied));
        occupied.insert(to);
        units[i].position = to;
        repairs.push(Repair::ShiftedDuplicate {
            slot,
            unit_id: units[i].id.clone(),
            from,
            to,
        });
    }
}

/// Next unoccupied position strictly above `from`, if one exists below `u32::MAX`
pub(crate) fn free_position_above(occupied: &BTreeSet<u32>, from: u32) -> Option<u32> {
    let mut candidate = from.checked_add(1)?;
    while occupied.contains(&candidate) {
        candidate = candidate.checked_add(1)?;
    }
    Some(candidate)
}

/// Lowest unoccupied position behind the ready unit
pub(crate) fn lowest_free_position(occupied: &BTreeSet<u32>) -> u32 {
    (1..=u32::MAX).find(|p| !occupied.contains(p)).unwrap_or(u32::MAX)
}

/// Deterministic id for a new unit: `{thread}-{seq:04}`, skipping ids in use
pub(crate) fn mint_unit_id(state: &mut SlotState) -> String {
    loop {
        let candidate = format!("{}-{:04}", state.thread_id, state.next_sequence);
        state.next_sequence += 1;
        if state.unit(&candidate).is_none() {
            return candidate;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rules() -> ProgressionConfig {
        ProgressionConfig::default()
    }

    fn slot_with(units: Vec<Unit>, current: &str) -> SlotState {
        SlotState {
            thread_id: "t1".into(),
            current_unit_id: current.into(),
            position: 0,
            units,
            next_sequence: 100,
        }
    }

    fn state_with_slot(slot: SlotState) -> LearningState {
        let mut state = LearningState::with_threads(
            "u1",
            &["t1".to_string(), "t2".to_string(), "t3".to_string()],
            3,
            3,
        );
        state.rotation_slots.insert(SlotNumber::FIRST, slot);
        state
    }

    #[test]
    fn test_clean_state_is_untouched() {
        let state = LearningState::with_threads(
            "u1",
            &["t1".to_string(), "t2".to_string(), "t3".to_string()],
            5,
            3,
        );
        let (out, repairs) = normalize_with_report(&state, &rules());
        assert!(repairs.is_empty());
        assert_eq!(out, state);
    }

    #[test]
    fn test_first_seen_keeps_duplicate_position() {
        let slot = slot_with(
            vec![
                Unit::fresh("a", "t1", 0, 3),
                Unit::fresh("b", "t1", 2, 3),
                Unit::fresh("c", "t1", 2, 3),
                Unit::fresh("d", "t1", 3, 3),
            ],
            "a",
        );
        let out = normalize(&state_with_slot(slot), &rules());
        let slot = out.slot(SlotNumber::FIRST).unwrap();
        assert_eq!(slot.unit("b").unwrap().position, 2);
        assert_eq!(slot.unit("c").unwrap().position, 4);
        assert_eq!(slot.unit("d").unwrap().position, 3);
        assert!(slot.is_consistent());
    }

    #[test]
    fn test_current_unit_promoted_to_ready() {
        let slot = slot_with(
            vec![Unit::fresh("a", "t1", 0, 3), Unit::fresh("b", "t1", 4, 3)],
            "b",
        );
        let (out, repairs) = normalize_with_report(&state_with_slot(slot), &rules());
        let slot = out.slot(SlotNumber::FIRST).unwrap();
        assert_eq!(slot.ready_unit().unwrap().id, "b");
        assert_eq!(slot.unit("a").unwrap().position, 4);
        assert!(matches!(repairs[0], Repair::PromotedCurrent { .. }));
    }

    #[test]
    fn test_unknown_current_unit_reassigned() {
        let slot = slot_with(
            vec![Unit::fresh("x", "t1", 2, 3), Unit::fresh("y", "t1", 5, 3)],
            "gone",
        );
        let out = normalize(&state_with_slot(slot), &rules());
        let slot = out.slot(SlotNumber::FIRST).unwrap();
        assert_eq!(slot.current_unit_id, "x");
        assert_eq!(slot.ready_unit().unwrap().id, "x");
    }

    #[test]
    fn test_empty_slot_gets_minted_ready_unit() {
        let slot = slot_with(vec![], "gone");
        let out = normalize(&state_with_slot(slot), &rules());
        let slot = out.slot(SlotNumber::FIRST).unwrap();
        assert_eq!(slot.current_unit_id, "t1-0100");
        assert!(slot.is_consistent());
    }

    #[test]
    fn test_missing_slot_materialized_and_active_reset() {
        let mut state = LearningState::with_threads("u1", &["t1".to_string()], 2, 3);
        state.active_slot = SlotNumber::new(9, 9).unwrap();
        let (out, repairs) = normalize_with_report(&state, &rules());
        assert_eq!(out.rotation_slots.len(), 3);
        assert_eq!(out.active_slot, SlotNumber::FIRST);
        assert!(repairs.contains(&Repair::ResetActiveSlot { from: 9 }));
    }

    #[test]
    fn test_normalize_is_idempotent() {
        let slot = slot_with(
            vec![
                Unit::fresh("a", "t1", 1, 3),
                Unit::fresh("b", "t1", 1, 3),
                Unit::fresh("c", "t1", 1, 3),
            ],
            "c",
        );
        let once = normalize(&state_with_slot(slot), &rules());
        let (twice, repairs) = normalize_with_report(&once, &rules());
        assert!(repairs.is_empty());
        assert_eq!(once, twice);
    }

    #[test]
    fn test_free_position_search_stops_at_top() {
        let occupied: BTreeSet<u32> = [0, 1, u32::MAX - 1, u32::MAX].into_iter().collect();
        assert_eq!(free_position_above(&occupied, u32::MAX - 2), None);
        assert_eq!(free_position_above(&occupied, 0), Some(2));
        assert_eq!(lowest_free_position(&occupied), 2);
    }
}
