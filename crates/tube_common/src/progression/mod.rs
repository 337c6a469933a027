//! Progression engine - pure transforms from one learning state to the next.
//!
//! Nothing here touches the clock, storage or the network: given the same
//! state, event and rules, every function returns the same result. Rejected
//! events return an error and leave the caller's state untouched.

mod normalize;

pub use normalize::{normalize, normalize_with_report, Repair};

use std::collections::BTreeSet;

use crate::config::ProgressionConfig;
use crate::error::{Result, TubeError};
use crate::types::{CompletionEvent, LearningState, SlotNumber, SlotState, Unit};

/// Apply a completed exercise set.
///
/// Perfect score: the ready unit moves to the position given by its skip
/// number, then its skip number and distractor level escalate, and a freshly
/// minted unit becomes ready. Otherwise the ready unit stays put. Points grow
/// by `correct_count * points_per_correct` either way.
pub fn apply(
    state: &LearningState,
    event: &CompletionEvent,
    rules: &ProgressionConfig,
) -> Result<LearningState> {
    let slot = SlotNumber::new(event.slot, rules.slot_count)?;
    if event.correct_count > event.total_count {
        return Err(TubeError::InvalidEvent(format!(
            "correct_count {} exceeds total_count {}",
            event.correct_count, event.total_count
        )));
    }

    let mut next = normalize(state, rules);
    let slot_state = next
        .rotation_slots
        .get_mut(&slot)
        .ok_or_else(|| TubeError::Structural(format!("slot {} missing after normalize", slot)))?;

    if event.thread_id != slot_state.thread_id {
        return Err(TubeError::StaleEvent(format!(
            "slot {} holds thread {}, event names {}",
            slot, slot_state.thread_id, event.thread_id
        )));
    }
    if event.unit_id != slot_state.current_unit_id {
        return Err(TubeError::StaleEvent(format!(
            "slot {} is serving {}, event names {}",
            slot, slot_state.current_unit_id, event.unit_id
        )));
    }

    slot_state.position += 1;
    if event.is_perfect() {
        advance_ready_unit(slot_state, rules)?;
    }

    next.points.add(u64::from(event.correct_count) * rules.points_per_correct);
    Ok(next)
}

fn advance_ready_unit(slot: &mut SlotState, rules: &ProgressionConfig) -> Result<()> {
    let idx = slot
        .units
        .iter()
        .position(|u| u.position == 0)
        .ok_or_else(|| TubeError::Structural(format!("thread {} has no ready unit", slot.thread_id)))?;
    let mut completed = slot.units.remove(idx);

    let target = completed.skip_number.max(1);
    completed.skip_number = rules.escalate_skip(completed.skip_number);
    completed.distractor_level = completed.distractor_level.escalate(rules.distractor_ceiling);
    insert_shifting(&mut slot.units, completed, target);

    let id = normalize::mint_unit_id(slot);
    let fresh = Unit::fresh(id.clone(), slot.thread_id.clone(), 0, rules.first_skip());
    slot.units.push(fresh);
    slot.current_unit_id = id;
    slot.units.sort_by_key(|u| u.position);
    Ok(())
}

/// Place `unit` at `target`; units on the contiguous run starting there move
/// up by one so positions stay unique. When that run reaches `u32::MAX` the
/// unit takes the lowest free position instead and nothing shifts.
fn insert_shifting(units: &mut Vec<Unit>, mut unit: Unit, target: u32) {
    let occupied: BTreeSet<u32> = units.iter().map(|u| u.position).collect();
    if !occupied.contains(&target) {
        unit.position = target;
        units.push(unit);
        return;
    }

    match normalize::free_position_above(&occupied, target) {
        Some(gap) => {
            for u in units.iter_mut() {
                if u.position >= target && u.position < gap {
                    u.position += 1;
                }
            }
            unit.position = target;
        }
        None => unit.position = normalize::lowest_free_position(&occupied),
    }
    units.push(unit);
}

/// Move the rotation from `from` to `to`. The cycle count grows only when
/// the rotation wraps from the last slot to the first.
pub fn cycle_slot(
    state: &LearningState,
    from: u8,
    to: u8,
    rules: &ProgressionConfig,
) -> Result<LearningState> {
    let from = SlotNumber::new(from, rules.slot_count)?;
    let to = SlotNumber::new(to, rules.slot_count)?;

    let mut next = state.clone();
    next.active_slot = to;
    if from.get() == rules.slot_count && to == SlotNumber::FIRST {
        next.cycle_count += 1;
    }
    Ok(next)
}

/// Slot that follows the active one in rotation order
pub fn next_slot(state: &LearningState, rules: &ProgressionConfig) -> SlotNumber {
    state.active_slot.successor(rules.slot_count)
}

/// Rotate from the active slot to its successor
pub fn advance(state: &LearningState, rules: &ProgressionConfig) -> Result<LearningState> {
    let to = next_slot(state, rules);
    cycle_slot(state, state.active_slot.get(), to.get(), rules)
}

/// Unit ids the player needs soon: each slot's ready unit and the next
/// `lookahead` positions, active slot first.
pub fn upcoming_unit_ids(state: &LearningState, lookahead: u32, rules: &ProgressionConfig) -> Vec<String> {
    let mut ids = Vec::new();
    let mut slot = state.active_slot;
    for _ in 0..rules.slot_count {
        if let Some(slot_state) = state.slot(slot) {
            for unit in slot_state.ordered_units() {
                if unit.position > lookahead {
                    break;
                }
                if !ids.contains(&unit.id) {
                    ids.push(unit.id.clone());
                }
            }
        }
        slot = slot.successor(rules.slot_count);
    }
    ids
}
