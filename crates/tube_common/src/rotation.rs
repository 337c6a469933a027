//! Rotation adapter - the shape the renderer consumes.
//!
//! Slots are "tubes" and units are "stitches" on this side of the boundary.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::types::{DistractorLevel, LearningState, Points};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StitchView {
    pub id: String,
    pub position: u32,
    pub skip_number: u32,
    pub distractor_level: DistractorLevel,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TubeView {
    pub thread_id: String,
    pub current_stitch_id: String,
    pub stitches: Vec<StitchView>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RotationView {
    pub active_tube: u8,
    pub cycle_count: u32,
    pub points: Points,
    pub tubes: BTreeMap<u8, TubeView>,
}

impl RotationView {
    pub fn from_state(state: &LearningState) -> Self {
        let tubes = state
            .rotation_slots
            .iter()
            .map(|(slot, slot_state)| {
                let stitches = slot_state
                    .ordered_units()
                    .into_iter()
                    .map(|unit| StitchView {
                        id: unit.id.clone(),
                        position: unit.position,
                        skip_number: unit.skip_number,
                        distractor_level: unit.distractor_level,
                    })
                    .collect();
                (
                    slot.get(),
                    TubeView {
                        thread_id: slot_state.thread_id.clone(),
                        current_stitch_id: slot_state.current_unit_id.clone(),
                        stitches,
                    },
                )
            })
            .collect();

        Self {
            active_tube: state.active_slot.get(),
            cycle_count: state.cycle_count,
            points: state.points,
            tubes,
        }
    }

    /// The stitch the given tube serves next
    pub fn ready_stitch(&self, tube: u8) -> Option<&StitchView> {
        self.tubes
            .get(&tube)?
            .stitches
            .iter()
            .find(|s| s.position == 0)
    }
}
