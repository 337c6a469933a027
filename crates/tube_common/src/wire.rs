//! Request and response bodies for the state and content endpoints.
//!
//! Shared by the HTTP clients here and the `tubed` backend so both sides
//! agree on field names.

use serde::{Deserialize, Serialize};

use crate::types::{LearningState, StitchContent};

/// `GET /user-state?userId=<id>`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserStateResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<LearningState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// `POST /user-state`. `id` is sent only for anonymous identities.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SaveUserStateRequest {
    pub state: LearningState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SaveUserStateResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// `GET /content/stitch/{id}`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StitchResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stitch: Option<StitchContent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// `POST /content/batch`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchRequest {
    pub stitch_ids: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchResponse {
    pub success: bool,
    #[serde(default)]
    pub stitches: Vec<StitchContent>,
}
