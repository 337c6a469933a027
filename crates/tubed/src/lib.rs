//! tubed - state and content backend for the tube player
//!
//! Serves `/user-state` (newest write wins) and the stitch content
//! endpoints the player's cache prefetches from.

pub mod catalog;
pub mod routes;
pub mod server;

pub use catalog::Catalog;
pub use server::{build_router, run, serve, AppState, DEFAULT_BIND};
