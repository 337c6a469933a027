//! tubectl - command line player for the tube progression core

pub mod commands;
pub mod display;
