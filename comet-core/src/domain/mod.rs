//! Core domain types
//!
//! These records are written by the engine (runs, stage runs, queued jobs)
//! and read by whatever surface sits in front of it.

pub mod event;
pub mod job;
pub mod pipeline;
pub mod run;
pub mod stage;
